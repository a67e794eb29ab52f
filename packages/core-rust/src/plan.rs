//! Pure planning of target writes.
//!
//! For one `(event, rule, target)` triple this module decides whether the rule
//! applies, builds the `$set` payload (field mapping, transform, provenance
//! stamps) and the equality filter selecting target documents. Nothing here
//! touches a store; the engine's executor applies the resulting [`TargetWrite`].

use serde_json::Value;
use tracing::trace;

use crate::event::SyncEvent;
use crate::rule::{SyncRule, TransformError};
use crate::types::{fields, Document, Filter};

/// What a planned write does to matching target documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Set the mapped fields.
    Set,
    /// Mark the targets inactive instead of removing them.
    SoftDelete,
}

/// A fully planned update-many against one target collection.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetWrite {
    /// Target collection.
    pub target: String,
    /// Equality filter selecting the documents to update.
    pub filter: Filter,
    /// Fields to set on every matching document.
    pub payload: Document,
    /// Kind of write.
    pub kind: WriteKind,
}

/// Whether `rule.conditions` hold for the event.
///
/// Inserts, updates and replaces are checked against the post-image; an event
/// without one never matches a non-empty condition set. Deletes are checked
/// against the pre-image when the feed supplied it and pass otherwise.
#[must_use]
pub fn conditions_match(rule: &SyncRule, event: &SyncEvent) -> bool {
    if rule.conditions.is_empty() {
        return true;
    }
    let document = if event.event_type.is_delete() {
        match &event.full_document_before_change {
            Some(before) => before,
            None => return true,
        }
    } else {
        match &event.full_document {
            Some(doc) => doc,
            None => return false,
        }
    };
    rule.conditions
        .iter()
        .all(|(field, expected)| document.get(field) == Some(expected))
}

/// Copies every mapped source field present in `source` to its target name.
///
/// Absent source fields are omitted, never defaulted.
#[must_use]
pub fn map_fields(rule: &SyncRule, source: &Document) -> Document {
    let mut mapped = Document::new();
    for mapping in &rule.field_mappings {
        if let Some(value) = source.get(&mapping.source) {
            mapped.insert(mapping.target.clone(), value.clone());
        }
    }
    mapped
}

/// Adds `updatedAt`, `syncEventID` and `syncedFrom` to a payload.
pub fn stamp_metadata(payload: &mut Document, event: &SyncEvent, now: u64) {
    payload.insert(fields::UPDATED_AT.to_string(), Value::from(now));
    payload.insert(
        fields::SYNC_EVENT_ID.to_string(),
        Value::String(event.event_id.clone()),
    );
    payload.insert(
        fields::SYNCED_FROM.to_string(),
        Value::String(event.collection_name.clone()),
    );
}

/// Filter selecting the target documents that reference the source document.
///
/// `{correlation_field: document_id}`, narrowed by `branch_id` when the event
/// carries one and by the literal conditions unless the rule is gate-only.
#[must_use]
pub fn target_filter(rule: &SyncRule, event: &SyncEvent) -> Filter {
    let mut filter = Filter::new();
    if rule.conditions_filter_targets {
        for (field, value) in &rule.conditions {
            filter.insert(field.clone(), value.clone());
        }
    }
    if let Some(branch) = &event.branch_id {
        filter.insert(fields::BRANCH_ID.to_string(), Value::String(branch.clone()));
    }
    filter.insert(
        rule.correlation_field.clone(),
        Value::String(event.document_id.clone()),
    );
    filter
}

/// Payload marking targets of a deleted source document inactive.
#[must_use]
pub fn soft_delete_payload(event: &SyncEvent, now: u64) -> Document {
    let mut payload = Document::new();
    payload.insert(
        fields::STATUS.to_string(),
        Value::String(fields::STATUS_INACTIVE.to_string()),
    );
    payload.insert(fields::DELETED_AT.to_string(), Value::from(now));
    payload.insert(
        fields::SYNC_EVENT_ID.to_string(),
        Value::String(event.event_id.clone()),
    );
    payload.insert(
        fields::DELETED_REFERENCE.to_string(),
        Value::String(event.document_id.clone()),
    );
    payload
}

/// Plans the write of `rule` for `event` against `target`.
///
/// Returns `Ok(None)` when the rule is disabled or its conditions do not hold.
///
/// # Errors
///
/// Propagates the rule transform's error.
pub fn plan_write(
    rule: &SyncRule,
    event: &SyncEvent,
    target: &str,
    now: u64,
) -> Result<Option<TargetWrite>, TransformError> {
    if !rule.enabled {
        trace!(rule = %rule.name, "rule disabled");
        return Ok(None);
    }
    if !conditions_match(rule, event) {
        trace!(rule = %rule.name, document_id = %event.document_id, "rule conditions not met");
        return Ok(None);
    }

    let filter = target_filter(rule, event);

    if event.event_type.is_delete() {
        return Ok(Some(TargetWrite {
            target: target.to_string(),
            filter,
            payload: soft_delete_payload(event, now),
            kind: WriteKind::SoftDelete,
        }));
    }

    let empty = Document::new();
    let source = event
        .full_document
        .as_ref()
        .or(event.updated_fields.as_ref())
        .unwrap_or(&empty);

    let mut payload = map_fields(rule, source);
    if let Some(transform) = &rule.transform {
        payload = transform(payload, event)?;
    }
    stamp_metadata(&mut payload, event, now);

    Ok(Some(TargetWrite {
        target: target.to_string(),
        filter,
        payload,
        kind: WriteKind::Set,
    }))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::event::ChangeNotification;
    use crate::types::EventType;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn student_rule() -> SyncRule {
        SyncRule::builder("student-names", "students")
            .target("parents")
            .map("_id", "student_id")
            .map("name", "student_name")
            .build()
            .unwrap()
    }

    fn insert_event(document: Value) -> SyncEvent {
        let document = doc(document);
        let id = document
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or("S1")
            .to_string();
        SyncEvent::from_notification(ChangeNotification::insert("students", &id, document), 3, 0)
    }

    #[test]
    fn insert_maps_fields_and_stamps_metadata() {
        let rule = student_rule();
        let event = insert_event(json!({"_id": "S1", "name": "Ann", "dob": "2010-01-01"}));

        let write = plan_write(&rule, &event, "parents", 99).unwrap().unwrap();

        assert_eq!(write.kind, WriteKind::Set);
        assert_eq!(write.target, "parents");
        assert_eq!(write.filter, doc(json!({"student_id": "S1"})));
        assert_eq!(write.payload.get("student_id"), Some(&json!("S1")));
        assert_eq!(write.payload.get("student_name"), Some(&json!("Ann")));
        assert_eq!(write.payload.get("updatedAt"), Some(&json!(99)));
        assert_eq!(
            write.payload.get("syncEventID"),
            Some(&json!(event.event_id))
        );
        assert_eq!(write.payload.get("syncedFrom"), Some(&json!("students")));
        assert!(!write.payload.contains_key("dob"));
    }

    #[test]
    fn absent_source_fields_are_omitted() {
        let rule = student_rule();
        let event = insert_event(json!({"_id": "S1"}));

        let write = plan_write(&rule, &event, "parents", 0).unwrap().unwrap();

        assert!(!write.payload.contains_key("student_name"));
    }

    #[test]
    fn conditions_gate_and_narrow() {
        let rule = SyncRule::builder("withdrawals", "students")
            .target("parents")
            .map("_id", "student_id")
            .condition("status", "withdrawn")
            .build()
            .unwrap();

        let active = insert_event(json!({"_id": "S1", "status": "active"}));
        assert!(plan_write(&rule, &active, "parents", 0).unwrap().is_none());

        let withdrawn = insert_event(json!({"_id": "S1", "status": "withdrawn"}));
        let write = plan_write(&rule, &withdrawn, "parents", 0).unwrap().unwrap();
        assert_eq!(
            write.filter,
            doc(json!({"student_id": "S1", "status": "withdrawn"}))
        );
    }

    #[test]
    fn gate_only_conditions_do_not_narrow() {
        let rule = SyncRule::builder("withdrawals", "students")
            .target("parents")
            .map("_id", "student_id")
            .condition("status", "withdrawn")
            .conditions_gate_only()
            .build()
            .unwrap();

        let event = insert_event(json!({"_id": "S1", "status": "withdrawn"}));
        let write = plan_write(&rule, &event, "parents", 0).unwrap().unwrap();
        assert_eq!(write.filter, doc(json!({"student_id": "S1"})));
    }

    #[test]
    fn branch_narrows_filter() {
        let rule = student_rule();
        let event = insert_event(json!({"_id": "S1", "branch_id": "B9"}));

        let write = plan_write(&rule, &event, "parents", 0).unwrap().unwrap();

        assert_eq!(
            write.filter,
            doc(json!({"student_id": "S1", "branch_id": "B9"}))
        );
    }

    #[test]
    fn disabled_rule_plans_nothing() {
        let rule = SyncRule::builder("r", "students")
            .target("parents")
            .map("_id", "student_id")
            .enabled(false)
            .build()
            .unwrap();
        let event = insert_event(json!({"_id": "S1"}));
        assert!(plan_write(&rule, &event, "parents", 0).unwrap().is_none());
    }

    #[test]
    fn delete_is_a_soft_delete() {
        let rule = SyncRule::builder("fee-links", "fees")
            .target("payments")
            .map("_id", "fee_id")
            .build()
            .unwrap();
        let event =
            SyncEvent::from_notification(ChangeNotification::delete("fees", "F1"), 3, 0);

        let write = plan_write(&rule, &event, "payments", 7).unwrap().unwrap();

        assert_eq!(write.kind, WriteKind::SoftDelete);
        assert_eq!(write.filter, doc(json!({"fee_id": "F1"})));
        assert_eq!(write.payload.get("status"), Some(&json!("inactive")));
        assert_eq!(write.payload.get("deletedAt"), Some(&json!(7)));
        assert_eq!(write.payload.get("deletedReference"), Some(&json!("F1")));
        assert_eq!(
            write.payload.get("syncEventID"),
            Some(&json!(event.event_id))
        );
    }

    #[test]
    fn delete_conditions_use_pre_image_when_present() {
        let rule = SyncRule::builder("r", "students")
            .target("parents")
            .map("_id", "student_id")
            .condition("status", "withdrawn")
            .build()
            .unwrap();

        let no_pre_image =
            SyncEvent::from_notification(ChangeNotification::delete("students", "S1"), 3, 0);
        assert!(conditions_match(&rule, &no_pre_image));

        let active_pre_image = SyncEvent::from_notification(
            ChangeNotification::delete("students", "S1")
                .with_pre_image(doc(json!({"status": "active"}))),
            3,
            0,
        );
        assert!(!conditions_match(&rule, &active_pre_image));
    }

    #[test]
    fn transform_replaces_payload_but_keeps_stamps() {
        let rule = SyncRule::builder("r", "students")
            .target("parents")
            .map("_id", "student_id")
            .map("name", "student_name")
            .transform(|mut data, event| {
                let name = event
                    .full_document
                    .as_ref()
                    .and_then(|d| d.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransformError::missing_field("name"))?;
                data.insert("student_name".into(), json!(name.to_uppercase()));
                Ok(data)
            })
            .build()
            .unwrap();

        let event = insert_event(json!({"_id": "S1", "name": "Ann"}));
        let write = plan_write(&rule, &event, "parents", 0).unwrap().unwrap();
        assert_eq!(write.payload.get("student_name"), Some(&json!("ANN")));
        assert!(write.payload.contains_key("syncEventID"));

        let nameless = insert_event(json!({"_id": "S2"}));
        let err = plan_write(&rule, &nameless, "parents", 0).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn update_without_post_image_falls_back_to_delta() {
        let rule = student_rule();
        let mut event = SyncEvent::forced("students", "S1", EventType::Update, None, 3, 0);
        event.updated_fields = Some(doc(json!({"name": "Bea"})));

        let write = plan_write(&rule, &event, "parents", 0).unwrap().unwrap();
        assert_eq!(write.payload.get("student_name"), Some(&json!("Bea")));
    }

    proptest! {
        // Payload = mapped targets of present fields + the three stamps, nothing else.
        #[test]
        fn payload_contains_exactly_mapped_fields(
            values in proptest::collection::btree_map("[a-e]", "[a-z]{0,6}", 0..5),
            mapped in proptest::collection::btree_set("[a-h]", 1..6),
        ) {
            let mut builder = SyncRule::builder("prop", "students").target("parents");
            for field in &mapped {
                builder = builder.map(field.clone(), format!("t_{field}"));
            }
            let rule = builder.build().unwrap();

            let mut source = Document::new();
            for (k, v) in &values {
                source.insert(k.clone(), Value::String(v.clone()));
            }
            let event = SyncEvent::from_notification(
                ChangeNotification::insert("students", "S1", source.clone()),
                3,
                0,
            );

            let write = plan_write(&rule, &event, "parents", 5).unwrap().unwrap();

            let mut expected: Vec<String> = mapped
                .iter()
                .filter(|f| source.contains_key(*f))
                .map(|f| format!("t_{f}"))
                .collect();
            expected.extend(["syncEventID", "syncedFrom", "updatedAt"].map(String::from));
            expected.sort();
            let mut actual: Vec<String> = write.payload.keys().cloned().collect();
            actual.sort();
            prop_assert_eq!(actual, expected);

            for field in mapped.iter().filter(|f| source.contains_key(*f)) {
                prop_assert_eq!(write.payload.get(&format!("t_{field}")), source.get(field));
            }
        }

        // A delete never plans anything other than a soft delete.
        #[test]
        fn deletes_always_soft_delete(id in "[A-Z][0-9]{1,4}", collection in "[a-z]{3,8}") {
            let rule = SyncRule::builder("prop", collection.clone())
                .target("targets")
                .map("_id", "ref_id")
                .build()
                .unwrap();
            let event = SyncEvent::from_notification(
                ChangeNotification::delete(&collection, &id),
                3,
                0,
            );
            let write = plan_write(&rule, &event, "targets", 0).unwrap().unwrap();
            prop_assert_eq!(write.kind, WriteKind::SoftDelete);
            prop_assert_eq!(write.payload.get("status"), Some(&json!("inactive")));
        }

        // A failing condition set never produces a write.
        #[test]
        fn mismatched_conditions_never_write(actual in "[a-z]{1,6}", expected in "[a-z]{1,6}") {
            prop_assume!(actual != expected);
            let rule = SyncRule::builder("prop", "students")
                .target("parents")
                .map("_id", "student_id")
                .condition("status", expected)
                .build()
                .unwrap();
            let mut source = Document::new();
            source.insert("status".into(), Value::String(actual));
            let event = SyncEvent::from_notification(
                ChangeNotification::update("students", "S1", source.clone(), source),
                3,
                0,
            );
            prop_assert!(plan_write(&rule, &event, "parents", 0).unwrap().is_none());
        }
    }
}
