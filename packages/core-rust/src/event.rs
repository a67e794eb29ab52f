//! Change notifications and the normalized sync events built from them.
//!
//! A [`ChangeNotification`] is what a change feed delivers: one raw record per
//! insert/update/replace/delete on a collection. The listener turns each one
//! into a [`SyncEvent`], which carries scheduling priority, tenant/actor
//! provenance and the retry bookkeeping used by the processor pool.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{fields, Document, EventStatus, EventType, Priority};

/// Default retry ceiling for a sync event.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A raw change-feed record for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Kind of change.
    pub operation_type: EventType,
    /// Collection the change happened in.
    pub collection: String,
    /// Primary key of the changed document.
    pub document_id: String,
    /// Post-image. Absent on delete.
    pub full_document: Option<Document>,
    /// Pre-image, best effort.
    pub full_document_before_change: Option<Document>,
    /// Changed fields, for updates.
    pub updated_fields: Option<Document>,
    /// Opaque position in the feed; resubscribing after it resumes the stream.
    pub resume_token: String,
    /// Commit time (epoch millis) reported by the feed.
    pub cluster_time: u64,
}

impl ChangeNotification {
    fn new(operation_type: EventType, collection: &str, document_id: &str) -> Self {
        Self {
            operation_type,
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            full_document: None,
            full_document_before_change: None,
            updated_fields: None,
            resume_token: String::new(),
            cluster_time: 0,
        }
    }

    /// Notification for a newly inserted document.
    #[must_use]
    pub fn insert(collection: &str, document_id: &str, document: Document) -> Self {
        Self {
            full_document: Some(document),
            ..Self::new(EventType::Insert, collection, document_id)
        }
    }

    /// Notification for a partial update with its post-image.
    #[must_use]
    pub fn update(
        collection: &str,
        document_id: &str,
        document: Document,
        updated_fields: Document,
    ) -> Self {
        Self {
            full_document: Some(document),
            updated_fields: Some(updated_fields),
            ..Self::new(EventType::Update, collection, document_id)
        }
    }

    /// Notification for a whole-document replacement.
    #[must_use]
    pub fn replace(collection: &str, document_id: &str, document: Document) -> Self {
        Self {
            full_document: Some(document),
            ..Self::new(EventType::Replace, collection, document_id)
        }
    }

    /// Notification for a removed document.
    #[must_use]
    pub fn delete(collection: &str, document_id: &str) -> Self {
        Self::new(EventType::Delete, collection, document_id)
    }

    /// Attaches a pre-image.
    #[must_use]
    pub fn with_pre_image(mut self, before: Document) -> Self {
        self.full_document_before_change = Some(before);
        self
    }

    /// Sets the feed position and commit time.
    #[must_use]
    pub fn at_position(mut self, resume_token: impl Into<String>, cluster_time: u64) -> Self {
        self.resume_token = resume_token.into();
        self.cluster_time = cluster_time;
        self
    }

    /// Whether this change was written by the sync engine itself.
    ///
    /// Engine writes always set [`fields::SYNC_EVENT_ID`], so an update whose
    /// delta contains that field is an echo of a propagated write.
    #[must_use]
    pub fn is_engine_write(&self) -> bool {
        self.operation_type == EventType::Update
            && self
                .updated_fields
                .as_ref()
                .is_some_and(|delta| delta.contains_key(fields::SYNC_EVENT_ID))
    }
}

/// Normalized representation of a single change, owned by whichever task
/// currently holds it (queue, worker, or a pending retry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Unique event id.
    pub event_id: String,
    /// Kind of change.
    pub event_type: EventType,
    /// Source collection.
    pub collection_name: String,
    /// Source document id.
    pub document_id: String,
    /// Post-image, absent on delete.
    pub full_document: Option<Document>,
    /// Pre-image, best effort.
    pub full_document_before_change: Option<Document>,
    /// Delta for updates.
    pub updated_fields: Option<Document>,
    /// Creation time (epoch millis).
    pub timestamp: u64,
    /// Queue lane the event travels in.
    pub priority: Priority,
    /// Processing state.
    pub status: EventStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Retry ceiling.
    pub max_retries: u32,
    /// Tenant provenance.
    pub branch_id: Option<String>,
    /// Actor provenance.
    pub user_id: Option<String>,
    /// Feed position this event was built from.
    pub correlation_id: Option<String>,
    /// `rule:target` pairs already written; retries skip them.
    #[serde(default)]
    pub completed_targets: BTreeSet<String>,
}

impl SyncEvent {
    /// Builds an event from a change notification.
    #[must_use]
    pub fn from_notification(notification: ChangeNotification, max_retries: u32, now: u64) -> Self {
        let priority = Priority::for_change(&notification.collection, notification.operation_type);
        let (branch_id, user_id) = extract_provenance(
            notification.full_document.as_ref(),
            notification.full_document_before_change.as_ref(),
        );
        let correlation_id = if notification.resume_token.is_empty() {
            None
        } else {
            Some(notification.resume_token)
        };

        Self {
            event_id: new_event_id(),
            event_type: notification.operation_type,
            collection_name: notification.collection,
            document_id: notification.document_id,
            full_document: notification.full_document,
            full_document_before_change: notification.full_document_before_change,
            updated_fields: notification.updated_fields,
            timestamp: now,
            priority,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries,
            branch_id,
            user_id,
            correlation_id,
            completed_targets: BTreeSet::new(),
        }
    }

    /// Builds a one-off event for manual repair or backfill.
    #[must_use]
    pub fn forced(
        collection: &str,
        document_id: &str,
        event_type: EventType,
        document: Option<Document>,
        max_retries: u32,
        now: u64,
    ) -> Self {
        let (branch_id, user_id) = extract_provenance(document.as_ref(), None);
        Self {
            event_id: new_event_id(),
            event_type,
            collection_name: collection.to_string(),
            document_id: document_id.to_string(),
            full_document: document,
            full_document_before_change: None,
            updated_fields: None,
            timestamp: now,
            priority: Priority::for_change(collection, event_type),
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries,
            branch_id,
            user_id,
            correlation_id: None,
            completed_targets: BTreeSet::new(),
        }
    }

    /// Key under which post-sync handlers are registered: `"<collection>:<event_type>"`.
    #[must_use]
    pub fn handler_key(&self) -> String {
        handler_key(&self.collection_name, self.event_type)
    }

    /// Whether another attempt is allowed after the current failure count.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether `rule` has already been written to `target` by an earlier attempt.
    #[must_use]
    pub fn is_target_done(&self, rule: &str, target: &str) -> bool {
        self.completed_targets.contains(&target_key(rule, target))
    }

    /// Records a successful write of `rule` to `target`.
    pub fn mark_target_done(&mut self, rule: &str, target: &str) {
        self.completed_targets.insert(target_key(rule, target));
    }
}

/// Builds a handler registry key.
#[must_use]
pub fn handler_key(collection: &str, event_type: EventType) -> String {
    format!("{collection}:{event_type}")
}

fn target_key(rule: &str, target: &str) -> String {
    format!("{rule}:{target}")
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Pulls `(branch_id, user_id)` from the post-image, falling back to the pre-image.
///
/// The user is the last editor (`updated_by`) when known, otherwise the creator.
#[must_use]
pub fn extract_provenance(
    document: Option<&Document>,
    before: Option<&Document>,
) -> (Option<String>, Option<String>) {
    let lookup = |field: &str| {
        document
            .and_then(|doc| field_as_string(doc, field))
            .or_else(|| before.and_then(|doc| field_as_string(doc, field)))
    };
    let branch = lookup(fields::BRANCH_ID);
    let user = lookup(fields::UPDATED_BY).or_else(|| lookup(fields::CREATED_BY));
    (branch, user)
}

fn field_as_string(doc: &Document, field: &str) -> Option<String> {
    match doc.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
