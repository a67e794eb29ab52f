//! Declarative propagation rules.
//!
//! A [`SyncRule`] describes how a change in one source collection is copied
//! into denormalized fields of one or more target collections. Rules are
//! immutable once built; the registry shares them behind an `Arc` with a registration id.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::event::SyncEvent;
use crate::types::{Document, Priority};

/// Pure function applied to the mapped payload before it is written.
///
/// Must only read its arguments: retries call it again with the same inputs.
pub type TransformFn =
    Arc<dyn Fn(Document, &SyncEvent) -> Result<Document, TransformError> + Send + Sync>;

/// Failure raised by a rule transform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// May succeed if attempted again.
    #[error("transform failed (retryable): {0}")]
    Retryable(String),
    /// Will fail the same way on every attempt.
    #[error("transform failed (permanent): {0}")]
    Permanent(String),
}

impl TransformError {
    /// A required input field was absent; retrying cannot help.
    #[must_use]
    pub fn missing_field(field: &str) -> Self {
        Self::Permanent(format!("missing field `{field}`"))
    }

    /// Whether the failure is worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Errors from assembling a [`SyncRule`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("rule {rule} has no source collection")]
    NoSource { rule: String },
    #[error("rule {rule} has no target collections")]
    NoTargets { rule: String },
    #[error("rule {rule} has no correlation field and no field mappings to derive one from")]
    NoCorrelationField { rule: String },
    #[error("rule {rule} lists target {target} more than once")]
    DuplicateTarget { rule: String, target: String },
}

/// One `source field -> target field` copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    /// Field read from the source document.
    pub source: String,
    /// Field written on target documents.
    pub target: String,
}

/// How changes in `source_collection` propagate to `target_collections`.
#[derive(Clone)]
pub struct SyncRule {
    /// Human-readable rule name. Not required to be unique.
    pub name: String,
    /// Collection whose changes trigger this rule.
    pub source_collection: String,
    /// Collections receiving the propagated fields.
    pub target_collections: Vec<String>,
    /// Ordered field copies.
    pub field_mappings: Vec<FieldMapping>,
    /// Target field that holds the source document id; targets are selected by it.
    pub correlation_field: String,
    /// Equality predicate on the source document; empty means always apply.
    pub conditions: Document,
    /// Whether `conditions` also narrow the target filter.
    pub conditions_filter_targets: bool,
    /// Optional payload rewrite.
    pub transform: Option<TransformFn>,
    /// Execution order among the rules of one source collection.
    pub priority: Priority,
    /// Disabled rules are never applied.
    pub enabled: bool,
    /// Informational: a reverse rule exists. Echo suppression relies on provenance stamps.
    pub bidirectional: bool,
}

impl SyncRule {
    /// Starts building a rule triggered by changes in `source_collection`.
    #[must_use]
    pub fn builder(name: impl Into<String>, source_collection: impl Into<String>) -> SyncRuleBuilder {
        SyncRuleBuilder::new(name.into(), source_collection.into())
    }

    /// Whether `target` is one of this rule's target collections.
    #[must_use]
    pub fn targets_collection(&self, target: &str) -> bool {
        self.target_collections.iter().any(|t| t == target)
    }
}

impl fmt::Debug for SyncRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRule")
            .field("name", &self.name)
            .field("source_collection", &self.source_collection)
            .field("target_collections", &self.target_collections)
            .field("field_mappings", &self.field_mappings)
            .field("correlation_field", &self.correlation_field)
            .field("conditions", &self.conditions)
            .field("conditions_filter_targets", &self.conditions_filter_targets)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("bidirectional", &self.bidirectional)
            .finish()
    }
}

/// Builder for [`SyncRule`].
///
/// ```
/// use fieldsync_core::SyncRule;
///
/// let rule = SyncRule::builder("student-names", "students")
///     .target("parents")
///     .map("_id", "student_id")
///     .map("name", "student_name")
///     .build()
///     .unwrap();
///
/// assert_eq!(rule.correlation_field, "student_id");
/// ```
pub struct SyncRuleBuilder {
    name: String,
    source_collection: String,
    target_collections: Vec<String>,
    field_mappings: Vec<FieldMapping>,
    correlation_field: Option<String>,
    conditions: Document,
    conditions_filter_targets: bool,
    transform: Option<TransformFn>,
    priority: Priority,
    enabled: bool,
    bidirectional: bool,
}

impl SyncRuleBuilder {
    fn new(name: String, source_collection: String) -> Self {
        Self {
            name,
            source_collection,
            target_collections: Vec::new(),
            field_mappings: Vec::new(),
            correlation_field: None,
            conditions: Document::new(),
            conditions_filter_targets: true,
            transform: None,
            priority: Priority::Medium,
            enabled: true,
            bidirectional: false,
        }
    }

    /// Adds a target collection.
    #[must_use]
    pub fn target(mut self, collection: impl Into<String>) -> Self {
        self.target_collections.push(collection.into());
        self
    }

    /// Adds several target collections.
    #[must_use]
    pub fn targets<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_collections
            .extend(collections.into_iter().map(Into::into));
        self
    }

    /// Copies `source` on the source document into `target` on target documents.
    #[must_use]
    pub fn map(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.field_mappings.push(FieldMapping {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Names the target field holding the source document id.
    ///
    /// Defaults to the target field of the first mapping.
    #[must_use]
    pub fn correlation_field(mut self, field: impl Into<String>) -> Self {
        self.correlation_field = Some(field.into());
        self
    }

    /// Requires `field == value` on the source document.
    #[must_use]
    pub fn condition(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(field.into(), value.into());
        self
    }

    /// Uses the conditions only to gate the rule, not to narrow the target filter.
    #[must_use]
    pub fn conditions_gate_only(mut self) -> Self {
        self.conditions_filter_targets = false;
        self
    }

    /// Rewrites the mapped payload before it is written.
    #[must_use]
    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Document, &SyncEvent) -> Result<Document, TransformError> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    /// Sets the rule priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Enables or disables the rule.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Marks the rule as one half of a two-way pair.
    #[must_use]
    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    /// Validates and builds the rule.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] when the name, source or targets are missing, a
    /// target is listed twice, or no correlation field can be determined.
    pub fn build(self) -> Result<SyncRule, RuleError> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }
        if self.source_collection.trim().is_empty() {
            return Err(RuleError::NoSource { rule: self.name });
        }
        if self.target_collections.is_empty() {
            return Err(RuleError::NoTargets { rule: self.name });
        }
        for (i, target) in self.target_collections.iter().enumerate() {
            if self.target_collections[..i].contains(target) {
                return Err(RuleError::DuplicateTarget {
                    rule: self.name.clone(),
                    target: target.clone(),
                });
            }
        }

        let correlation_field = match self.correlation_field {
            Some(field) => field,
            None => match self.field_mappings.first() {
                Some(first) => first.target.clone(),
                None => return Err(RuleError::NoCorrelationField { rule: self.name }),
            },
        };

        Ok(SyncRule {
            name: self.name,
            source_collection: self.source_collection,
            target_collections: self.target_collections,
            field_mappings: self.field_mappings,
            correlation_field,
            conditions: self.conditions,
            conditions_filter_targets: self.conditions_filter_targets,
            transform: self.transform,
            priority: self.priority,
            enabled: self.enabled,
            bidirectional: self.bidirectional,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn correlation_defaults_to_first_mapping() {
        let rule = SyncRule::builder("r", "students")
            .target("parents")
            .map("_id", "student_id")
            .map("name", "student_name")
            .build()
            .unwrap();

        assert_eq!(rule.correlation_field, "student_id");
        assert_eq!(rule.field_mappings.len(), 2);
        assert!(rule.enabled);
        assert!(!rule.bidirectional);
        assert_eq!(rule.priority, Priority::Medium);
    }

    #[test]
    fn explicit_correlation_field_wins() {
        let rule = SyncRule::builder("r", "students")
            .target("parents")
            .map("name", "student_name")
            .correlation_field("student_id")
            .build()
            .unwrap();

        assert_eq!(rule.correlation_field, "student_id");
    }

    #[test]
    fn build_rejects_incomplete_rules() {
        assert_eq!(
            SyncRule::builder("", "students").target("p").map("a", "b").build().unwrap_err(),
            RuleError::EmptyName
        );
        assert!(matches!(
            SyncRule::builder("r", "").target("p").map("a", "b").build(),
            Err(RuleError::NoSource { .. })
        ));
        assert!(matches!(
            SyncRule::builder("r", "students").map("a", "b").build(),
            Err(RuleError::NoTargets { .. })
        ));
        assert!(matches!(
            SyncRule::builder("r", "students").target("p").build(),
            Err(RuleError::NoCorrelationField { .. })
        ));
        assert!(matches!(
            SyncRule::builder("r", "students")
                .targets(["p", "q", "p"])
                .map("a", "b")
                .build(),
            Err(RuleError::DuplicateTarget { target, .. }) if target == "p"
        ));
    }

    #[test]
    fn builder_options() {
        let rule = SyncRule::builder("r", "students")
            .targets(["parents", "classes"])
            .map("_id", "student_id")
            .condition("status", "withdrawn")
            .condition("grade", json!(7))
            .conditions_gate_only()
            .priority(Priority::Critical)
            .enabled(false)
            .bidirectional()
            .transform(|data, _| Ok(data))
            .build()
            .unwrap();

        assert!(rule.targets_collection("classes"));
        assert!(!rule.targets_collection("fees"));
        assert_eq!(rule.conditions.get("status"), Some(&json!("withdrawn")));
        assert_eq!(rule.conditions.get("grade"), Some(&json!(7)));
        assert!(!rule.conditions_filter_targets);
        assert!(!rule.enabled);
        assert!(rule.bidirectional);
        assert!(rule.transform.is_some());
        assert!(format!("{rule:?}").contains("<fn>"));
    }

    #[test]
    fn transform_error_classification() {
        assert!(TransformError::Retryable("lookup".into()).is_retryable());
        assert!(!TransformError::missing_field("name").is_retryable());
        assert!(TransformError::missing_field("name")
            .to_string()
            .contains("`name`"));
    }
}
