use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A schemaless record as stored in a collection.
///
/// Field order is not significant for matching; `serde_json::Map` keeps keys
/// sorted, which gives deterministic serialization of payloads and filters.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Equality filter: every key must equal the given value in a matching document.
pub type Filter = Document;

/// Field names written by the engine onto target documents.
///
/// Listeners use [`SYNC_EVENT_ID`](fields::SYNC_EVENT_ID) to recognise writes
/// the engine itself produced.
pub mod fields {
    /// Timestamp (epoch millis) of the last propagated write.
    pub const UPDATED_AT: &str = "updatedAt";
    /// Id of the sync event that produced the write.
    pub const SYNC_EVENT_ID: &str = "syncEventID";
    /// Source collection the write was propagated from.
    pub const SYNCED_FROM: &str = "syncedFrom";
    /// Soft-delete marker field.
    pub const STATUS: &str = "status";
    /// Value of [`STATUS`] on soft-deleted targets.
    pub const STATUS_INACTIVE: &str = "inactive";
    /// Timestamp (epoch millis) of a soft delete.
    pub const DELETED_AT: &str = "deletedAt";
    /// Id of the deleted source document.
    pub const DELETED_REFERENCE: &str = "deletedReference";
    /// Tenant provenance.
    pub const BRANCH_ID: &str = "branch_id";
    /// Actor provenance of the latest change.
    pub const UPDATED_BY: &str = "updated_by";
    /// Actor provenance of the creation.
    pub const CREATED_BY: &str = "created_by";
    /// Primary key of a document.
    pub const ID: &str = "_id";
}

/// Kind of change reported by a change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A new document was created.
    Insert,
    /// Some fields of an existing document changed.
    Update,
    /// A document was removed.
    Delete,
    /// A document was replaced as a whole.
    Replace,
}

impl EventType {
    /// Lowercase name used in handler keys and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
        }
    }

    /// Whether the event removes its document.
    #[must_use]
    pub fn is_delete(self) -> bool {
        matches!(self, Self::Delete)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown event type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "replace" => Ok(Self::Replace),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

/// Scheduling priority of an event or rule.
///
/// Ordered so that `Critical > High > Medium > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background propagation.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Core academic entities.
    High,
    /// Tenant-wide entities that everything else depends on.
    Critical,
}

impl Priority {
    /// All priorities from highest to lowest.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Static priority of a source collection.
    #[must_use]
    pub fn for_collection(collection: &str) -> Self {
        match collection {
            "branches" | "academic_calendar" | "users" => Self::Critical,
            "students" | "teachers" | "classes" | "fees" => Self::High,
            _ => Self::Medium,
        }
    }

    /// Priority of a change: the collection priority, with deletes promoted
    /// to at least [`Priority::High`].
    #[must_use]
    pub fn for_change(collection: &str, event_type: EventType) -> Self {
        let base = Self::for_collection(collection);
        if event_type.is_delete() {
            base.max(Self::High)
        } else {
            base
        }
    }

    /// Lane index in the event queue; 0 is drained first.
    #[must_use]
    pub fn lane(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of a sync event.
///
/// State machine: `Pending -> Processing -> {Completed | Retrying -> Pending | Failed}`.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Waiting in the queue.
    #[default]
    Pending,
    /// Held by a worker.
    Processing,
    /// All targets written.
    Completed,
    /// Failed at least once, waiting for its backoff before re-entering the queue.
    Retrying,
    /// Retry budget exhausted or failure is permanent.
    Failed,
}

impl EventStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}
