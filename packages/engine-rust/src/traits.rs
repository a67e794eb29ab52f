use async_trait::async_trait;
use fieldsync_core::{ChangeNotification, Document, Filter};
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::error::FeedError;

/// Stream of change notifications for one collection.
///
/// Ends (`None`) when the subscription is closed by the feed.
pub type ChangeStream = BoxStream<'static, Result<ChangeNotification, FeedError>>;

/// Source of per-collection change notifications.
/// Implementations: `MongoDB` change streams (external), in-memory feed (tests, demo).
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Open a live subscription to inserts, updates, replaces and deletes on
    /// `collection`, requesting post-images and best-effort pre-images.
    ///
    /// With `resume_after`, delivery restarts just after that feed position.
    async fn subscribe(
        &self,
        collection: &str,
        resume_after: Option<&str>,
    ) -> anyhow::Result<ChangeStream>;
}

/// Document storage for source lookups and target writes.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Load a single document by id.
    async fn find_by_id(&self, collection: &str, id: &str) -> anyhow::Result<Option<Document>>;

    /// Set `payload` fields on every document matching the equality `filter`.
    /// Never inserts. Returns the number of matched documents.
    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        payload: &Document,
    ) -> anyhow::Result<u64>;
}

/// Severity of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Sink for engine lifecycle records: startup/shutdown, listener errors,
/// exhausted retries and periodic health snapshots.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record a system event.
    async fn log_system_event(
        &self,
        event_type: &str,
        component: &str,
        details: serde_json::Value,
        severity: Severity,
    ) -> anyhow::Result<()>;
}
