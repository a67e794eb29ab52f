//! Error types for the sync engine.

use fieldsync_core::{RuleError, TransformError};

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised while propagating an event or operating the engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The target store rejected or failed an update.
    #[error("write to {collection} failed: {source}")]
    TargetWrite {
        collection: String,
        #[source]
        source: anyhow::Error,
    },
    /// A rule transform failed.
    #[error("rule {rule}: {source}")]
    Transform {
        rule: String,
        #[source]
        source: TransformError,
    },
    /// A rule could not be built.
    #[error(transparent)]
    InvalidRule(#[from] RuleError),
    /// Reading a source document failed.
    #[error("lookup of {collection}/{document_id} failed: {source}")]
    Lookup {
        collection: String,
        document_id: String,
        #[source]
        source: anyhow::Error,
    },
    /// A forced sync referenced a document that does not exist.
    #[error("document {document_id} not found in {collection}")]
    DocumentNotFound {
        collection: String,
        document_id: String,
    },
    /// No rule is registered for the collection.
    #[error("no sync rules registered for collection {0}")]
    NoRules(String),
    /// The event queue has been closed by shutdown.
    #[error("event queue is closed")]
    QueueClosed,
    /// The operation requires a running engine.
    #[error("sync engine is not running")]
    NotRunning,
    /// `start()` was called twice.
    #[error("sync engine is already running")]
    AlreadyRunning,
}

impl SyncError {
    /// Returns true if the failed event should be attempted again.
    ///
    /// Store and lookup failures are treated as transient. Permanent transform
    /// failures and configuration errors fail the event immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TargetWrite { .. } | Self::Lookup { .. } => true,
            Self::Transform { source, .. } => source.is_retryable(),
            Self::InvalidRule(_)
            | Self::DocumentNotFound { .. }
            | Self::NoRules(_)
            | Self::QueueClosed
            | Self::NotRunning
            | Self::AlreadyRunning => false,
        }
    }
}

/// Errors delivered on a change stream.
///
/// `Clone` because the in-memory feed fans items out through a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Network reset, cursor killed, or similar; resubscribing may succeed.
    #[error("change stream transport error: {0}")]
    Transport(String),
    /// The feed no longer retains the history needed to resume.
    #[error("change history lost for {collection} (resume token {resume_token:?})")]
    HistoryLost {
        collection: String,
        resume_token: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        let write = SyncError::TargetWrite {
            collection: "parents".into(),
            source: anyhow::anyhow!("timeout"),
        };
        assert!(write.is_retryable());

        let transient = SyncError::Transform {
            rule: "r".into(),
            source: TransformError::Retryable("busy".into()),
        };
        assert!(transient.is_retryable());

        let permanent = SyncError::Transform {
            rule: "r".into(),
            source: TransformError::missing_field("name"),
        };
        assert!(!permanent.is_retryable());

        assert!(!SyncError::QueueClosed.is_retryable());
        assert!(!SyncError::NoRules("x".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::DocumentNotFound {
            collection: "students".into(),
            document_id: "S1".into(),
        };
        assert_eq!(err.to_string(), "document S1 not found in students");

        let err = SyncError::TargetWrite {
            collection: "parents".into(),
            source: anyhow::anyhow!("connection reset"),
        };
        assert!(err.to_string().contains("connection reset"));

        let err = FeedError::HistoryLost {
            collection: "fees".into(),
            resume_token: Some("fees:3".into()),
        };
        assert!(err.to_string().contains("fees:3"));
    }
}
