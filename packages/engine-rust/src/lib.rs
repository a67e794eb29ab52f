//! `fieldsync` engine: real-time, rule-driven propagation of document changes
//! across collections.
//!
//! Change listeners turn per-collection change streams into [`SyncEvent`]s on
//! a bounded priority queue. A worker pool applies every matching
//! [`SyncRule`] to its target collections, retries transient failures with
//! backoff and runs post-sync [`EventHandler`]s. [`SyncEngine`] owns the
//! lifecycle.
//!
//! [`SyncEvent`]: fieldsync_core::SyncEvent
//! [`SyncRule`]: fieldsync_core::SyncRule

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
mod listener;
pub mod metrics;
mod processor;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod traits;
pub mod worker;

pub use audit::{MemoryAuditSink, TracingAuditSink};
pub use config::{EngineConfig, RetryPolicy};
pub use engine::{EngineStatus, SyncEngine};
pub use error::{FeedError, SyncError, SyncResult};
pub use executor::{SyncExecutor, TargetOutcome};
pub use handlers::{handler_fn, EventHandler};
pub use metrics::{SyncMetrics, SyncStats};
pub use queue::{EventQueue, Slot};
pub use registry::{RegisteredRule, RuleRegistry};
pub use shutdown::EngineState;
pub use traits::{AuditSink, ChangeFeedSource, ChangeStream, CollectionStore, Severity};
