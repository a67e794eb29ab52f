//! Audit sink implementations.
//!
//! [`TracingAuditSink`] writes records as structured `tracing` events and is
//! the default when no external audit trail is wired in. [`MemoryAuditSink`]
//! keeps records for inspection in tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::traits::{AuditSink, Severity};

/// Component name used for every record the engine emits.
pub const COMPONENT: &str = "sync_engine";

/// Audit sink that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_system_event(
        &self,
        event_type: &str,
        component: &str,
        details: serde_json::Value,
        severity: Severity,
    ) -> anyhow::Result<()> {
        match severity {
            Severity::Info => info!(event_type, component, %details, "system event"),
            Severity::Warning => warn!(event_type, component, %details, "system event"),
            Severity::Error | Severity::Critical => {
                error!(event_type, component, severity = severity.as_str(), %details, "system event");
            }
        }
        Ok(())
    }
}

/// One captured audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub event_type: String,
    pub component: String,
    pub details: serde_json::Value,
    pub severity: Severity,
}

/// Audit sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records with the given event type.
    #[must_use]
    pub fn records_of(&self, event_type: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log_system_event(
        &self,
        event_type: &str,
        component: &str,
        details: serde_json::Value,
        severity: Severity,
    ) -> anyhow::Result<()> {
        self.records.lock().push(AuditRecord {
            event_type: event_type.to_string(),
            component: component.to_string(),
            details,
            severity,
        });
        Ok(())
    }
}

/// Sends a record to `sink`, logging instead of failing when the sink errors.
pub(crate) async fn emit(
    sink: &Arc<dyn AuditSink>,
    event_type: &str,
    details: serde_json::Value,
    severity: Severity,
) {
    if let Err(err) = sink
        .log_system_event(event_type, COMPONENT, details, severity)
        .await
    {
        warn!(event_type, error = %err, "audit sink rejected record");
    }
}
