//! Sync statistics and the periodic health reporter.
//!
//! [`SyncMetrics`] keeps the engine's own counters (atomics plus a per-collection
//! timing map) and mirrors them to the `metrics` facade so an exporter installed
//! by the host process can scrape them. [`HealthReporter`] runs on a
//! [`BackgroundWorker`](crate::worker::BackgroundWorker) and emits a snapshot
//! through the audit sink every health interval.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::audit;
use crate::queue::EventQueue;
use crate::traits::{AuditSink, Severity};
use crate::worker::BackgroundRunnable;

const EVENTS_PROCESSED: &str = "fieldsync_events_processed_total";
const EVENTS_FAILED: &str = "fieldsync_events_failed_total";
const EVENT_RETRIES: &str = "fieldsync_event_retries_total";
const QUEUE_DEPTH: &str = "fieldsync_queue_depth";
const ACTIVE_LISTENERS: &str = "fieldsync_active_listeners";
const SYNC_DURATION: &str = "fieldsync_sync_duration_seconds";

/// Processing time aggregate for one source collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CollectionTiming {
    pub count: u64,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

impl CollectionTiming {
    fn record(&mut self, elapsed_ms: f64) {
        self.count += 1;
        self.total_ms += elapsed_ms;
        #[allow(clippy::cast_precision_loss)]
        let count = self.count as f64;
        self.avg_ms = self.total_ms / count;
        self.max_ms = self.max_ms.max(elapsed_ms);
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_retried: u64,
    pub loop_skips: u64,
    pub history_gaps: u64,
    pub listener_restarts: u64,
    pub handler_failures: u64,
    pub active_listeners: u64,
    /// Failed events waiting out their backoff before re-entering the queue.
    pub retries_pending: u64,
    /// Epoch millis of the last completed event.
    pub last_sync_time: Option<u64>,
    pub collections: BTreeMap<String, CollectionTiming>,
}

/// Shared, lock-free engine counters.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    events_retried: AtomicU64,
    loop_skips: AtomicU64,
    history_gaps: AtomicU64,
    listener_restarts: AtomicU64,
    handler_failures: AtomicU64,
    active_listeners: AtomicU64,
    retries_pending: AtomicU64,
    last_sync_time: AtomicU64,
    timings: DashMap<String, CollectionTiming>,
}

impl SyncMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed event and its processing time.
    pub fn record_success(&self, collection: &str, elapsed: Duration, now: u64) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.last_sync_time.store(now, Ordering::Relaxed);
        self.record_timing(collection, elapsed);
        metrics::counter!(EVENTS_PROCESSED, "collection" => collection.to_string()).increment(1);
    }

    /// Records an event that exhausted its retries or failed permanently.
    pub fn record_failure(&self, collection: &str) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(EVENTS_FAILED, "collection" => collection.to_string()).increment(1);
    }

    /// Records one scheduled retry.
    pub fn record_retry(&self, collection: &str) {
        self.events_retried.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(EVENT_RETRIES, "collection" => collection.to_string()).increment(1);
    }

    /// Records an executor attempt time without counting a success.
    pub fn record_timing(&self, collection: &str, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        self.timings
            .entry(collection.to_string())
            .or_default()
            .record(elapsed_ms);
        metrics::histogram!(SYNC_DURATION, "collection" => collection.to_string())
            .record(elapsed.as_secs_f64());
    }

    /// Records an engine echo dropped by a listener.
    pub fn record_loop_skip(&self) {
        self.loop_skips.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a change-feed history gap.
    pub fn record_history_gap(&self) {
        self.history_gaps.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a listener resubscription.
    pub fn record_listener_restart(&self) {
        self.listener_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a handler error or panic.
    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_started(&self) {
        let active = self.active_listeners.fetch_add(1, Ordering::Relaxed) + 1;
        Self::publish_listeners(active);
    }

    pub fn listener_stopped(&self) {
        let previous = self
            .active_listeners
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        Self::publish_listeners(previous.saturating_sub(1));
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_listeners(active: u64) {
        metrics::gauge!(ACTIVE_LISTENERS).set(active as f64);
    }

    /// Publishes the current queue depth gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn publish_queue_depth(&self, depth: usize) {
        metrics::gauge!(QUEUE_DEPTH).set(depth as f64);
    }

    /// Counts an event entering its backoff sleep.
    pub fn retry_scheduled(&self) {
        self.retries_pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an event leaving its backoff sleep, requeued or dropped.
    pub fn retry_settled(&self) {
        let _ = self
            .retries_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    #[must_use]
    pub fn retries_pending(&self) -> u64 {
        self.retries_pending.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_listeners(&self) -> u64 {
        self.active_listeners.load(Ordering::Relaxed)
    }

    /// Copies every counter and timing.
    #[must_use]
    pub fn snapshot(&self) -> SyncStats {
        let last = self.last_sync_time.load(Ordering::Relaxed);
        SyncStats {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_retried: self.events_retried.load(Ordering::Relaxed),
            loop_skips: self.loop_skips.load(Ordering::Relaxed),
            history_gaps: self.history_gaps.load(Ordering::Relaxed),
            listener_restarts: self.listener_restarts.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            active_listeners: self.active_listeners.load(Ordering::Relaxed),
            retries_pending: self.retries_pending.load(Ordering::Relaxed),
            last_sync_time: (last > 0).then_some(last),
            collections: self
                .timings
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health reporting
// ---------------------------------------------------------------------------

/// Health record emitted through the audit sink.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub stats: SyncStats,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub in_flight: u64,
}

/// On-demand tasks for the health reporter.
#[derive(Debug)]
pub enum HealthTask {
    /// Emit a snapshot now instead of waiting for the next tick.
    ReportNow,
}

/// Periodically emits `sync_health_check` audit records.
pub struct HealthReporter {
    metrics: Arc<SyncMetrics>,
    queue: Arc<EventQueue>,
    audit: Arc<dyn AuditSink>,
    in_flight: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl HealthReporter {
    pub fn new(
        metrics: Arc<SyncMetrics>,
        queue: Arc<EventQueue>,
        audit: Arc<dyn AuditSink>,
        in_flight: Arc<dyn Fn() -> u64 + Send + Sync>,
    ) -> Self {
        Self {
            metrics,
            queue,
            audit,
            in_flight,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            stats: self.metrics.snapshot(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            in_flight: (self.in_flight)(),
        }
    }

    async fn report(&self) {
        let snapshot = self.snapshot();
        self.metrics.publish_queue_depth(snapshot.queue_depth);
        debug!(
            queue_depth = snapshot.queue_depth,
            processed = snapshot.stats.events_processed,
            failed = snapshot.stats.events_failed,
            "health snapshot"
        );
        let severity = if snapshot.stats.history_gaps > 0 {
            Severity::Warning
        } else {
            Severity::Info
        };
        let details = serde_json::to_value(&snapshot).unwrap_or_default();
        audit::emit(&self.audit, "sync_health_check", details, severity).await;
    }
}

#[async_trait]
impl BackgroundRunnable for HealthReporter {
    type Task = HealthTask;

    async fn run(&mut self, task: HealthTask) {
        match task {
            HealthTask::ReportNow => self.report().await,
        }
    }

    async fn on_tick(&mut self) {
        self.report().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::worker::BackgroundWorker;

    #[test]
    fn counters_and_timings() {
        let metrics = SyncMetrics::new();
        metrics.record_success("students", Duration::from_millis(10), 1_000);
        metrics.record_success("students", Duration::from_millis(30), 2_000);
        metrics.record_failure("fees");
        metrics.record_retry("fees");
        metrics.record_loop_skip();
        metrics.retry_scheduled();
        metrics.retry_scheduled();
        metrics.retry_settled();

        let stats = metrics.snapshot();
        assert_eq!(stats.events_processed, 2);
        assert_eq!(stats.events_failed, 1);
        assert_eq!(stats.events_retried, 1);
        assert_eq!(stats.loop_skips, 1);
        assert_eq!(stats.retries_pending, 1);
        assert_eq!(stats.last_sync_time, Some(2_000));

        let timing = stats.collections["students"];
        assert_eq!(timing.count, 2);
        assert!((timing.avg_ms - 20.0).abs() < 1.0);
        assert!((timing.max_ms - 30.0).abs() < 1.0);
    }

    #[test]
    fn last_sync_time_absent_before_first_success() {
        let metrics = SyncMetrics::new();
        assert_eq!(metrics.snapshot().last_sync_time, None);
    }

    #[test]
    fn listener_gauge_never_underflows() {
        let metrics = SyncMetrics::new();
        metrics.listener_started();
        metrics.listener_stopped();
        metrics.listener_stopped();
        assert_eq!(metrics.active_listeners(), 0);
    }

    #[tokio::test]
    async fn reporter_emits_on_demand_and_on_tick() {
        let sink = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(SyncMetrics::new());
        let queue = Arc::new(EventQueue::new(8));
        metrics.record_success("rooms", Duration::from_millis(1), 5);

        let reporter = HealthReporter::new(
            Arc::clone(&metrics),
            queue,
            Arc::clone(&sink) as Arc<dyn AuditSink>,
            Arc::new(|| 0),
        );
        let mut worker = BackgroundWorker::start(reporter, Duration::from_millis(30));
        worker.submit(HealthTask::ReportNow).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        worker.stop().await;

        let records = sink.records_of("sync_health_check");
        assert!(records.len() >= 2);
        assert_eq!(records[0].details["stats"]["events_processed"], 1);
        assert_eq!(records[0].details["queue_capacity"], 8);
        assert_eq!(records[0].severity, Severity::Info);
    }
}
