//! Event processor pool.
//!
//! A fixed number of workers pop events from the shared queue, run every rule
//! registered for the event's collection through the [`SyncExecutor`], and
//! handle retry bookkeeping. Targets that were written by an earlier attempt
//! are skipped on retry. After a successful event the registered handlers run
//! as a side channel.
//!
//! An event keeps its queue [`Slot`] until it completes or fails for good. A
//! retrying event carries the slot through its backoff and back into the
//! queue, so retries never push the engine past its queue capacity.

use std::sync::Arc;
use std::time::Duration;

use fieldsync_core::{ClockSource, EventStatus, SyncEvent};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::audit;
use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use crate::executor::{SyncExecutor, TargetOutcome};
use crate::handlers::HandlerRegistry;
use crate::listener::stopped;
use crate::metrics::SyncMetrics;
use crate::queue::{EventQueue, Slot};
use crate::registry::RuleRegistry;
use crate::shutdown::LifecycleController;
use crate::traits::{AuditSink, Severity};

/// What happened to an event after one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// All applicable targets written.
    Completed,
    /// Re-enqueued after the given backoff.
    Retrying(Duration),
    /// Dropped after exhausting retries or on a permanent error.
    Failed,
}

/// Shared state of the worker pool for one engine run.
pub(crate) struct Processor {
    pub queue: Arc<EventQueue>,
    pub registry: Arc<RuleRegistry>,
    pub executor: SyncExecutor,
    pub handlers: Arc<HandlerRegistry>,
    pub metrics: Arc<SyncMetrics>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn ClockSource>,
    pub lifecycle: Arc<LifecycleController>,
    pub retry: RetryPolicy,
    pub poll_timeout: Duration,
}

impl Processor {
    /// Spawns `count` workers that run until `shutdown` flips.
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|id| {
                let processor = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(
                    processor
                        .run_worker(shutdown)
                        .instrument(info_span!("sync_worker", worker = id)),
                )
            })
            .collect()
    }

    async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("worker started");
        loop {
            let popped = tokio::select! {
                biased;
                () = stopped(&mut shutdown) => break,
                popped = self.queue.pop_with_slot(self.poll_timeout) => popped,
            };
            let Some((event, slot)) = popped else {
                if self.queue.is_closed() {
                    break;
                }
                continue;
            };

            let _in_flight = self.lifecycle.in_flight_guard();
            self.process(event, slot).await;
        }
        info!("worker stopped");
    }

    /// Runs one attempt of `event` and settles it.
    ///
    /// `slot` is released once the event is settled, or handed to the retry
    /// when the event is retried.
    pub async fn process(self: &Arc<Self>, mut event: SyncEvent, slot: Slot) -> Disposition {
        event.status = EventStatus::Processing;
        let started = Instant::now();
        let result = self.propagate(&mut event).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                event.status = EventStatus::Completed;
                self.metrics
                    .record_success(&event.collection_name, elapsed, self.clock.now());
                debug!(
                    event_id = %event.event_id,
                    collection = %event.collection_name,
                    retry_count = event.retry_count,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "event completed"
                );
                drop(slot);
                let report = self.handlers.dispatch(&event).await;
                for _ in 0..report.failed {
                    self.metrics.record_handler_failure();
                }
                Disposition::Completed
            }
            Err(err) => {
                self.metrics.record_timing(&event.collection_name, elapsed);
                self.settle_failure(event, slot, &err).await
            }
        }
    }

    /// Applies every rule of the event's collection to each of its targets.
    ///
    /// All pending targets are attempted even after a failure so one broken
    /// target does not hold back the others. Returns the first permanent
    /// error if any, otherwise the first error.
    async fn propagate(&self, event: &mut SyncEvent) -> SyncResult<()> {
        let rules = self.registry.rules_for(&event.collection_name);
        let mut first_error: Option<SyncError> = None;

        for rule in &rules {
            let rule_key = rule.progress_key();
            for target in &rule.target_collections {
                if event.is_target_done(&rule_key, target) {
                    continue;
                }
                match self.executor.execute(event, &rule.rule, target).await {
                    Ok(outcome) => {
                        if outcome != TargetOutcome::Skipped {
                            debug!(rule = %rule.name, target = %target, ?outcome, "target synced");
                        }
                        event.mark_target_done(&rule_key, target);
                    }
                    Err(err) => {
                        warn!(rule = %rule.name, target = %target, error = %err, "target sync failed");
                        let replace = match &first_error {
                            None => true,
                            Some(first) => first.is_retryable() && !err.is_retryable(),
                        };
                        if replace {
                            first_error = Some(err);
                        }
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn settle_failure(
        self: &Arc<Self>,
        mut event: SyncEvent,
        slot: Slot,
        err: &SyncError,
    ) -> Disposition {
        if err.is_retryable() && event.can_retry() {
            event.retry_count += 1;
            event.status = EventStatus::Retrying;
            let delay = self.retry.delay_for(event.retry_count);
            self.metrics.record_retry(&event.collection_name);
            warn!(
                event_id = %event.event_id,
                collection = %event.collection_name,
                retry_count = event.retry_count,
                max_retries = event.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "event failed, retrying"
            );
            self.schedule_retry(event, slot, delay);
            return Disposition::Retrying(delay);
        }

        drop(slot);
        event.status = EventStatus::Failed;
        self.metrics.record_failure(&event.collection_name);
        error!(
            event_id = %event.event_id,
            collection = %event.collection_name,
            document_id = %event.document_id,
            retry_count = event.retry_count,
            retryable = err.is_retryable(),
            error = %err,
            "event failed permanently"
        );
        audit::emit(
            &self.audit,
            "sync_event_failed",
            json!({
                "event_id": event.event_id,
                "event_type": event.event_type,
                "collection": event.collection_name,
                "document_id": event.document_id,
                "branch_id": event.branch_id,
                "user_id": event.user_id,
                "error": err.to_string(),
                "retryable": err.is_retryable(),
                "retry_count": event.retry_count,
                "max_retries": event.max_retries,
                "completed_targets": event.completed_targets,
            }),
            Severity::Error,
        )
        .await;
        Disposition::Failed
    }

    /// Re-enqueues `event` at the tail of its lane after `delay`.
    ///
    /// The sleep runs on its own task so the worker keeps draining the queue.
    /// The event's slot stays reserved during the backoff and is reused for
    /// the requeue, which therefore never waits. Shutdown drops the pending
    /// retry.
    fn schedule_retry(self: &Arc<Self>, mut event: SyncEvent, slot: Slot, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        let metrics = Arc::clone(&self.metrics);
        let mut shutdown = self.lifecycle.shutdown_receiver();
        metrics.retry_scheduled();

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    event.status = EventStatus::Pending;
                    let event_id = event.event_id.clone();
                    if queue.requeue(event, slot).is_err() {
                        debug!(%event_id, "queue closed, retry dropped");
                    }
                }
                () = stopped(&mut shutdown) => debug!(event_id = %event.event_id, "shutdown, retry dropped"),
            }
            metrics.retry_settled();
        });
    }
}
