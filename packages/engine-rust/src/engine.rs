//! The sync engine: rule registry, listeners, queue and worker pool wired
//! together behind an explicit start/stop lifecycle.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use fieldsync_core::{ClockSource, EventType, SyncEvent, SyncRule, SystemClock};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::executor::SyncExecutor;
use crate::handlers::{EventHandler, HandlerRegistry};
use crate::listener::{ListenerContext, ListenerSet};
use crate::metrics::{HealthReporter, HealthTask, SyncMetrics, SyncStats};
use crate::processor::Processor;
use crate::queue::EventQueue;
use crate::registry::{RegisteredRule, RuleRegistry};
use crate::shutdown::{EngineState, LifecycleController};
use crate::traits::{AuditSink, ChangeFeedSource, CollectionStore, Severity};
use crate::worker::BackgroundWorker;

/// Snapshot returned by [`SyncEngine::status`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub running: bool,
    pub stats: SyncStats,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    /// Enabled rules.
    pub active_rules: usize,
    pub total_rules: usize,
    pub active_listeners: u64,
    /// Source collections with at least one rule.
    pub collections: Vec<String>,
    pub in_flight: u64,
}

struct RunHandles {
    workers: Vec<JoinHandle<()>>,
    health: BackgroundWorker<HealthReporter>,
}

/// Real-time, rule-driven propagation engine.
///
/// Construct one per process or tenant with its collaborators, register rules
/// and handlers, then [`start`](Self::start). Rules and handlers may be added
/// or removed while running.
pub struct SyncEngine {
    config: EngineConfig,
    feed: Arc<dyn ChangeFeedSource>,
    store: Arc<dyn CollectionStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn ClockSource>,
    registry: Arc<RuleRegistry>,
    handlers: Arc<HandlerRegistry>,
    metrics: Arc<SyncMetrics>,
    lifecycle: Arc<LifecycleController>,
    queue: ArcSwapOption<EventQueue>,
    listeners: Mutex<Option<ListenerSet>>,
    run: tokio::sync::Mutex<Option<RunHandles>>,
}

impl SyncEngine {
    /// Creates a stopped engine.
    pub fn new(
        config: EngineConfig,
        feed: Arc<dyn ChangeFeedSource>,
        store: Arc<dyn CollectionStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let handlers = Arc::new(HandlerRegistry::with_timeout(config.handler_timeout));
        Self {
            config,
            feed,
            store,
            audit,
            clock: Arc::new(SystemClock),
            registry: Arc::new(RuleRegistry::new()),
            handlers,
            metrics: Arc::new(SyncMetrics::new()),
            lifecycle: Arc::new(LifecycleController::new()),
            queue: ArcSwapOption::empty(),
            listeners: Mutex::new(None),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Replaces the clock used for event timestamps and metadata stamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Rules and handlers
    // -----------------------------------------------------------------------

    /// Registers a rule.
    ///
    /// Registering the same rule twice propagates every change twice. When the
    /// engine is running and the rule introduces a new source collection, its
    /// listener starts immediately (unless dynamic listeners are disabled).
    pub fn add_sync_rule(&self, rule: SyncRule) {
        let source = rule.source_collection.clone();
        info!(
            rule = %rule.name,
            source = %source,
            targets = ?rule.target_collections,
            priority = %rule.priority,
            "sync rule added"
        );
        let first_for_source = self.registry.add_rule(rule);

        if first_for_source && self.config.dynamic_listeners && self.lifecycle.is_running() {
            if let Some(set) = self.listeners.lock().as_mut() {
                if set.spawn(&source) {
                    info!(collection = %source, "listener started for new source collection");
                }
            }
        }
    }

    /// Removes every rule of `source` targeting `target`. Returns how many were removed.
    ///
    /// The listener of `source` is retired once it has no rules left.
    pub fn remove_sync_rule(&self, source: &str, target: &str) -> usize {
        let removed = self.registry.remove_rule(source, target);
        info!(source, target, removed, "sync rules removed");

        if removed > 0 && !self.registry.has_rules_for(source) {
            if let Some(set) = self.listeners.lock().as_mut() {
                set.retire(source);
            }
        }
        removed
    }

    /// Registers a post-sync handler under `"<collection>:<event_type>"`.
    pub fn add_event_handler(&self, key: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let key = key.into();
        info!(handler_key = %key, "event handler added");
        self.handlers.add(key, handler);
    }

    #[must_use]
    pub fn rules_for(&self, collection: &str) -> Vec<Arc<RegisteredRule>> {
        self.registry.rules_for(collection)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Starts the worker pool, one listener per source collection and the
    /// health reporter.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadyRunning`] if the engine is not stopped.
    pub async fn start(&self) -> SyncResult<()> {
        let mut run = self.run.lock().await;
        if run.is_some() || self.lifecycle.state() != EngineState::Stopped {
            return Err(SyncError::AlreadyRunning);
        }
        self.lifecycle.set_starting();

        let queue = Arc::new(EventQueue::new(self.config.queue_capacity));
        self.queue.store(Some(Arc::clone(&queue)));
        let shutdown = self.lifecycle.shutdown_receiver();

        let processor = Arc::new(Processor {
            queue: Arc::clone(&queue),
            registry: Arc::clone(&self.registry),
            executor: SyncExecutor::new(Arc::clone(&self.store), Arc::clone(&self.clock)),
            handlers: Arc::clone(&self.handlers),
            metrics: Arc::clone(&self.metrics),
            audit: Arc::clone(&self.audit),
            clock: Arc::clone(&self.clock),
            lifecycle: Arc::clone(&self.lifecycle),
            retry: self.config.retry.clone(),
            poll_timeout: self.config.poll_timeout,
        });
        let workers = processor.spawn_workers(self.config.worker_count, &shutdown);

        let listener_ctx = Arc::new(ListenerContext {
            feed: Arc::clone(&self.feed),
            queue: Arc::clone(&queue),
            metrics: Arc::clone(&self.metrics),
            audit: Arc::clone(&self.audit),
            clock: Arc::clone(&self.clock),
            restart_delay: self.config.listener_restart_delay,
            max_retries: self.config.retry.max_retries,
            skip_engine_writes: self.config.skip_engine_writes,
        });
        let mut listeners = ListenerSet::new(listener_ctx, Handle::current());
        for collection in self.registry.source_collections() {
            listeners.spawn(&collection);
        }
        let collections = listeners.collections();
        *self.listeners.lock() = Some(listeners);

        let lifecycle = Arc::clone(&self.lifecycle);
        let health = BackgroundWorker::start(
            HealthReporter::new(
                Arc::clone(&self.metrics),
                Arc::clone(&queue),
                Arc::clone(&self.audit),
                Arc::new(move || lifecycle.in_flight_count()),
            ),
            self.config.health_interval,
        );

        *run = Some(RunHandles { workers, health });
        self.lifecycle.set_running();

        info!(
            workers = self.config.worker_count,
            listeners = ?collections,
            rules = self.registry.rule_count(),
            queue_capacity = queue.capacity(),
            "sync engine started"
        );
        audit::emit(
            &self.audit,
            "sync_engine_started",
            json!({
                "workers": self.config.worker_count,
                "listeners": collections,
                "rules": self.registry.rule_count(),
                "queue_capacity": queue.capacity(),
            }),
            Severity::Info,
        )
        .await;
        Ok(())
    }

    /// Stops the engine.
    ///
    /// Listeners stop first, then workers get up to the drain timeout to
    /// finish the event they hold; workers still running when it elapses are
    /// aborted. Events still queued or waiting for a retry are dropped and
    /// counted in the shutdown record. Stopping a stopped engine is a no-op.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(handles) = run.take() else {
            return;
        };
        info!("sync engine stopping");
        self.lifecycle.trigger_shutdown();

        let listeners = self.listeners.lock().take();
        if let Some(listeners) = listeners {
            listeners.shutdown().await;
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let drained = self
            .lifecycle
            .wait_for_drain(self.config.drain_timeout)
            .await;
        if !drained {
            warn!(
                in_flight = self.lifecycle.in_flight_count(),
                "drain timeout elapsed, abandoning in-flight events"
            );
        }

        let pending_retries = self.metrics.retries_pending();
        let dropped = self
            .queue
            .swap(None)
            .map_or(0, |queue| queue.close().len());

        // Past the deadline each join gets a single poll before the abort.
        for mut worker in handles.workers {
            match tokio::time::timeout_at(deadline, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "sync worker task failed"),
                Err(_) => {
                    warn!("sync worker did not stop before the drain timeout, aborting");
                    worker.abort();
                }
            }
        }
        let mut health = handles.health;
        health.stop().await;

        self.lifecycle.set_stopped();
        let stats = self.metrics.snapshot();
        info!(
            dropped_events = dropped,
            pending_retries,
            drained,
            processed = stats.events_processed,
            failed = stats.events_failed,
            "sync engine stopped"
        );
        audit::emit(
            &self.audit,
            "sync_engine_stopped",
            json!({
                "dropped_events": dropped,
                "pending_retries": pending_retries,
                "drained": drained,
                "stats": stats,
            }),
            Severity::Info,
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Enqueues a one-off event for `collection`/`document_id` (repair, backfill).
    ///
    /// Inserts, updates and replaces carry the document as currently stored.
    /// Returns the new event's id.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotRunning`] unless the engine is running.
    /// - [`SyncError::NoRules`] if no rule listens to `collection`.
    /// - [`SyncError::DocumentNotFound`] / [`SyncError::Lookup`] when the
    ///   document cannot be loaded.
    pub async fn force_sync(
        &self,
        collection: &str,
        document_id: &str,
        event_type: EventType,
    ) -> SyncResult<String> {
        let Some(queue) = self.queue.load_full().filter(|_| self.lifecycle.is_running()) else {
            return Err(SyncError::NotRunning);
        };
        if !self.registry.has_rules_for(collection) {
            return Err(SyncError::NoRules(collection.to_string()));
        }

        let document = if event_type.is_delete() {
            None
        } else {
            let found = self
                .store
                .find_by_id(collection, document_id)
                .await
                .map_err(|source| SyncError::Lookup {
                    collection: collection.to_string(),
                    document_id: document_id.to_string(),
                    source,
                })?;
            Some(found.ok_or_else(|| SyncError::DocumentNotFound {
                collection: collection.to_string(),
                document_id: document_id.to_string(),
            })?)
        };

        let event = SyncEvent::forced(
            collection,
            document_id,
            event_type,
            document,
            self.config.retry.max_retries,
            self.clock.now(),
        );
        let event_id = event.event_id.clone();
        queue.push(event).await?;
        info!(collection, document_id, %event_type, %event_id, "forced sync queued");
        Ok(event_id)
    }

    /// Current state, counters and queue depth.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let (queue_depth, queue_capacity) = self
            .queue
            .load_full()
            .map_or((0, self.config.queue_capacity), |q| (q.len(), q.capacity()));
        self.metrics.publish_queue_depth(queue_depth);
        let state = self.lifecycle.state();

        EngineStatus {
            state,
            running: state == EngineState::Running,
            stats: self.metrics.snapshot(),
            queue_depth,
            queue_capacity,
            active_rules: self.registry.enabled_rule_count(),
            total_rules: self.registry.rule_count(),
            active_listeners: self.metrics.active_listeners(),
            collections: self.registry.source_collections(),
            in_flight: self.lifecycle.in_flight_count(),
        }
    }

    /// Emits a health snapshot now instead of waiting for the next interval.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotRunning`] if the engine is stopped.
    pub async fn report_health(&self) -> SyncResult<()> {
        let run = self.run.lock().await;
        let Some(handles) = run.as_ref() else {
            return Err(SyncError::NotRunning);
        };
        handles
            .health
            .submit(HealthTask::ReportNow)
            .await
            .map_err(|_| SyncError::NotRunning)
    }
}
