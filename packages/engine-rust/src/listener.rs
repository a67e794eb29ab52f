//! Per-collection change listeners.
//!
//! A listener subscribes to one source collection, turns each notification
//! into a [`SyncEvent`] and pushes it onto the event queue, waiting when the
//! queue is full. When the subscription fails or ends it resubscribes after
//! the configured delay, resuming after the last notification it queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fieldsync_core::{ChangeNotification, ClockSource, SyncEvent};
use futures_util::StreamExt;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::audit;
use crate::error::FeedError;
use crate::metrics::SyncMetrics;
use crate::queue::EventQueue;
use crate::traits::{AuditSink, ChangeFeedSource, ChangeStream, Severity};

/// Shared dependencies of every listener of one engine run.
pub(crate) struct ListenerContext {
    pub feed: Arc<dyn ChangeFeedSource>,
    pub queue: Arc<EventQueue>,
    pub metrics: Arc<SyncMetrics>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn ClockSource>,
    pub restart_delay: Duration,
    pub max_retries: u32,
    pub skip_engine_writes: bool,
}

enum StreamEnd {
    Stopped,
    Closed,
    Failed(String),
}

/// Resolves once `stop` flips to `true` or its sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

struct ChangeListener {
    collection: String,
    ctx: Arc<ListenerContext>,
    resume_token: Option<String>,
    stop: watch::Receiver<bool>,
}

impl ChangeListener {
    async fn run(mut self) {
        info!("change listener started");
        loop {
            if *self.stop.borrow() {
                break;
            }

            let subscription = self
                .ctx
                .feed
                .subscribe(&self.collection, self.resume_token.as_deref())
                .await;

            let reason = match subscription {
                Ok(stream) => {
                    self.ctx.metrics.listener_started();
                    let end = self.consume(stream).await;
                    self.ctx.metrics.listener_stopped();
                    match end {
                        StreamEnd::Stopped => break,
                        StreamEnd::Closed => "change stream closed".to_string(),
                        StreamEnd::Failed(reason) => reason,
                    }
                }
                Err(err) => format!("subscribe failed: {err:#}"),
            };

            error!(error = %reason, resume_token = ?self.resume_token, "change listener failed");
            audit::emit(
                &self.ctx.audit,
                "change_listener_error",
                json!({
                    "collection": self.collection,
                    "error": reason,
                    "resume_token": self.resume_token,
                    "restart_delay_ms": u64::try_from(self.ctx.restart_delay.as_millis()).unwrap_or(u64::MAX),
                }),
                Severity::Error,
            )
            .await;
            self.ctx.metrics.record_listener_restart();

            tokio::select! {
                () = tokio::time::sleep(self.ctx.restart_delay) => {}
                () = stopped(&mut self.stop) => break,
            }
        }
        info!("change listener stopped");
    }

    async fn consume(&mut self, mut stream: ChangeStream) -> StreamEnd {
        loop {
            let item = tokio::select! {
                biased;
                () = stopped(&mut self.stop) => return StreamEnd::Stopped,
                item = stream.next() => item,
            };

            match item {
                None => return StreamEnd::Closed,
                Some(Ok(notification)) => {
                    if !self.enqueue(notification).await {
                        return StreamEnd::Stopped;
                    }
                }
                Some(Err(FeedError::HistoryLost {
                    collection,
                    resume_token,
                })) => {
                    self.ctx.metrics.record_history_gap();
                    // The lost position must not be requested again.
                    self.resume_token = None;
                    error!(?resume_token, "change history lost, continuing from the oldest retained change");
                    audit::emit(
                        &self.ctx.audit,
                        "change_history_lost",
                        json!({ "collection": collection, "resume_token": resume_token }),
                        Severity::Critical,
                    )
                    .await;
                }
                Some(Err(err)) => return StreamEnd::Failed(err.to_string()),
            }
        }
    }

    /// Queues one notification. Returns `false` when the listener must stop.
    async fn enqueue(&mut self, notification: ChangeNotification) -> bool {
        let token = (!notification.resume_token.is_empty())
            .then(|| notification.resume_token.clone());

        if self.ctx.skip_engine_writes && notification.is_engine_write() {
            debug!(document_id = %notification.document_id, "skipping engine write");
            self.ctx.metrics.record_loop_skip();
            self.resume_token = token.or(self.resume_token.take());
            return true;
        }

        let event =
            SyncEvent::from_notification(notification, self.ctx.max_retries, self.ctx.clock.now());
        let event_id = event.event_id.clone();

        let pushed = tokio::select! {
            pushed = self.ctx.queue.push(event) => pushed,
            () = stopped(&mut self.stop) => return false,
        };
        if pushed.is_err() {
            warn!("event queue closed, listener stopping");
            return false;
        }

        debug!(%event_id, "event queued");
        self.resume_token = token.or(self.resume_token.take());
        true
    }
}

struct ListenerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The listeners of one engine run, keyed by source collection.
pub(crate) struct ListenerSet {
    ctx: Arc<ListenerContext>,
    runtime: Handle,
    listeners: HashMap<String, ListenerHandle>,
}

impl ListenerSet {
    pub fn new(ctx: Arc<ListenerContext>, runtime: Handle) -> Self {
        Self {
            ctx,
            runtime,
            listeners: HashMap::new(),
        }
    }

    /// Starts a listener for `collection` unless one is already running.
    /// Returns whether a listener was started.
    pub fn spawn(&mut self, collection: &str) -> bool {
        if self
            .listeners
            .get(collection)
            .is_some_and(|handle| !handle.task.is_finished())
        {
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let listener = ChangeListener {
            collection: collection.to_string(),
            ctx: Arc::clone(&self.ctx),
            resume_token: None,
            stop: stop_rx,
        };
        let span = info_span!("change_listener", collection = %collection);
        let task = self.runtime.spawn(listener.run().instrument(span));
        self.listeners.insert(
            collection.to_string(),
            ListenerHandle {
                stop: stop_tx,
                task,
            },
        );
        true
    }

    /// Signals the listener of `collection` to exit without waiting for it.
    pub fn retire(&mut self, collection: &str) -> bool {
        match self.listeners.remove(collection) {
            Some(handle) => {
                handle.stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Collections with a listener, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = self.listeners.keys().cloned().collect();
        collections.sort();
        collections
    }

    /// Stops every listener and waits for them to exit.
    pub async fn shutdown(self) {
        for handle in self.listeners.values() {
            handle.stop.send_replace(true);
        }
        for (collection, handle) in self.listeners {
            if let Err(err) = handle.task.await {
                warn!(%collection, error = %err, "change listener task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fieldsync_core::{Document, EventType, ManualClock, Priority};
    use serde_json::Value;

    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::storage::MemoryChangeFeed;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    struct Fixture {
        feed: Arc<MemoryChangeFeed>,
        queue: Arc<EventQueue>,
        metrics: Arc<SyncMetrics>,
        audit: Arc<MemoryAuditSink>,
        set: ListenerSet,
    }

    fn fixture(capacity: usize) -> Fixture {
        let feed = Arc::new(MemoryChangeFeed::new());
        let queue = Arc::new(EventQueue::new(capacity));
        let metrics = Arc::new(SyncMetrics::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let ctx = Arc::new(ListenerContext {
            feed: Arc::clone(&feed) as Arc<dyn ChangeFeedSource>,
            queue: Arc::clone(&queue),
            metrics: Arc::clone(&metrics),
            audit: Arc::clone(&audit) as Arc<dyn AuditSink>,
            clock: Arc::new(ManualClock::new(10)),
            restart_delay: Duration::from_millis(20),
            max_retries: 3,
            skip_engine_writes: true,
        });
        Fixture {
            feed,
            queue,
            metrics,
            audit,
            set: ListenerSet::new(ctx, Handle::current()),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn notifications_become_queued_events() {
        let mut fx = fixture(16);
        fx.set.spawn("students");
        wait_until(|| fx.feed.live_subscribers("students") == 1).await;

        fx.feed.publish(ChangeNotification::insert(
            "students",
            "S1",
            doc(serde_json::json!({"_id": "S1", "branch_id": "B1"})),
        ));
        fx.feed.publish(ChangeNotification::delete("students", "S2"));

        let first = fx.queue.pop(Duration::from_secs(1)).await.unwrap();
        let second = fx.queue.pop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.document_id, "S1");
        assert_eq!(first.branch_id.as_deref(), Some("B1"));
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.timestamp, 10);
        assert_eq!(first.correlation_id.as_deref(), Some("students:1"));
        assert_eq!(second.event_type, EventType::Delete);
        assert_eq!(fx.metrics.active_listeners(), 1);

        fx.set.shutdown().await;
        assert_eq!(fx.metrics.active_listeners(), 0);
    }

    #[tokio::test]
    async fn engine_writes_are_skipped() {
        let mut fx = fixture(16);
        fx.set.spawn("parents");
        wait_until(|| fx.feed.live_subscribers("parents") == 1).await;

        fx.feed.publish(ChangeNotification::update(
            "parents",
            "P1",
            doc(serde_json::json!({"student_name": "Ann"})),
            doc(serde_json::json!({"student_name": "Ann", "syncEventID": "e1"})),
        ));
        fx.feed.publish(ChangeNotification::update(
            "parents",
            "P1",
            doc(serde_json::json!({"phone": "555"})),
            doc(serde_json::json!({"phone": "555"})),
        ));

        let event = fx.queue.pop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.correlation_id.as_deref(), Some("parents:2"));
        assert_eq!(fx.metrics.snapshot().loop_skips, 1);
        fx.set.shutdown().await;
    }

    #[tokio::test]
    async fn transport_errors_restart_and_resume() {
        let mut fx = fixture(16);
        fx.set.spawn("fees");
        wait_until(|| fx.feed.live_subscribers("fees") == 1).await;

        fx.feed.publish(ChangeNotification::insert("fees", "F1", doc(serde_json::json!({}))));
        assert_eq!(fx.queue.pop(Duration::from_secs(1)).await.unwrap().document_id, "F1");

        fx.feed.inject_error("fees", FeedError::Transport("connection reset".into()));
        wait_until(|| fx.metrics.snapshot().listener_restarts == 1).await;

        // Published while the listener is down; delivered after it resumes.
        fx.feed.publish(ChangeNotification::insert("fees", "F2", doc(serde_json::json!({}))));
        assert_eq!(fx.queue.pop(Duration::from_secs(1)).await.unwrap().document_id, "F2");

        let errors = fx.audit.records_of("change_listener_error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, Severity::Error);
        assert_eq!(errors[0].details["resume_token"], serde_json::json!("fees:1"));
        fx.set.shutdown().await;
    }

    #[tokio::test]
    async fn failed_subscriptions_are_retried() {
        let mut fx = fixture(16);
        fx.feed.fail_next_subscribes("rooms", 2);
        fx.set.spawn("rooms");

        wait_until(|| fx.feed.live_subscribers("rooms") == 1).await;
        assert_eq!(fx.feed.subscription_count(), 3);
        assert_eq!(fx.metrics.snapshot().listener_restarts, 2);
        fx.set.shutdown().await;
    }

    #[tokio::test]
    async fn history_loss_is_surfaced() {
        let mut fx = fixture(16);
        fx.set.spawn("users");
        wait_until(|| fx.feed.live_subscribers("users") == 1).await;

        fx.feed.inject_error(
            "users",
            FeedError::HistoryLost {
                collection: "users".into(),
                resume_token: Some("users:7".into()),
            },
        );
        fx.feed.publish(ChangeNotification::insert("users", "U1", doc(serde_json::json!({}))));

        assert_eq!(fx.queue.pop(Duration::from_secs(1)).await.unwrap().document_id, "U1");
        assert_eq!(fx.metrics.snapshot().history_gaps, 1);
        let lost = fx.audit.records_of("change_history_lost");
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].severity, Severity::Critical);
        fx.set.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_blocks_listener_without_dropping() {
        let mut fx = fixture(2);
        fx.set.spawn("students");
        wait_until(|| fx.feed.live_subscribers("students") == 1).await;

        for i in 0..5 {
            let id = format!("S{i}");
            fx.feed.publish(ChangeNotification::insert("students", &id, doc(serde_json::json!({}))));
        }
        wait_until(|| fx.queue.len() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.queue.len(), 2);

        let mut seen = Vec::new();
        while seen.len() < 5 {
            let event = fx.queue.pop(Duration::from_secs(1)).await.unwrap();
            seen.push(event.document_id);
        }
        assert_eq!(seen, vec!["S0", "S1", "S2", "S3", "S4"]);
        fx.set.shutdown().await;
    }

    #[tokio::test]
    async fn retire_stops_one_listener() {
        let mut fx = fixture(4);
        assert!(fx.set.spawn("students"));
        assert!(!fx.set.spawn("students"));
        assert!(fx.set.spawn("fees"));
        wait_until(|| fx.metrics.active_listeners() == 2).await;

        assert!(fx.set.retire("students"));
        wait_until(|| fx.metrics.active_listeners() == 1).await;
        assert_eq!(fx.set.collections(), vec!["fees"]);
        fx.set.shutdown().await;
    }
}
