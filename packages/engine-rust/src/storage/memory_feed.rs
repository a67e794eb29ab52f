//! In-memory [`ChangeFeedSource`] with resumable, bounded per-collection history.
//!
//! Every published notification gets a sequence number and the resume token
//! `"<collection>:<seq>"`. Subscribers receive live notifications through a
//! broadcast channel; a subscriber that falls behind the channel or resumes
//! from an old token is caught up from the retained history. When the history
//! no longer covers the requested position the stream yields
//! [`FeedError::HistoryLost`] and continues from the oldest retained entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fieldsync_core::{ChangeNotification, ClockSource, SystemClock};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::FeedError;
use crate::traits::{ChangeFeedSource, ChangeStream};

const DEFAULT_RETENTION: usize = 10_000;
const CHANNEL_CAPACITY: usize = 1_024;

type FeedItem = Result<(u64, ChangeNotification), FeedError>;

struct FeedLog {
    history: VecDeque<(u64, ChangeNotification)>,
    next_seq: u64,
    sender: broadcast::Sender<FeedItem>,
}

impl FeedLog {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: VecDeque::new(),
            next_seq: 1,
            sender,
        }
    }

    fn oldest_seq(&self) -> u64 {
        self.history.front().map_or(self.next_seq, |(seq, _)| *seq)
    }

    /// Retained entries from `from_seq` on, and whether entries before them were lost.
    fn replay_from(&self, from_seq: u64) -> (bool, Vec<(u64, ChangeNotification)>) {
        let gap = from_seq < self.oldest_seq();
        let entries = self
            .history
            .iter()
            .filter(|(seq, _)| *seq >= from_seq)
            .cloned()
            .collect();
        (gap, entries)
    }
}

fn parse_token(collection: &str, token: &str) -> Option<u64> {
    let (name, seq) = token.rsplit_once(':')?;
    if name != collection {
        return None;
    }
    seq.parse().ok()
}

struct Subscription {
    collection: String,
    log: Arc<Mutex<FeedLog>>,
    rx: broadcast::Receiver<FeedItem>,
    next_expected: u64,
    pending: VecDeque<Result<ChangeNotification, FeedError>>,
}

impl Subscription {
    fn queue_replay(&mut self, gap: bool, resume_token: Option<String>, entries: Vec<(u64, ChangeNotification)>) {
        if gap {
            self.pending.push_back(Err(FeedError::HistoryLost {
                collection: self.collection.clone(),
                resume_token,
            }));
        }
        for (seq, notification) in entries {
            self.next_expected = seq + 1;
            self.pending.push_back(Ok(notification));
        }
    }

    fn catch_up(&mut self) {
        let (gap, entries) = self.log.lock().replay_from(self.next_expected);
        let token = self
            .next_expected
            .checked_sub(1)
            .map(|seq| format!("{}:{seq}", self.collection));
        self.queue_replay(gap, token, entries);
    }

    async fn next(&mut self) -> Option<Result<ChangeNotification, FeedError>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            match self.rx.recv().await {
                Ok(Ok((seq, notification))) => {
                    if seq < self.next_expected {
                        continue;
                    }
                    self.next_expected = seq + 1;
                    return Some(Ok(notification));
                }
                Ok(Err(err)) => return Some(Err(err)),
                Err(RecvError::Lagged(_)) => self.catch_up(),
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Change feed kept entirely in memory.
pub struct MemoryChangeFeed {
    logs: DashMap<String, Arc<Mutex<FeedLog>>>,
    retention: usize,
    clock: Arc<dyn ClockSource>,
    subscribe_failures: DashMap<String, u32>,
    subscriptions: AtomicU64,
}

impl MemoryChangeFeed {
    #[must_use]
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
            retention: DEFAULT_RETENTION,
            clock: Arc::new(SystemClock),
            subscribe_failures: DashMap::new(),
            subscriptions: AtomicU64::new(0),
        }
    }

    /// Keeps at most `retention` notifications per collection (minimum 1).
    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Uses `clock` for the notifications' cluster time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    fn log(&self, collection: &str) -> Arc<Mutex<FeedLog>> {
        Arc::clone(
            self.logs
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(FeedLog::new())))
                .value(),
        )
    }

    /// Appends a notification, assigning its resume token and cluster time.
    pub fn publish(&self, notification: ChangeNotification) -> ChangeNotification {
        let log = self.log(&notification.collection);
        let mut log = log.lock();
        let seq = log.next_seq;
        log.next_seq += 1;
        let token = format!("{}:{seq}", notification.collection);
        let notification = notification.at_position(token, self.clock.now());

        log.history.push_back((seq, notification.clone()));
        while log.history.len() > self.retention {
            log.history.pop_front();
        }
        // No live subscriber is fine.
        let _ = log.sender.send(Ok((seq, notification.clone())));
        notification
    }

    /// Delivers `error` to every live subscriber of `collection`.
    pub fn inject_error(&self, collection: &str, error: FeedError) {
        let log = self.log(collection);
        let log = log.lock();
        let _ = log.sender.send(Err(error));
    }

    /// Ends every live stream of `collection` after its buffered items.
    pub fn close_subscriptions(&self, collection: &str) {
        let log = self.log(collection);
        let mut log = log.lock();
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        log.sender = sender;
    }

    /// Makes the next `count` subscribe calls for `collection` fail.
    pub fn fail_next_subscribes(&self, collection: &str, count: u32) {
        self.subscribe_failures.insert(collection.to_string(), count);
    }

    /// Retained notifications of `collection`, oldest first.
    #[must_use]
    pub fn history(&self, collection: &str) -> Vec<ChangeNotification> {
        self.logs.get(collection).map_or_else(Vec::new, |log| {
            log.lock().history.iter().map(|(_, n)| n.clone()).collect()
        })
    }

    /// Number of subscriptions opened so far, failed attempts included.
    #[must_use]
    pub fn subscription_count(&self) -> u64 {
        self.subscriptions.load(Ordering::Relaxed)
    }

    /// Number of live subscribers on `collection`.
    #[must_use]
    pub fn live_subscribers(&self, collection: &str) -> usize {
        self.logs
            .get(collection)
            .map_or(0, |log| log.lock().sender.receiver_count())
    }

    fn take_subscribe_failure(&self, collection: &str) -> bool {
        let mut failed = false;
        self.subscribe_failures.remove_if_mut(collection, |_, remaining| {
            if *remaining > 0 {
                *remaining -= 1;
                failed = true;
            }
            *remaining == 0
        });
        failed
    }
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeedSource for MemoryChangeFeed {
    async fn subscribe(
        &self,
        collection: &str,
        resume_after: Option<&str>,
    ) -> anyhow::Result<ChangeStream> {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
        if self.take_subscribe_failure(collection) {
            anyhow::bail!("change feed for {collection} unavailable");
        }

        let log = self.log(collection);
        let subscription = {
            let guard = log.lock();
            let mut subscription = Subscription {
                collection: collection.to_string(),
                log: Arc::clone(&log),
                rx: guard.sender.subscribe(),
                next_expected: guard.next_seq,
                pending: VecDeque::new(),
            };
            if let Some(token) = resume_after {
                match parse_token(collection, token) {
                    Some(seq) => {
                        let (gap, entries) = guard.replay_from(seq + 1);
                        subscription.queue_replay(gap, Some(token.to_string()), entries);
                    }
                    None => subscription.queue_replay(true, Some(token.to_string()), Vec::new()),
                }
            }
            subscription
        };

        let stream = futures_util::stream::unfold(subscription, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fieldsync_core::{Document, ManualClock};
    use serde_json::json;

    use super::*;

    fn doc(id: &str) -> Document {
        json!({ "_id": id }).as_object().cloned().unwrap()
    }

    async fn next(stream: &mut ChangeStream) -> Result<ChangeNotification, FeedError> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn live_notifications_get_positions() {
        let clock = Arc::new(ManualClock::new(500));
        let feed = MemoryChangeFeed::new().with_clock(clock);
        let mut stream = feed.subscribe("students", None).await.unwrap();

        feed.publish(ChangeNotification::insert("students", "S1", doc("S1")));
        let n = next(&mut stream).await.unwrap();
        assert_eq!(n.document_id, "S1");
        assert_eq!(n.resume_token, "students:1");
        assert_eq!(n.cluster_time, 500);
    }

    #[tokio::test]
    async fn subscribe_from_now_skips_history() {
        let feed = MemoryChangeFeed::new();
        feed.publish(ChangeNotification::insert("students", "old", doc("old")));
        let mut stream = feed.subscribe("students", None).await.unwrap();
        feed.publish(ChangeNotification::insert("students", "new", doc("new")));
        assert_eq!(next(&mut stream).await.unwrap().document_id, "new");
    }

    #[tokio::test]
    async fn resume_replays_after_token() {
        let feed = MemoryChangeFeed::new();
        for id in ["a", "b", "c"] {
            feed.publish(ChangeNotification::insert("students", id, doc(id)));
        }
        let mut stream = feed.subscribe("students", Some("students:1")).await.unwrap();
        assert_eq!(next(&mut stream).await.unwrap().document_id, "b");
        assert_eq!(next(&mut stream).await.unwrap().document_id, "c");

        feed.publish(ChangeNotification::insert("students", "d", doc("d")));
        assert_eq!(next(&mut stream).await.unwrap().document_id, "d");
    }

    #[tokio::test]
    async fn expired_token_reports_history_lost() {
        let feed = MemoryChangeFeed::new().with_retention(2);
        for id in ["a", "b", "c", "d"] {
            feed.publish(ChangeNotification::insert("fees", id, doc(id)));
        }
        assert_eq!(feed.history("fees").len(), 2);

        let mut stream = feed.subscribe("fees", Some("fees:1")).await.unwrap();
        assert!(matches!(
            next(&mut stream).await,
            Err(FeedError::HistoryLost { .. })
        ));
        assert_eq!(next(&mut stream).await.unwrap().document_id, "c");
        assert_eq!(next(&mut stream).await.unwrap().document_id, "d");
    }

    #[tokio::test]
    async fn foreign_token_reports_history_lost() {
        let feed = MemoryChangeFeed::new();
        let mut stream = feed.subscribe("fees", Some("rooms:3")).await.unwrap();
        assert!(matches!(
            next(&mut stream).await,
            Err(FeedError::HistoryLost { .. })
        ));
    }

    #[tokio::test]
    async fn injected_errors_and_closed_streams() {
        let feed = MemoryChangeFeed::new();
        let mut stream = feed.subscribe("rooms", None).await.unwrap();
        assert_eq!(feed.live_subscribers("rooms"), 1);

        feed.inject_error("rooms", FeedError::Transport("reset".into()));
        assert_eq!(
            next(&mut stream).await,
            Err(FeedError::Transport("reset".into()))
        );

        feed.close_subscriptions("rooms");
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_catches_up_from_history() {
        let feed = MemoryChangeFeed::new();
        let mut stream = feed.subscribe("students", None).await.unwrap();
        let total = CHANNEL_CAPACITY + 50;
        for i in 0..total {
            let id = i.to_string();
            feed.publish(ChangeNotification::insert("students", &id, doc(&id)));
        }
        for i in 0..total {
            assert_eq!(next(&mut stream).await.unwrap().document_id, i.to_string());
        }
    }

    #[tokio::test]
    async fn subscribe_failures_are_consumed() {
        let feed = MemoryChangeFeed::new();
        feed.fail_next_subscribes("students", 2);
        assert!(feed.subscribe("students", None).await.is_err());
        assert!(feed.subscribe("students", None).await.is_err());
        assert!(feed.subscribe("students", None).await.is_ok());
        assert_eq!(feed.subscription_count(), 3);
    }
}
