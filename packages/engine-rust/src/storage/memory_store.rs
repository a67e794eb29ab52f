//! In-memory [`CollectionStore`] backed by [`DashMap`].
//!
//! Every write publishes a change notification to the attached
//! [`MemoryChangeFeed`], so the store behaves like a database with change
//! streams enabled. Write failures can be injected per collection to exercise
//! the retry path, and writes can be held at a gate to simulate a slow store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use fieldsync_core::{fields, ChangeNotification, Document, Filter};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::storage::MemoryChangeFeed;
use crate::traits::CollectionStore;

#[derive(Debug, Default)]
struct FailurePlan {
    remaining: u32,
    always: bool,
}

/// Whether `doc` equals `filter` on every filter field.
#[must_use]
pub fn matches_filter(doc: &Document, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(field, expected)| doc.get(field) == Some(expected))
}

/// Document store kept entirely in memory.
pub struct MemoryStore {
    collections: DashMap<String, HashMap<String, Document>>,
    feed: Option<Arc<MemoryChangeFeed>>,
    failures: DashMap<String, FailurePlan>,
    gates: DashMap<String, Arc<Semaphore>>,
    update_calls: DashMap<String, u64>,
    lookups: AtomicU64,
    fail_lookups: AtomicBool,
}

impl MemoryStore {
    /// Creates a store that publishes no notifications.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            feed: None,
            failures: DashMap::new(),
            gates: DashMap::new(),
            update_calls: DashMap::new(),
            lookups: AtomicU64::new(0),
            fail_lookups: AtomicBool::new(false),
        }
    }

    /// Creates a store that publishes every write to `feed`.
    #[must_use]
    pub fn with_feed(feed: Arc<MemoryChangeFeed>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new()
        }
    }

    fn publish(&self, notifications: Vec<ChangeNotification>) {
        if let Some(feed) = &self.feed {
            for notification in notifications {
                feed.publish(notification);
            }
        }
    }

    /// Inserts `document` under `id`, setting its `_id`. Replaces silently if present.
    pub fn insert(&self, collection: &str, id: &str, mut document: Document) {
        document.insert(fields::ID.to_string(), Value::String(id.to_string()));
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document.clone());
        self.publish(vec![ChangeNotification::insert(collection, id, document)]);
    }

    /// Inserts a document without publishing a notification (fixture setup).
    pub fn seed(&self, collection: &str, id: &str, mut document: Document) {
        document.insert(fields::ID.to_string(), Value::String(id.to_string()));
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
    }

    /// Sets `changes` on document `id`. Returns `false` if it does not exist.
    pub fn update(&self, collection: &str, id: &str, changes: Document) -> bool {
        let notification = {
            let Some(mut docs) = self.collections.get_mut(collection) else {
                return false;
            };
            let Some(doc) = docs.get_mut(id) else {
                return false;
            };
            let before = doc.clone();
            for (field, value) in &changes {
                doc.insert(field.clone(), value.clone());
            }
            ChangeNotification::update(collection, id, doc.clone(), changes).with_pre_image(before)
        };
        self.publish(vec![notification]);
        true
    }

    /// Replaces document `id` entirely. Returns `false` if it does not exist.
    pub fn replace(&self, collection: &str, id: &str, mut document: Document) -> bool {
        document.insert(fields::ID.to_string(), Value::String(id.to_string()));
        let notification = {
            let Some(mut docs) = self.collections.get_mut(collection) else {
                return false;
            };
            let Some(previous) = docs.insert(id.to_string(), document.clone()) else {
                docs.remove(id);
                return false;
            };
            ChangeNotification::replace(collection, id, document).with_pre_image(previous)
        };
        self.publish(vec![notification]);
        true
    }

    /// Removes document `id`. Returns the removed document.
    pub fn delete(&self, collection: &str, id: &str) -> Option<Document> {
        let removed = self.collections.get_mut(collection)?.remove(id)?;
        self.publish(vec![
            ChangeNotification::delete(collection, id).with_pre_image(removed.clone())
        ]);
        Some(removed)
    }

    /// Snapshot of document `id`.
    #[must_use]
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections.get(collection)?.get(id).cloned()
    }

    /// Snapshot of every document in `collection`, sorted by id.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        let mut entries: Vec<(&String, &Document)> = docs.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, doc)| doc.clone()).collect()
    }

    /// Documents in `collection` matching the equality `filter`.
    #[must_use]
    pub fn find(&self, collection: &str, filter: &Filter) -> Vec<Document> {
        self.documents(collection)
            .into_iter()
            .filter(|doc| matches_filter(doc, filter))
            .collect()
    }

    /// Makes the next `count` `update_many` calls on `collection` fail.
    pub fn fail_next_writes(&self, collection: &str, count: u32) {
        self.failures.entry(collection.to_string()).or_default().remaining = count;
    }

    /// Makes every `update_many` call on `collection` fail until cleared.
    pub fn fail_always(&self, collection: &str, always: bool) {
        self.failures.entry(collection.to_string()).or_default().always = always;
    }

    /// Holds every `update_many` call on `collection` until it gets a permit.
    ///
    /// The returned semaphore starts empty; each `add_permits(n)` lets `n`
    /// writes through. Calling again returns the same gate.
    pub fn gate_writes(&self, collection: &str) -> Arc<Semaphore> {
        Arc::clone(
            &self
                .gates
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }

    /// Makes every `find_by_id` call fail until cleared.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::Relaxed);
    }

    /// Number of `update_many` calls against `collection`, failed ones included.
    #[must_use]
    pub fn update_calls(&self, collection: &str) -> u64 {
        self.update_calls.get(collection).map_or(0, |n| *n)
    }

    /// Number of `find_by_id` calls.
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    fn take_failure(&self, collection: &str) -> bool {
        let Some(mut plan) = self.failures.get_mut(collection) else {
            return false;
        };
        if plan.always {
            return true;
        }
        if plan.remaining > 0 {
            plan.remaining -= 1;
            return true;
        }
        false
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn find_by_id(&self, collection: &str, id: &str) -> anyhow::Result<Option<Document>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if self.fail_lookups.load(Ordering::Relaxed) {
            anyhow::bail!("lookup in {collection} timed out");
        }
        Ok(self.get(collection, id))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        payload: &Document,
    ) -> anyhow::Result<u64> {
        let gate = self.gates.get(collection).map(|gate| Arc::clone(&gate));
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .context("write gate closed")?
                .forget();
        }
        *self.update_calls.entry(collection.to_string()).or_default() += 1;
        if self.take_failure(collection) {
            anyhow::bail!("write to {collection} rejected: injected failure");
        }

        let notifications = {
            let Some(mut docs) = self.collections.get_mut(collection) else {
                return Ok(0);
            };
            let mut notifications = Vec::new();
            for (id, doc) in docs.iter_mut() {
                if !matches_filter(doc, filter) {
                    continue;
                }
                let before = doc.clone();
                for (field, value) in payload {
                    doc.insert(field.clone(), value.clone());
                }
                notifications.push(
                    ChangeNotification::update(collection, id, doc.clone(), payload.clone())
                        .with_pre_image(before),
                );
            }
            notifications
        };

        let matched = u64::try_from(notifications.len()).context("match count overflow")?;
        self.publish(notifications);
        Ok(matched)
    }
}
