//! Rule registry keyed by source collection.
//!
//! Readers load an immutable snapshot through `ArcSwap`, so workers never
//! block on concurrent `add_rule`/`remove_rule` calls. Writers copy the map,
//! modify the copy and swap it in (RCU).
//!
//! Every registration gets an id that never changes and is never reused, so
//! per-event progress stays attached to the same rule while other rules come
//! and go.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use fieldsync_core::SyncRule;

/// A rule together with the id it was registered under.
#[derive(Debug)]
pub struct RegisteredRule {
    pub id: u64,
    pub rule: SyncRule,
}

impl RegisteredRule {
    /// Key recorded in an event's completed targets for this registration.
    #[must_use]
    pub fn progress_key(&self) -> String {
        format!("{}#{}", self.rule.name, self.id)
    }
}

impl Deref for RegisteredRule {
    type Target = SyncRule;

    fn deref(&self) -> &SyncRule {
        &self.rule
    }
}

type RuleMap = HashMap<String, Vec<Arc<RegisteredRule>>>;

/// Registry of sync rules.
///
/// Duplicate registration is allowed and results in duplicate propagation.
pub struct RuleRegistry {
    rules: ArcSwap<RuleMap>,
    next_id: AtomicU64,
}

impl RuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(RuleMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a rule under its source collection.
    ///
    /// Rules of one collection stay ordered by priority, highest first, and by
    /// registration order within a priority. Returns `true` when this is the
    /// first rule for the source collection.
    pub fn add_rule(&self, rule: SyncRule) -> bool {
        let source = rule.source_collection.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rule = Arc::new(RegisteredRule { id, rule });
        let previous = self.rules.rcu(|current| {
            let mut next = RuleMap::clone(current);
            let list = next.entry(source.clone()).or_default();
            let position = list
                .iter()
                .position(|existing| existing.priority < rule.priority)
                .unwrap_or(list.len());
            list.insert(position, Arc::clone(&rule));
            next
        });
        !previous.contains_key(&source)
    }

    /// Removes every rule of `source` that targets `target`. Returns how many were removed.
    pub fn remove_rule(&self, source: &str, target: &str) -> usize {
        // The closure may run more than once; the last run is the one swapped in.
        let mut removed = 0;
        self.rules.rcu(|current| {
            let mut next = RuleMap::clone(current);
            removed = 0;
            if let Some(list) = next.get_mut(source) {
                let before = list.len();
                list.retain(|rule| !rule.targets_collection(target));
                removed = before - list.len();
                if list.is_empty() {
                    next.remove(source);
                }
            }
            next
        });
        removed
    }

    /// Rules registered for `collection`, highest priority first.
    #[must_use]
    pub fn rules_for(&self, collection: &str) -> Vec<Arc<RegisteredRule>> {
        self.rules
            .load()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any rule listens to `collection`.
    #[must_use]
    pub fn has_rules_for(&self, collection: &str) -> bool {
        self.rules.load().contains_key(collection)
    }

    /// Distinct source collections, sorted.
    #[must_use]
    pub fn source_collections(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.rules.load().keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Total number of registered rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.load().values().map(Vec::len).sum()
    }

    /// Number of enabled rules.
    #[must_use]
    pub fn enabled_rule_count(&self) -> usize {
        self.rules
            .load()
            .values()
            .flatten()
            .filter(|rule| rule.enabled)
            .count()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
