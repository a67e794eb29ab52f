//! Applies one `(event, rule, target)` triple to the target store.
//!
//! Planning (condition gate, mapping, transform, stamps, filter) is pure and
//! lives in [`fieldsync_core::plan`]; this module performs the I/O.

use std::sync::Arc;

use fieldsync_core::plan::soft_delete_payload;
use fieldsync_core::{plan_write, ClockSource, Filter, SyncEvent, SyncRule, WriteKind};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::traits::CollectionStore;

/// Result of executing one rule against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Disabled rule or conditions not met. Not an error.
    Skipped,
    /// Fields set on `matched` documents.
    Updated { matched: u64 },
    /// `matched` documents marked inactive.
    SoftDeleted { matched: u64 },
}

/// Marks every document of `target` matching `filter` inactive.
///
/// Target documents are never removed; the write sets `status`, `deletedAt`,
/// `syncEventID` and `deletedReference`.
///
/// # Errors
///
/// Returns [`SyncError::TargetWrite`] if the store rejects the update.
pub async fn apply_soft_delete(
    store: &dyn CollectionStore,
    target: &str,
    filter: &Filter,
    event: &SyncEvent,
    now: u64,
) -> SyncResult<u64> {
    let payload = soft_delete_payload(event, now);
    store
        .update_many(target, filter, &payload)
        .await
        .map_err(|source| SyncError::TargetWrite {
            collection: target.to_string(),
            source,
        })
}

/// Executes planned writes against a [`CollectionStore`].
pub struct SyncExecutor {
    store: Arc<dyn CollectionStore>,
    clock: Arc<dyn ClockSource>,
}

impl SyncExecutor {
    pub fn new(store: Arc<dyn CollectionStore>, clock: Arc<dyn ClockSource>) -> Self {
        Self { store, clock }
    }

    /// Plans and applies `rule` for `event` against `target`.
    ///
    /// Inserts, updates and replaces become an update-many with the mapped
    /// payload; deletes become a soft delete. Nothing is ever upserted.
    ///
    /// # Errors
    ///
    /// [`SyncError::Transform`] when the rule's transform fails and
    /// [`SyncError::TargetWrite`] when the store rejects the write.
    pub async fn execute(
        &self,
        event: &SyncEvent,
        rule: &SyncRule,
        target: &str,
    ) -> SyncResult<TargetOutcome> {
        let now = self.clock.now();
        let planned = plan_write(rule, event, target, now).map_err(|source| SyncError::Transform {
            rule: rule.name.clone(),
            source,
        })?;
        let Some(write) = planned else {
            debug!(rule = %rule.name, target, event_id = %event.event_id, "rule skipped");
            return Ok(TargetOutcome::Skipped);
        };

        match write.kind {
            WriteKind::SoftDelete => {
                let matched =
                    apply_soft_delete(self.store.as_ref(), &write.target, &write.filter, event, now)
                        .await?;
                Ok(TargetOutcome::SoftDeleted { matched })
            }
            WriteKind::Set => {
                let matched = self
                    .store
                    .update_many(&write.target, &write.filter, &write.payload)
                    .await
                    .map_err(|source| SyncError::TargetWrite {
                        collection: write.target.clone(),
                        source,
                    })?;
                Ok(TargetOutcome::Updated { matched })
            }
        }
    }
}
