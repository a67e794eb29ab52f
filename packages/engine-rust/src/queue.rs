//! Bounded, priority-laned event queue.
//!
//! The queue is the only hand-off point between change listeners and the
//! processor pool. It has four FIFO lanes (critical, high, medium, low) that
//! share one capacity budget:
//!
//! - `push` waits while the queue is full (backpressure), it never drops.
//! - `pop` takes from the highest non-empty lane and gives up after a timeout
//!   so workers can observe shutdown.
//!
//! Every queued event owns one capacity [`Slot`]. Workers take the slot along
//! with the event ([`EventQueue::pop_with_slot`]) and keep it while the event
//! is processed or waits out a retry backoff, then hand it back through
//! [`EventQueue::requeue`]. The capacity therefore bounds queued, in-process
//! and backing-off events together.
//!
//! Capacity and occupancy are tracked with two semaphores; the lanes
//! themselves sit behind a short-lived `parking_lot` mutex.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use fieldsync_core::{Priority, SyncEvent};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::SyncError;

const LANES: usize = Priority::DESCENDING.len();

/// Error returned by [`EventQueue::try_push`], handing the event back.
#[derive(Debug)]
pub enum TryPushError {
    /// Every slot is taken.
    Full(SyncEvent),
    /// The queue was closed.
    Closed(SyncEvent),
}

/// One unit of queue capacity. Dropping it frees the capacity.
#[derive(Debug)]
pub struct Slot(OwnedSemaphorePermit);

type Lane = VecDeque<(SyncEvent, Slot)>;

/// Bounded multi-producer multi-consumer queue of sync events.
pub struct EventQueue {
    lanes: Mutex<[Lane; LANES]>,
    free_slots: Arc<Semaphore>,
    queued: Semaphore,
    capacity: usize,
}

impl EventQueue {
    /// Creates a queue holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lanes: Mutex::new(Default::default()),
            free_slots: Arc::new(Semaphore::new(capacity)),
            queued: Semaphore::new(0),
            capacity,
        }
    }

    /// Appends an event to the tail of its priority lane, waiting for space.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::QueueClosed`] if the queue is closed before space frees up.
    pub async fn push(&self, event: SyncEvent) -> Result<(), SyncError> {
        let permit = Arc::clone(&self.free_slots)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::QueueClosed)?;
        self.enqueue(event, Slot(permit));
        Ok(())
    }

    /// Appends an event without waiting.
    ///
    /// # Errors
    ///
    /// Hands the event back when the queue is full or closed.
    pub fn try_push(&self, event: SyncEvent) -> Result<(), TryPushError> {
        match Arc::clone(&self.free_slots).try_acquire_owned() {
            Ok(permit) => {
                self.enqueue(event, Slot(permit));
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(TryPushError::Full(event)),
            Err(TryAcquireError::Closed) => Err(TryPushError::Closed(event)),
        }
    }

    /// Puts an event back using the slot it already holds. Never waits.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::QueueClosed`] if the queue is closed; the event and
    /// its slot are dropped.
    pub fn requeue(&self, event: SyncEvent, slot: Slot) -> Result<(), SyncError> {
        if self.is_closed() {
            return Err(SyncError::QueueClosed);
        }
        self.enqueue(event, slot);
        Ok(())
    }

    fn enqueue(&self, event: SyncEvent, slot: Slot) {
        let lane = event.priority.lane();
        self.lanes.lock()[lane].push_back((event, slot));
        self.queued.add_permits(1);
    }

    /// Removes the oldest event of the highest non-empty lane and frees its slot.
    ///
    /// Returns `None` if nothing arrives within `timeout` or the queue is closed.
    pub async fn pop(&self, timeout: Duration) -> Option<SyncEvent> {
        self.pop_with_slot(timeout).await.map(|(event, _slot)| event)
    }

    /// Like [`pop`](Self::pop), but the caller keeps the event's slot until it
    /// drops it or hands it back through [`requeue`](Self::requeue).
    pub async fn pop_with_slot(&self, timeout: Duration) -> Option<(SyncEvent, Slot)> {
        let item = tokio::time::timeout(timeout, self.queued.acquire())
            .await
            .ok()?
            .ok()?;
        item.forget();
        self.lanes.lock().iter_mut().find_map(VecDeque::pop_front)
    }

    /// Closes the queue and returns the events that were never processed.
    ///
    /// Blocked producers fail with [`SyncError::QueueClosed`]; consumers get `None`.
    pub fn close(&self) -> Vec<SyncEvent> {
        self.free_slots.close();
        self.queued.close();
        let mut lanes = self.lanes.lock();
        lanes
            .iter_mut()
            .flat_map(std::mem::take)
            .map(|(event, _slot)| event)
            .collect()
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queued.is_closed()
    }

    /// Slots neither queued nor held by a worker or a pending retry.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.free_slots.available_permits()
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.lock().iter().map(VecDeque::len).sum()
    }

    /// Whether no event is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of events queued or held through their slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued events per lane, critical first.
    #[must_use]
    pub fn lane_depths(&self) -> [usize; LANES] {
        let lanes = self.lanes.lock();
        std::array::from_fn(|i| lanes[i].len())
    }
}
