//! Engine lifecycle controller with in-flight event tracking.
//!
//! Uses `ArcSwap` for lock-free state reads and an atomic counter with RAII
//! guards so `stop()` knows when workers have finished their current event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;

/// Lifecycle state of a [`SyncEngine`](crate::SyncEngine).
///
/// State machine: Stopped -> Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Not started, or fully stopped.
    Stopped,
    /// Listeners and workers are being spawned.
    Starting,
    /// Accepting and processing events.
    Running,
    /// Listeners are closed; workers finish their in-flight events.
    Draining,
}

impl EngineState {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
        }
    }
}

/// Coordinates start and graceful stop across listeners and workers.
///
/// 1. Background tasks hold a `shutdown_receiver()` and exit once it flips.
/// 2. Workers hold an `in_flight_guard()` while processing an event.
/// 3. `trigger_shutdown()` moves to `Draining` and signals every receiver.
/// 4. `wait_for_drain()` waits until no event is in flight.
/// 5. The owner releases its resources and calls `set_stopped()`.
#[derive(Debug)]
pub struct LifecycleController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<EngineState>,
}

impl LifecycleController {
    /// Creates a controller in the `Stopped` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(EngineState::Stopped),
        }
    }

    /// Moves to `Starting` and re-arms the shutdown signal for a new run.
    pub fn set_starting(&self) {
        self.state.store(Arc::new(EngineState::Starting));
        self.shutdown_signal.send_replace(false);
    }

    /// Moves to `Running`.
    pub fn set_running(&self) {
        self.state.store(Arc::new(EngineState::Running));
    }

    /// Moves to `Stopped` regardless of in-flight work.
    pub fn set_stopped(&self) {
        self.state.store(Arc::new(EngineState::Stopped));
    }

    /// Returns a receiver that flips to `true` when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and signals all shutdown receivers.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(EngineState::Draining));
        self.shutdown_signal.send_replace(true);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        **self.state.load()
    }

    /// Whether the engine is accepting events.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Creates an RAII guard that counts one in-flight event.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Number of events currently being processed.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight events to finish, up to `timeout`.
    ///
    /// Returns `true` when everything drained, `false` on timeout. The state
    /// stays at `Draining` either way.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped, including
/// during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
