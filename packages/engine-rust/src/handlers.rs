//! Post-sync event handlers.
//!
//! Handlers are registered under `"<collection>:<event_type>"` and run after an
//! event propagated successfully. They are a side channel: errors, panics
//! and handlers that outlive their timeout are logged and counted, never fed
//! back into the sync outcome.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldsync_core::SyncEvent;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tracing::{error, warn};

/// Callback invoked after an event was propagated.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &SyncEvent) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(SyncEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &SyncEvent) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wraps an async closure as a handler.
///
/// ```
/// use fieldsync_engine::handlers::handler_fn;
///
/// let handler = handler_fn(|event| async move {
///     tracing::info!(document_id = %event.document_id, "student changed");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(SyncEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Outcome of dispatching one event to its handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Handlers keyed by `"<collection>:<event_type>"`.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    timeout: Duration,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HANDLER_TIMEOUT)
    }

    /// Creates a registry whose handlers are abandoned after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Appends a handler for `key`.
    pub fn add(&self, key: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(key.into())
            .or_default()
            .push(handler);
    }

    #[must_use]
    pub fn handler_count(&self, key: &str) -> usize {
        self.handlers.read().get(key).map_or(0, Vec::len)
    }

    /// Runs every handler registered for the event's key, in registration order.
    ///
    /// A handler still running after the registry's timeout is dropped and
    /// counted as failed.
    pub async fn dispatch(&self, event: &SyncEvent) -> DispatchReport {
        let key = event.handler_key();
        let handlers = self.handlers.read().get(&key).cloned().unwrap_or_default();

        let mut report = DispatchReport::default();
        for handler in handlers {
            report.invoked += 1;
            let run = AssertUnwindSafe(handler.handle(event)).catch_unwind();
            match tokio::time::timeout(self.timeout, run).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    report.failed += 1;
                    warn!(handler_key = %key, event_id = %event.event_id, error = %err, "event handler failed");
                }
                Ok(Err(_)) => {
                    report.failed += 1;
                    error!(handler_key = %key, event_id = %event.event_id, "event handler panicked");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        handler_key = %key,
                        event_id = %event.event_id,
                        timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                        "event handler timed out"
                    );
                }
            }
        }
        report
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fieldsync_core::EventType;

    use super::*;

    fn event() -> SyncEvent {
        SyncEvent::forced("students", "S1", EventType::Insert, None, 3, 0)
    }

    #[tokio::test]
    async fn dispatches_by_key() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        registry.add(
            "students:insert",
            handler_fn(move |_| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        registry.add("students:update", handler_fn(|_| async { Ok(()) }));

        let report = registry.dispatch(&event()).await;
        assert_eq!(report, DispatchReport { invoked: 1, failed: 0 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handler_count("students:update"), 1);
    }

    #[tokio::test]
    async fn errors_and_panics_are_isolated() {
        let registry = HandlerRegistry::new();
        let after = Arc::new(AtomicUsize::new(0));

        registry.add(
            "students:insert",
            handler_fn(|_| async { anyhow::bail!("notification service down") }),
        );
        registry.add(
            "students:insert",
            handler_fn(|event| async move {
                assert!(event.document_id.is_empty(), "boom");
                Ok(())
            }),
        );
        let a = Arc::clone(&after);
        registry.add(
            "students:insert",
            handler_fn(move |_| {
                let a = Arc::clone(&a);
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let report = registry.dispatch(&event()).await;
        assert_eq!(report.invoked, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stuck_handler_times_out_and_later_handlers_run() {
        let registry = HandlerRegistry::with_timeout(Duration::from_millis(20));
        let after = Arc::new(AtomicUsize::new(0));

        registry.add(
            "students:insert",
            handler_fn(|_| std::future::pending::<anyhow::Result<()>>()),
        );
        let a = Arc::clone(&after);
        registry.add(
            "students:insert",
            handler_fn(move |_| {
                let a = Arc::clone(&a);
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let report = tokio::time::timeout(Duration::from_secs(2), registry.dispatch(&event()))
            .await
            .unwrap();
        assert_eq!(report, DispatchReport { invoked: 2, failed: 1 });
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_handlers_is_a_no_op() {
        let registry = HandlerRegistry::new();
        assert_eq!(registry.dispatch(&event()).await, DispatchReport::default());
    }
}
