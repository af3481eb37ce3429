//! Monitoring lifecycle
//!
//! [`MonitorHandle`] is what `start_monitoring` hands back. Cancelling it
//! detaches the source subscription and stops the observation task; any
//! observation still queued at that point is discarded.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::source::SourceSubscription;

/// Shared between the handle and the tracker's active-monitor slot
pub(crate) struct MonitorInner {
    subscription: Mutex<Option<SourceSubscription>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorInner {
    pub(crate) fn new(
        subscription: Option<SourceSubscription>,
        stop_tx: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            subscription: Mutex::new(subscription),
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Tear everything down; returns false if already cancelled
    pub(crate) fn cancel(&self) -> bool {
        let stop_tx = self.stop_tx.lock().take();
        let Some(stop_tx) = stop_tx else {
            return false;
        };

        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        let _ = stop_tx.send(());
        self.task.lock().take();

        tracing::debug!("Connectivity monitoring stopped");
        true
    }

    pub(crate) fn is_active(&self) -> bool {
        self.stop_tx.lock().is_some()
            && self
                .task
                .lock()
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false)
    }
}

/// Handle for an active connectivity monitor
///
/// Monitoring stops when the handle is cancelled or dropped. Cancelling
/// more than once is a no-op.
pub struct MonitorHandle {
    inner: Arc<MonitorInner>,
}

impl MonitorHandle {
    pub(crate) fn new(inner: Arc<MonitorInner>) -> Self {
        Self { inner }
    }

    /// Stop monitoring
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether this monitor is still receiving observations
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inner_with_counter() -> (Arc<MonitorInner>, Arc<AtomicUsize>, oneshot::Receiver<()>) {
        let detached = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&detached);
        let subscription = SourceSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(std::future::pending::<()>());

        let inner = Arc::new(MonitorInner::new(Some(subscription), stop_tx, task));
        (inner, detached, stop_rx)
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (inner, detached, mut stop_rx) = inner_with_counter();
        let handle = MonitorHandle::new(Arc::clone(&inner));
        assert!(handle.is_active());

        handle.cancel();
        handle.cancel();

        assert!(!handle.is_active());
        assert_eq!(detached.load(Ordering::SeqCst), 1);
        assert!(stop_rx.try_recv().is_ok());
        assert!(!inner.cancel());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let (inner, detached, _stop_rx) = inner_with_counter();
        drop(MonitorHandle::new(Arc::clone(&inner)));

        assert_eq!(detached.load(Ordering::SeqCst), 1);
        assert!(!inner.is_active());
    }
}
