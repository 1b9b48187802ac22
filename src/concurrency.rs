//! Cooperative cancellation shared between a job, its tasks and its handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// One-way cancel flag with an awaitable trigger. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<SignalInner>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call flipped the flag.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            // Registered on creation, so a cancel between the check and the await still wakes us.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
