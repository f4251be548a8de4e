//! Shared cancellation flag.
//!
//! Every engine loop checks [`AbortSignal::is_aborted`] once per iteration and
//! parks on [`AbortSignal::aborted`] inside its `select!`, so an abort from
//! any task (or a Ctrl-C handler) is seen promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cloneable handle; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<Inner>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every task parked in [`aborted`](Self::aborted).
    pub fn abort(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once [`abort`](Self::abort) has been called.
    pub async fn aborted(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent abort is not missed.
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}
