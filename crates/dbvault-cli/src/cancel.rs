//! Cooperative cancellation for backup runs.
//!
//! A cloneable token that orchestrators poll or await. Children inherit
//! cancellation from their parent but can be cancelled independently, which
//! is how a per-run deadline is layered under a process-wide shutdown
//! signal. The stored reason lets a failed copy be classified as timed out
//! versus cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The run's deadline expired.
    DeadlineExceeded,
    /// The process is shutting down (signal received).
    Shutdown,
    /// Explicit cancellation by the caller.
    UserRequested,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelReason::Shutdown => write!(f, "shutdown"),
            CancelReason::UserRequested => write!(f, "user requested"),
        }
    }
}

struct Inner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Arc<Inner>>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        }
    }
}

fn cancel_inner(inner: &Arc<Inner>, reason: CancelReason) {
    inner.cancelled.store(true, Ordering::SeqCst);
    if let Ok(mut slot) = inner.reason.lock() {
        if slot.is_none() {
            *slot = Some(reason);
        }
    }
    inner.notify.notify_waiters();
    if let Ok(children) = inner.children.lock() {
        for child in children.iter() {
            cancel_inner(child, reason);
        }
    }
}

/// A cloneable cancellation token.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Cancels this token and every child. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        cancel_inner(&self.inner, reason);
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The first recorded cancellation reason, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.lock().ok().and_then(|slot| *slot)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// A child token: cancelled when the parent is, cancellable on its own
    /// without affecting the parent.
    pub fn child(&self) -> CancelToken {
        let child = Arc::new(Inner::new());
        if self.is_cancelled() {
            child.cancelled.store(true, Ordering::SeqCst);
            if let (Ok(mut slot), Some(reason)) = (child.reason.lock(), self.reason()) {
                *slot = Some(reason);
            }
        }
        if let Ok(mut children) = self.inner.children.lock() {
            children.push(child.clone());
        }
        CancelToken { inner: child }
    }

    /// Arms a deadline: the token is cancelled with
    /// [`CancelReason::DeadlineExceeded`] after `after`, unless the
    /// returned guard is dropped first.
    pub fn deadline(&self, after: Duration) -> DeadlineGuard {
        let token = self.clone();
        DeadlineGuard {
            handle: tokio::spawn(async move {
                tokio::time::sleep(after).await;
                token.cancel(CancelReason::DeadlineExceeded);
            }),
        }
    }
}

/// Disarms its deadline timer on drop.
pub struct DeadlineGuard {
    handle: JoinHandle<()>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
