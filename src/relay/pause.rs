//! Pause/resume handle for one connection's reads.
//!
//! Handles are cheap clones shared with the processor so it can stop the
//! engine from reading a source while a flow-control window is exhausted.
//! `resume` may be called from any thread, including from inside the
//! processor while the engine is pumping. Either way the connection stays
//! held until the next tick of the session task re-arms it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct PauseHandle {
    inner: Arc<PauseState>,
}

#[derive(Debug)]
struct PauseState {
    paused: AtomicBool,
    resume_pending: AtomicBool,
    waker: Arc<Notify>,
}

impl PauseHandle {
    /// Create a handle that wakes `waker` when resumed.
    pub fn new(waker: Arc<Notify>) -> Self {
        Self {
            inner: Arc::new(PauseState {
                paused: AtomicBool::new(false),
                resume_pending: AtomicBool::new(false),
                waker,
            }),
        }
    }

    /// Stop reading from this connection.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Allow reads again. A resume of a non-paused handle is a no-op.
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            self.inner.resume_pending.store(true, Ordering::Release);
            self.inner.waker.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Paused, or resumed but not yet re-armed by a tick.
    pub(crate) fn is_held(&self) -> bool {
        self.is_paused() || self.inner.resume_pending.load(Ordering::Acquire)
    }

    /// Consume a pending resume notification.
    pub(crate) fn take_resume(&self) -> bool {
        self.inner.resume_pending.swap(false, Ordering::AcqRel)
    }
}
