//! Per-item pause/cancel signals shared between the manager and a worker.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::engine::{Interrupt, ProgressSignal};

/// Cooperative stop flags for one queue item.
///
/// The manager sets a flag; the worker observes it at its next progress
/// tick (or while backing off between attempts) and unwinds. Flags are
/// cleared whenever a new execution of the item starts.
#[derive(Debug, Default)]
pub struct TaskControl {
    cancel: AtomicBool,
    pause: AtomicBool,
    changed: Notify,
}

impl TaskControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Clears both flags for a fresh execution.
    pub fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.pause.store(false, Ordering::SeqCst);
    }

    /// Current signal; cancel wins over pause.
    #[must_use]
    pub fn signal(&self) -> ProgressSignal {
        if self.cancel.load(Ordering::SeqCst) {
            ProgressSignal::Stop(Interrupt::Cancel)
        } else if self.pause.load(Ordering::SeqCst) {
            ProgressSignal::Stop(Interrupt::Pause)
        } else {
            ProgressSignal::Continue
        }
    }

    /// Resolves once a pause or cancel has been requested.
    pub async fn stopped(&self) -> Interrupt {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            if let ProgressSignal::Stop(interrupt) = self.signal() {
                return interrupt;
            }
            notified.await;
        }
    }
}
