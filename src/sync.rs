//! Sincronização mínima para o modelo cooperativo.

#![allow(dead_code)]

use core::sync::atomic::{AtomicBool, Ordering};

/// Binary auto-reset event.
///
/// `signal` makes exactly one pending or future `wait` return; the flag
/// is consumed by the waiter. Mirrors an auto-unsignal kernel event, so
/// the queue-then-wait pattern of the USB paths consumes one completion
/// per transfer.
pub struct Event {
    signaled: AtomicBool,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    /// Consume one signal, spinning until it arrives.
    pub fn wait(&self) {
        while !self.signaled.swap(false, Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    /// Consume a pending signal without blocking.
    pub fn try_wait(&self) -> bool {
        self.signaled.swap(false, Ordering::Acquire)
    }
}
