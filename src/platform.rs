//! Platform services injected by the hosting bootloader.
//!
//! The boot core never talks to timers, the scheduler or the PMIC
//! directly; everything goes through this trait so the core stays
//! portable and testable.

#![allow(dead_code)]

use alloc::boxed::Box;

use crate::util::KResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootMode {
    Normal,
    Recovery,
    Bootloader,
    Edl,
}

pub trait Platform: Send + Sync {
    /// Milliseconds since boot.
    fn uptime_ms(&self) -> u64;

    /// Cooperative sleep.
    fn sleep_ms(&self, ms: u64);

    /// Spawn a cooperative thread and start it.
    fn spawn(&self, name: &'static str, entry: Box<dyn FnOnce() + Send>) -> KResult<()>;

    /// Reboot the device. Does not return on real hardware.
    fn reboot(&self, mode: RebootMode);

    /// Power the device off. Does not return on real hardware.
    fn shutdown(&self);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Host-backed platform for unit tests.
    pub struct TestPlatform {
        clock: AtomicU64,
    }

    impl TestPlatform {
        pub fn new() -> Self {
            Self {
                clock: AtomicU64::new(0),
            }
        }
    }

    impl Platform for TestPlatform {
        fn uptime_ms(&self) -> u64 {
            self.clock.load(Ordering::Relaxed)
        }

        fn sleep_ms(&self, ms: u64) {
            // Advance the fake clock; real sleeping would only slow the tests.
            self.clock.fetch_add(ms, Ordering::Relaxed);
            std::thread::yield_now();
        }

        fn spawn(&self, _name: &'static str, entry: Box<dyn FnOnce() + Send>) -> KResult<()> {
            std::thread::spawn(entry);
            Ok(())
        }

        fn reboot(&self, _mode: RebootMode) {}

        fn shutdown(&self) {}
    }
}
