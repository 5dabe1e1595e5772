//! Lock-free flag primitive shared between the worker threads.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Cache-line aligned atomic bool.
///
/// Used for state the native callback and the host loop read every cycle
/// without taking a mutex: the chain's `last_cycle` latch, the session's
/// `active` gate, the monitor's `accepting` gate.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicFlag {
    value: AtomicBool,
}

impl AtomicFlag {
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, value: bool) -> bool {
        self.value.swap(value, Ordering::AcqRel)
    }
}

impl Default for AtomicFlag {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Cache-line aligned atomic small enum cell.
///
/// The chain mirrors its main state here so the worker loops can observe
/// `Running`/`Stopped` without contending on the state mutex.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicCell8 {
    value: AtomicU8,
}

impl AtomicCell8 {
    pub fn new(value: u8) -> Self {
        Self {
            value: AtomicU8::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> u8 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: u8) {
        self.value.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_roundtrip() {
        let flag = AtomicFlag::new(false);
        assert!(!flag.get());
        flag.set(true);
        assert!(flag.get());
        assert!(flag.swap(false));
        assert!(!flag.get());
    }
}
