//! Shared slots between a script worker and the thread driving it.
//!
//! Both slots are single atomics: the worker and the driver never take a lock
//! to read or update them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;

use crate::core::error::JobError;

/// Fractional progress in `[0.0, 1.0]`, stored as `f64` bits.
#[derive(Debug, Clone, Default)]
pub struct ProgressSlot(Arc<AtomicU64>);

impl ProgressSlot {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0.0f64.to_bits())))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Store `value` clamped to `[0.0, 1.0]`; NaN is ignored.
    pub fn set(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.0
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }
}

/// Cooperative cancellation request shared with the script body.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal outcome of one script task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The body returned; `None` means it produced no value.
    Completed(Option<Value>),
    Failed(JobError),
    TimedOut,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_starts_at_zero_and_clamps() {
        let slot = ProgressSlot::new();
        assert_eq!(slot.get(), 0.0);
        slot.set(0.25);
        assert_eq!(slot.get(), 0.25);
        slot.set(4.0);
        assert_eq!(slot.get(), 1.0);
        slot.set(-1.0);
        assert_eq!(slot.get(), 0.0);
        slot.set(f64::NAN);
        assert_eq!(slot.get(), 0.0);
    }

    #[test]
    fn clones_share_state() {
        let slot = ProgressSlot::new();
        let writer = slot.clone();
        writer.set(0.5);
        assert_eq!(slot.get(), 0.5);

        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!flag.is_cancelled());
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
