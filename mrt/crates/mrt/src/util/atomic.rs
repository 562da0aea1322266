//! Atomic Utilities
//!
//! Saturating counter updates for the heap statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// AtomicUtils - utility for atomic operations
pub struct AtomicUtils;

impl AtomicUtils {
    /// Atomic fetch-sub with saturation
    ///
    /// Does not wrap, saturates at zero. Returns the previous value.
    pub fn saturating_sub(atomic: &AtomicUsize, value: usize) -> usize {
        let mut current = atomic.load(Ordering::Relaxed);

        loop {
            let new_value = current.saturating_sub(value);

            match atomic.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_sub() {
        let v = AtomicUsize::new(5);
        assert_eq!(AtomicUtils::saturating_sub(&v, 3), 5);
        assert_eq!(AtomicUtils::saturating_sub(&v, 10), 2);
        assert_eq!(v.load(Ordering::Relaxed), 0);
    }
}
