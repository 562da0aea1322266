//! Util Module - Shared Utilities
//!
//! Utilities and helper functions used throughout the runtime.

pub mod alignment;
pub mod atomic;

pub use alignment::Alignment;
pub use atomic::AtomicUtils;

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static IN_SAFEREGION: Cell<bool> = const { Cell::new(false) };
}

/// Stable numeric identifier of the calling thread
///
/// Identifiers start at 1 and are never reused; 0 means "no thread".
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// Whether the calling thread is inside a safe region
///
/// Maintained by the mutator handle; threads that never attach report
/// `false`.
pub fn in_saferegion() -> bool {
    IN_SAFEREGION.with(Cell::get)
}

pub(crate) fn set_in_saferegion(value: bool) {
    IN_SAFEREGION.with(|flag| flag.set(value));
}

/// Format an address for diagnostics
pub fn format_address(address: usize) -> String {
    format!("{:#018x}", address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_are_distinct() {
        let main = current_thread_id();
        assert_ne!(main, 0);
        assert_eq!(main, current_thread_id(), "id is stable within a thread");

        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(main, other);
    }

    #[test]
    fn test_saferegion_flag_is_thread_local() {
        set_in_saferegion(true);
        assert!(in_saferegion());
        assert!(!std::thread::spawn(in_saferegion).join().unwrap());
        set_in_saferegion(false);
        assert!(!in_saferegion());
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address(0x1000), "0x0000000000001000");
    }
}
