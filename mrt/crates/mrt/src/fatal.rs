//! Fatal Module - Invariant Violations
//!
//! Reference-count underflow, operations on non-heap addresses, allocation
//! size overflow and re-entrant thread-list locking cannot be recovered from:
//! continuing would corrupt the heap. They are never returned as values.
//! The runtime reports them here, which logs the violation, writes a
//! diagnostic block to stderr and hands control to the installed
//! [`AbortHandler`]. The default handler aborts the process.
//!
//! Tests install [`panic_handler`] so fatal paths can be observed with
//! `#[should_panic]`.

use parking_lot::RwLock;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// An unrecoverable runtime invariant violation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    /// A decrement would drive the count below zero
    ///
    /// Signals a double release or a missing increment somewhere upstream.
    #[error("reference count underflow on object {address:#x}")]
    RefCountUnderflow { address: usize },

    /// An increment would overflow the count word
    #[error("reference count overflow on object {address:#x}")]
    RefCountOverflow { address: usize },

    /// A count operation targeted an address outside the managed heap
    #[error("invalid heap address {address:#x} passed to {operation}")]
    InvalidHeapAddress {
        address: usize,
        operation: &'static str,
    },

    /// A flexible or array allocation size computation overflowed
    #[error("allocation size overflow: {fixed} + {elem_size} * {count}")]
    AllocationOverflow {
        fixed: usize,
        elem_size: usize,
        count: usize,
    },

    /// The owning thread tried to take the thread-list lock again
    #[error("thread list lock re-entered by its owner (thread {thread_id})")]
    ThreadListLockReentry { thread_id: u64 },

    /// A thread touched managed memory while inside a safe region
    #[error("safe region check failed on thread {thread_id}: {message}")]
    SaferegionViolation { thread_id: u64, message: String },

    /// A strong operation reached an object that was already released
    #[error("access to released object {address:#x} in {operation}")]
    ReleasedObjectAccess {
        address: usize,
        operation: &'static str,
    },
}

/// Handler invoked with the violation once diagnostics have been written
pub type AbortHandler = fn(&FatalError) -> !;

/// Default handler: terminate the process immediately
pub fn abort_handler(_err: &FatalError) -> ! {
    std::process::abort()
}

/// Handler for tests: unwind with the violation text
pub fn panic_handler(err: &FatalError) -> ! {
    panic!("fatal runtime error: {}", err)
}

/// Routes fatal violations to the installed handler
pub struct FatalReporter {
    handler: RwLock<AbortHandler>,
    reported: AtomicU64,
}

impl FatalReporter {
    /// Create a reporter with the given handler
    pub fn new(handler: AbortHandler) -> Self {
        Self {
            handler: RwLock::new(handler),
            reported: AtomicU64::new(0),
        }
    }

    /// Replace the abort handler
    pub fn set_handler(&self, handler: AbortHandler) {
        *self.handler.write() = handler;
    }

    /// Number of violations reported so far
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }

    /// Report a violation and never return
    ///
    /// `dump` writes the runtime's diagnostic block (heap and RC/GC counters)
    /// to stderr before the handler runs.
    pub fn fatal(&self, err: FatalError, dump: impl FnOnce(&mut dyn Write)) -> ! {
        self.reported.fetch_add(1, Ordering::Relaxed);
        log::error!("fatal runtime error: {}", err);

        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(out, "==== mrt fatal: {} ====", err);
        dump(&mut out);
        let _ = out.flush();
        drop(out);

        let handler = *self.handler.read();
        handler(&err)
    }
}

impl Default for FatalReporter {
    fn default() -> Self {
        Self::new(abort_handler)
    }
}
