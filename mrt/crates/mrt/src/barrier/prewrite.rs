//! Pre-Write Barrier - Snapshot-at-the-beginning support
//!
//! While a mark is in progress every reference that is about to be
//! overwritten, dropped or resurrected through a weak path is published to
//! the collector, so the object graph seen at mark start stays fully
//! traced.
//!
//! ```text
//! mutator                         collector
//!    │  pre_write(slot)              │ start_marking()
//!    │──── old value ────► buffer ──►│ drain()
//!    │  dec → 0 while marking        │
//!    │──── object ──────► deferred ─►│ drain_deferred()
//!    │                               │ stop_marking()
//! ```
//!
//! Outside a mark both paths cost one relaxed load.

use crate::object::{ObjRef, NULL};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Mutation hook shared by every reference barrier
pub struct PreWriteBarrier {
    /// Mark in progress
    marking: AtomicBool,

    /// References published during the current mark
    buffer: SegQueue<ObjRef>,

    /// Objects whose count reached zero during the current mark
    deferred: SegQueue<ObjRef>,

    /// Total references published since creation
    published: AtomicU64,
}

impl PreWriteBarrier {
    pub fn new() -> Self {
        Self {
            marking: AtomicBool::new(false),
            buffer: SegQueue::new(),
            deferred: SegQueue::new(),
            published: AtomicU64::new(0),
        }
    }

    /// Begin publishing mutations
    pub fn start_marking(&self) {
        self.marking.store(true, Ordering::SeqCst);
    }

    /// Stop publishing mutations
    pub fn stop_marking(&self) {
        self.marking.store(false, Ordering::SeqCst);
    }

    /// Check whether a mark is in progress
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    /// Publish `obj` to the collector if a mark is in progress
    #[inline]
    pub fn publish(&self, obj: ObjRef) {
        if obj != NULL && self.is_marking() {
            self.buffer.push(obj);
            self.published.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publish the current content of `slot` before it is mutated
    ///
    /// Must run before the store that overwrites the slot.
    #[inline]
    pub fn pre_write(&self, slot: &AtomicUsize) {
        if self.is_marking() {
            self.publish(slot.load(Ordering::Acquire));
        }
    }

    /// Hand every published reference to `f`
    ///
    /// # Returns
    /// Number of references drained
    pub fn drain(&self, mut f: impl FnMut(ObjRef)) -> usize {
        let mut drained = 0;
        while let Some(obj) = self.buffer.pop() {
            f(obj);
            drained += 1;
        }
        drained
    }

    /// Park an object whose count reached zero during a mark
    pub fn defer_release(&self, obj: ObjRef) {
        self.deferred.push(obj);
    }

    /// Take every parked object
    pub fn drain_deferred(&self) -> Vec<ObjRef> {
        std::iter::from_fn(|| self.deferred.pop()).collect()
    }

    /// References waiting in the buffer
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Objects waiting for release
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for PreWriteBarrier {
    fn default() -> Self {
        Self::new()
    }
}
