//! Stats Module - Runtime Counters
//!
//! Counters behind the heap statistics accessors and the RC/GC performance
//! dump:
//! - Heap: allocation and free volume, live size, native allocation bytes
//! - RC: increments, decrements, releases, weak collections, cycle candidates
//! - GC: cycles per trigger reason, throttled requests, pause distribution
//!
//! All counters are relaxed atomics. They are diagnostic and never used for
//! synchronisation.

pub mod histogram;

pub use histogram::Histogram;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Heap allocation counters
#[derive(Default)]
pub struct HeapStats {
    alloc_bytes: AtomicUsize,
    alloc_count: AtomicUsize,
    free_bytes: AtomicUsize,
    free_count: AtomicUsize,
    live_bytes: AtomicUsize,
    live_objects: AtomicUsize,
    peak_live_bytes: AtomicUsize,
    bytes_since_gc: AtomicUsize,
    native_bytes: AtomicUsize,
}

/// Point-in-time copy of [`HeapStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStatsSnapshot {
    pub alloc_bytes: usize,
    pub alloc_count: usize,
    pub free_bytes: usize,
    pub free_count: usize,
    pub live_bytes: usize,
    pub live_objects: usize,
    pub peak_live_bytes: usize,
    pub bytes_since_gc: usize,
    pub native_bytes: usize,
}

impl HeapStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_alloc(&self, size: usize) {
        self.alloc_bytes.fetch_add(size, Ordering::Relaxed);
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_since_gc.fetch_add(size, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.live_objects.fetch_add(1, Ordering::Relaxed);
        self.peak_live_bytes.fetch_max(live, Ordering::Relaxed);
    }

    /// Record a free
    pub fn record_free(&self, size: usize) {
        self.free_bytes.fetch_add(size, Ordering::Relaxed);
        self.free_count.fetch_add(1, Ordering::Relaxed);
        crate::util::AtomicUtils::saturating_sub(&self.live_bytes, size);
        crate::util::AtomicUtils::saturating_sub(&self.live_objects, 1);
    }

    /// Give back bytes over-counted by an earlier allocation
    ///
    /// Used when an object turns out smaller than the size it was allocated
    /// with; only the live size and the GC window shrink.
    pub fn sub_bytes(&self, size: usize) {
        crate::util::AtomicUtils::saturating_sub(&self.live_bytes, size);
        crate::util::AtomicUtils::saturating_sub(&self.bytes_since_gc, size);
    }

    /// Zero the allocation/free counters; live size is kept
    pub fn reset(&self) {
        self.alloc_bytes.store(0, Ordering::Relaxed);
        self.alloc_count.store(0, Ordering::Relaxed);
        self.free_bytes.store(0, Ordering::Relaxed);
        self.free_count.store(0, Ordering::Relaxed);
    }

    /// Restart the allocation window used by the heuristic trigger
    pub fn reset_gc_window(&self) {
        self.bytes_since_gc.store(0, Ordering::Relaxed);
    }

    pub fn alloc_bytes(&self) -> usize {
        self.alloc_bytes.load(Ordering::Relaxed)
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_count.load(Ordering::Relaxed)
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn live_objects(&self) -> usize {
        self.live_objects.load(Ordering::Relaxed)
    }

    pub fn bytes_since_gc(&self) -> usize {
        self.bytes_since_gc.load(Ordering::Relaxed)
    }

    pub fn native_bytes(&self) -> usize {
        self.native_bytes.load(Ordering::Relaxed)
    }

    pub fn set_native_bytes(&self, bytes: usize) {
        self.native_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HeapStatsSnapshot {
        HeapStatsSnapshot {
            alloc_bytes: self.alloc_bytes(),
            alloc_count: self.alloc_count(),
            free_bytes: self.free_bytes(),
            free_count: self.free_count(),
            live_bytes: self.live_bytes(),
            live_objects: self.live_objects(),
            peak_live_bytes: self.peak_live_bytes.load(Ordering::Relaxed),
            bytes_since_gc: self.bytes_since_gc(),
            native_bytes: self.native_bytes(),
        }
    }
}

/// Reference-count engine counters
#[derive(Default)]
pub struct RcStats {
    pub incs: AtomicU64,
    pub decs: AtomicU64,
    pub fast_ops: AtomicU64,
    pub released: AtomicU64,
    pub weak_collected: AtomicU64,
    pub deferred_releases: AtomicU64,
    pub cycle_candidates: AtomicU64,
    pub finalizers_run: AtomicU64,
    pub referent_rejected: AtomicU64,
    pub resurrected: AtomicU64,
}

/// Point-in-time copy of [`RcStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RcStatsSnapshot {
    pub incs: u64,
    pub decs: u64,
    pub fast_ops: u64,
    pub released: u64,
    pub weak_collected: u64,
    pub deferred_releases: u64,
    pub cycle_candidates: u64,
    pub finalizers_run: u64,
    pub referent_rejected: u64,
    pub resurrected: u64,
}

impl RcStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RcStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RcStatsSnapshot {
            incs: get(&self.incs),
            decs: get(&self.decs),
            fast_ops: get(&self.fast_ops),
            released: get(&self.released),
            weak_collected: get(&self.weak_collected),
            deferred_releases: get(&self.deferred_releases),
            cycle_candidates: get(&self.cycle_candidates),
            finalizers_run: get(&self.finalizers_run),
            referent_rejected: get(&self.referent_rejected),
            resurrected: get(&self.resurrected),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.incs,
            &self.decs,
            &self.fast_ops,
            &self.released,
            &self.weak_collected,
            &self.deferred_releases,
            &self.cycle_candidates,
            &self.finalizers_run,
            &self.referent_rejected,
            &self.resurrected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Number of distinct GC trigger reasons
pub const GC_REASON_COUNT: usize = 7;

/// Collector counters
pub struct GcStats {
    cycles: AtomicU64,
    by_reason: [AtomicU64; GC_REASON_COUNT],
    throttled: AtomicU64,
    reclaimed_objects: AtomicU64,
    reclaimed_bytes: AtomicU64,
    timeouts: AtomicU64,
    pauses: Histogram,
}

/// Point-in-time copy of [`GcStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcStatsSnapshot {
    pub cycles: u64,
    pub by_reason: [u64; GC_REASON_COUNT],
    pub throttled: u64,
    pub reclaimed_objects: u64,
    pub reclaimed_bytes: u64,
    pub safepoint_timeouts: u64,
    pub max_pause_us: u64,
    pub mean_pause_us: u64,
    pub p99_pause_us: u64,
}

impl GcStats {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            by_reason: Default::default(),
            throttled: AtomicU64::new(0),
            reclaimed_objects: AtomicU64::new(0),
            reclaimed_bytes: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            pauses: Histogram::new(),
        }
    }

    /// Record a completed cycle
    pub fn record_cycle(&self, reason_index: usize, pause_us: u64, objects: u64, bytes: u64) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = self.by_reason.get(reason_index) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.reclaimed_objects.fetch_add(objects, Ordering::Relaxed);
        self.reclaimed_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.pauses.record(pause_us);
    }

    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn max_pause_us(&self) -> u64 {
        self.pauses.max()
    }

    pub fn snapshot(&self) -> GcStatsSnapshot {
        let mut by_reason = [0; GC_REASON_COUNT];
        for (dst, src) in by_reason.iter_mut().zip(&self.by_reason) {
            *dst = src.load(Ordering::Relaxed);
        }
        GcStatsSnapshot {
            cycles: self.cycles(),
            by_reason,
            throttled: self.throttled.load(Ordering::Relaxed),
            reclaimed_objects: self.reclaimed_objects.load(Ordering::Relaxed),
            reclaimed_bytes: self.reclaimed_bytes.load(Ordering::Relaxed),
            safepoint_timeouts: self.timeouts.load(Ordering::Relaxed),
            max_pause_us: self.pauses.max(),
            mean_pause_us: self.pauses.mean(),
            p99_pause_us: self.pauses.percentile(0.99),
        }
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}
