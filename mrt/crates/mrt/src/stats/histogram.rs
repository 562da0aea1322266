//! Histogram - Pause Time Histogram
//!
//! Logarithmic buckets for GC pause times in microseconds, used to report
//! percentiles in the performance dump.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Histogram - pause time distribution
pub struct Histogram {
    /// Bucket counts keyed by bit length of the value
    buckets: Mutex<BTreeMap<u64, u64>>,
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create new histogram
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(BTreeMap::new()),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Record value
    pub fn record(&self, value: u64) {
        *self.buckets.lock().entry(Self::bucket(value)).or_insert(0) += 1;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Bucket for value: 0, then 1, 2-3, 4-7, ...
    fn bucket(value: u64) -> u64 {
        64 - value.leading_zeros() as u64
    }

    /// Upper bound of the bucket holding the `p` percentile
    pub fn percentile(&self, p: f64) -> u64 {
        let buckets = self.buckets.lock();
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0;
        for (&bucket, &count) in buckets.iter() {
            cumulative += count;
            if cumulative >= target {
                return Self::upper_bound(bucket);
            }
        }
        self.max()
    }

    fn upper_bound(bucket: u64) -> u64 {
        if bucket == 0 {
            0
        } else {
            (1u64 << bucket.min(63)) - 1
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        self.sum.load(Ordering::Relaxed) / count
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.buckets.lock().clear();
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}
