//! Bump Region - Lock-free pointer-bump allocation
//!
//! Fresh memory is carved from the heap mapping with a single CAS on the
//! top pointer. The usable end is the heap's current footprint limit, which
//! only grows.

use std::sync::atomic::{AtomicUsize, Ordering};

/// BumpRegion - CAS bump pointer over `[start, capacity_end)`
pub struct BumpRegion {
    start: usize,
    top: AtomicUsize,
    limit: AtomicUsize,
    capacity_end: usize,
}

impl BumpRegion {
    /// Create region with an initial usable limit
    pub fn new(start: usize, initial_limit: usize, capacity_end: usize) -> Self {
        debug_assert!(start <= initial_limit && initial_limit <= capacity_end);
        Self {
            start,
            top: AtomicUsize::new(start),
            limit: AtomicUsize::new(initial_limit),
            capacity_end,
        }
    }

    /// Allocate `size` bytes aligned to `align`
    ///
    /// Returns None when the footprint limit would be exceeded.
    #[inline]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        let mut current_top = self.top.load(Ordering::Relaxed);

        loop {
            let aligned = current_top.checked_add(align - 1)? & !(align - 1);
            let new_top = aligned.checked_add(size)?;
            if new_top > self.limit.load(Ordering::Acquire) {
                return None;
            }

            match self.top.compare_exchange_weak(
                current_top,
                new_top,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(aligned),
                Err(actual) => current_top = actual,
            }
        }
    }

    /// Raise the usable limit, never past the reserved capacity
    ///
    /// Returns the new limit.
    pub fn grow_to(&self, new_limit: usize) -> usize {
        let target = new_limit.min(self.capacity_end);
        self.limit.fetch_max(target, Ordering::AcqRel).max(target)
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn capacity_end(&self) -> usize {
        self.capacity_end
    }

    /// Bytes handed out so far
    pub fn allocated(&self) -> usize {
        self.top() - self.start
    }

    /// Bytes left below the current limit
    pub fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.top())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_bump_allocate() {
        let region = BumpRegion::new(0x1000, 0x1100, 0x2000);
        assert_eq!(region.allocate(16, 8), Some(0x1000));
        assert_eq!(region.allocate(8, 8), Some(0x1010));
        assert_eq!(region.allocated(), 0x18);
    }

    #[test]
    fn test_bump_alignment() {
        let region = BumpRegion::new(0x1000, 0x2000, 0x2000);
        region.allocate(8, 8);
        assert_eq!(region.allocate(32, 64), Some(0x1040));
    }

    #[test]
    fn test_bump_limit_and_growth() {
        let region = BumpRegion::new(0x1000, 0x1020, 0x1100);
        assert!(region.allocate(0x40, 8).is_none());
        assert_eq!(region.grow_to(0x1080), 0x1080);
        assert_eq!(region.allocate(0x40, 8), Some(0x1000));
        assert_eq!(region.grow_to(0x9000), 0x1100, "growth clamps to capacity");
        assert_eq!(region.grow_to(0x1000), 0x1100, "limit never shrinks");
    }

    #[test]
    fn test_concurrent_bump() {
        let region = Arc::new(BumpRegion::new(0, 8 * 4000, 8 * 4000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let region = Arc::clone(&region);
                thread::spawn(move || {
                    (0..1000)
                        .map(|_| region.allocate(8, 8).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000, "every allocation must be unique");
    }
}
