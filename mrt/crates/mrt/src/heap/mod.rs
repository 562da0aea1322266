//! Heap Module - Managed heap oracle
//!
//! The runtime consumes the heap through [`HeapOracle`]: allocate and free
//! raw blocks, answer bounds and membership queries, enumerate live blocks
//! and report statistics. [`MappedHeap`] is the bundled implementation:
//! - One anonymous mapping reserved at start-up (`heap_size`)
//! - Lock-free bump allocation up to a footprint limit that grows from
//!   `heap_start_size` towards `heap_growth_limit`
//! - Exact-size free lists for reuse of released blocks
//! - An ordered table of live blocks for validation and heap walks

pub mod bump;
pub mod mapping;

pub use bump::BumpRegion;
pub use mapping::HeapMapping;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::stats::HeapStats;
use crate::util::Alignment;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Heap services the runtime depends on
pub trait HeapOracle: Send + Sync {
    /// Allocate `size` bytes aligned to `align`
    ///
    /// Reused blocks keep their old contents; the caller initialises them.
    fn allocate(&self, size: usize, align: usize) -> Option<usize>;

    /// Return a block to the heap
    fn free(&self, addr: usize, size: usize);

    /// Lowest heap address
    fn lower_bound(&self) -> usize;

    /// One past the highest heap address
    fn upper_bound(&self) -> usize;

    /// Check whether `addr` is a currently allocated block start
    fn is_allocated(&self, addr: usize) -> bool;

    /// Visit every allocated block
    fn for_each_block(&self, f: &mut dyn FnMut(usize));

    /// Number of allocated blocks
    fn block_count(&self) -> usize;

    /// Allocation counters
    fn stats(&self) -> &HeapStats;

    /// Current footprint in bytes
    fn total_memory(&self) -> usize;

    /// Largest footprint the heap may reach
    fn max_memory(&self) -> usize;

    /// Unused bytes within the current footprint
    fn free_memory(&self) -> usize;

    /// Cheap range check against the heap bounds
    fn in_bounds(&self, addr: usize) -> bool {
        addr >= self.lower_bound() && addr < self.upper_bound()
    }
}

/// MappedHeap - memmap2-backed heap
pub struct MappedHeap {
    mapping: HeapMapping,
    bump: BumpRegion,
    max_footprint: usize,
    min_free: usize,
    max_free: usize,
    free_lists: Mutex<HashMap<usize, Vec<usize>>>,
    free_list_bytes: AtomicUsize,
    live: RwLock<IndexSet<usize>>,
    stats: HeapStats,
}

impl MappedHeap {
    /// Reserve the heap described by `config`
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let mapping = HeapMapping::anonymous(config.heap_size)?;
        let base = mapping.base();
        let initial = base + config.heap_start_size.min(mapping.size());
        let bump = BumpRegion::new(base, initial, mapping.end());
        let max_footprint = if config.ignore_max_footprint {
            mapping.size()
        } else {
            config.heap_growth_limit.min(mapping.size())
        };

        log::debug!(
            "heap reserved at {:#x} ({} bytes, start {} bytes, max footprint {} bytes)",
            base,
            mapping.size(),
            config.heap_start_size,
            max_footprint
        );

        Ok(Self {
            mapping,
            bump,
            max_footprint,
            min_free: config.heap_min_free,
            max_free: config.heap_max_free,
            free_lists: Mutex::new(HashMap::new()),
            free_list_bytes: AtomicUsize::new(0),
            live: RwLock::new(IndexSet::new()),
            stats: HeapStats::new(),
        })
    }

    fn take_free_block(&self, size: usize, align: usize) -> Option<usize> {
        let mut lists = self.free_lists.lock();
        let list = lists.get_mut(&size)?;
        let pos = list
            .iter()
            .rposition(|addr| Alignment::is_aligned(*addr, align))?;
        let addr = list.swap_remove(pos);
        self.free_list_bytes.fetch_sub(size, Ordering::Relaxed);
        Some(addr)
    }

    /// Grow the footprint to fit `size` more bytes
    fn try_grow(&self, size: usize) -> bool {
        let limit = self.bump.limit();
        let ceiling = self.mapping.base() + self.max_footprint;
        if limit >= ceiling {
            return false;
        }
        let step = if size > self.max_free {
            size
        } else {
            size.max(self.min_free)
        };
        let grown = self.bump.grow_to(limit.saturating_add(step).min(ceiling));
        log::debug!("heap footprint grown to {} bytes", grown - self.mapping.base());
        grown > limit
    }
}

impl HeapOracle for MappedHeap {
    fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        let align = align.max(Alignment::DEFAULT);
        let size = Alignment::checked_align_up(size, Alignment::DEFAULT)?;

        let addr = match self.take_free_block(size, align) {
            Some(addr) => addr,
            None => match self.bump.allocate(size, align) {
                Some(addr) => addr,
                None => {
                    if !self.try_grow(size) {
                        return None;
                    }
                    self.bump.allocate(size, align)?
                },
            },
        };

        self.live.write().insert(addr);
        self.stats.record_alloc(size);
        Some(addr)
    }

    fn free(&self, addr: usize, size: usize) {
        let size = Alignment::align_up(size, Alignment::DEFAULT);
        if !self.live.write().swap_remove(&addr) {
            log::warn!("free of unallocated block {:#x} ignored", addr);
            return;
        }
        self.free_lists.lock().entry(size).or_default().push(addr);
        self.free_list_bytes.fetch_add(size, Ordering::Relaxed);
        self.stats.record_free(size);
    }

    fn lower_bound(&self) -> usize {
        self.mapping.base()
    }

    fn upper_bound(&self) -> usize {
        self.mapping.end()
    }

    fn is_allocated(&self, addr: usize) -> bool {
        self.live.read().contains(&addr)
    }

    fn for_each_block(&self, f: &mut dyn FnMut(usize)) {
        let blocks: Vec<usize> = self.live.read().iter().copied().collect();
        blocks.into_iter().for_each(f);
    }

    fn block_count(&self) -> usize {
        self.live.read().len()
    }

    fn stats(&self) -> &HeapStats {
        &self.stats
    }

    fn total_memory(&self) -> usize {
        self.bump.limit() - self.mapping.base()
    }

    fn max_memory(&self) -> usize {
        self.max_footprint
    }

    fn free_memory(&self) -> usize {
        self.bump.remaining() + self.free_list_bytes.load(Ordering::Relaxed)
    }
}
