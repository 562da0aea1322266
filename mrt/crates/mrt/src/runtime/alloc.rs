//! Allocation - Object allocation and heap statistics
//!
//! Every allocation path funnels into one routine:
//!
//! ```text
//! yieldpoint ──► heap.allocate ──fail──► OOM GC ──► retry once ──fail──► OutOfMemory
//!                     │                                  │
//!                     ▼                                  ▼
//!            zero body, init header (rc = 1, caller owns it)
//!                     │
//!                     ▼
//!            heuristic threshold reached? ──yes──► Heuristic GC
//! ```
//!
//! Size arithmetic for variable-length objects is checked; an overflow is
//! a fatal error, never a short allocation.

use crate::error::{MrtError, Result};
use crate::fatal::FatalError;
use crate::gc::{GcOutcome, GcReason};
use crate::logging::RuntimeEvent;
use crate::object::header::{init_header, STATE_PERMANENT};
use crate::object::{
    class_of, get_header, ref_slot, ClassFlags, ClassKind, ClassMetadata, ObjRef,
    ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, HEADER_SIZE, OBJECT_ALIGNMENT,
};
use crate::roots::MutatorState;
use crate::runtime::Runtime;
use indexmap::IndexMap;
use std::sync::atomic::Ordering;

impl Runtime {
    // ========================================================================
    // Allocation core
    // ========================================================================

    /// Park the calling mutator if a collection is waiting for it
    #[inline]
    fn poll_safepoint(&self) {
        if !self.safepoint.poll() {
            return;
        }
        if let Some(record) = self.threads.current() {
            if record.state() == MutatorState::Running {
                self.safepoint.block_until_released(&record);
            }
        }
    }

    fn allocate_object(
        &self,
        size: usize,
        align: usize,
        class: Option<&ClassMetadata>,
        state: u32,
    ) -> Result<ObjRef> {
        self.poll_safepoint();
        if !align.is_power_of_two() {
            return Err(MrtError::InvalidArgument(format!(
                "alignment {} is not a power of two",
                align
            )));
        }
        if size < HEADER_SIZE {
            return Err(MrtError::InvalidArgument(format!(
                "object size {} is smaller than the {}-byte header",
                size, HEADER_SIZE
            )));
        }
        let align = align.max(OBJECT_ALIGNMENT);

        let obj = match self.heap.allocate(size, align) {
            Some(obj) => obj,
            None => self.allocate_after_gc(size, align)?,
        };

        // SAFETY: the heap handed out `size` bytes at `obj`; reused blocks
        // keep their old contents, so the body is cleared before the header
        // makes the object visible.
        unsafe {
            std::ptr::write_bytes((obj + HEADER_SIZE) as *mut u8, 0, size - HEADER_SIZE);
            init_header(obj, class.map_or(0, |c| c.address()), size, state);
        }
        if class.is_some_and(|c| c.reference_kind().is_some()) {
            self.references.register(obj);
        }

        self.maybe_trigger_heuristic();
        Ok(obj)
    }

    /// Out-of-memory path: collect once and retry
    fn allocate_after_gc(&self, size: usize, align: usize) -> Result<ObjRef> {
        if self.coordinator.is_allow_user_gc_before_oom() && !self.is_gc_thread() {
            let outcome = self.gc_start(GcReason::Oom);
            log::debug!("allocation of {} bytes failed, OOM GC: {:?}", size, outcome);
            if let Some(obj) = self.heap.allocate(size, align) {
                return Ok(obj);
            }
        }

        let heap_used = self.heap.stats().live_bytes();
        log::warn!(
            "out of memory: {} bytes requested, {} bytes live",
            size,
            heap_used
        );
        self.logger
            .log(RuntimeEvent::AllocationFailure { size, heap_used });
        Err(MrtError::OutOfMemory {
            requested: size,
            available: self.heap.free_memory(),
        })
    }

    fn maybe_trigger_heuristic(&self) {
        if !self.coordinator.is_trigger_gc_enabled() || self.coordinator.is_gc_running() {
            return;
        }
        if self
            .coordinator
            .should_trigger_heuristic(self.heap.stats().bytes_since_gc())
        {
            self.gc_start(GcReason::Heuristic);
        }
    }

    // ========================================================================
    // Allocation entry points
    // ========================================================================

    /// Allocate a raw object of `size` bytes, header included
    ///
    /// The object has no class; the caller owns its single count.
    ///
    /// # Returns
    /// `InvalidArgument` for a bad size or alignment, `OutOfMemory` if the
    /// heap is exhausted even after a collection
    pub fn new_obj(&self, size: usize, align: usize) -> Result<ObjRef> {
        self.allocate_object(size, align, None, 0)
    }

    /// Allocate `fixed_size + elem_size * n_elems` bytes
    ///
    /// An overflowing size is fatal.
    pub fn new_obj_flexible(
        &self,
        fixed_size: usize,
        elem_size: usize,
        n_elems: usize,
        align: usize,
    ) -> Result<ObjRef> {
        let size = elem_size
            .checked_mul(n_elems)
            .and_then(|body| body.checked_add(fixed_size));
        match size {
            Some(size) => self.new_obj(size, align),
            None => self.fatal(FatalError::AllocationOverflow {
                fixed: fixed_size,
                elem_size,
                count: n_elems,
            }),
        }
    }

    /// Allocate an instance of a fixed-size class
    ///
    /// Instances of `PERMANENT` classes are never reclaimed.
    pub fn new_obj_for_class(&self, class: &ClassMetadata) -> Result<ObjRef> {
        if class.kind() == ClassKind::Interface || class.flags().contains(ClassFlags::ABSTRACT) {
            return Err(MrtError::InvalidArgument(format!(
                "cannot instantiate {}",
                class.name()
            )));
        }
        let Some(size) = class.object_size() else {
            return Err(MrtError::InvalidArgument(format!(
                "{} is an array class",
                class.name()
            )));
        };
        let state = if class.flags().contains(ClassFlags::PERMANENT) {
            STATE_PERMANENT
        } else {
            0
        };
        self.allocate_object(size, OBJECT_ALIGNMENT, Some(class), state)
    }

    /// Allocate an `n`-element array of an array class
    ///
    /// The length word is written before the array is returned. An
    /// overflowing size is fatal.
    pub fn new_array(&self, class: &ClassMetadata, n: usize) -> Result<ObjRef> {
        if !class.is_array() {
            return Err(MrtError::InvalidArgument(format!(
                "{} is not an array class",
                class.name()
            )));
        }
        let Some(size) = class.array_size(n) else {
            let elem_size = match class.size_info() {
                crate::object::SizeInfo::Array { component_size } => component_size,
                crate::object::SizeInfo::Object { .. } => 0,
            };
            self.fatal(FatalError::AllocationOverflow {
                fixed: ARRAY_DATA_OFFSET,
                elem_size,
                count: n,
            })
        };
        let obj = self.allocate_object(size, OBJECT_ALIGNMENT, Some(class), 0)?;
        // SAFETY: freshly allocated array of at least ARRAY_DATA_OFFSET bytes.
        unsafe { ref_slot(obj, ARRAY_LENGTH_OFFSET) }.store(n, Ordering::Release);
        Ok(obj)
    }

    /// Allocate an immortal object
    ///
    /// Count operations on it are no-ops and it is never reclaimed.
    pub fn perm_new_obj(&self, size: usize, align: usize) -> Result<ObjRef> {
        self.allocate_object(size, align, None, STATE_PERMANENT)
    }

    /// Release an object regardless of its count
    pub fn free_obj(&self, obj: ObjRef) {
        self.rc().release_obj(obj);
    }

    /// Give back `bytes` over-counted by an earlier allocation
    pub fn sub_obj_bytes(&self, bytes: usize) {
        self.heap.stats().sub_bytes(bytes);
    }

    // ========================================================================
    // Native allocation pressure
    // ========================================================================

    pub fn native_alloc_bytes(&self) -> usize {
        self.heap.stats().native_bytes()
    }

    /// Publish the native heap size
    ///
    /// Crossing `native_gc_threshold` requests a `Native` collection, which
    /// is subject to its own throttle.
    ///
    /// # Returns
    /// The outcome of the collection request, if one was made
    pub fn set_native_alloc_bytes(&self, bytes: usize) -> Option<GcOutcome> {
        self.heap.stats().set_native_bytes(bytes);
        if bytes >= self.config.native_gc_threshold && !self.coordinator.is_gc_running() {
            Some(self.gc_start(GcReason::Native))
        } else {
            None
        }
    }

    // ========================================================================
    // Heap statistics
    // ========================================================================

    pub fn alloc_size(&self) -> usize {
        self.heap.stats().alloc_bytes()
    }

    pub fn alloc_count(&self) -> usize {
        self.heap.stats().alloc_count()
    }

    pub fn free_size(&self) -> usize {
        self.heap.stats().free_bytes()
    }

    pub fn free_count(&self) -> usize {
        self.heap.stats().free_count()
    }

    /// Zero the allocation and free counters
    pub fn reset_heap_stats(&self) {
        self.heap.stats().reset();
    }

    pub fn total_memory(&self) -> usize {
        self.heap.total_memory()
    }

    pub fn max_memory(&self) -> usize {
        self.heap.max_memory()
    }

    pub fn free_memory(&self) -> usize {
        self.heap.free_memory()
    }

    pub fn heap_lower_bound(&self) -> usize {
        self.heap.lower_bound()
    }

    pub fn heap_upper_bound(&self) -> usize {
        self.heap.upper_bound()
    }

    /// Allocated blocks, including released objects still held by weak
    /// counts
    pub fn total_heap_obj(&self) -> usize {
        self.heap.block_count()
    }

    /// Visit every object that has not been released
    pub fn visit_allocated_objects(&self, mut f: impl FnMut(ObjRef)) {
        self.heap.for_each_block(&mut |obj| {
            // SAFETY: the block was allocated when the snapshot was taken and
            // freed blocks stay mapped.
            if !unsafe { get_header(obj) }.is_released() {
                f(obj);
            }
        });
    }

    /// Live instance count per class name
    pub fn class_instance_num(&self) -> IndexMap<String, usize> {
        let mut counts: IndexMap<String, usize> = IndexMap::new();
        self.visit_allocated_objects(|obj| {
            if let Some(class) = unsafe { class_of(obj) } {
                *counts.entry(class.name().to_string()).or_default() += 1;
            }
        });
        counts
    }

    /// Collect live instances of `class`
    ///
    /// With `include_assignable`, instances of subclasses count too. At
    /// most `max` objects are returned; 0 means no limit. Every returned
    /// object carries one strong count owned by the caller.
    pub fn get_instances(
        &self,
        class: &ClassMetadata,
        include_assignable: bool,
        max: usize,
    ) -> Vec<ObjRef> {
        let mut found = Vec::new();
        let limit = if max == 0 { usize::MAX } else { max };
        self.heap.for_each_block(&mut |obj| {
            if found.len() >= limit || !self.heap.is_allocated(obj) {
                return;
            }
            let Some(obj_class) = (unsafe { class_of(obj) }) else {
                return;
            };
            let matches = obj_class.address() == class.address()
                || (include_assignable && class.is_assignable_from(obj_class));
            if matches && self.rc().inc_resurrect_weak(obj) {
                found.push(obj);
            }
        });
        found
    }
}
