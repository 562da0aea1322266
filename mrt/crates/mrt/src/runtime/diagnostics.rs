//! Diagnostics - Heap dumps, counters and address validation
//!
//! Every dump writes to a caller-provided stream. Write errors are returned
//! to the caller; the dumps themselves never fail otherwise.
//!
//! The fatal-error dump is special: it runs while some lock may already be
//! held by the failing thread, so it reads atomic counters only.

use crate::fatal::FatalError;
use crate::object::{class_of, get_header, ObjRef, FieldKind, OBJECT_ALIGNMENT};
use crate::runtime::Runtime;
use crate::stats::{GcStatsSnapshot, HeapStatsSnapshot, RcStatsSnapshot};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::Ordering;

/// Serializable view of the runtime counters
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    /// RFC 3339 capture time
    pub timestamp: String,
    pub heap: HeapStatsSnapshot,
    pub rc: RcStatsSnapshot,
    pub gc: GcStatsSnapshot,
    pub total_memory: usize,
    pub max_memory: usize,
    pub free_memory: usize,
    pub gc_threshold: usize,
    pub threads: usize,
    pub global_refs: usize,
    pub weak_global_refs: usize,
    pub classes: usize,
    pub cycle_patterns: usize,
    pub cycle_candidates: usize,
    pub registered_references: usize,
    pub reference_queue: usize,
    pub pending_finalizers: usize,
}

impl Runtime {
    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Capture every counter at once
    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            heap: self.heap.stats().snapshot(),
            rc: self.rc_stats.snapshot(),
            gc: self.gc_stats.snapshot(),
            total_memory: self.heap.total_memory(),
            max_memory: self.heap.max_memory(),
            free_memory: self.heap.free_memory(),
            gc_threshold: self.coordinator.threshold(),
            threads: self.threads.len(),
            global_refs: self.roots.global_count(),
            weak_global_refs: self.roots.weak_global_count(),
            classes: self.classes.len(),
            cycle_patterns: self.cycles.pattern_count(),
            cycle_candidates: self.cycles.candidate_count(),
            registered_references: self.references.registered_count(),
            reference_queue: self.references.queue_len(),
            pending_finalizers: self.finalizers.pending_count(),
        }
    }

    /// Write [`Self::snapshot`] as pretty-printed JSON
    pub fn dump_json(&self, os: &mut dyn Write) -> io::Result<()> {
        let snapshot = self.snapshot();
        serde_json::to_writer_pretty(&mut *os, &snapshot).map_err(io::Error::from)?;
        writeln!(os)
    }

    // ========================================================================
    // Text dumps
    // ========================================================================

    /// Dump heap usage followed by every live object
    ///
    /// # Arguments
    /// * `os` - Output stream
    /// * `msg` - Headline, typically the reason for the dump
    pub fn dump_heap(&self, os: &mut dyn Write, msg: &str) -> io::Result<()> {
        writeln!(os, "==== heap dump: {} ====", msg)?;
        self.show_heap_usage(os)?;

        let mut result = Ok(());
        self.visit_allocated_objects(|obj| {
            if result.is_err() {
                return;
            }
            // SAFETY: visited objects are allocated and not released.
            let header = unsafe { get_header(obj) };
            let class = unsafe { class_of(obj) }.map_or("<raw>", |c| c.name());
            result = writeln!(
                os,
                "{:#014x} {:>8} rc={:<4} weak={:<4} state={:#06x} {}",
                obj,
                header.size(),
                header.ref_count(),
                header.weak_count(),
                header.state(),
                class
            );
        });
        result?;
        writeln!(os, "==== end of heap dump ====")
    }

    /// One-paragraph heap summary
    pub fn show_heap_usage(&self, os: &mut dyn Write) -> io::Result<()> {
        let stats = self.heap.stats().snapshot();
        writeln!(
            os,
            "heap: {} objects, {} bytes live (peak {}), footprint {} of {} bytes, {} free",
            stats.live_objects,
            stats.live_bytes,
            stats.peak_live_bytes,
            self.heap.total_memory(),
            self.heap.max_memory(),
            self.heap.free_memory()
        )?;
        writeln!(
            os,
            "allocated {} objects / {} bytes, freed {} objects / {} bytes, native {} bytes",
            stats.alloc_count,
            stats.alloc_bytes,
            stats.free_count,
            stats.free_bytes,
            stats.native_bytes
        )
    }

    /// Reference-count and collection counters
    pub fn dump_rc_and_gc_performance_info(&self, os: &mut dyn Write) -> io::Result<()> {
        let rc = self.rc_stats.snapshot();
        writeln!(os, "==== rc ====")?;
        writeln!(os, "increments:        {}", rc.incs)?;
        writeln!(os, "decrements:        {}", rc.decs)?;
        writeln!(os, "unsync operations: {}", rc.fast_ops)?;
        writeln!(os, "released:          {}", rc.released)?;
        writeln!(os, "weak collected:    {}", rc.weak_collected)?;
        writeln!(os, "deferred releases: {}", rc.deferred_releases)?;
        writeln!(os, "cycle candidates:  {}", rc.cycle_candidates)?;
        writeln!(os, "finalizers run:    {}", rc.finalizers_run)?;
        writeln!(os, "referents rejected:{:>2}", rc.referent_rejected)?;
        writeln!(os, "resurrected:       {}", rc.resurrected)?;

        let gc = self.gc_stats.snapshot();
        writeln!(os, "==== gc ====")?;
        writeln!(os, "cycles:            {}", gc.cycles)?;
        for reason in crate::gc::GcReason::ALL {
            let count = gc.by_reason[reason.index()];
            if count > 0 {
                writeln!(os, "  {:<16} {}", reason.name(), count)?;
            }
        }
        writeln!(os, "throttled:         {}", gc.throttled)?;
        writeln!(os, "safepoint timeouts:{:>2}", gc.safepoint_timeouts)?;
        writeln!(
            os,
            "reclaimed:         {} objects / {} bytes",
            gc.reclaimed_objects, gc.reclaimed_bytes
        )?;
        writeln!(
            os,
            "pause (us):        mean {} p99 {} max {}",
            gc.mean_pause_us, gc.p99_pause_us, gc.max_pause_us
        )
    }

    /// Every static field of every registered class
    ///
    /// Reference statics print the object address and its class.
    pub fn dump_static_fields(&self, os: &mut dyn Write) -> io::Result<()> {
        for class in self.classes.all() {
            let statics: Vec<_> = class.ro().fields().iter().filter(|f| f.is_static()).collect();
            if statics.is_empty() {
                continue;
            }
            writeln!(os, "{}:", class.name())?;
            for field in statics {
                let Some(addr) = field.address() else {
                    continue;
                };
                // SAFETY: static storage is owned by the registered class.
                let word = unsafe { &*(addr as *const std::sync::atomic::AtomicU64) }
                    .load(Ordering::Acquire);
                if field.kind == FieldKind::Ref {
                    let target = word as ObjRef;
                    let name = if self.fast_is_valid_obj_addr(target) {
                        unsafe { class_of(target) }.map_or("<raw>", |c| c.name())
                    } else {
                        "null"
                    };
                    writeln!(os, "  {} = {:#x} ({})", field.name, target, name)?;
                } else {
                    writeln!(os, "  {} = {:#x}", field.name, word)?;
                }
            }
        }
        Ok(())
    }

    /// Recorded cycle patterns, most frequent first
    ///
    /// # Arguments
    /// * `limit` - Maximum number of patterns; 0 prints all
    pub fn dump_cycle_patterns(&self, os: &mut dyn Write, limit: usize) -> io::Result<()> {
        self.write_patterns(os, limit, false)
    }

    /// Learned cycle patterns only
    pub fn dump_dynamic_cycle_patterns(&self, os: &mut dyn Write, limit: usize) -> io::Result<()> {
        self.write_patterns(os, limit, true)
    }

    fn write_patterns(&self, os: &mut dyn Write, limit: usize, learned_only: bool) -> io::Result<()> {
        let mut patterns = self.cycles.patterns();
        patterns.retain(|p| !learned_only || p.learned);
        patterns.sort_by(|a, b| b.hits.cmp(&a.hits));
        if limit > 0 {
            patterns.truncate(limit);
        }

        writeln!(os, "{} cycle pattern(s)", patterns.len())?;
        for pattern in patterns {
            writeln!(
                os,
                "{:>6} {} [{}]",
                pattern.hits,
                if pattern.learned { "learned" } else { "       " },
                pattern.classes.join(" -> ")
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // Address validation
    // ========================================================================

    /// Bounds and alignment check only
    #[inline]
    pub fn fast_is_valid_obj_addr(&self, obj: ObjRef) -> bool {
        self.heap.in_bounds(obj) && obj % OBJECT_ALIGNMENT == 0
    }

    /// Full check: the address is an allocated, unreleased object
    pub fn is_valid_obj_addr(&self, obj: ObjRef) -> bool {
        self.fast_is_valid_obj_addr(obj)
            && self.heap.is_allocated(obj)
            && !unsafe { get_header(obj) }.is_released()
    }

    /// Abort if `obj` is not a valid object
    pub fn check_heap_obj(&self, obj: ObjRef, operation: &'static str) {
        if !self.is_valid_obj_addr(obj) {
            self.fatal(FatalError::InvalidHeapAddress {
                address: obj,
                operation,
            });
        }
    }

    // ========================================================================
    // Fatal dump
    // ========================================================================

    /// Counters written before a fatal abort
    ///
    /// Atomics only: the failing thread may hold the thread list or a heap
    /// lock.
    pub(crate) fn write_fatal_dump(&self, out: &mut dyn Write) {
        let heap = self.heap.stats().snapshot();
        let rc = self.rc_stats.snapshot();
        let _ = writeln!(
            out,
            "heap: {} objects, {} bytes live, {} allocated, {} freed",
            heap.live_objects, heap.live_bytes, heap.alloc_count, heap.free_count
        );
        let _ = writeln!(
            out,
            "rc: {} incs, {} decs, {} released, {} weak collected",
            rc.incs, rc.decs, rc.released, rc.weak_collected
        );
        let _ = writeln!(
            out,
            "gc: {} cycles, max pause {} us, running: {}",
            self.gc_stats.cycles(),
            self.gc_stats.max_pause_us(),
            self.coordinator.is_gc_running()
        );
    }
}
