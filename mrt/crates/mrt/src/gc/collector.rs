//! Collector - Tracing seam and the bundled cycle collector
//!
//! The runtime reaches its tracing engine through [`Collector`]. The
//! bundled [`TracingCollector`] is a non-moving mark and trial-deletion
//! collector whose only job is the garbage reference counting cannot see:
//!
//! ```text
//! start marking ──► mark from roots (parallel) ──► drain pre-write buffer
//!       │
//!       ▼
//! unmarked objects with rc > 0 ──► trial deletion ──► externally held?
//!       │                                               │yes: live
//!       ▼ no
//! finalizable? ──yes──► finalizer queue (kept with everything it reaches)
//!       │no
//!       ▼
//! record cycle patterns ──► reclaim as a group ──► stop marking
//!       │
//!       ▼
//! release deferred zero-count objects, clear mark bits
//! ```
//!
//! Marking narrows the candidate set; trial deletion decides. An object
//! whose count exceeds the number of references from other candidates is
//! held from outside the candidate set (a native local, an unattached
//! thread) and survives together with everything it reaches.

use crate::gc::GcReason;
use crate::object::header::{
    STATE_CYCLE_CANDIDATE, STATE_FINALIZED, STATE_FINALIZE_PENDING, STATE_MARKED, STATE_PERMANENT,
    STATE_RELEASED,
};
use crate::object::{class_of, get_header, ref_slot, ObjRef, NULL};
use crate::rc::Reclaimed;
use crate::roots::{RootInfo, VisitRootFlags};
use crate::runtime::Runtime;
use crossbeam::queue::SegQueue;
use indexmap::{IndexMap, IndexSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of one collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionResult {
    /// Objects marked reachable from roots
    pub marked: usize,
    /// Unmarked objects examined by trial deletion
    pub candidates: usize,
    /// Garbage groups reclaimed
    pub cycles: usize,
    /// Objects handed to the finalizer queue instead of being reclaimed
    pub finalizable: usize,
    /// Zero-count objects released after marking ended
    pub deferred: usize,
    pub reclaimed: Reclaimed,
}

/// Tracing engine used by the runtime
///
/// `collect` runs with every attached mutator stopped. It must leave the
/// pre-write barrier inactive and every mark bit clear.
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    fn collect(&self, rt: &Runtime, reason: GcReason) -> CollectionResult;
}

/// Non-moving mark and trial-deletion collector
pub struct TracingCollector {
    workers: usize,
}

impl TracingCollector {
    /// Create a collector marking with `workers` threads
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    // ========================================================================
    // Marking
    // ========================================================================

    /// Set the mark bit
    ///
    /// # Returns
    /// `true` if this call marked the object
    #[inline]
    fn try_mark(obj: ObjRef) -> bool {
        let header = unsafe { get_header(obj) };
        header.set(STATE_MARKED) & STATE_MARKED == 0
    }

    /// Strong children of `obj`
    fn children(obj: ObjRef, mut f: impl FnMut(ObjRef)) {
        let Some(class) = (unsafe { class_of(obj) }) else {
            return;
        };
        unsafe {
            class.gctib().visit_refs(obj, |offset| {
                let child = ref_slot(obj, offset).load(Ordering::Acquire);
                if child != NULL {
                    f(child);
                }
            });
        }
    }

    /// Mark everything reachable from `seeds`
    ///
    /// Work is shared through one lock-free queue; `pending` counts objects
    /// pushed but not yet scanned, so a worker only stops once the whole
    /// closure is scanned.
    fn mark_closure(&self, rt: &Runtime, seeds: Vec<ObjRef>) -> usize {
        let queue = SegQueue::new();
        let pending = AtomicUsize::new(0);
        let marked = AtomicUsize::new(0);

        for obj in seeds {
            if rt.heap.in_bounds(obj) && Self::try_mark(obj) {
                pending.fetch_add(1, Ordering::AcqRel);
                queue.push(obj);
            }
        }
        if queue.is_empty() {
            return 0;
        }

        let worker = || {
            while pending.load(Ordering::Acquire) != 0 {
                let Some(obj) = queue.pop() else {
                    std::thread::yield_now();
                    continue;
                };
                Self::children(obj, |child| {
                    if rt.heap.in_bounds(child) && Self::try_mark(child) {
                        pending.fetch_add(1, Ordering::AcqRel);
                        queue.push(child);
                    }
                });
                marked.fetch_add(1, Ordering::Relaxed);
                pending.fetch_sub(1, Ordering::AcqRel);
            }
        };

        if self.workers == 1 {
            worker();
        } else {
            let scoped = crossbeam::thread::scope(|s| {
                for _ in 1..self.workers {
                    s.spawn(|_| worker());
                }
                worker();
            });
            if scoped.is_err() {
                log::error!("marking worker panicked");
            }
        }
        marked.load(Ordering::Relaxed)
    }

    /// Mark objects published by the pre-write barrier until none remain
    fn drain_published(&self, rt: &Runtime) -> usize {
        let mut total = 0;
        loop {
            let mut published = Vec::new();
            if rt.satb.drain(|obj| published.push(obj)) == 0 {
                return total;
            }
            total += self.mark_closure(rt, published);
        }
    }

    // ========================================================================
    // Trial deletion
    // ========================================================================

    /// Unmarked objects that still carry strong counts, with their strong
    /// edges restricted to the set
    fn unmarked_candidates(rt: &Runtime) -> IndexMap<ObjRef, Vec<ObjRef>> {
        let mut candidates = IndexMap::new();
        rt.heap.for_each_block(&mut |obj| {
            let header = unsafe { get_header(obj) };
            let state = header.state();
            if state & (STATE_MARKED | STATE_PERMANENT | STATE_RELEASED) == 0
                && header.ref_count() > 0
            {
                candidates.insert(obj, Vec::new());
            }
        });

        let members: Vec<ObjRef> = candidates.keys().copied().collect();
        for obj in members {
            let mut edges = Vec::new();
            Self::children(obj, |child| {
                if candidates.contains_key(&child) {
                    edges.push(child);
                }
            });
            if let Some(slot) = candidates.get_mut(&obj) {
                *slot = edges;
            }
        }
        candidates
    }

    /// Add `roots` and everything they reach inside `graph` to `set`
    fn close_over(
        graph: &IndexMap<ObjRef, Vec<ObjRef>>,
        roots: impl IntoIterator<Item = ObjRef>,
        set: &mut IndexSet<ObjRef>,
    ) {
        let mut work: Vec<ObjRef> = roots.into_iter().filter(|o| set.insert(*o)).collect();
        while let Some(obj) = work.pop() {
            if let Some(edges) = graph.get(&obj) {
                for &child in edges {
                    if set.insert(child) {
                        work.push(child);
                    }
                }
            }
        }
    }

    /// Candidates kept alive by counts from outside the candidate set
    fn externally_held(graph: &IndexMap<ObjRef, Vec<ObjRef>>) -> IndexSet<ObjRef> {
        let mut internal: IndexMap<ObjRef, u32> = graph.keys().map(|&o| (o, 0)).collect();
        for edges in graph.values() {
            for child in edges {
                if let Some(count) = internal.get_mut(child) {
                    *count += 1;
                }
            }
        }

        let external = internal.iter().filter_map(|(&obj, &count)| {
            let rc = unsafe { get_header(obj) }.ref_count();
            (rc > count).then_some(obj)
        });
        let mut live = IndexSet::new();
        Self::close_over(graph, external.collect::<Vec<_>>(), &mut live);
        live
    }

    /// Split garbage into weakly connected groups
    fn components(
        graph: &IndexMap<ObjRef, Vec<ObjRef>>,
        garbage: &IndexSet<ObjRef>,
    ) -> Vec<Vec<ObjRef>> {
        let mut undirected: IndexMap<ObjRef, Vec<ObjRef>> =
            garbage.iter().map(|&o| (o, Vec::new())).collect();
        for &obj in garbage {
            for &child in graph.get(&obj).into_iter().flatten() {
                if garbage.contains(&child) {
                    if let Some(out) = undirected.get_mut(&obj) {
                        out.push(child);
                    }
                    if let Some(back) = undirected.get_mut(&child) {
                        back.push(obj);
                    }
                }
            }
        }

        let mut seen = IndexSet::new();
        let mut groups = Vec::new();
        for &start in garbage {
            if !seen.insert(start) {
                continue;
            }
            let mut group = vec![start];
            let mut work = vec![start];
            while let Some(obj) = work.pop() {
                for &next in undirected.get(&obj).into_iter().flatten() {
                    if seen.insert(next) {
                        group.push(next);
                        work.push(next);
                    }
                }
            }
            groups.push(group);
        }
        groups
    }

    fn class_names(group: &[ObjRef]) -> Vec<String> {
        group
            .iter()
            .map(|&obj| {
                unsafe { class_of(obj) }
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "<raw>".to_string())
            })
            .collect()
    }

    fn clear_marks(rt: &Runtime) {
        rt.heap.for_each_block(&mut |obj| {
            unsafe { get_header(obj) }.clear(STATE_MARKED | STATE_CYCLE_CANDIDATE);
        });
    }
}

impl Default for TracingCollector {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Collector for TracingCollector {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn collect(&self, rt: &Runtime, reason: GcReason) -> CollectionResult {
        let mut result = CollectionResult::default();
        rt.satb.start_marking();

        // Roots
        let mut seeds = Vec::new();
        rt.visit_roots(VisitRootFlags::ALL_ROOTS, &mut |obj: ObjRef, _info: &RootInfo| {
            seeds.push(obj)
        });
        result.marked = self.mark_closure(rt, seeds);
        result.marked += self.drain_published(rt);

        // Trial deletion over what marking did not reach
        let graph = Self::unmarked_candidates(rt);
        result.candidates = graph.len();
        let live = Self::externally_held(&graph);
        let mut garbage: IndexSet<ObjRef> = graph
            .keys()
            .filter(|o| !live.contains(*o))
            .copied()
            .collect();

        // Anything touched since marking started survives this cycle
        let mut published = Vec::new();
        rt.satb.drain(|obj| published.push(obj));
        let mut keep = IndexSet::new();
        Self::close_over(&graph, published.into_iter().filter(|o| garbage.contains(o)), &mut keep);

        // Finalizable garbage gets its finalizer first
        let finalizable: Vec<ObjRef> = garbage
            .iter()
            .copied()
            .filter(|&obj| {
                let state = unsafe { get_header(obj) }.state();
                state & (STATE_FINALIZED | STATE_FINALIZE_PENDING) == 0
                    && unsafe { class_of(obj) }.is_some_and(|c| c.is_finalizable())
            })
            .collect();
        Self::close_over(&graph, finalizable.iter().copied(), &mut keep);
        garbage.retain(|o| !keep.contains(o));

        for obj in finalizable {
            if rt.rc().enqueue_for_finalization(obj) {
                result.finalizable += 1;
            }
        }

        // Patterns are recorded before reclamation clears the fields
        if !garbage.is_empty() {
            let groups = Self::components(&graph, &garbage);
            result.cycles = groups.len();
            for group in &groups {
                rt.cycles.record_pattern(Self::class_names(group));
            }
            result.reclaimed = rt.rc().reclaim_group(&garbage);
        }

        rt.satb.stop_marking();
        rt.satb.drain(|_| {});
        result.deferred = rt.rc().process_deferred();
        Self::clear_marks(rt);

        let dropped = rt.cycles.take_candidates().len();
        log::debug!(
            "{} collection ({}): marked {}, candidates {}, reclaimed {} objects in {} groups, {} finalizable, {} deferred, {} cycle candidates dropped",
            self.name(),
            reason,
            result.marked,
            result.candidates,
            result.reclaimed.objects,
            result.cycles,
            result.finalizable,
            result.deferred,
            dropped
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatal::panic_handler;
    use crate::object::{ClassBuilder, ClassFlags, ClassMetadata, FieldKind};
    use crate::{RuntimeConfig, KB, MB};
    use std::sync::Arc;

    fn runtime() -> Runtime {
        let config = RuntimeConfig {
            heap_size: 8 * MB,
            heap_start_size: 256 * KB,
            heap_growth_limit: 8 * MB,
            verify_heap_addresses: true,
            gc_threads: Some(2),
            ..Default::default()
        };
        let rt = Runtime::new(config).unwrap();
        rt.set_abort_handler(panic_handler);
        rt
    }

    fn node(rt: &Runtime) -> Arc<ClassMetadata> {
        rt.register_class(ClassBuilder::new("Node").field("next", FieldKind::Ref))
            .unwrap()
    }

    /// Build a ring of `n` nodes and return its first node, still held
    fn ring(rt: &Runtime, class: &Arc<ClassMetadata>, n: usize) -> ObjRef {
        let next = class.field_offset("next").unwrap();
        let first = rt.new_obj_for_class(class).unwrap();
        let mut prev = first;
        for _ in 1..n {
            let obj = rt.new_obj_for_class(class).unwrap();
            unsafe { rt.barrier().write_ref_field_no_inc(prev, next, obj) };
            prev = obj;
        }
        unsafe { rt.barrier().write_ref_field(prev, next, first) };
        first
    }

    #[test]
    fn test_unreachable_ring_reclaimed() {
        let rt = runtime();
        let class = node(&rt);
        let first = ring(&rt, &class, 3);
        rt.rc().dec_ref(first);
        assert_eq!(rt.heap().block_count(), 3, "counts alone cannot free a ring");

        let result = TracingCollector::new(2).collect(&rt, GcReason::ForceGC);
        assert_eq!(result.reclaimed.objects, 3);
        assert_eq!(result.cycles, 1);
        assert_eq!(rt.heap().block_count(), 0);
        assert!(!rt.satb().is_marking());
    }

    #[test]
    fn test_externally_held_ring_survives() {
        let rt = runtime();
        let class = node(&rt);
        let first = ring(&rt, &class, 4);

        let result = TracingCollector::new(1).collect(&rt, GcReason::ForceGC);
        assert_eq!(result.reclaimed.objects, 0);
        assert_eq!(result.candidates, 4);
        assert_eq!(rt.heap().block_count(), 4);

        rt.rc().dec_ref(first);
        TracingCollector::new(1).collect(&rt, GcReason::ForceGC);
        assert_eq!(rt.heap().block_count(), 0);
    }

    #[test]
    fn test_rooted_ring_is_marked() {
        let rt = runtime();
        let class = node(&rt);
        let first = ring(&rt, &class, 2);
        let handle = rt.new_global_ref(first);
        rt.rc().dec_ref(first);

        let result = TracingCollector::new(2).collect(&rt, GcReason::ForceGC);
        assert_eq!(result.marked, 2);
        assert_eq!(result.candidates, 0);
        assert_eq!(rt.heap().block_count(), 2);

        rt.delete_global_ref(handle);
        TracingCollector::new(2).collect(&rt, GcReason::ForceGC);
        assert_eq!(rt.heap().block_count(), 0);
    }

    #[test]
    fn test_finalizable_cycle_member_goes_to_queue() {
        let rt = runtime();
        let class = rt
            .register_class(
                ClassBuilder::new("Resource")
                    .field("next", FieldKind::Ref)
                    .flags(ClassFlags::FINALIZABLE),
            )
            .unwrap();
        let first = ring(&rt, &class, 2);
        rt.rc().dec_ref(first);

        let result = TracingCollector::new(1).collect(&rt, GcReason::ForceGC);
        assert_eq!(result.finalizable, 2);
        assert_eq!(result.reclaimed.objects, 0);

        assert_eq!(rt.run_finalization(), 2);
        TracingCollector::new(1).collect(&rt, GcReason::ForceGC);
        assert_eq!(rt.heap().block_count(), 0, "finalized ring reclaimed on the next cycle");
    }

    #[test]
    fn test_cycle_pattern_recorded() {
        let rt = runtime();
        let class = node(&rt);
        for _ in 0..2 {
            let first = ring(&rt, &class, 2);
            rt.rc().dec_ref(first);
            TracingCollector::new(1).collect(&rt, GcReason::ForceGC);
        }
        let patterns = rt.cycles().patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].hits, 2);
        assert_eq!(patterns[0].classes, vec!["Node".to_string(), "Node".to_string()]);
    }

    #[test]
    fn test_garbage_reaching_live_object() {
        let rt = runtime();
        let class = node(&rt);
        let next = class.field_offset("next").unwrap();
        let first = ring(&rt, &class, 2);
        let survivor = rt.new_obj(48, 8).unwrap();

        let holder = rt
            .register_class(
                ClassBuilder::new("Holder")
                    .field("a", FieldKind::Ref)
                    .field("b", FieldKind::Ref),
            )
            .unwrap();
        let a = holder.field_offset("a").unwrap();
        let b = holder.field_offset("b").unwrap();
        let h = rt.new_obj_for_class(&holder).unwrap();
        unsafe {
            rt.barrier().write_ref_field(h, a, first);
            rt.barrier().write_ref_field(h, b, survivor);
            rt.barrier().write_ref_field(first, next, h);
        }
        rt.rc().dec_ref(first);
        rt.rc().dec_ref(h);

        let result = TracingCollector::new(1).collect(&rt, GcReason::ForceGC);
        assert_eq!(result.reclaimed.objects, 2, "first and holder");
        assert_eq!(rt.rc().ref_count(survivor), 1, "edge leaving the group decremented once");
        rt.rc().dec_ref(survivor);
        assert_eq!(rt.heap().block_count(), 0);
    }
}
