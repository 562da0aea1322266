//! RC Module - Reference counting engine
//!
//! Every managed object carries a strong and a weak count in its header.
//! The engine keeps them exact:
//!
//! ```text
//!   inc_ref ──► rc += 1
//!   dec_ref ──► rc -= 1 ──(rc == 0)──► marking?  ──yes──► deferred list
//!                                         │no
//!                                         ▼
//!                                   finalizable? ──yes──► finalizer queue
//!                                         │no
//!                                         ▼
//!                              release: clear strong fields (dec each),
//!                              drop weak fields, then
//!                              weak_rc == 0 ? free : mark weak-collected
//! ```
//!
//! Release is iterative, so long chains never recurse. Underflow, overflow
//! and counts on addresses outside the heap are fatal: they mean the heap is
//! already corrupt.
//!
//! The engine does not detect cycles inline. A decrement that leaves a
//! cycle-capable object alive records it as a candidate; the collector and
//! the cycle-pattern jobs consume candidates later.

pub mod cycle;
pub mod reference;

pub use cycle::{CycleJob, CyclePattern, CyclePatternStore};
pub use reference::ReferenceProcessor;

use crate::fatal::FatalError;
use crate::object::header::{
    STATE_CYCLE_CANDIDATE, STATE_DEFERRED_RELEASE, STATE_FINALIZED, STATE_FINALIZE_PENDING,
    STATE_RELEASED, STATE_TRACING, STATE_WEAK_COLLECTED,
};
use crate::object::{class_of, get_header, ref_slot, ObjRef, ObjectHeader, NULL, OBJECT_ALIGNMENT};
use crate::runtime::Runtime;
use crate::stats::RcStats;
use indexmap::IndexSet;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Spins tolerated while a slot keeps pointing at a dead object
const LOAD_RETRY_LIMIT: u32 = 1024;

/// Outcome of a group reclamation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reclaimed {
    pub objects: u64,
    pub bytes: u64,
}

/// Reference-count operations bound to one runtime
///
/// Obtained through [`Runtime::rc`]. All operations accept `NULL` as a
/// no-op and ignore permanent objects.
///
/// # Examples
///
/// ```rust
/// use mrt::{Runtime, RuntimeConfig};
///
/// let rt = Runtime::new(RuntimeConfig::default()).unwrap();
/// let obj = rt.new_obj(64, 8).unwrap();
/// rt.rc().inc_ref(obj);
/// assert_eq!(rt.rc().ref_count(obj), 2);
/// rt.rc().dec_ref(obj);
/// rt.rc().dec_ref(obj); // released and freed
/// ```
#[derive(Clone, Copy)]
pub struct RcEngine<'rt> {
    rt: &'rt Runtime,
}

impl<'rt> RcEngine<'rt> {
    pub(crate) fn new(rt: &'rt Runtime) -> Self {
        Self { rt }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Header of `obj` after full validation
    ///
    /// Heap bounds and alignment are always checked; the exact allocation
    /// check runs when `verify_heap_addresses` is set.
    #[inline]
    fn header(&self, obj: ObjRef, operation: &'static str) -> &'rt ObjectHeader {
        let heap = &self.rt.heap;
        if !heap.in_bounds(obj)
            || obj % OBJECT_ALIGNMENT != 0
            || (self.rt.config.verify_heap_addresses && !heap.is_allocated(obj))
        {
            self.rt.fatal(FatalError::InvalidHeapAddress {
                address: obj,
                operation,
            });
        }
        unsafe { get_header(obj) }
    }

    /// Header of `obj` after the bounds check only
    ///
    /// Used where the object may legitimately be freed concurrently: the
    /// block stays mapped and header words are only touched atomically.
    #[inline]
    fn header_unverified(&self, obj: ObjRef, operation: &'static str) -> &'rt ObjectHeader {
        if !self.rt.heap.in_bounds(obj) || obj % OBJECT_ALIGNMENT != 0 {
            self.rt.fatal(FatalError::InvalidHeapAddress {
                address: obj,
                operation,
            });
        }
        unsafe { get_header(obj) }
    }

    #[inline]
    fn trace(&self, header: &ObjectHeader, obj: ObjRef, operation: &str) {
        if header.state.load(Ordering::Relaxed) & STATE_TRACING != 0 {
            log::debug!(
                "rc trace {:#x}: {} (rc={}, weak={})",
                obj,
                operation,
                header.ref_count(),
                header.weak_count()
            );
        }
    }

    // ========================================================================
    // Strong counts
    // ========================================================================

    /// Take one strong count
    ///
    /// The caller must already hold a reference to `obj`.
    pub fn inc_ref(&self, obj: ObjRef) {
        if obj == NULL {
            return;
        }
        let header = self.header(obj, "inc_ref");
        if header.is_permanent() {
            return;
        }
        let prev = header.rc.fetch_add(1, Ordering::Relaxed);
        if prev == u32::MAX {
            self.rt.fatal(FatalError::RefCountOverflow { address: obj });
        }
        if prev == 0 && header.is_released() {
            self.rt.fatal(FatalError::ReleasedObjectAccess {
                address: obj,
                operation: "inc_ref",
            });
        }
        RcStats::bump(&self.rt.rc_stats.incs);
        self.trace(header, obj, "inc");
    }

    /// Drop one strong count, releasing the object at zero
    pub fn dec_ref(&self, obj: ObjRef) {
        if obj != NULL && self.dec_inner(obj, "dec_ref") {
            self.release(obj);
        }
    }

    /// Increment `new` then decrement `old`
    ///
    /// The increment comes first so that `new == old` never transiently
    /// reaches zero.
    pub fn inc_dec_ref(&self, new: ObjRef, old: ObjRef) {
        self.inc_ref(new);
        self.dec_ref(old);
    }

    /// Decrement for a caller that owns the only possible access to `obj`
    ///
    /// Skips the atomic read-modify-write; used on freshly allocated objects
    /// that never escaped the allocating thread.
    pub fn dec_ref_unsync(&self, obj: ObjRef) {
        if obj == NULL {
            return;
        }
        let header = self.header(obj, "dec_ref_unsync");
        if header.is_permanent() {
            return;
        }
        let count = header.rc.load(Ordering::Relaxed);
        if count == 0 {
            self.rt.fatal(FatalError::RefCountUnderflow { address: obj });
        }
        header.rc.store(count - 1, Ordering::Relaxed);
        RcStats::bump(&self.rt.rc_stats.decs);
        RcStats::bump(&self.rt.rc_stats.fast_ops);
        if count == 1 && self.zero_action(obj) {
            self.release(obj);
        }
    }

    /// Shared decrement path
    ///
    /// # Returns
    /// `true` when the count reached zero and the caller must release
    fn dec_inner(&self, obj: ObjRef, operation: &'static str) -> bool {
        let header = self.header(obj, operation);
        if header.is_permanent() {
            return false;
        }
        self.rt.satb.publish(obj);
        let prev = match header
            .rc
            .fetch_update(Ordering::Release, Ordering::Relaxed, |c| c.checked_sub(1))
        {
            Ok(prev) => prev,
            Err(_) => self.rt.fatal(FatalError::RefCountUnderflow { address: obj }),
        };
        RcStats::bump(&self.rt.rc_stats.decs);
        self.trace(header, obj, "dec");

        if prev == 1 {
            fence(Ordering::Acquire);
            return self.zero_action(obj);
        }
        self.note_candidate(obj, header);
        false
    }

    /// Decide what happens to an object whose count just reached zero
    ///
    /// # Returns
    /// `true` if the object must be released now
    fn zero_action(&self, obj: ObjRef) -> bool {
        let header = unsafe { get_header(obj) };

        if self.rt.satb.is_marking() {
            if header.set(STATE_DEFERRED_RELEASE) & STATE_DEFERRED_RELEASE == 0 {
                self.rt.satb.defer_release(obj);
                RcStats::bump(&self.rt.rc_stats.deferred_releases);
            }
            return false;
        }

        let finalizable = unsafe { class_of(obj) }.is_some_and(|class| class.is_finalizable());
        if finalizable
            && !header.has(STATE_FINALIZED)
            && header.set(STATE_FINALIZE_PENDING) & STATE_FINALIZE_PENDING == 0
        {
            // The finalizer queue owns this count until the finalizer ran.
            header.rc.store(1, Ordering::Release);
            self.rt.finalizers.enqueue(obj);
            return false;
        }
        true
    }

    /// Hand a live-but-unreachable finalizable object to the finalizer queue
    ///
    /// The queue takes its own strong count.
    ///
    /// # Returns
    /// `false` if the object was already finalized or queued
    pub(crate) fn enqueue_for_finalization(&self, obj: ObjRef) -> bool {
        let header = unsafe { get_header(obj) };
        if header.has(STATE_FINALIZED) || header.set(STATE_FINALIZE_PENDING) & STATE_FINALIZE_PENDING != 0 {
            return false;
        }
        header.rc.fetch_add(1, Ordering::AcqRel);
        self.rt.finalizers.enqueue(obj);
        true
    }

    fn note_candidate(&self, obj: ObjRef, header: &ObjectHeader) {
        if header.state.load(Ordering::Relaxed) & STATE_CYCLE_CANDIDATE != 0 {
            return;
        }
        let cyclic = unsafe { class_of(obj) }.is_some_and(|class| class.may_form_cycles());
        if cyclic
            && header.set(STATE_CYCLE_CANDIDATE) & STATE_CYCLE_CANDIDATE == 0
            && self.rt.cycles.record_candidate(obj)
        {
            RcStats::bump(&self.rt.rc_stats.cycle_candidates);
        }
    }

    // ========================================================================
    // Fast paths
    // ========================================================================

    /// Increment without allocation-table verification or statistics
    #[inline]
    pub fn inc_ref_fast(&self, obj: ObjRef) {
        if obj == NULL {
            return;
        }
        let header = self.header_unverified(obj, "inc_ref_fast");
        if header.is_permanent() {
            return;
        }
        if header.rc.fetch_add(1, Ordering::Relaxed) == u32::MAX {
            self.rt.fatal(FatalError::RefCountOverflow { address: obj });
        }
    }

    /// Decrement without allocation-table verification or statistics
    ///
    /// Still publishes to an active mark and still detects underflow: a
    /// wrapped count is restored before the violation is reported.
    #[inline]
    pub fn dec_ref_fast(&self, obj: ObjRef) {
        if obj == NULL {
            return;
        }
        let header = self.header_unverified(obj, "dec_ref_fast");
        if header.is_permanent() {
            return;
        }
        self.rt.satb.publish(obj);
        let prev = header.rc.fetch_sub(1, Ordering::Release);
        if prev == 0 {
            header.rc.fetch_add(1, Ordering::Relaxed);
            self.rt.fatal(FatalError::RefCountUnderflow { address: obj });
        }
        if prev == 1 {
            fence(Ordering::Acquire);
            if self.zero_action(obj) {
                self.release(obj);
            }
        }
    }

    #[inline]
    pub fn inc_dec_ref_fast(&self, new: ObjRef, old: ObjRef) {
        self.inc_ref_fast(new);
        self.dec_ref_fast(old);
    }

    // ========================================================================
    // Weak counts
    // ========================================================================

    /// Take one weak count
    pub fn weak_inc(&self, obj: ObjRef) {
        if obj == NULL {
            return;
        }
        let header = self.header(obj, "weak_inc");
        if header.is_permanent() {
            return;
        }
        if header.weak_rc.fetch_add(1, Ordering::Relaxed) == u32::MAX {
            self.rt.fatal(FatalError::RefCountOverflow { address: obj });
        }
    }

    /// Drop one weak count, freeing a weak-collected object at zero
    pub fn weak_dec(&self, obj: ObjRef) {
        if obj == NULL {
            return;
        }
        let header = self.header(obj, "weak_dec");
        if header.is_permanent() {
            return;
        }
        // Pairs with `finish_release`: both sides store then load in SeqCst,
        // so at least one of them sees the other's store and frees.
        let prev = match header
            .weak_rc
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |c| c.checked_sub(1))
        {
            Ok(prev) => prev,
            Err(_) => self.rt.fatal(FatalError::RefCountUnderflow { address: obj }),
        };
        if prev == 1 && header.state.load(Ordering::SeqCst) & STATE_WEAK_COLLECTED != 0 {
            self.free(obj, header);
        }
    }

    /// Upgrade to a strong count from a weak path
    ///
    /// Succeeds while the object still has strong holders, or while it sits
    /// on the deferred-release list; a finalize-pending object counts as
    /// held by its queue.
    ///
    /// # Returns
    /// `true` if a strong count was taken
    pub fn inc_resurrect_weak(&self, obj: ObjRef) -> bool {
        if obj == NULL {
            return false;
        }
        let header = self.header(obj, "inc_resurrect_weak");
        if header.is_permanent() {
            return true;
        }
        let mut count = header.rc.load(Ordering::Acquire);
        loop {
            let state = header.state();
            if state & STATE_RELEASED != 0 || (count == 0 && state & STATE_DEFERRED_RELEASE == 0) {
                return false;
            }
            match header.rc.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
        self.rt.satb.publish(obj);
        RcStats::bump(&self.rt.rc_stats.resurrected);
        self.trace(header, obj, "resurrect");
        true
    }

    /// Take a strong count only if the object still has one
    ///
    /// With `live_only`, objects waiting for their finalizer are refused
    /// too. Never touches non-atomic memory, so it is safe on a block that
    /// was freed after its address was read.
    fn try_inc(&self, obj: ObjRef, header: &ObjectHeader, live_only: bool) -> bool {
        let mut count = header.rc.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return false;
            }
            if count == u32::MAX {
                self.rt.fatal(FatalError::RefCountOverflow { address: obj });
            }
            match header.rc.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }
        if live_only && header.state() & (STATE_FINALIZE_PENDING | STATE_RELEASED) != 0 {
            // The finalizer queue still holds one count, so this never hits zero.
            header.rc.fetch_sub(1, Ordering::Release);
            return false;
        }
        true
    }

    /// Load a strong reference from `slot` and take a count on it
    ///
    /// Retries while the slot changes under the load. A slot that keeps
    /// pointing at an object without strong counts is a broken invariant.
    pub(crate) fn load_and_inc(&self, slot: &AtomicUsize, order: Ordering) -> ObjRef {
        let mut spins = 0;
        loop {
            let obj = slot.load(order);
            if obj == NULL {
                return NULL;
            }
            let header = self.header_unverified(obj, "load_ref");
            if header.is_permanent() {
                return obj;
            }
            if self.try_inc(obj, header, false) {
                if slot.load(Ordering::Acquire) == obj {
                    RcStats::bump(&self.rt.rc_stats.incs);
                    self.trace(header, obj, "load");
                    return obj;
                }
                self.dec_ref(obj);
                continue;
            }
            if slot.load(Ordering::Acquire) == obj {
                spins += 1;
                if spins > LOAD_RETRY_LIMIT {
                    self.rt.fatal(FatalError::ReleasedObjectAccess {
                        address: obj,
                        operation: "load_ref",
                    });
                }
                std::thread::yield_now();
            }
        }
    }

    /// Load a weak reference from `slot`, upgrading it to a strong count
    ///
    /// # Returns
    /// The object with one strong count taken, or `NULL` if it is dead
    pub(crate) fn load_weak_and_inc(&self, slot: &AtomicUsize, order: Ordering) -> ObjRef {
        loop {
            let obj = slot.load(order);
            if obj == NULL {
                return NULL;
            }
            let header = self.header_unverified(obj, "load_weak");
            if header.is_permanent() {
                return obj;
            }
            if !self.try_inc(obj, header, true) {
                return NULL;
            }
            if slot.load(Ordering::Acquire) == obj {
                RcStats::bump(&self.rt.rc_stats.incs);
                return obj;
            }
            self.dec_ref(obj);
        }
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Release an object whose strong count is zero
    ///
    /// Clears every strong field (decrementing its target), drops every weak
    /// field, then frees or weak-collects. Targets that reach zero are
    /// released by the same loop.
    pub(crate) fn release(&self, obj: ObjRef) {
        let mut work = vec![obj];
        while let Some(obj) = work.pop() {
            let header = unsafe { get_header(obj) };
            if header.set(STATE_RELEASED) & STATE_RELEASED != 0 {
                continue;
            }
            self.trace(header, obj, "release");

            if let Some(class) = unsafe { class_of(obj) } {
                if class.reference_kind().is_some() {
                    self.rt.references.unregister(obj);
                }
                let tib = class.gctib();
                unsafe {
                    tib.visit_refs(obj, |offset| {
                        let child = ref_slot(obj, offset).swap(NULL, Ordering::AcqRel);
                        if child != NULL && self.dec_inner(child, "release") {
                            work.push(child);
                        }
                    });
                    tib.visit_weak_refs(|offset| {
                        let target = ref_slot(obj, offset).swap(NULL, Ordering::AcqRel);
                        self.weak_dec(target);
                    });
                }
            }

            RcStats::bump(&self.rt.rc_stats.released);
            self.finish_release(obj, header);
        }
    }

    /// Free the memory, or keep it for outstanding weak holders
    fn finish_release(&self, obj: ObjRef, header: &ObjectHeader) {
        header.state.fetch_or(STATE_WEAK_COLLECTED, Ordering::SeqCst);
        if header.weak_rc.load(Ordering::SeqCst) == 0 {
            self.free(obj, header);
        } else {
            RcStats::bump(&self.rt.rc_stats.weak_collected);
        }
    }

    fn free(&self, obj: ObjRef, header: &ObjectHeader) {
        if header.claim_free() {
            let size = header.size();
            header.rc.store(0, Ordering::Release);
            self.rt.heap.free(obj, size);
        }
    }

    /// Release `obj` regardless of its current count
    ///
    /// The caller guarantees no other holder will touch the object again.
    pub fn release_obj(&self, obj: ObjRef) {
        if obj == NULL {
            return;
        }
        let header = self.header(obj, "release_obj");
        if header.is_permanent() || header.is_released() {
            return;
        }
        header.rc.store(0, Ordering::Release);
        self.release(obj);
    }

    /// Reclaim a closed group of unreachable objects
    ///
    /// Every strong count on a member must come from another member. Edges
    /// inside the group are dropped without count traffic; edges leaving it
    /// are decremented normally.
    pub(crate) fn reclaim_group(&self, group: &IndexSet<ObjRef>) -> Reclaimed {
        let mut reclaimed = Reclaimed::default();
        for &obj in group {
            let header = unsafe { get_header(obj) };
            header.set(STATE_RELEASED);
            if unsafe { class_of(obj) }.is_some_and(|class| class.reference_kind().is_some()) {
                self.rt.references.unregister(obj);
            }
        }

        let mut cascade = Vec::new();
        for &obj in group {
            let Some(class) = (unsafe { class_of(obj) }) else {
                continue;
            };
            let tib = class.gctib();
            unsafe {
                tib.visit_refs(obj, |offset| {
                    let child = ref_slot(obj, offset).swap(NULL, Ordering::AcqRel);
                    if child != NULL && !group.contains(&child) && self.dec_inner(child, "reclaim") {
                        cascade.push(child);
                    }
                });
                tib.visit_weak_refs(|offset| {
                    let target = ref_slot(obj, offset).swap(NULL, Ordering::AcqRel);
                    self.weak_dec(target);
                });
            }
        }

        for &obj in group {
            let header = unsafe { get_header(obj) };
            header.rc.store(0, Ordering::Release);
            reclaimed.objects += 1;
            reclaimed.bytes += header.size() as u64;
            RcStats::bump(&self.rt.rc_stats.released);
            self.finish_release(obj, header);
        }

        for child in cascade {
            self.release(child);
        }
        reclaimed
    }

    /// Release objects whose count reached zero during the last mark
    ///
    /// Objects resurrected in the meantime are kept. Each object is claimed
    /// by moving its count from 0 to 1 before the deferred bit is cleared, so
    /// a concurrent [`Self::inc_resurrect_weak`] either wins the claim or
    /// increments past it; the release decision is the claim's decrement.
    ///
    /// # Returns
    /// Number of objects released
    pub(crate) fn process_deferred(&self) -> usize {
        let mut released = 0;
        for obj in self.rt.satb.drain_deferred() {
            let header = unsafe { get_header(obj) };
            if header.is_released() {
                header.clear(STATE_DEFERRED_RELEASE);
                continue;
            }
            let claimed = header
                .rc
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            header.clear(STATE_DEFERRED_RELEASE);
            if !claimed {
                continue;
            }
            if header.rc.fetch_sub(1, Ordering::AcqRel) == 1 && self.zero_action(obj) {
                self.release(obj);
                released += 1;
            }
        }
        released
    }

    // ========================================================================
    // Queries and debugging
    // ========================================================================

    /// Current strong count
    pub fn ref_count(&self, obj: ObjRef) -> u32 {
        if obj == NULL {
            return 0;
        }
        self.header_unverified(obj, "ref_count").ref_count()
    }

    /// Current weak count
    pub fn weak_ref_count(&self, obj: ObjRef) -> u32 {
        if obj == NULL {
            return 0;
        }
        self.header_unverified(obj, "weak_ref_count").weak_count()
    }

    /// Check whether the object has no strong holders left
    pub fn is_garbage(&self, obj: ObjRef) -> bool {
        if obj == NULL {
            return false;
        }
        let header = self.header_unverified(obj, "is_garbage");
        !header.is_permanent() && (header.is_released() || header.ref_count() == 0)
    }

    /// Reset an object's lifecycle state so it can be reused in place
    ///
    /// Leaves one strong count owned by the caller.
    pub fn pre_renew_object(&self, obj: ObjRef) {
        if obj != NULL {
            self.header(obj, "pre_renew_object").pre_renew();
        }
    }

    /// Log every count operation on `obj`
    pub fn set_tracing_object(&self, obj: ObjRef, enabled: bool) {
        if obj == NULL {
            return;
        }
        let header = self.header(obj, "set_tracing_object");
        if enabled {
            header.set(STATE_TRACING);
        } else {
            header.clear(STATE_TRACING);
        }
    }

    /// Publish a referent read through a reference object to an active mark
    pub fn weak_ref_get_barrier(&self, obj: ObjRef) {
        self.rt.satb.publish(obj);
    }
}
