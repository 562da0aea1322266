//! Mutator - Per-thread handle of an attached thread
//!
//! A [`Mutator`] is returned by [`Runtime::gc_init_thread_local`] and
//! stays on the thread that created it. It owns the thread's record in
//! the thread list and every root the record holds:
//! - native-interface local references and their frames
//! - typed roots pushed by compiled code (frames, stack slots, monitors)
//! - the thread object and the pending exception
//!
//! Each of those holds one strong count. Dropping the mutator detaches the
//! thread and gives every count back.

use crate::fatal::FatalError;
use crate::object::{ObjRef, NULL};
use crate::roots::{MutatorState, RootInfo, RootType, ThreadRecord};
use crate::runtime::Runtime;
use std::marker::PhantomData;
use std::sync::Arc;

/// Attached mutator thread
///
/// # Examples
///
/// ```rust
/// use mrt::{Runtime, RuntimeConfig};
///
/// let rt = Runtime::new(RuntimeConfig::default()).unwrap();
/// let mutator = rt.gc_init_thread_local(true).unwrap();
///
/// let obj = rt.new_obj(64, 8).unwrap();
/// mutator.push_local_frame();
/// mutator.new_local_ref(obj);
/// rt.rc().dec_ref(obj);
/// assert!(rt.heap().is_allocated(obj));
///
/// mutator.pop_local_frame();
/// assert!(!rt.heap().is_allocated(obj));
/// ```
pub struct Mutator<'rt> {
    rt: &'rt Runtime,
    record: Arc<ThreadRecord>,
    detached: bool,
    /// Bound to the attaching thread
    _not_send: PhantomData<*const ()>,
}

impl<'rt> Mutator<'rt> {
    pub(crate) fn new(rt: &'rt Runtime, record: Arc<ThreadRecord>) -> Self {
        Self {
            rt,
            record,
            detached: false,
            _not_send: PhantomData,
        }
    }

    pub fn tid(&self) -> u64 {
        self.record.tid()
    }

    pub fn record(&self) -> &ThreadRecord {
        &self.record
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.rt
    }

    // ========================================================================
    // Safe regions and yieldpoints
    // ========================================================================

    /// Promise not to touch managed memory until [`Self::leave_saferegion`]
    pub fn enter_saferegion(&self) {
        self.rt.safepoint.enter_saferegion(&self.record);
    }

    /// Return to managed code, waiting out any collection in progress
    pub fn leave_saferegion(&self) {
        self.rt.safepoint.leave_saferegion(&self.record);
    }

    pub fn is_in_saferegion(&self) -> bool {
        self.record.state() == MutatorState::Saferegion
    }

    /// Assert the thread is outside a safe region
    ///
    /// A violation is fatal.
    pub fn check_saferegion(&self, operation: &str) {
        if self.is_in_saferegion() {
            self.rt.fatal(FatalError::SaferegionViolation {
                thread_id: self.tid(),
                message: format!("{} called inside a safe region", operation),
            });
        }
    }

    /// Run `f` inside a safe region
    ///
    /// `f` must not touch managed memory.
    pub fn saferegion<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_saferegion();
        let result = f();
        self.leave_saferegion();
        result
    }

    /// Yieldpoint: park here if a collection has been requested
    #[inline]
    pub fn yieldpoint(&self) {
        if self.rt.safepoint.poll() {
            self.rt.safepoint.block_until_released(&self.record);
        }
    }

    // ========================================================================
    // Local references
    // ========================================================================

    /// Create a local reference, taking one count on `obj`
    ///
    /// # Returns
    /// `obj`, as the local handle
    pub fn new_local_ref(&self, obj: ObjRef) -> ObjRef {
        if obj == NULL {
            return NULL;
        }
        self.rt.rc().inc_ref(obj);
        self.record.push_local(obj);
        self.rt
            .roots
            .log_new_root(obj, RootInfo::new(RootType::JniLocal, self.tid()));
        obj
    }

    /// Delete one local reference to `obj`
    pub fn delete_local_ref(&self, obj: ObjRef) {
        if self.record.remove_local(obj) {
            self.rt.rc().dec_ref(obj);
        }
    }

    pub fn push_local_frame(&self) {
        self.record.push_frame();
    }

    /// Pop the innermost local frame, dropping the references it holds
    pub fn pop_local_frame(&self) {
        let rc = self.rt.rc();
        for obj in self.record.pop_frame() {
            rc.dec_ref(obj);
        }
    }

    pub fn local_count(&self) -> usize {
        self.record.local_count()
    }

    // ========================================================================
    // Thread roots
    // ========================================================================

    /// Push a typed root owned by this thread, taking one count on `obj`
    pub fn push_root(&self, root_type: RootType, obj: ObjRef) {
        if obj == NULL {
            return;
        }
        self.rt.rc().inc_ref(obj);
        self.record.push_root(root_type, obj);
        self.rt
            .roots
            .log_new_root(obj, RootInfo::new(root_type, self.tid()));
    }

    /// Pop the most recent typed root and drop its count
    ///
    /// # Returns
    /// `false` if no root was pushed
    pub fn pop_root(&self) -> bool {
        match self.record.pop_root() {
            Some((_, obj)) => {
                self.rt.rc().dec_ref(obj);
                true
            },
            None => false,
        }
    }

    /// Set the language-level thread object
    pub fn set_thread_object(&self, obj: ObjRef) {
        let rc = self.rt.rc();
        rc.inc_ref(obj);
        let old = self.record.swap_thread_object(obj);
        rc.dec_ref(old);
        if obj != NULL {
            self.rt
                .roots
                .log_new_root(obj, RootInfo::new(RootType::ThreadObject, self.tid()));
        }
    }

    /// Set (or clear with null) the pending exception
    pub fn set_pending_exception(&self, obj: ObjRef) {
        let rc = self.rt.rc();
        rc.inc_ref(obj);
        let old = self.record.swap_pending_exception(obj);
        rc.dec_ref(old);
    }

    /// Pending exception, without taking a count
    pub fn pending_exception(&self) -> ObjRef {
        self.record.pending_exception()
    }

    // ========================================================================
    // Detach
    // ========================================================================

    /// Detach the thread; equivalent to dropping the handle
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        if self.record.state() != MutatorState::Running {
            self.leave_saferegion();
        }
        let rc = self.rt.rc();
        for obj in self.record.drain_all() {
            rc.dec_ref(obj);
        }

        self.rt.safepoint.detach(&self.record);
        let guard = match self.rt.threads.lock().lock() {
            Ok(guard) => guard,
            Err(err) => self.rt.fatal(err),
        };
        self.rt.threads.remove(&guard, self.tid());
        drop(guard);
        log::debug!("thread {} detached", self.tid());
    }
}

impl Drop for Mutator<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use crate::fatal::panic_handler;
    use crate::gc::{GcOutcome, GcReason};
    use crate::roots::{MutatorState, RootInfo, RootType, VisitRootFlags};
    use crate::object::ObjRef;
    use crate::{Runtime, RuntimeConfig, KB, MB};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn runtime() -> Runtime {
        let config = RuntimeConfig {
            heap_size: 4 * MB,
            heap_start_size: 256 * KB,
            heap_growth_limit: 4 * MB,
            verify_heap_addresses: true,
            check_saferegion: true,
            ..Default::default()
        };
        let rt = Runtime::new(config).unwrap();
        rt.set_abort_handler(panic_handler);
        rt
    }

    #[test]
    fn test_attach_twice_rejected() {
        let rt = runtime();
        let mutator = rt.gc_init_thread_local(true).unwrap();
        assert!(rt.gc_init_thread_local(false).is_err());
        assert_eq!(rt.threads().len(), 1);

        rt.gc_fini_thread_local(mutator);
        assert!(rt.threads().is_empty());
        assert!(rt.gc_init_thread_local(false).is_ok());
    }

    #[test]
    fn test_detach_drops_thread_roots() {
        let rt = runtime();
        let mutator = rt.gc_init_thread_local(false).unwrap();
        let a = rt.new_obj(48, 8).unwrap();
        let b = rt.new_obj(48, 8).unwrap();
        let c = rt.new_obj(48, 8).unwrap();

        mutator.new_local_ref(a);
        mutator.push_root(RootType::InterpreterFrame, b);
        mutator.set_thread_object(c);
        mutator.set_pending_exception(c);
        for obj in [a, b, c] {
            rt.rc().dec_ref(obj);
        }
        assert_eq!(rt.heap().block_count(), 3);

        drop(mutator);
        assert_eq!(rt.heap().block_count(), 0);
    }

    #[test]
    fn test_local_frames() {
        let rt = runtime();
        let mutator = rt.gc_init_thread_local(false).unwrap();
        let outer = rt.new_obj(48, 8).unwrap();
        let inner = rt.new_obj(48, 8).unwrap();

        mutator.new_local_ref(outer);
        mutator.push_local_frame();
        mutator.new_local_ref(inner);
        mutator.new_local_ref(inner);
        assert_eq!(mutator.local_count(), 3);

        mutator.pop_local_frame();
        assert_eq!(mutator.local_count(), 1);
        assert_eq!(rt.rc().ref_count(inner), 1);

        mutator.delete_local_ref(outer);
        mutator.delete_local_ref(outer);
        assert_eq!(rt.rc().ref_count(outer), 1, "second delete is a no-op");

        rt.rc().dec_ref(outer);
        rt.rc().dec_ref(inner);
    }

    #[test]
    fn test_thread_roots_visited() {
        let rt = runtime();
        let mutator = rt.gc_init_thread_local(false).unwrap();
        let obj = rt.new_obj(48, 8).unwrap();
        mutator.push_root(RootType::Monitor, obj);

        let mut seen = Vec::new();
        rt.visit_roots(VisitRootFlags::ALL_ROOTS, &mut |o: ObjRef, info: &RootInfo| {
            seen.push((o, *info))
        });
        assert_eq!(seen, vec![(obj, RootInfo::new(RootType::Monitor, mutator.tid()))]);

        assert!(mutator.pop_root());
        assert!(!mutator.pop_root());
        rt.rc().dec_ref(obj);
    }

    #[test]
    fn test_saferegion_state() {
        let rt = runtime();
        let mutator = rt.gc_init_thread_local(false).unwrap();
        assert_eq!(mutator.record().state(), MutatorState::Running);
        let inside = mutator.saferegion(|| crate::util::in_saferegion());
        assert!(inside);
        assert!(!mutator.is_in_saferegion());
        mutator.check_saferegion("test");
    }

    #[test]
    #[should_panic(expected = "inside a safe region")]
    fn test_barrier_in_saferegion_is_fatal() {
        let rt = runtime();
        let mutator = rt.gc_init_thread_local(false).unwrap();
        let obj = rt.new_obj(48, 8).unwrap();
        mutator.enter_saferegion();
        unsafe {
            rt.barrier()
                .store_field::<i64>(obj, 40, 1, crate::barrier::Access::Plain);
        }
    }

    #[test]
    fn test_collection_waits_for_yieldpoint() {
        let rt = runtime();
        let attached = std::sync::Barrier::new(2);
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                let mutator = rt.gc_init_thread_local(false).unwrap();
                attached.wait();
                while !stop.load(Ordering::Acquire) {
                    let obj = rt.new_obj(48, 8).unwrap();
                    rt.rc().dec_ref(obj);
                    mutator.yieldpoint();
                }
            });
            attached.wait();
            std::thread::sleep(Duration::from_millis(5));
            assert!(matches!(
                rt.gc_start(GcReason::ForceGC),
                GcOutcome::Completed(_)
            ));
            stop.store(true, Ordering::Release);
        });
        assert!(rt.threads().is_empty());
    }
}
