//! Finalizer - Object Finalization
//!
//! Instances of `FINALIZABLE` classes are not released the first time their
//! count reaches zero. The engine marks them finalize-pending, gives the
//! queue one strong count and pushes them here. Running the queue calls the
//! installed hook for each object, marks it finalized and drops the queue's
//! count; unless the hook resurrected the object, that final decrement
//! releases it for good.
//!
//! Pending objects are roots of kind `Finalizing`.

use crate::logging::RuntimeEvent;
use crate::object::header::{STATE_FINALIZED, STATE_FINALIZE_PENDING};
use crate::object::{class_of, get_header, ObjRef};
use crate::runtime::Runtime;
use crate::stats::RcStats;
use crossbeam::queue::SegQueue;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Language-level finalizer invoked for each pending object
pub type FinalizerHook = Arc<dyn Fn(&Runtime, ObjRef) + Send + Sync>;

/// Queue of objects waiting for their finalizer
pub struct FinalizerQueue {
    pending: SegQueue<ObjRef>,
    /// Every object from enqueue until its queue count is dropped
    in_flight: Mutex<IndexSet<ObjRef>>,
    hook: RwLock<Option<FinalizerHook>>,
    /// Serializes runs so each object is finalized exactly once
    running: Mutex<()>,
}

impl FinalizerQueue {
    pub fn new() -> Self {
        Self {
            pending: SegQueue::new(),
            in_flight: Mutex::new(IndexSet::new()),
            hook: RwLock::new(None),
            running: Mutex::new(()),
        }
    }

    /// Install the finalizer hook
    pub fn set_hook(&self, hook: FinalizerHook) {
        *self.hook.write() = Some(hook);
    }

    pub(crate) fn enqueue(&self, obj: ObjRef) {
        self.in_flight.lock().insert(obj);
        self.pending.push(obj);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of every object the queue holds a count on
    pub(crate) fn held_objects(&self) -> Vec<ObjRef> {
        self.in_flight.lock().iter().copied().collect()
    }

    /// Run the finalizer of every pending object
    ///
    /// A panicking hook is logged and the object is still treated as
    /// finalized.
    ///
    /// # Returns
    /// Number of objects finalized
    pub(crate) fn run(&self, rt: &Runtime) -> usize {
        let _guard = self.running.lock();
        let hook = self.hook.read().clone();
        let mut finalized = 0;

        while let Some(obj) = self.pending.pop() {
            if let Some(hook) = &hook {
                if catch_unwind(AssertUnwindSafe(|| hook(rt, obj))).is_err() {
                    log::warn!("finalizer for {:#x} panicked", obj);
                }
            }

            let header = unsafe { get_header(obj) };
            header.set(STATE_FINALIZED);
            header.clear(STATE_FINALIZE_PENDING);
            let class = unsafe { class_of(obj) }
                .map(|c| c.name().to_string())
                .unwrap_or_default();
            rt.logger.log(RuntimeEvent::ObjectFinalized {
                address: obj,
                class,
            });
            RcStats::bump(&rt.rc_stats.finalizers_run);
            finalized += 1;

            self.in_flight.lock().swap_remove(&obj);
            rt.rc().dec_ref(obj);
        }
        finalized
    }
}

impl Default for FinalizerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_held_objects_snapshot() {
        let queue = FinalizerQueue::new();
        queue.enqueue(0x10);
        queue.enqueue(0x20);

        assert_eq!(queue.held_objects(), vec![0x10, 0x20]);
        assert_eq!(queue.pending_count(), 2);
    }
}
