//! Thread List - Attached mutators and the lock that guards them
//!
//! Threads attach and detach while collectors walk their roots, so every
//! walk of thread-local roots happens under the process-wide thread-list
//! lock. The lock records its owner:
//! - acquiring it again from the owning thread is a fatal re-entrancy error
//!   rather than a silent deadlock
//! - collectors that must not block use [`ThreadListLock::try_lock`]
//!
//! # Thread Safety
//!
//! The record table itself is behind an `RwLock` for memory safety; the
//! thread-list lock is the protocol-level guarantee that membership does
//! not change during a walk.

use crate::fatal::FatalError;
use crate::object::{ObjRef, NULL};
use crate::roots::{RootInfo, RootType, RootVisitor};
use crate::util::current_thread_id;
use indexmap::IndexMap;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Thread-list lock
// ============================================================================

/// Process-wide mutex with owner tracking
pub struct ThreadListLock {
    raw: RawMutex,
    owner: AtomicU64,
}

/// Held thread-list lock; released on drop
pub struct ThreadListGuard<'a> {
    lock: &'a ThreadListLock,
}

impl ThreadListLock {
    pub fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            owner: AtomicU64::new(0),
        }
    }

    /// Acquire the lock, blocking
    ///
    /// # Returns
    /// `ThreadListLockReentry` if the calling thread already holds it
    pub fn lock(&self) -> Result<ThreadListGuard<'_>, FatalError> {
        let me = current_thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            return Err(FatalError::ThreadListLockReentry { thread_id: me });
        }
        self.raw.lock();
        self.owner.store(me, Ordering::Release);
        Ok(ThreadListGuard { lock: self })
    }

    /// Acquire the lock without blocking
    ///
    /// # Returns
    /// `Ok(None)` if another thread holds it
    pub fn try_lock(&self) -> Result<Option<ThreadListGuard<'_>>, FatalError> {
        let me = current_thread_id();
        if self.owner.load(Ordering::Acquire) == me {
            return Err(FatalError::ThreadListLockReentry { thread_id: me });
        }
        if !self.raw.try_lock() {
            return Ok(None);
        }
        self.owner.store(me, Ordering::Release);
        Ok(Some(ThreadListGuard { lock: self }))
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Check whether the calling thread holds the lock
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_id()
    }

    /// Thread id of the holder, 0 if free
    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }
}

impl Default for ThreadListLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadListGuard<'_> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Release);
        // SAFETY: a guard only exists while its thread holds the raw lock.
        unsafe { self.lock.raw.unlock() };
    }
}

// ============================================================================
// Thread records
// ============================================================================

/// Where a mutator stands with respect to collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MutatorState {
    /// Executing managed code; may touch the heap
    Running = 0,
    /// Inside a safe region; promises not to touch the heap
    Saferegion = 1,
    /// Stopped at a yieldpoint for a pause
    Parked = 2,
    /// Detached from the runtime
    Detached = 3,
}

impl MutatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MutatorState::Running,
            1 => MutatorState::Saferegion,
            2 => MutatorState::Parked,
            _ => MutatorState::Detached,
        }
    }

    /// The collector may proceed past a thread in this state
    pub fn is_safe(self) -> bool {
        self != MutatorState::Running
    }
}

/// Per-thread runtime state and thread-local roots
///
/// Every object referenced from a record holds one strong count owned by
/// the record.
pub struct ThreadRecord {
    tid: u64,
    is_main: bool,
    state: AtomicU8,
    /// Native-interface local references
    locals: Mutex<Vec<ObjRef>>,
    /// Local-frame marks into `locals`
    frames: Mutex<Vec<usize>>,
    /// Frame, stack and monitor roots pushed by compiled code
    roots: Mutex<Vec<(RootType, ObjRef)>>,
    thread_object: AtomicUsize,
    pending_exception: AtomicUsize,
}

impl ThreadRecord {
    pub(crate) fn new(tid: u64, is_main: bool) -> Self {
        Self {
            tid,
            is_main,
            state: AtomicU8::new(MutatorState::Running as u8),
            locals: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            roots: Mutex::new(Vec::new()),
            thread_object: AtomicUsize::new(NULL),
            pending_exception: AtomicUsize::new(NULL),
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn state(&self) -> MutatorState {
        MutatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: MutatorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    // === Local references ===

    pub(crate) fn push_local(&self, obj: ObjRef) {
        self.locals.lock().push(obj);
    }

    /// Remove one local reference; returns whether it was present
    pub(crate) fn remove_local(&self, obj: ObjRef) -> bool {
        let mut locals = self.locals.lock();
        match locals.iter().rposition(|&o| o == obj) {
            Some(pos) => {
                locals.remove(pos);
                true
            },
            None => false,
        }
    }

    pub(crate) fn push_frame(&self) {
        let mark = self.locals.lock().len();
        self.frames.lock().push(mark);
    }

    /// Pop the innermost local frame, returning the references it held
    pub(crate) fn pop_frame(&self) -> Vec<ObjRef> {
        let mark = self.frames.lock().pop().unwrap_or(0);
        let mut locals = self.locals.lock();
        let mark = mark.min(locals.len());
        locals.split_off(mark)
    }

    pub fn local_count(&self) -> usize {
        self.locals.lock().len()
    }

    // === Typed roots ===

    pub(crate) fn push_root(&self, root_type: RootType, obj: ObjRef) {
        self.roots.lock().push((root_type, obj));
    }

    pub(crate) fn pop_root(&self) -> Option<(RootType, ObjRef)> {
        self.roots.lock().pop()
    }

    pub(crate) fn swap_thread_object(&self, obj: ObjRef) -> ObjRef {
        self.thread_object.swap(obj, Ordering::AcqRel)
    }

    pub(crate) fn swap_pending_exception(&self, obj: ObjRef) -> ObjRef {
        self.pending_exception.swap(obj, Ordering::AcqRel)
    }

    pub fn pending_exception(&self) -> ObjRef {
        self.pending_exception.load(Ordering::Acquire)
    }

    /// Take every reference the record owns, leaving it empty
    pub(crate) fn drain_all(&self) -> Vec<ObjRef> {
        let mut all: Vec<ObjRef> = std::mem::take(&mut *self.locals.lock());
        self.frames.lock().clear();
        all.extend(self.roots.lock().drain(..).map(|(_, obj)| obj));
        all.push(self.swap_thread_object(NULL));
        all.push(self.swap_pending_exception(NULL));
        all.retain(|&obj| obj != NULL);
        all
    }

    /// Visit every thread-local root
    pub fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        let local = RootInfo::new(RootType::JniLocal, self.tid);
        let locals: Vec<ObjRef> = self.locals.lock().clone();
        for obj in locals {
            visitor.visit_root(obj, &local);
        }

        let roots: Vec<(RootType, ObjRef)> = self.roots.lock().clone();
        for (root_type, obj) in roots {
            visitor.visit_root(obj, &RootInfo::new(root_type, self.tid));
        }

        let thread_object = self.thread_object.load(Ordering::Acquire);
        if thread_object != NULL {
            visitor.visit_root(thread_object, &RootInfo::new(RootType::ThreadObject, self.tid));
        }
        let exception = self.pending_exception();
        if exception != NULL {
            visitor.visit_root(exception, &RootInfo::new(RootType::ThreadBlock, self.tid));
        }
    }
}

// ============================================================================
// Thread list
// ============================================================================

/// Attached mutator threads
pub struct ThreadList {
    lock: ThreadListLock,
    threads: RwLock<IndexMap<u64, Arc<ThreadRecord>>>,
}

impl ThreadList {
    pub fn new() -> Self {
        Self {
            lock: ThreadListLock::new(),
            threads: RwLock::new(IndexMap::new()),
        }
    }

    pub fn lock(&self) -> &ThreadListLock {
        &self.lock
    }

    /// Add a record; the caller holds the thread-list lock
    pub(crate) fn insert(&self, _guard: &ThreadListGuard<'_>, record: Arc<ThreadRecord>) -> bool {
        let mut threads = self.threads.write();
        if threads.contains_key(&record.tid()) {
            return false;
        }
        threads.insert(record.tid(), record);
        true
    }

    /// Remove a record; the caller holds the thread-list lock
    pub(crate) fn remove(&self, _guard: &ThreadListGuard<'_>, tid: u64) -> Option<Arc<ThreadRecord>> {
        self.threads.write().shift_remove(&tid)
    }

    pub fn get(&self, tid: u64) -> Option<Arc<ThreadRecord>> {
        self.threads.read().get(&tid).cloned()
    }

    /// Record of the calling thread, if attached
    pub fn current(&self) -> Option<Arc<ThreadRecord>> {
        self.get(current_thread_id())
    }

    /// Records in attach order
    pub fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}
