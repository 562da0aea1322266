//! Root Enumeration - Entry points into the live-object graph
//!
//! Roots are starting points for marking. Each visited root is a transient
//! pair of an object and a [`RootInfo`] (kind plus owning thread); nothing
//! about a root is persisted by the walk.
//!
//! # Root Types
//!
//! 1. **Thread roots** - native-interface locals, interpreter frames, native
//!    stack slots, monitors, thread objects, pending exceptions
//! 2. **Global roots** - native-interface globals, static fields of loaded
//!    classes, sticky classes, interned strings, VM-internal objects
//! 3. **Runtime queues** - objects waiting for finalization and cleared
//!    references waiting to be polled
//! 4. **Weak globals** - visited separately; never keep an object alive
//!
//! # New-root logging
//!
//! Incremental marking asks for "roots created since the checkpoint". While
//! logging is on, every root registration is appended to the new-root log;
//! [`VisitRootFlags::NEW_ROOTS`] visits only the log. A logged entry is
//! visited only while a matching registration is still live; entries whose
//! root was deleted are dropped from the log at the next visit.
//!
//! # Thread Safety
//!
//! Registrations may race with walks. Weak globals live in individually
//! locked slots so [`RootRegistry::visit_weak_globals_concurrent`] can
//! re-check each slot after locking it.

pub mod thread_list;

pub use thread_list::{MutatorState, ThreadList, ThreadListGuard, ThreadListLock, ThreadRecord};

use crate::object::{ObjRef, NULL};
use crossbeam::queue::SegQueue;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Root kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RootType {
    JniGlobal,
    JniLocal,
    InterpreterFrame,
    NativeStack,
    StickyClass,
    ThreadBlock,
    Monitor,
    ThreadObject,
    InternedString,
    Finalizing,
    Debugger,
    ReferenceCleanup,
    VmInternal,
    JniMonitor,
    Unknown,
}

impl RootType {
    pub const ALL: [RootType; 15] = [
        RootType::JniGlobal,
        RootType::JniLocal,
        RootType::InterpreterFrame,
        RootType::NativeStack,
        RootType::StickyClass,
        RootType::ThreadBlock,
        RootType::Monitor,
        RootType::ThreadObject,
        RootType::InternedString,
        RootType::Finalizing,
        RootType::Debugger,
        RootType::ReferenceCleanup,
        RootType::VmInternal,
        RootType::JniMonitor,
        RootType::Unknown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RootType::JniGlobal => "JNI Global",
            RootType::JniLocal => "JNI Local",
            RootType::InterpreterFrame => "Interpreter Frame",
            RootType::NativeStack => "Native Stack",
            RootType::StickyClass => "Sticky Class",
            RootType::ThreadBlock => "Thread Block",
            RootType::Monitor => "Monitor",
            RootType::ThreadObject => "Thread Object",
            RootType::InternedString => "Interned String",
            RootType::Finalizing => "Finalizing",
            RootType::Debugger => "Debugger",
            RootType::ReferenceCleanup => "Reference Cleanup",
            RootType::VmInternal => "VM Internal",
            RootType::JniMonitor => "JNI Monitor",
            RootType::Unknown => "Unknown",
        }
    }

    /// Roots that belong to class loading
    pub fn is_class_loader_root(self) -> bool {
        matches!(self, RootType::StickyClass)
    }
}

impl fmt::Display for RootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind and owning thread of one visited root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootInfo {
    pub root_type: RootType,
    /// Owning thread, 0 for global roots
    pub thread_id: u64,
}

impl RootInfo {
    pub fn new(root_type: RootType, thread_id: u64) -> Self {
        Self {
            root_type,
            thread_id,
        }
    }

    pub fn global(root_type: RootType) -> Self {
        Self::new(root_type, 0)
    }
}

impl fmt::Display for RootInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Type={} thread_id={}", self.root_type, self.thread_id)
    }
}

/// Root visitation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisitRootFlags(pub u32);

impl VisitRootFlags {
    pub const NONE: Self = Self(0);
    /// Visit every root
    pub const ALL_ROOTS: Self = Self(0x1);
    /// Visit only roots logged since the last clear
    pub const NEW_ROOTS: Self = Self(0x2);
    /// Start logging new roots (after the visit)
    pub const START_LOGGING_NEW_ROOTS: Self = Self(0x4);
    /// Stop logging new roots (after the visit)
    pub const STOP_LOGGING_NEW_ROOTS: Self = Self(0x8);
    /// Empty the new-root log (after the visit)
    pub const CLEAR_ROOT_LOG: Self = Self(0x10);
    /// Restrict the walk to class-loader roots
    pub const CLASS_LOADER: Self = Self(0x20);
    /// Demand precise identification; every root here is precise
    pub const PRECISE: Self = Self(0x80);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the walk covers the full root set
    pub fn visits_all(self) -> bool {
        self.contains(Self::ALL_ROOTS) || !self.contains(Self::NEW_ROOTS)
    }
}

impl std::ops::BitOr for VisitRootFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-root callback
pub trait RootVisitor {
    fn visit_root(&mut self, obj: ObjRef, info: &RootInfo);
}

impl<F: FnMut(ObjRef, &RootInfo)> RootVisitor for F {
    fn visit_root(&mut self, obj: ObjRef, info: &RootInfo) {
        self(obj, info)
    }
}

/// Handle of a native-interface global reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalRef(pub u64);

/// Handle of a native-interface weak global reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakGlobalRef(pub u64);

/// Individually locked weak global slot
type WeakSlot = Arc<Mutex<ObjRef>>;

/// Live registrations keyed by object and root info, with multiplicity
#[derive(Debug, Default)]
pub struct RootCensus {
    live: HashMap<(ObjRef, RootInfo), usize>,
}

impl RootCensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, obj: ObjRef, info: RootInfo) {
        if obj != NULL {
            *self.live.entry((obj, info)).or_insert(0) += 1;
        }
    }

    /// Consume one matching registration
    ///
    /// # Returns
    /// `false` if every matching registration is already accounted for
    fn take(&mut self, obj: ObjRef, info: &RootInfo) -> bool {
        match self.live.get_mut(&(obj, *info)) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            },
            _ => false,
        }
    }
}

impl RootVisitor for RootCensus {
    fn visit_root(&mut self, obj: ObjRef, info: &RootInfo) {
        self.record(obj, *info);
    }
}

/// Global and VM-level roots
///
/// The registry only stores references. The runtime takes and drops the
/// counts that back them.
pub struct RootRegistry {
    next_handle: AtomicU64,
    globals: RwLock<IndexMap<u64, ObjRef>>,
    weak_globals: RwLock<IndexMap<u64, WeakSlot>>,
    /// Sticky classes, interned strings, debugger and VM-internal roots
    vm_roots: RwLock<Vec<(RootType, ObjRef)>>,
    /// Addresses of static reference slots
    static_slots: RwLock<Vec<usize>>,
    logging: AtomicBool,
    new_roots: SegQueue<(ObjRef, RootInfo)>,
    new_root_count: AtomicUsize,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            globals: RwLock::new(IndexMap::new()),
            weak_globals: RwLock::new(IndexMap::new()),
            vm_roots: RwLock::new(Vec::new()),
            static_slots: RwLock::new(Vec::new()),
            logging: AtomicBool::new(false),
            new_roots: SegQueue::new(),
            new_root_count: AtomicUsize::new(0),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // === New-root log ===

    pub fn is_logging_new_roots(&self) -> bool {
        self.logging.load(Ordering::Acquire)
    }

    /// Append a registration to the log if logging is on
    pub fn log_new_root(&self, obj: ObjRef, info: RootInfo) {
        if obj != NULL && self.is_logging_new_roots() {
            self.new_roots.push((obj, info));
            self.new_root_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn new_root_count(&self) -> usize {
        self.new_root_count.load(Ordering::Relaxed)
    }

    /// Visit logged roots whose registration is still live
    ///
    /// The log is drained before the live registrations are counted, so a
    /// root registered during the visit stays queued for the next one.
    /// Entries with no live registration left are dropped.
    fn visit_new_roots(
        &self,
        thread_roots: &mut dyn FnMut(&mut RootCensus),
        visitor: &mut dyn RootVisitor,
    ) {
        let logged: Vec<(ObjRef, RootInfo)> = std::iter::from_fn(|| self.new_roots.pop()).collect();

        let mut live = self.census();
        thread_roots(&mut live);

        let mut dropped = 0;
        for (obj, info) in logged {
            if live.take(obj, &info) {
                visitor.visit_root(obj, &info);
                self.new_roots.push((obj, info));
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            crate::util::AtomicUtils::saturating_sub(&self.new_root_count, dropped);
            log::trace!("dropped {} stale new-root log entries", dropped);
        }
    }

    /// Registry-owned roots that can appear in the log
    fn census(&self) -> RootCensus {
        let mut census = RootCensus::new();
        let info = RootInfo::global(RootType::JniGlobal);
        for &obj in self.globals.read().values() {
            census.record(obj, info);
        }
        for &(root_type, obj) in self.vm_roots.read().iter() {
            census.record(obj, RootInfo::global(root_type));
        }
        census
    }

    fn clear_root_log(&self) {
        while self.new_roots.pop().is_some() {}
        self.new_root_count.store(0, Ordering::Relaxed);
    }

    /// Apply the logging side effects of `flags`
    pub fn apply_log_flags(&self, flags: VisitRootFlags) {
        if flags.contains(VisitRootFlags::CLEAR_ROOT_LOG) {
            self.clear_root_log();
        }
        if flags.contains(VisitRootFlags::START_LOGGING_NEW_ROOTS) {
            self.logging.store(true, Ordering::Release);
        }
        if flags.contains(VisitRootFlags::STOP_LOGGING_NEW_ROOTS) {
            self.logging.store(false, Ordering::Release);
        }
    }

    // === Globals ===

    pub fn add_global(&self, obj: ObjRef) -> GlobalRef {
        let handle = self.next_handle();
        self.globals.write().insert(handle, obj);
        self.log_new_root(obj, RootInfo::global(RootType::JniGlobal));
        GlobalRef(handle)
    }

    pub fn remove_global(&self, handle: GlobalRef) -> Option<ObjRef> {
        self.globals.write().shift_remove(&handle.0)
    }

    pub fn global(&self, handle: GlobalRef) -> Option<ObjRef> {
        self.globals.read().get(&handle.0).copied()
    }

    pub fn global_count(&self) -> usize {
        self.globals.read().len()
    }

    // === Weak globals ===

    pub fn add_weak_global(&self, obj: ObjRef) -> WeakGlobalRef {
        let handle = self.next_handle();
        self.weak_globals
            .write()
            .insert(handle, Arc::new(Mutex::new(obj)));
        WeakGlobalRef(handle)
    }

    pub fn remove_weak_global(&self, handle: WeakGlobalRef) -> Option<ObjRef> {
        let slot = self.weak_globals.write().shift_remove(&handle.0)?;
        let obj = std::mem::replace(&mut *slot.lock(), NULL);
        Some(obj)
    }

    /// Slot of a weak global, for decoding or clearing
    pub(crate) fn weak_global_slot(&self, handle: WeakGlobalRef) -> Option<WeakSlot> {
        self.weak_globals.read().get(&handle.0).cloned()
    }

    pub fn weak_global_count(&self) -> usize {
        self.weak_globals.read().len()
    }

    /// Visit weak globals under the table write lock
    ///
    /// `visitor` returns `false` to clear the slot; the cleared referent is
    /// handed to `on_clear`.
    pub fn visit_weak_globals(
        &self,
        mut visitor: impl FnMut(ObjRef) -> bool,
        mut on_clear: impl FnMut(ObjRef),
    ) {
        let table = self.weak_globals.write();
        for slot in table.values() {
            let mut obj = slot.lock();
            if *obj != NULL && !visitor(*obj) {
                on_clear(std::mem::replace(&mut *obj, NULL));
            }
        }
    }

    /// Visit weak globals while mutators may clear them
    ///
    /// The table is snapshotted, then each slot is locked and re-read: a
    /// slot cleared after the snapshot is skipped, never visited stale.
    pub fn visit_weak_globals_concurrent(
        &self,
        mut visitor: impl FnMut(ObjRef) -> bool,
        mut on_clear: impl FnMut(ObjRef),
    ) {
        let slots: Vec<WeakSlot> = self.weak_globals.read().values().cloned().collect();
        for slot in slots {
            let mut obj = slot.lock();
            if *obj == NULL {
                continue;
            }
            if !visitor(*obj) {
                on_clear(std::mem::replace(&mut *obj, NULL));
            }
        }
    }

    // === VM roots ===

    pub fn add_vm_root(&self, root_type: RootType, obj: ObjRef) {
        self.vm_roots.write().push((root_type, obj));
        self.log_new_root(obj, RootInfo::global(root_type));
    }

    /// Remove one registration of `obj` under `root_type`
    pub fn remove_vm_root(&self, root_type: RootType, obj: ObjRef) -> bool {
        let mut roots = self.vm_roots.write();
        match roots.iter().rposition(|&(t, o)| t == root_type && o == obj) {
            Some(pos) => {
                roots.remove(pos);
                true
            },
            None => false,
        }
    }

    /// Take every VM root, leaving the table empty
    pub(crate) fn drain_vm_roots(&self) -> Vec<(RootType, ObjRef)> {
        std::mem::take(&mut *self.vm_roots.write())
    }

    pub fn vm_root_count(&self, root_type: RootType) -> usize {
        self.vm_roots
            .read()
            .iter()
            .filter(|(t, _)| *t == root_type)
            .count()
    }

    // === Static slots ===

    /// Register static reference slots as roots
    pub fn add_static_slots(&self, slots: &[usize]) {
        self.static_slots.write().extend_from_slice(slots);
    }

    pub fn static_slot_count(&self) -> usize {
        self.static_slots.read().len()
    }

    fn visit_static_slots(&self, visitor: &mut dyn RootVisitor) {
        let info = RootInfo::global(RootType::StickyClass);
        let slots: Vec<usize> = self.static_slots.read().clone();
        for addr in slots {
            // SAFETY: registered slots belong to loaded classes, which are
            // never unloaded.
            let obj = unsafe { crate::object::ref_slot(addr, 0) }.load(Ordering::Acquire);
            if obj != NULL {
                visitor.visit_root(obj, &info);
            }
        }
    }

    /// Visit global roots selected by `flags`
    ///
    /// Log side effects are not applied here; see [`Self::apply_log_flags`].
    /// Logged thread roots are not visible to the registry alone; use
    /// [`Self::visit_with_thread_roots`] to include them.
    pub fn visit(&self, flags: VisitRootFlags, visitor: &mut dyn RootVisitor) {
        self.visit_with_thread_roots(flags, &mut |_: &mut RootCensus| {}, visitor);
    }

    /// Visit global roots; `thread_roots` adds the live thread-owned roots
    /// that logged entries are checked against
    pub fn visit_with_thread_roots(
        &self,
        flags: VisitRootFlags,
        thread_roots: &mut dyn FnMut(&mut RootCensus),
        visitor: &mut dyn RootVisitor,
    ) {
        if !flags.visits_all() {
            self.visit_new_roots(thread_roots, visitor);
            return;
        }

        self.visit_static_slots(visitor);
        let vm_roots: Vec<(RootType, ObjRef)> = self.vm_roots.read().clone();
        for (root_type, obj) in vm_roots {
            if !flags.contains(VisitRootFlags::CLASS_LOADER) || root_type.is_class_loader_root() {
                visitor.visit_root(obj, &RootInfo::global(root_type));
            }
        }
        if flags.contains(VisitRootFlags::CLASS_LOADER) {
            return;
        }

        let info = RootInfo::global(RootType::JniGlobal);
        let globals: Vec<ObjRef> = self.globals.read().values().copied().collect();
        for obj in globals {
            visitor.visit_root(obj, &info);
        }
    }
}

impl Default for RootRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(registry: &RootRegistry, flags: VisitRootFlags) -> Vec<(ObjRef, RootType)> {
        let mut seen = Vec::new();
        registry.visit(flags, &mut |obj: ObjRef, info: &RootInfo| {
            seen.push((obj, info.root_type))
        });
        seen
    }

    #[test]
    fn test_flags() {
        let flags = VisitRootFlags::NEW_ROOTS | VisitRootFlags::CLEAR_ROOT_LOG;
        assert!(flags.contains(VisitRootFlags::NEW_ROOTS));
        assert!(!flags.visits_all());
        assert!(VisitRootFlags::NONE.visits_all());
        assert!((VisitRootFlags::ALL_ROOTS | VisitRootFlags::NEW_ROOTS).visits_all());
        assert_eq!(VisitRootFlags::PRECISE.0, 0x80);
    }

    #[test]
    fn test_root_info_display() {
        let info = RootInfo::new(RootType::JniLocal, 3);
        assert_eq!(info.to_string(), "Type=JNI Local thread_id=3");
        assert_eq!(RootType::ALL.len(), 15);
    }

    #[test]
    fn test_globals_visited() {
        let registry = RootRegistry::new();
        let handle = registry.add_global(0x100);
        registry.add_vm_root(RootType::InternedString, 0x200);

        let seen = collect(&registry, VisitRootFlags::ALL_ROOTS);
        assert_eq!(
            seen,
            vec![(0x200, RootType::InternedString), (0x100, RootType::JniGlobal)]
        );

        assert_eq!(registry.remove_global(handle), Some(0x100));
        assert_eq!(registry.global_count(), 0);
    }

    #[test]
    fn test_class_loader_flag() {
        let registry = RootRegistry::new();
        registry.add_global(0x100);
        registry.add_vm_root(RootType::StickyClass, 0x300);
        registry.add_vm_root(RootType::VmInternal, 0x400);

        let seen = collect(&registry, VisitRootFlags::ALL_ROOTS | VisitRootFlags::CLASS_LOADER);
        assert_eq!(seen, vec![(0x300, RootType::StickyClass)]);
    }

    #[test]
    fn test_new_root_log() {
        let registry = RootRegistry::new();
        registry.add_global(0x100);

        registry.apply_log_flags(
            VisitRootFlags::CLEAR_ROOT_LOG | VisitRootFlags::START_LOGGING_NEW_ROOTS,
        );
        assert!(collect(&registry, VisitRootFlags::NEW_ROOTS).is_empty());

        registry.add_global(0x200);
        registry.add_vm_root(RootType::InternedString, 0x300);
        let seen = collect(&registry, VisitRootFlags::NEW_ROOTS);
        assert_eq!(
            seen,
            vec![(0x200, RootType::JniGlobal), (0x300, RootType::InternedString)]
        );
        assert_eq!(collect(&registry, VisitRootFlags::NEW_ROOTS).len(), 2, "visit keeps the log");

        registry.apply_log_flags(VisitRootFlags::STOP_LOGGING_NEW_ROOTS);
        registry.add_global(0x400);
        assert_eq!(registry.new_root_count(), 2);
    }

    #[test]
    fn test_weak_global_clear() {
        let registry = RootRegistry::new();
        let a = registry.add_weak_global(0x100);
        registry.add_weak_global(0x200);

        let mut cleared = Vec::new();
        registry.visit_weak_globals(|obj| obj != 0x200, |obj| cleared.push(obj));
        assert_eq!(cleared, vec![0x200]);

        let mut visited = Vec::new();
        registry.visit_weak_globals_concurrent(
            |obj| {
                visited.push(obj);
                true
            },
            |_| {},
        );
        assert_eq!(visited, vec![0x100], "cleared slot is skipped");

        assert_eq!(registry.remove_weak_global(a), Some(0x100));
        assert_eq!(registry.weak_global_count(), 1);
    }

    #[test]
    fn test_concurrent_weak_visit_tolerates_clearing() {
        let registry = RootRegistry::new();
        let handles: Vec<WeakGlobalRef> =
            (1..=1000).map(|i| registry.add_weak_global(i * 8)).collect();

        std::thread::scope(|s| {
            s.spawn(|| {
                for handle in &handles {
                    if let Some(slot) = registry.weak_global_slot(*handle) {
                        *slot.lock() = NULL;
                    }
                }
            });
            for _ in 0..10 {
                registry.visit_weak_globals_concurrent(
                    |obj| {
                        assert_ne!(obj, NULL, "cleared slots are never visited");
                        true
                    },
                    |_| {},
                );
            }
        });
    }

    #[test]
    fn test_static_slots() {
        let registry = RootRegistry::new();
        let slots = [AtomicUsize::new(0x500), AtomicUsize::new(NULL)];
        registry.add_static_slots(&[slots[0].as_ptr() as usize, slots[1].as_ptr() as usize]);
        assert_eq!(registry.static_slot_count(), 2);

        let seen = collect(&registry, VisitRootFlags::ALL_ROOTS);
        assert_eq!(seen, vec![(0x500, RootType::StickyClass)], "null slots are skipped");
    }
}
