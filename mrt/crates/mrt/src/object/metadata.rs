//! Class Metadata - Class, field and method descriptors
//!
//! Each class is described by two records:
//! - `ClassMetadata`: the per-class mutable record. After loading only the
//!   monitor and the init-state/static-fields word change.
//! - `ClassMetadataRO`: the read-only record (name, fields, methods, family
//!   class, flags), immutable once built.
//!
//! Field and method descriptors refer back to their declaring class through
//! [`SelfRelativeRef`], a signed delta from the descriptor's own address, so
//! the metadata stays valid wherever the containing block ends up.

use crate::object::gctib::{GcTib, ARRAY_OF_OBJECT, ARRAY_OF_PRIMITIVE, EMPTY_OBJECT};
use crate::object::header::{ARRAY_DATA_OFFSET, HEADER_SIZE};
use crate::util::{current_thread_id, Alignment};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Self-relative references
// ============================================================================

/// Position-independent reference: a byte delta from the reference's own
/// address to its target
///
/// A zero delta encodes null; a reference never points at itself.
#[repr(C)]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SelfRelativeRef {
    delta: isize,
}

impl SelfRelativeRef {
    /// Null reference
    pub const NULL: Self = Self { delta: 0 };

    /// Build from a raw delta
    pub const fn from_delta(delta: isize) -> Self {
        Self { delta }
    }

    /// Encode `target` as seen from a reference stored at `base`
    pub fn encode(base: usize, target: usize) -> Self {
        Self {
            delta: target.wrapping_sub(base) as isize,
        }
    }

    /// Raw delta
    pub fn delta(&self) -> isize {
        self.delta
    }

    /// Check for the null encoding
    pub fn is_null(&self) -> bool {
        self.delta == 0
    }

    /// Resolve against an explicit base address
    pub fn resolve_from(&self, base: usize) -> Option<usize> {
        if self.is_null() {
            None
        } else {
            Some(base.wrapping_add_signed(self.delta))
        }
    }

    /// Resolve against this reference's own address
    pub fn resolve(&self) -> Option<usize> {
        self.resolve_from(self as *const Self as usize)
    }

    /// Point this reference at `target` from where it currently lives
    pub fn set(&mut self, target: usize) {
        *self = Self::encode(self as *const Self as usize, target);
    }
}

// ============================================================================
// Field descriptors
// ============================================================================

/// Java-visible field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    /// Counted object reference
    Ref,
    /// Weak reference, does not keep the target alive
    WeakRef,
    /// Referent slot of a reference object
    Referent,
}

impl FieldKind {
    /// Storage size in bytes
    pub fn size(self) -> usize {
        match self {
            FieldKind::Boolean | FieldKind::Byte => 1,
            FieldKind::Short | FieldKind::Char => 2,
            FieldKind::Int | FieldKind::Float => 4,
            FieldKind::Long
            | FieldKind::Double
            | FieldKind::Ref
            | FieldKind::WeakRef
            | FieldKind::Referent => 8,
        }
    }

    /// Check whether the field holds an object reference of any strength
    pub fn is_reference(self) -> bool {
        matches!(self, FieldKind::Ref | FieldKind::WeakRef | FieldKind::Referent)
    }

    /// Array type descriptor character
    pub fn descriptor(self) -> char {
        match self {
            FieldKind::Boolean => 'Z',
            FieldKind::Byte => 'B',
            FieldKind::Short => 'S',
            FieldKind::Char => 'C',
            FieldKind::Int => 'I',
            FieldKind::Long => 'J',
            FieldKind::Float => 'F',
            FieldKind::Double => 'D',
            FieldKind::Ref | FieldKind::WeakRef | FieldKind::Referent => 'L',
        }
    }
}

/// Field modifier bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags(pub u32);

impl FieldFlags {
    pub const STATIC: Self = Self(1 << 0);
    pub const VOLATILE: Self = Self(1 << 1);
    pub const FINAL: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FieldFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Where a field lives
#[derive(Debug)]
pub enum FieldLocation {
    /// Instance field: byte offset from the object start
    Offset(u32),
    /// Static field: self-relative address of its storage word
    Address(SelfRelativeRef),
}

/// Read-only field descriptor
#[derive(Debug)]
pub struct FieldMetadataRO {
    pub name: Box<str>,
    pub kind: FieldKind,
    pub flags: FieldFlags,
    location: FieldLocation,
    declaring_class: SelfRelativeRef,
    pub annotation: Box<str>,
}

impl FieldMetadataRO {
    /// Byte offset of an instance field
    pub fn offset(&self) -> Option<usize> {
        match &self.location {
            FieldLocation::Offset(off) => Some(*off as usize),
            FieldLocation::Address(_) => None,
        }
    }

    /// Absolute storage address of a static field
    pub fn address(&self) -> Option<usize> {
        match &self.location {
            FieldLocation::Offset(_) => None,
            FieldLocation::Address(addr) => addr.resolve(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    pub fn is_volatile(&self) -> bool {
        self.flags.contains(FieldFlags::VOLATILE)
    }

    /// Class that declares this field
    pub fn declaring_class(&self) -> Option<&ClassMetadata> {
        // Descriptors are owned by their class, so the class outlives `self`.
        self.declaring_class
            .resolve()
            .map(|addr| unsafe { &*(addr as *const ClassMetadata) })
    }
}

// ============================================================================
// Method descriptors and dispatch tables
// ============================================================================

/// Read-only method descriptor
#[derive(Debug)]
pub struct MethodMetadataRO {
    pub name: Box<str>,
    pub signature: Box<str>,
    /// Entry point of the compiled code
    pub addr: usize,
    declaring_class: SelfRelativeRef,
    pub flags: u32,
    pub arg_size: u16,
    /// Slot in the virtual table, if the method is virtual
    pub vtab_index: Option<u32>,
    pub annotation: Box<str>,
}

impl MethodMetadataRO {
    /// Class that declares this method
    pub fn declaring_class(&self) -> Option<&ClassMetadata> {
        self.declaring_class
            .resolve()
            .map(|addr| unsafe { &*(addr as *const ClassMetadata) })
    }

    fn matches(&self, name: &str, signature: &str) -> bool {
        &*self.name == name && &*self.signature == signature
    }
}

/// Immutable dispatch table keyed by a stable method index
#[derive(Debug, Default, Clone)]
pub struct DispatchTable {
    slots: Box<[Option<Arc<MethodMetadataRO>>]>,
}

impl DispatchTable {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Method bound to `index`
    pub fn get(&self, index: u32) -> Option<&MethodMetadataRO> {
        self.slots.get(index as usize)?.as_deref()
    }

    /// Entry point bound to `index`
    pub fn entry(&self, index: u32) -> Option<usize> {
        self.get(index).map(|m| m.addr)
    }
}

/// Interface dispatch: one table per implemented interface
#[derive(Debug, Default)]
pub struct InterfaceTable {
    tables: Box<[(u16, DispatchTable)]>,
}

impl InterfaceTable {
    /// Implementation of the `index`-th method of `interface`
    pub fn get(&self, interface: &ClassMetadata, index: u32) -> Option<&MethodMetadataRO> {
        self.tables
            .iter()
            .find(|(cl, _)| *cl == interface.clindex())
            .and_then(|(_, table)| table.get(index))
    }

    pub fn interface_count(&self) -> usize {
        self.tables.len()
    }
}

// ============================================================================
// Class records
// ============================================================================

/// Structural kind, resolved once at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Object,
    Interface,
    ObjectArray,
    PrimitiveArray,
}

/// Object size or array component size, keyed by class kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeInfo {
    Object { objsize: usize },
    Array { component_size: usize },
}

/// Superclass or component class, keyed by class kind
#[derive(Debug, Clone)]
pub enum FamilyClass {
    Super(Option<Arc<ClassMetadata>>),
    Component(Arc<ClassMetadata>),
    PrimitiveComponent(FieldKind),
}

/// Reference-object family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Phantom,
}

/// Class flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassFlags(pub u32);

impl ClassFlags {
    /// Instances need a finalizer run before reclamation
    pub const FINALIZABLE: Self = Self(1 << 0);
    pub const ABSTRACT: Self = Self(1 << 1);
    /// Instances can never take part in a reference cycle
    pub const NO_CYCLE: Self = Self(1 << 2);
    /// Instances are never reclaimed
    pub const PERMANENT: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ClassFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Observable class initialization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassInitState {
    Uninitialized,
    Initializing,
    Initialized { static_fields: usize },
    Erroneous,
}

const INIT_UNINITIALIZED: usize = 0;
const INIT_INITIALIZING: usize = 1;
const INIT_ERRONEOUS: usize = 2;

/// The init-state/static-fields word
///
/// Small sentinel values encode the state; any aligned address means the
/// class is initialized and points at its static storage.
#[derive(Debug)]
struct ClassInitCell {
    word: AtomicUsize,
    owner: AtomicU64,
    /// Serializes waiters against the publishing store
    lock: Mutex<()>,
    published: Condvar,
}

impl ClassInitCell {
    fn new() -> Self {
        Self {
            word: AtomicUsize::new(INIT_UNINITIALIZED),
            owner: AtomicU64::new(0),
            lock: Mutex::new(()),
            published: Condvar::new(),
        }
    }

    /// Publish the final word and wake every waiter
    fn publish(&self, word: usize) {
        self.owner.store(0, Ordering::Relaxed);
        self.word.store(word, Ordering::Release);
        let _lock = self.lock.lock();
        self.published.notify_all();
    }

    /// Block until the initializing thread publishes
    ///
    /// The initializing thread itself never blocks here.
    fn wait_published(&self, me: u64) -> ClassInitState {
        let mut lock = self.lock.lock();
        loop {
            match self.state() {
                ClassInitState::Initializing if self.owner.load(Ordering::Relaxed) != me => {
                    self.published.wait(&mut lock)
                },
                state => return state,
            }
        }
    }

    fn state(&self) -> ClassInitState {
        match self.word.load(Ordering::Acquire) {
            INIT_UNINITIALIZED => ClassInitState::Uninitialized,
            INIT_INITIALIZING => ClassInitState::Initializing,
            INIT_ERRONEOUS => ClassInitState::Erroneous,
            addr => ClassInitState::Initialized {
                static_fields: addr,
            },
        }
    }
}

/// Read-only class record
#[derive(Debug)]
pub struct ClassMetadataRO {
    pub name: Box<str>,
    fields: Box<[FieldMetadataRO]>,
    methods: Box<[Arc<MethodMetadataRO>]>,
    family: FamilyClass,
    interfaces: Box<[Arc<ClassMetadata>]>,
    pub flags: ClassFlags,
    pub modifiers: u32,
    pub annotation: Box<str>,
    reference_kind: Option<ReferenceKind>,
}

impl ClassMetadataRO {
    pub fn fields(&self) -> &[FieldMetadataRO] {
        &self.fields
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodMetadataRO> {
        self.methods.iter().map(|m| &**m)
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }

    /// Superclass plus implemented interfaces
    pub fn num_super_classes(&self) -> usize {
        let has_super = matches!(self.family, FamilyClass::Super(Some(_)));
        self.interfaces.len() + has_super as usize
    }

    pub fn family(&self) -> &FamilyClass {
        &self.family
    }
}

/// Per-class mutable record
pub struct ClassMetadata {
    /// Class-level lock word
    pub monitor: AtomicU32,
    clindex: u16,
    kind: ClassKind,
    size_info: SizeInfo,
    itab: InterfaceTable,
    vtab: DispatchTable,
    gctib: Arc<GcTib>,
    ro: ClassMetadataRO,
    init: ClassInitCell,
    statics: Box<[AtomicU64]>,
}

impl fmt::Debug for ClassMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassMetadata")
            .field("name", &self.ro.name)
            .field("clindex", &self.clindex)
            .field("kind", &self.kind)
            .field("size_info", &self.size_info)
            .finish()
    }
}

impl ClassMetadata {
    /// Address used as the `shadow` of instances
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    pub fn name(&self) -> &str {
        &self.ro.name
    }

    pub fn clindex(&self) -> u16 {
        self.clindex
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::ObjectArray | ClassKind::PrimitiveArray)
    }

    pub fn size_info(&self) -> SizeInfo {
        self.size_info
    }

    pub fn ro(&self) -> &ClassMetadataRO {
        &self.ro
    }

    pub fn gctib(&self) -> &GcTib {
        &self.gctib
    }

    pub fn vtab(&self) -> &DispatchTable {
        &self.vtab
    }

    pub fn itab(&self) -> &InterfaceTable {
        &self.itab
    }

    pub fn flags(&self) -> ClassFlags {
        self.ro.flags
    }

    pub fn is_finalizable(&self) -> bool {
        self.ro.flags.contains(ClassFlags::FINALIZABLE)
    }

    pub fn reference_kind(&self) -> Option<ReferenceKind> {
        self.ro.reference_kind
    }

    /// Check whether instances can take part in reference cycles
    pub fn may_form_cycles(&self) -> bool {
        !self.ro.flags.contains(ClassFlags::NO_CYCLE) && self.gctib.has_refs()
    }

    pub fn superclass(&self) -> Option<&Arc<ClassMetadata>> {
        match &self.ro.family {
            FamilyClass::Super(sup) => sup.as_ref(),
            _ => None,
        }
    }

    pub fn component_class(&self) -> Option<&Arc<ClassMetadata>> {
        match &self.ro.family {
            FamilyClass::Component(c) => Some(c),
            _ => None,
        }
    }

    /// Fixed instance size for non-array classes
    pub fn object_size(&self) -> Option<usize> {
        match self.size_info {
            SizeInfo::Object { objsize } => Some(objsize),
            SizeInfo::Array { .. } => None,
        }
    }

    /// Allocation size of an `n`-element array, None on overflow
    pub fn array_size(&self, n: usize) -> Option<usize> {
        match self.size_info {
            SizeInfo::Array { component_size } => component_size
                .checked_mul(n)?
                .checked_add(ARRAY_DATA_OFFSET)
                .and_then(|sz| Alignment::checked_align_up(sz, Alignment::DEFAULT)),
            SizeInfo::Object { .. } => None,
        }
    }

    /// Find a field declared here or in a superclass
    pub fn field(&self, name: &str) -> Option<&FieldMetadataRO> {
        self.ro
            .fields
            .iter()
            .find(|f| &*f.name == name)
            .or_else(|| self.superclass().and_then(|s| s.field(name)))
    }

    /// Byte offset of an instance field
    pub fn field_offset(&self, name: &str) -> Option<usize> {
        self.field(name).and_then(FieldMetadataRO::offset)
    }

    /// Find a method declared here or in a superclass
    pub fn method(&self, name: &str, signature: &str) -> Option<&MethodMetadataRO> {
        self.ro
            .methods()
            .find(|m| m.matches(name, signature))
            .or_else(|| self.superclass().and_then(|s| s.method(name, signature)))
    }

    /// Virtual dispatch by stable vtable index
    pub fn virtual_method(&self, index: u32) -> Option<&MethodMetadataRO> {
        self.vtab.get(index)
    }

    /// Interface dispatch by interface and stable method index
    pub fn interface_method(&self, interface: &ClassMetadata, index: u32) -> Option<&MethodMetadataRO> {
        self.itab.get(interface, index)
    }

    /// Check whether instances of `other` are instances of `self`
    pub fn is_assignable_from(&self, other: &ClassMetadata) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if other
            .ro
            .interfaces
            .iter()
            .any(|i| self.is_assignable_from(i))
        {
            return true;
        }
        other
            .superclass()
            .is_some_and(|sup| self.is_assignable_from(sup))
    }

    /// Static field storage words
    pub fn statics(&self) -> &[AtomicU64] {
        &self.statics
    }

    /// Addresses of static reference slots
    pub fn static_ref_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.ro
            .fields
            .iter()
            .filter(|f| f.is_static() && f.kind == FieldKind::Ref)
            .filter_map(FieldMetadataRO::address)
    }

    // === Initialization ===

    /// Current initialization state (acquire)
    pub fn init_state(&self) -> ClassInitState {
        self.init.state()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.init_state(), ClassInitState::Initialized { .. })
    }

    /// Run `init` exactly once across all threads
    ///
    /// Threads that lose the race block until the winner publishes its
    /// result. A recursive request from the initializing thread returns
    /// `Initializing` immediately. If `init` panics the class becomes
    /// `Erroneous` and the waiters are released before the panic
    /// propagates.
    pub fn initialize_with(&self, init: impl FnOnce(&ClassMetadata) -> bool) -> ClassInitState {
        let me = current_thread_id();
        match self.init.word.compare_exchange(
            INIT_UNINITIALIZED,
            INIT_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.init.owner.store(me, Ordering::Relaxed);
                let mut publish = InitPublish {
                    cell: &self.init,
                    word: INIT_ERRONEOUS,
                };
                if init(self) {
                    publish.word = self.statics.as_ptr() as usize;
                }
                drop(publish);
                self.init.state()
            },
            Err(_) => self.init.wait_published(me),
        }
    }
}

/// Publishes the init word when dropped, unwinding included
struct InitPublish<'a> {
    cell: &'a ClassInitCell,
    word: usize,
}

impl Drop for InitPublish<'_> {
    fn drop(&mut self) {
        self.cell.publish(self.word);
    }
}

// ============================================================================
// Builder
// ============================================================================

struct FieldSpec {
    name: String,
    kind: FieldKind,
    flags: FieldFlags,
}

struct MethodSpec {
    name: String,
    signature: String,
    addr: usize,
    flags: u32,
    arg_size: u16,
    is_virtual: bool,
}

/// Assembles class metadata the way the class loader would
///
/// # Examples
///
/// ```rust
/// use mrt::object::{ClassBuilder, FieldKind};
///
/// let node = ClassBuilder::new("Node")
///     .field("next", FieldKind::Ref)
///     .field("value", FieldKind::Int)
///     .build(1);
/// assert_eq!(node.field_offset("next"), Some(32));
/// assert!(node.gctib().is_reference(32));
/// ```
pub struct ClassBuilder {
    name: String,
    kind: ClassKind,
    family: FamilyClass,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
    interfaces: Vec<Arc<ClassMetadata>>,
    flags: ClassFlags,
    modifiers: u32,
    annotation: String,
    reference_kind: Option<ReferenceKind>,
}

impl ClassBuilder {
    /// Plain object class
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ClassKind::Object,
            family: FamilyClass::Super(None),
            fields: Vec::new(),
            methods: Vec::new(),
            interfaces: Vec::new(),
            flags: ClassFlags::default(),
            modifiers: 0,
            annotation: String::new(),
            reference_kind: None,
        }
    }

    /// Interface class
    pub fn interface(name: impl Into<String>) -> Self {
        Self {
            kind: ClassKind::Interface,
            flags: ClassFlags::ABSTRACT,
            ..Self::new(name)
        }
    }

    /// Array of references to `component`
    pub fn object_array(component: &Arc<ClassMetadata>) -> Self {
        Self {
            kind: ClassKind::ObjectArray,
            family: FamilyClass::Component(Arc::clone(component)),
            ..Self::new(format!("[L{};", component.name()))
        }
    }

    /// Array of primitive `elem`
    pub fn primitive_array(elem: FieldKind) -> Self {
        Self {
            kind: ClassKind::PrimitiveArray,
            family: FamilyClass::PrimitiveComponent(elem),
            flags: ClassFlags::NO_CYCLE,
            ..Self::new(format!("[{}", elem.descriptor()))
        }
    }

    pub fn superclass(mut self, sup: &Arc<ClassMetadata>) -> Self {
        if self.reference_kind.is_none() {
            self.reference_kind = sup.reference_kind();
        }
        if sup.is_finalizable() {
            self.flags = self.flags | ClassFlags::FINALIZABLE;
        }
        self.family = FamilyClass::Super(Some(Arc::clone(sup)));
        self
    }

    pub fn implements(mut self, interface: &Arc<ClassMetadata>) -> Self {
        self.interfaces.push(Arc::clone(interface));
        self
    }

    /// Instance field laid out after previous fields
    pub fn field(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.field_with_flags(name, kind, FieldFlags::default())
    }

    pub fn volatile_field(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.field_with_flags(name, kind, FieldFlags::VOLATILE)
    }

    /// Static field stored in the class's static block
    pub fn static_field(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.field_with_flags(name, kind, FieldFlags::STATIC)
    }

    pub fn field_with_flags(mut self, name: impl Into<String>, kind: FieldKind, flags: FieldFlags) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            flags,
        });
        self
    }

    /// Non-virtual method
    pub fn method(mut self, name: impl Into<String>, signature: impl Into<String>, addr: usize) -> Self {
        self.methods.push(MethodSpec {
            name: name.into(),
            signature: signature.into(),
            addr,
            flags: 0,
            arg_size: 0,
            is_virtual: false,
        });
        self
    }

    /// Virtual method; overrides a superclass slot with the same signature
    pub fn virtual_method(
        mut self,
        name: impl Into<String>,
        signature: impl Into<String>,
        addr: usize,
    ) -> Self {
        self.methods.push(MethodSpec {
            name: name.into(),
            signature: signature.into(),
            addr,
            flags: 0,
            arg_size: 0,
            is_virtual: true,
        });
        self
    }

    /// Reference-object class; the referent is the first instance field
    pub fn reference(mut self, kind: ReferenceKind) -> Self {
        self.reference_kind = Some(kind);
        if !matches!(self.family, FamilyClass::Super(Some(_))) {
            self.fields.insert(
                0,
                FieldSpec {
                    name: "referent".to_string(),
                    kind: FieldKind::Referent,
                    flags: FieldFlags::VOLATILE,
                },
            );
        }
        self
    }

    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn finalizable(self) -> Self {
        self.flags(ClassFlags::FINALIZABLE)
    }

    pub fn modifiers(mut self, modifiers: u32) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = annotation.into();
        self
    }

    /// Lay out fields, build dispatch tables and link descriptors
    pub fn build(self, clindex: u16) -> Arc<ClassMetadata> {
        Arc::new_cyclic(|weak| {
            let class_addr = weak.as_ptr() as usize;
            self.assemble(clindex, class_addr)
        })
    }

    fn assemble(self, clindex: u16, class_addr: usize) -> ClassMetadata {
        let sup = match &self.family {
            FamilyClass::Super(sup) => sup.clone(),
            _ => None,
        };

        // Instance layout continues after the superclass.
        let (mut strong, mut weak) = match &sup {
            Some(s) => s.gctib().offsets(),
            None => (Vec::new(), Vec::new()),
        };
        let mut cursor = sup
            .as_ref()
            .and_then(|s| s.object_size())
            .unwrap_or(HEADER_SIZE);

        let static_count = self
            .fields
            .iter()
            .filter(|f| f.flags.contains(FieldFlags::STATIC))
            .count();
        let statics: Box<[AtomicU64]> = (0..static_count).map(|_| AtomicU64::new(0)).collect();

        let mut static_idx = 0;
        let mut fields: Box<[FieldMetadataRO]> = self
            .fields
            .iter()
            .map(|spec| {
                let location = if spec.flags.contains(FieldFlags::STATIC) {
                    static_idx += 1;
                    FieldLocation::Address(SelfRelativeRef::NULL)
                } else {
                    let size = spec.kind.size();
                    let offset = Alignment::align_up(cursor, size);
                    cursor = offset + size;
                    match spec.kind {
                        FieldKind::Ref => strong.push(offset),
                        FieldKind::WeakRef | FieldKind::Referent => weak.push(offset),
                        _ => {},
                    }
                    FieldLocation::Offset(offset as u32)
                };
                FieldMetadataRO {
                    name: spec.name.clone().into_boxed_str(),
                    kind: spec.kind,
                    flags: spec.flags,
                    location,
                    declaring_class: SelfRelativeRef::NULL,
                    annotation: Box::from(""),
                }
            })
            .collect();
        debug_assert_eq!(static_idx, static_count);

        // Descriptors now sit at their final addresses; link them.
        let mut next_static = 0;
        for field in fields.iter_mut() {
            field.declaring_class.set(class_addr);
            if let FieldLocation::Address(addr) = &mut field.location {
                addr.set(statics[next_static].as_ptr() as usize);
                next_static += 1;
            }
        }

        let mut vtab: Vec<Option<Arc<MethodMetadataRO>>> = sup
            .as_ref()
            .map(|s| s.vtab.slots.to_vec())
            .unwrap_or_default();
        let methods: Box<[Arc<MethodMetadataRO>]> = self
            .methods
            .iter()
            .map(|spec| {
                let vtab_index = if spec.is_virtual {
                    let existing = vtab.iter().position(|slot| {
                        slot.as_ref()
                            .is_some_and(|m| m.matches(&spec.name, &spec.signature))
                    });
                    let idx = match existing {
                        Some(idx) => idx,
                        None => {
                            vtab.push(None);
                            vtab.len() - 1
                        },
                    };
                    Some(idx as u32)
                } else {
                    None
                };
                let mut method = Arc::new(MethodMetadataRO {
                    name: spec.name.clone().into_boxed_str(),
                    signature: spec.signature.clone().into_boxed_str(),
                    addr: spec.addr,
                    declaring_class: SelfRelativeRef::NULL,
                    flags: spec.flags,
                    arg_size: spec.arg_size,
                    vtab_index,
                    annotation: Box::from(""),
                });
                if let Some(m) = Arc::get_mut(&mut method) {
                    m.declaring_class.set(class_addr);
                }
                if let Some(idx) = vtab_index {
                    vtab[idx as usize] = Some(Arc::clone(&method));
                }
                method
            })
            .collect();

        let itab_tables: Box<[(u16, DispatchTable)]> = self
            .interfaces
            .iter()
            .map(|iface| {
                let slots = iface
                    .ro
                    .methods()
                    .map(|im| {
                        methods
                            .iter()
                            .find(|m| m.matches(&im.name, &im.signature))
                            .cloned()
                            .or_else(|| {
                                vtab.iter()
                                    .flatten()
                                    .find(|m| m.matches(&im.name, &im.signature))
                                    .cloned()
                            })
                    })
                    .collect();
                (iface.clindex(), DispatchTable { slots })
            })
            .collect();

        let (size_info, gctib) = match (&self.kind, &self.family) {
            (ClassKind::ObjectArray, _) => (
                SizeInfo::Array { component_size: 8 },
                Arc::clone(&ARRAY_OF_OBJECT),
            ),
            (ClassKind::PrimitiveArray, FamilyClass::PrimitiveComponent(elem)) => (
                SizeInfo::Array {
                    component_size: elem.size(),
                },
                Arc::clone(&ARRAY_OF_PRIMITIVE),
            ),
            _ => {
                let objsize = Alignment::align_up(cursor, Alignment::DEFAULT);
                let tib = if strong.is_empty() && weak.is_empty() {
                    Arc::clone(&EMPTY_OBJECT)
                } else {
                    Arc::new(GcTib::from_offsets(&strong, &weak, 0))
                };
                (SizeInfo::Object { objsize }, tib)
            },
        };

        ClassMetadata {
            monitor: AtomicU32::new(0),
            clindex,
            kind: self.kind,
            size_info,
            itab: InterfaceTable { tables: itab_tables },
            vtab: DispatchTable {
                slots: vtab.into_boxed_slice(),
            },
            gctib,
            ro: ClassMetadataRO {
                name: self.name.into_boxed_str(),
                fields,
                methods,
                family: self.family,
                interfaces: self.interfaces.into_boxed_slice(),
                flags: self.flags,
                modifiers: self.modifiers,
                annotation: self.annotation.into_boxed_str(),
                reference_kind: self.reference_kind,
            },
            init: ClassInitCell::new(),
            statics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[repr(C)]
    struct Relocatable {
        link: SelfRelativeRef,
        target: u64,
    }

    #[test]
    fn test_self_relative_resolve() {
        let mut block = Box::new(Relocatable {
            link: SelfRelativeRef::NULL,
            target: 42,
        });
        assert_eq!(block.link.resolve(), None);

        let target = &block.target as *const u64 as usize;
        block.link.set(target);
        assert_eq!(block.link.resolve(), Some(target));
        assert_eq!(block.link.delta(), 8);
    }

    #[test]
    fn test_self_relative_survives_relocation() {
        let mut original = Box::new(Relocatable {
            link: SelfRelativeRef::NULL,
            target: 7,
        });
        let target = &original.target as *const u64 as usize;
        original.link.set(target);

        // Byte-copy the block somewhere else, as a relocating loader would.
        let moved: Box<Relocatable> = unsafe {
            let mut dst = Box::<Relocatable>::new_uninit();
            std::ptr::copy_nonoverlapping(&*original as *const Relocatable, dst.as_mut_ptr(), 1);
            dst.assume_init()
        };

        let resolved = moved.link.resolve().unwrap();
        assert_eq!(resolved, &moved.target as *const u64 as usize);
        assert_eq!(unsafe { *(resolved as *const u64) }, 7);
    }

    #[test]
    fn test_explicit_base_resolution() {
        let r = SelfRelativeRef::encode(0x1000, 0x0f00);
        assert_eq!(r.delta(), -0x100);
        assert_eq!(r.resolve_from(0x1000), Some(0x0f00));
        assert_eq!(r.resolve_from(0x2000), Some(0x1f00));
    }

    #[test]
    fn test_field_layout() {
        let class = ClassBuilder::new("Pair")
            .field("flag", FieldKind::Boolean)
            .field("first", FieldKind::Ref)
            .field("count", FieldKind::Int)
            .field("second", FieldKind::Ref)
            .build(3);

        assert_eq!(class.field_offset("flag"), Some(32));
        assert_eq!(class.field_offset("first"), Some(40));
        assert_eq!(class.field_offset("count"), Some(48));
        assert_eq!(class.field_offset("second"), Some(56));
        assert_eq!(class.object_size(), Some(64));
        assert!(class.gctib().is_reference(40));
        assert!(class.gctib().is_reference(56));
        assert!(!class.gctib().is_reference(48));
        assert!(class.may_form_cycles());
    }

    #[test]
    fn test_declaring_class_links() {
        let class = ClassBuilder::new("Owner")
            .field("x", FieldKind::Long)
            .method("run", "()V", 0x4000)
            .build(1);

        let field = class.field("x").unwrap();
        assert!(std::ptr::eq(field.declaring_class().unwrap(), &*class));
        let method = class.method("run", "()V").unwrap();
        assert!(std::ptr::eq(method.declaring_class().unwrap(), &*class));
    }

    #[test]
    fn test_inherited_layout_and_vtable() {
        let base = ClassBuilder::new("Base")
            .field("left", FieldKind::Ref)
            .virtual_method("size", "()I", 0x100)
            .virtual_method("name", "()S", 0x200)
            .build(1);
        let derived = ClassBuilder::new("Derived")
            .superclass(&base)
            .field("right", FieldKind::Ref)
            .virtual_method("name", "()S", 0x300)
            .build(2);

        assert_eq!(derived.field_offset("left"), Some(32));
        assert_eq!(derived.field_offset("right"), Some(40));
        assert!(derived.gctib().is_reference(32), "inherited reference field");

        assert_eq!(derived.vtab().len(), 2);
        assert_eq!(derived.vtab().entry(0), Some(0x100));
        assert_eq!(derived.vtab().entry(1), Some(0x300), "override keeps slot index");
        assert!(base.is_assignable_from(&derived));
        assert!(!derived.is_assignable_from(&base));
    }

    #[test]
    fn test_interface_dispatch() {
        let iface = ClassBuilder::interface("Runnable")
            .virtual_method("run", "()V", 0)
            .build(1);
        let class = ClassBuilder::new("Task")
            .implements(&iface)
            .virtual_method("run", "()V", 0x500)
            .build(2);

        assert_eq!(class.interface_method(&iface, 0).map(|m| m.addr), Some(0x500));
        assert!(iface.is_assignable_from(&class));
        assert_eq!(class.ro().num_super_classes(), 1);
    }

    #[test]
    fn test_array_classes() {
        let object = ClassBuilder::new("java/lang/Object").build(0);
        let arr = ClassBuilder::object_array(&object).build(1);
        assert_eq!(arr.name(), "[Ljava/lang/Object;");
        assert_eq!(arr.size_info(), SizeInfo::Array { component_size: 8 });
        assert_eq!(arr.array_size(3), Some(ARRAY_DATA_OFFSET + 24));
        assert!(arr.component_class().is_some());

        let ints = ClassBuilder::primitive_array(FieldKind::Int).build(2);
        assert_eq!(ints.name(), "[I");
        assert_eq!(ints.array_size(3), Some(ARRAY_DATA_OFFSET + 16));
        assert_eq!(ints.array_size(usize::MAX), None, "overflow is reported");
        assert!(!ints.gctib().has_refs());
    }

    #[test]
    fn test_static_fields() {
        let class = ClassBuilder::new("Config")
            .static_field("instance", FieldKind::Ref)
            .static_field("counter", FieldKind::Long)
            .build(1);

        let slots: Vec<usize> = class.static_ref_slots().collect();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0], class.statics()[0].as_ptr() as usize);
        assert_eq!(class.object_size(), Some(HEADER_SIZE));
    }

    #[test]
    fn test_reference_class_layout() {
        let weak = ClassBuilder::new("WeakReference")
            .reference(ReferenceKind::Weak)
            .field("queue", FieldKind::Ref)
            .build(1);
        assert_eq!(weak.field_offset("referent"), Some(HEADER_SIZE));
        assert_eq!(weak.reference_kind(), Some(ReferenceKind::Weak));
        assert!(!weak.gctib().is_reference(HEADER_SIZE), "referent is weak");
        assert!(weak.gctib().has_weak_refs());
    }

    #[test]
    fn test_initialize_once_across_threads() {
        let class = ClassBuilder::new("Lazy")
            .static_field("value", FieldKind::Long)
            .build(1);
        let runs = AtomicUsize::new(0);
        let barrier = Barrier::new(4);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    let state = class.initialize_with(|c| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        c.statics()[0].store(99, Ordering::Relaxed);
                        true
                    });
                    assert!(matches!(state, ClassInitState::Initialized { .. }));
                    assert_eq!(class.statics()[0].load(Ordering::Relaxed), 99);
                });
            }
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1, "initializer must run exactly once");
    }

    #[test]
    fn test_failed_initialization() {
        let class = ClassBuilder::new("Broken").build(1);
        assert_eq!(class.initialize_with(|_| false), ClassInitState::Erroneous);
        assert_eq!(class.init_state(), ClassInitState::Erroneous);
    }

    #[test]
    fn test_panicking_initializer_marks_erroneous() {
        let class = ClassBuilder::new("Exploding").build(1);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            class.initialize_with(|_| panic!("static initializer threw"))
        }));
        assert!(result.is_err());
        assert_eq!(class.init_state(), ClassInitState::Erroneous);

        // A later request sees the failure instead of waiting forever.
        assert_eq!(class.initialize_with(|_| true), ClassInitState::Erroneous);
    }

    #[test]
    fn test_waiters_released_when_initializer_panics() {
        let class = ClassBuilder::new("ExplodingShared").build(1);
        let entered = Barrier::new(4);

        thread::scope(|s| {
            s.spawn(|| {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    class.initialize_with(|_| {
                        entered.wait();
                        thread::sleep(std::time::Duration::from_millis(50));
                        panic!("static initializer threw")
                    })
                }));
                assert!(result.is_err());
            });
            for _ in 0..3 {
                s.spawn(|| {
                    entered.wait();
                    let state = class.initialize_with(|_| unreachable!("initializer already claimed"));
                    assert_eq!(state, ClassInitState::Erroneous);
                });
            }
        });

        assert_eq!(class.init_state(), ClassInitState::Erroneous);
    }

    #[test]
    fn test_recursive_initialization() {
        let class = ClassBuilder::new("Recursive").build(1);
        let state = class.initialize_with(|c| {
            assert_eq!(c.initialize_with(|_| true), ClassInitState::Initializing);
            true
        });
        assert!(matches!(state, ClassInitState::Initialized { .. }));
    }
}
