//! Object Header - Metadata at the start of every managed object
//!
//! Object Header Layout (32 bytes on 64-bit):
//! ┌─────────────────────────────────────────┐
//! │        Shadow (8 bytes)                 │  <- class metadata address
//! ├────────────────────┬────────────────────┤
//! │  Monitor (4 bytes) │ Strong RC (4 bytes)│
//! ├────────────────────┼────────────────────┤
//! │  Weak RC (4 bytes) │ State (4 bytes)    │
//! ├────────────────────┴────────────────────┤
//! │        Size (8 bytes)                   │  <- allocation size incl. header
//! └─────────────────────────────────────────┘
//!
//! The shadow is a non-owning back pointer: the class stays alive through
//! its registry entry, never through its instances. Array objects carry a
//! length word directly after the header.

use crate::object::metadata::ClassMetadata;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Size of object header in bytes
pub const HEADER_SIZE: usize = 32;

/// Minimum object alignment (bytes)
pub const OBJECT_ALIGNMENT: usize = 8;

/// Offset of the element count in array objects
pub const ARRAY_LENGTH_OFFSET: usize = HEADER_SIZE;

/// Offset of the first array element
pub const ARRAY_DATA_OFFSET: usize = HEADER_SIZE + 8;

/// State bits
pub const STATE_PERMANENT: u32 = 1 << 0;
pub const STATE_RELEASED: u32 = 1 << 1;
pub const STATE_WEAK_COLLECTED: u32 = 1 << 2;
pub const STATE_FREED: u32 = 1 << 3;
pub const STATE_FINALIZE_PENDING: u32 = 1 << 4;
pub const STATE_FINALIZED: u32 = 1 << 5;
pub const STATE_REFERENT_CLEARED: u32 = 1 << 6;
pub const STATE_MARKED: u32 = 1 << 7;
pub const STATE_CYCLE_CANDIDATE: u32 = 1 << 8;
pub const STATE_DEFERRED_RELEASE: u32 = 1 << 9;
pub const STATE_ENQUEUED: u32 = 1 << 10;
pub const STATE_TRACING: u32 = 1 << 11;

/// Bits that survive `pre_renew`
const STATE_RENEW_KEEP: u32 = STATE_PERMANENT | STATE_TRACING;

/// Object Header
///
/// Every managed object starts with this header. Only the counts, the state
/// word and the monitor change after construction.
#[repr(C)]
pub struct ObjectHeader {
    /// Class metadata address (0 for raw allocations)
    pub shadow: AtomicUsize,
    /// Lock/wait-set word, opaque to the runtime
    pub monitor: AtomicU32,
    /// Strong reference count
    pub rc: AtomicU32,
    /// Weak reference count
    pub weak_rc: AtomicU32,
    /// Lifecycle state bits
    pub state: AtomicU32,
    /// Allocation size in bytes including the header
    pub size: AtomicUsize,
}

impl ObjectHeader {
    /// Class metadata address
    #[inline]
    pub fn shadow(&self) -> usize {
        self.shadow.load(Ordering::Acquire)
    }

    /// Current strong count
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.rc.load(Ordering::Acquire)
    }

    /// Current weak count
    #[inline]
    pub fn weak_count(&self) -> u32 {
        self.weak_rc.load(Ordering::Acquire)
    }

    /// Allocation size including header
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Raw state bits
    #[inline]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Check whether all of `bits` are set
    #[inline]
    pub fn has(&self, bits: u32) -> bool {
        self.state() & bits == bits
    }

    /// Set `bits`, returning the previous state
    #[inline]
    pub fn set(&self, bits: u32) -> u32 {
        self.state.fetch_or(bits, Ordering::AcqRel)
    }

    /// Clear `bits`, returning the previous state
    #[inline]
    pub fn clear(&self, bits: u32) -> u32 {
        self.state.fetch_and(!bits, Ordering::AcqRel)
    }

    /// Immortal objects ignore count operations
    #[inline]
    pub fn is_permanent(&self) -> bool {
        self.state.load(Ordering::Relaxed) & STATE_PERMANENT != 0
    }

    /// Strong count reached zero and fields were cleared
    #[inline]
    pub fn is_released(&self) -> bool {
        self.state() & STATE_RELEASED != 0
    }

    /// Claim the right to free the memory; true for exactly one caller
    #[inline]
    pub fn claim_free(&self) -> bool {
        self.set(STATE_FREED) & STATE_FREED == 0
    }

    /// Reset lifecycle state for object reuse
    pub fn pre_renew(&self) {
        self.state.fetch_and(STATE_RENEW_KEEP, Ordering::AcqRel);
        self.weak_rc.store(0, Ordering::Relaxed);
        self.rc.store(1, Ordering::Release);
    }
}

/// Initialise the header of freshly allocated memory
///
/// New objects start with one strong count owned by the caller. Every word
/// is written atomically: a reused block may still be probed by a reader
/// that loaded its address before the previous occupant was freed. The
/// count is published last.
///
/// # Safety
/// `obj` must point to at least `HEADER_SIZE` writable, 8-byte aligned bytes.
pub unsafe fn init_header(obj: usize, shadow: usize, size: usize, state: u32) {
    let header = get_header(obj);
    header.state.store(state, Ordering::Relaxed);
    header.size.store(size, Ordering::Relaxed);
    header.shadow.store(shadow, Ordering::Relaxed);
    header.monitor.store(0, Ordering::Relaxed);
    header.weak_rc.store(0, Ordering::Relaxed);
    header.rc.store(1, Ordering::Release);
}

/// Get the header of an object
///
/// # Safety
/// `obj` must be the address of a live (not freed) managed object.
#[inline]
pub unsafe fn get_header<'a>(obj: usize) -> &'a ObjectHeader {
    &*(obj as *const ObjectHeader)
}

/// Get the class metadata of an object, if it has one
///
/// # Safety
/// `obj` must be a live object whose class is still registered.
#[inline]
pub unsafe fn class_of<'a>(obj: usize) -> Option<&'a ClassMetadata> {
    let shadow = get_header(obj).shadow();
    if shadow == 0 {
        None
    } else {
        Some(&*(shadow as *const ClassMetadata))
    }
}

/// Address of a field
#[inline]
pub fn field_addr(obj: usize, offset: usize) -> usize {
    obj + offset
}

/// View a reference-sized field as an atomic word
///
/// # Safety
/// `obj + offset` must be 8-byte aligned and inside a live object.
#[inline]
pub unsafe fn ref_slot<'a>(obj: usize, offset: usize) -> &'a AtomicUsize {
    AtomicUsize::from_ptr(field_addr(obj, offset) as *mut usize)
}

/// Element count of an array object
///
/// # Safety
/// `obj` must be a live array object.
#[inline]
pub unsafe fn array_length(obj: usize) -> usize {
    ref_slot(obj, ARRAY_LENGTH_OFFSET).load(Ordering::Relaxed)
}
