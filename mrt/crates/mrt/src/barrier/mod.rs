//! Barrier Module - Field access barriers
//!
//! Every field access made by compiled code goes through one of these
//! primitives. They differ along two axes.
//!
//! Memory ordering ([`Access`]):
//! - `Plain` - no cross-thread ordering beyond word atomicity
//! - `Volatile` - sequentially consistent
//! - `Ordered` - release store, paired by the reader with an acquire load
//!
//! Reference-count effect ([`RcEffect`]) for reference stores:
//! - `Rc` - increment the new value, decrement the old one
//! - `NoRc` - raw swap; the caller keeps the counts right
//! - `NoInc` - the caller already took the count on the new value
//! - `NoDec` - the caller takes over the count of the old value
//!
//! Every reference store runs the pre-write hook before memory changes, so
//! a concurrent mark never loses an edge:
//!
//! ```text
//! pre_write(slot) ──► inc(new) ──► swap(slot, new) ──► dec(old)
//! ```
//!
//! Weak fields hold weak counts and load as null once their target is
//! released. Referent fields of reference objects add the cleared-referent
//! policy (see [`weak`]).
//!
//! With `check_saferegion` enabled, every barrier asserts that the calling
//! thread is not inside a safe region.

pub mod prewrite;
pub mod primitive;
pub mod reference;
pub mod weak;

pub use prewrite::PreWriteBarrier;
pub use primitive::{Access, FieldValue};
pub use reference::RcEffect;

use crate::fatal::FatalError;
use crate::object::ObjRef;
use crate::runtime::Runtime;
use crate::util::{current_thread_id, in_saferegion};

/// Field barriers bound to one runtime
///
/// Obtained through [`Runtime::barrier`]. All methods taking an object and
/// an offset are `unsafe`: the caller guarantees `obj` is a live object and
/// `offset` names a field of the right kind inside it.
///
/// # Examples
///
/// ```rust
/// use mrt::object::{ClassBuilder, FieldKind};
/// use mrt::{Runtime, RuntimeConfig};
///
/// let rt = Runtime::new(RuntimeConfig::default()).unwrap();
/// let class = rt
///     .register_class(ClassBuilder::new("Pair").field("first", FieldKind::Ref))
///     .unwrap();
/// let first = class.field_offset("first").unwrap();
///
/// let pair = rt.new_obj_for_class(&class).unwrap();
/// let value = rt.new_obj(48, 8).unwrap();
/// unsafe {
///     rt.barrier().write_ref_field(pair, first, value);
///     let loaded = rt.barrier().load_ref_field(pair, first);
///     assert_eq!(loaded, value);
///     rt.rc().dec_ref(loaded);
/// }
/// rt.rc().dec_ref(value);
/// rt.rc().dec_ref(pair);
/// ```
#[derive(Clone, Copy)]
pub struct FieldBarrier<'rt> {
    rt: &'rt Runtime,
}

impl<'rt> FieldBarrier<'rt> {
    pub(crate) fn new(rt: &'rt Runtime) -> Self {
        Self { rt }
    }

    /// Assert the calling thread may touch managed memory
    #[inline]
    fn check(&self, operation: &'static str) {
        if self.rt.config.check_saferegion && in_saferegion() {
            self.rt.fatal(FatalError::SaferegionViolation {
                thread_id: current_thread_id(),
                message: format!("{} called inside a safe region", operation),
            });
        }
    }

    // ========================================================================
    // Primitive fields
    // ========================================================================

    /// Load a primitive field
    ///
    /// # Safety
    /// `obj + offset` must be a field of type `T` inside a live object.
    #[inline]
    pub unsafe fn load_field<T: FieldValue>(&self, obj: ObjRef, offset: usize, access: Access) -> T {
        self.check("load_field");
        primitive::load_field(obj, offset, access)
    }

    /// Store a primitive field
    ///
    /// # Safety
    /// `obj + offset` must be a field of type `T` inside a live object.
    #[inline]
    pub unsafe fn store_field<T: FieldValue>(&self, obj: ObjRef, offset: usize, value: T, access: Access) {
        self.check("store_field");
        primitive::store_field(obj, offset, value, access)
    }

    /// Load a primitive static field
    ///
    /// # Safety
    /// `addr` must be a static slot of type `T` of a registered class.
    #[inline]
    pub unsafe fn load_static_field_prim<T: FieldValue>(&self, addr: usize, access: Access) -> T {
        self.check("load_static_field");
        primitive::load_static(addr, access)
    }

    /// Store a primitive static field
    ///
    /// # Safety
    /// `addr` must be a static slot of type `T` of a registered class.
    #[inline]
    pub unsafe fn store_static_field_prim<T: FieldValue>(&self, addr: usize, value: T, access: Access) {
        self.check("store_static_field");
        primitive::store_static(addr, value, access)
    }
}

#[cfg(test)]
mod tests {
    use crate::barrier::Access;
    use crate::fatal::panic_handler;
    use crate::object::{ClassBuilder, FieldKind};
    use crate::{Runtime, RuntimeConfig, KB, MB};

    fn runtime() -> Runtime {
        let config = RuntimeConfig {
            heap_size: 4 * MB,
            heap_start_size: 256 * KB,
            heap_growth_limit: 4 * MB,
            check_saferegion: true,
            ..Default::default()
        };
        let rt = Runtime::new(config).unwrap();
        rt.set_abort_handler(panic_handler);
        rt
    }

    #[test]
    fn test_primitive_fields_through_barrier() {
        let rt = runtime();
        let class = rt
            .register_class(
                ClassBuilder::new("Point")
                    .field("x", FieldKind::Int)
                    .volatile_field("y", FieldKind::Double),
            )
            .unwrap();
        let x = class.field_offset("x").unwrap();
        let y = class.field_offset("y").unwrap();
        let obj = rt.new_obj_for_class(&class).unwrap();

        unsafe {
            rt.barrier().store_field(obj, x, -7i32, Access::Plain);
            rt.barrier().store_field(obj, y, 2.5f64, Access::Volatile);
            assert_eq!(rt.barrier().load_field::<i32>(obj, x, Access::Plain), -7);
            assert_eq!(rt.barrier().load_field::<f64>(obj, y, Access::Volatile), 2.5);
        }
        rt.rc().dec_ref(obj);
    }

    #[test]
    #[should_panic(expected = "safe region")]
    fn test_barrier_inside_saferegion_is_fatal() {
        let rt = runtime();
        let obj = rt.new_obj(48, 8).unwrap();
        crate::util::set_in_saferegion(true);
        unsafe {
            rt.barrier()
                .store_field(obj, crate::object::HEADER_SIZE, 1i64, Access::Plain)
        };
    }
}
