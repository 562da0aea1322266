//! Primitive Field Access - Loads and stores of non-reference fields
//!
//! Primitive fields need no count maintenance, only the memory ordering
//! the language asks for:
//!
//! | Access     | Load      | Store     | Used for                    |
//! |------------|-----------|-----------|-----------------------------|
//! | `Plain`    | Relaxed   | Relaxed   | ordinary fields             |
//! | `Volatile` | SeqCst    | SeqCst    | volatile fields             |
//! | `Ordered`  | Acquire   | Release   | lazySet / putOrdered        |
//!
//! Plain accesses still go through atomics so that a plain and a volatile
//! access racing on the same word is never undefined behavior.

use crate::object::{header::field_addr, FieldKind, ObjRef};
use std::sync::atomic::{
    AtomicBool, AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicU32, AtomicU64,
    Ordering,
};

/// Memory ordering of a field access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    Plain,
    Volatile,
    Ordered,
}

impl Access {
    #[inline]
    pub fn load_order(self) -> Ordering {
        match self {
            Access::Plain => Ordering::Relaxed,
            Access::Volatile => Ordering::SeqCst,
            Access::Ordered => Ordering::Acquire,
        }
    }

    #[inline]
    pub fn store_order(self) -> Ordering {
        match self {
            Access::Plain => Ordering::Relaxed,
            Access::Volatile => Ordering::SeqCst,
            Access::Ordered => Ordering::Release,
        }
    }

    /// Access matching a field's declared volatility
    pub fn for_volatile(is_volatile: bool) -> Self {
        if is_volatile {
            Access::Volatile
        } else {
            Access::Plain
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A primitive type that can live in a managed field
pub trait FieldValue: Copy + sealed::Sealed {
    /// Field kind this type is stored as
    const KIND: FieldKind;

    /// # Safety
    /// `addr` must be valid and aligned for `Self`.
    unsafe fn load_at(addr: usize, order: Ordering) -> Self;

    /// # Safety
    /// `addr` must be valid, writable and aligned for `Self`.
    unsafe fn store_at(addr: usize, value: Self, order: Ordering);
}

macro_rules! atomic_field {
    ($t:ty, $atomic:ty, $kind:expr) => {
        impl sealed::Sealed for $t {}

        impl FieldValue for $t {
            const KIND: FieldKind = $kind;

            #[inline]
            unsafe fn load_at(addr: usize, order: Ordering) -> Self {
                <$atomic>::from_ptr(addr as *mut $t).load(order)
            }

            #[inline]
            unsafe fn store_at(addr: usize, value: Self, order: Ordering) {
                <$atomic>::from_ptr(addr as *mut $t).store(value, order)
            }
        }
    };
}

macro_rules! float_field {
    ($t:ty, $atomic:ty, $bits:ty, $kind:expr) => {
        impl sealed::Sealed for $t {}

        impl FieldValue for $t {
            const KIND: FieldKind = $kind;

            #[inline]
            unsafe fn load_at(addr: usize, order: Ordering) -> Self {
                <$t>::from_bits(<$atomic>::from_ptr(addr as *mut $bits).load(order))
            }

            #[inline]
            unsafe fn store_at(addr: usize, value: Self, order: Ordering) {
                <$atomic>::from_ptr(addr as *mut $bits).store(value.to_bits(), order)
            }
        }
    };
}

atomic_field!(bool, AtomicBool, FieldKind::Boolean);
atomic_field!(i8, AtomicI8, FieldKind::Byte);
atomic_field!(i16, AtomicI16, FieldKind::Short);
atomic_field!(u16, AtomicU16, FieldKind::Char);
atomic_field!(i32, AtomicI32, FieldKind::Int);
atomic_field!(i64, AtomicI64, FieldKind::Long);
float_field!(f32, AtomicU32, u32, FieldKind::Float);
float_field!(f64, AtomicU64, u64, FieldKind::Double);

/// Load a primitive instance field
///
/// # Safety
/// `obj` must be a live object with a field of type `T` at `offset`.
#[inline]
pub unsafe fn load_field<T: FieldValue>(obj: ObjRef, offset: usize, access: Access) -> T {
    T::load_at(field_addr(obj, offset), access.load_order())
}

/// Store a primitive instance field
///
/// # Safety
/// `obj` must be a live object with a field of type `T` at `offset`.
#[inline]
pub unsafe fn store_field<T: FieldValue>(obj: ObjRef, offset: usize, value: T, access: Access) {
    T::store_at(field_addr(obj, offset), value, access.store_order())
}

/// Load a primitive static field
///
/// # Safety
/// `addr` must be the address of a static field of type `T`.
#[inline]
pub unsafe fn load_static<T: FieldValue>(addr: usize, access: Access) -> T {
    T::load_at(addr, access.load_order())
}

/// Store a primitive static field
///
/// # Safety
/// `addr` must be the address of a static field of type `T`.
#[inline]
pub unsafe fn store_static<T: FieldValue>(addr: usize, value: T, access: Access) {
    T::store_at(addr, value, access.store_order())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(8))]
    struct Block([u8; 64]);

    #[test]
    fn test_int_and_long_fields() {
        let mut block = Block([0; 64]);
        let obj = block.0.as_mut_ptr() as usize;

        unsafe {
            store_field(obj, 32, -7i32, Access::Plain);
            store_field(obj, 40, i64::MAX, Access::Volatile);
            assert_eq!(load_field::<i32>(obj, 32, Access::Plain), -7);
            assert_eq!(load_field::<i64>(obj, 40, Access::Ordered), i64::MAX);
        }
    }

    #[test]
    fn test_small_fields() {
        let mut block = Block([0; 64]);
        let obj = block.0.as_mut_ptr() as usize;

        unsafe {
            store_field(obj, 32, true, Access::Plain);
            store_field(obj, 33, -1i8, Access::Plain);
            store_field(obj, 34, 'x' as u16, Access::Ordered);
            store_field(obj, 36, -300i16, Access::Volatile);

            assert!(load_field::<bool>(obj, 32, Access::Plain));
            assert_eq!(load_field::<i8>(obj, 33, Access::Plain), -1);
            assert_eq!(load_field::<u16>(obj, 34, Access::Plain), 'x' as u16);
            assert_eq!(load_field::<i16>(obj, 36, Access::Plain), -300);
        }
    }

    #[test]
    fn test_float_fields_keep_bits() {
        let mut block = Block([0; 64]);
        let obj = block.0.as_mut_ptr() as usize;

        unsafe {
            store_field(obj, 32, 1.5f32, Access::Plain);
            store_field(obj, 40, f64::NAN, Access::Volatile);
            assert_eq!(load_field::<f32>(obj, 32, Access::Plain), 1.5);
            assert!(load_field::<f64>(obj, 40, Access::Volatile).is_nan());
        }
    }

    #[test]
    fn test_static_access() {
        let cell = AtomicU64::new(0);
        let addr = cell.as_ptr() as usize;
        unsafe {
            store_static(addr, 99i64, Access::Volatile);
            assert_eq!(load_static::<i64>(addr, Access::Plain), 99);
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(<f64 as FieldValue>::KIND, FieldKind::Double);
        assert_eq!(<u16 as FieldValue>::KIND, FieldKind::Char);
        assert_eq!(Access::for_volatile(true), Access::Volatile);
        assert_eq!(Access::default(), Access::Plain);
    }
}
