//! Reference Barriers - Strong reference fields, statics and locals
//!
//! Stores follow one order for every variant:
//!
//! 1. pre-write hook (the old value is published to an active mark)
//! 2. increment the new value (unless `NoInc`/`NoRc`)
//! 3. atomic swap into the slot with the requested ordering
//! 4. decrement the old value (unless `NoDec`/`NoRc`)
//!
//! Incrementing before the swap keeps self-assignment safe: when old and
//! new are the same object its count never touches zero.
//!
//! Counted loads return a reference owned by the caller, who must
//! eventually drop it with `dec_ref`. The `_norc` loads return a borrowed
//! value with no count taken.

use crate::barrier::{Access, FieldBarrier};
use crate::object::{ref_slot, ObjRef, NULL};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Count side effect of a reference store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RcEffect {
    /// Increment new, decrement old
    #[default]
    Rc,
    /// Raw swap
    NoRc,
    /// Decrement old only; the caller already counted new
    NoInc,
    /// Increment new only; the caller inherits old's count
    NoDec,
}

impl RcEffect {
    #[inline]
    fn incs(self) -> bool {
        matches!(self, RcEffect::Rc | RcEffect::NoDec)
    }

    #[inline]
    fn decs(self) -> bool {
        matches!(self, RcEffect::Rc | RcEffect::NoInc)
    }
}

impl<'rt> FieldBarrier<'rt> {
    // ========================================================================
    // Core
    // ========================================================================

    /// Store `val` into `slot`
    ///
    /// # Returns
    /// The previous value. With `NoDec` the caller now owns its count; with
    /// every other effect it is only informational.
    #[inline]
    pub(crate) fn store_slot(
        &self,
        slot: &AtomicUsize,
        val: ObjRef,
        access: Access,
        effect: RcEffect,
    ) -> ObjRef {
        let rc = self.rt.rc();
        self.rt.satb.pre_write(slot);
        if effect.incs() {
            rc.inc_ref(val);
        }
        let old = slot.swap(val, access.store_order());
        if effect.decs() {
            rc.dec_ref(old);
        }
        old
    }

    #[inline]
    fn load_slot(&self, slot: &AtomicUsize, access: Access) -> ObjRef {
        self.rt.rc().load_and_inc(slot, access.load_order())
    }

    /// Store a reference field with explicit ordering and count effect
    ///
    /// # Safety
    /// `obj + offset` must be a strong reference field of a live object.
    pub unsafe fn write_field(
        &self,
        obj: ObjRef,
        offset: usize,
        val: ObjRef,
        access: Access,
        effect: RcEffect,
    ) -> ObjRef {
        self.check("write_field");
        self.store_slot(ref_slot(obj, offset), val, access, effect)
    }

    // ========================================================================
    // Instance fields
    // ========================================================================

    /// Plain counted store
    ///
    /// # Safety
    /// `obj + offset` must be a strong reference field of a live object.
    #[inline]
    pub unsafe fn write_ref_field(&self, obj: ObjRef, offset: usize, val: ObjRef) {
        self.check("write_ref_field");
        self.store_slot(ref_slot(obj, offset), val, Access::Plain, RcEffect::Rc);
    }

    /// Sequentially consistent counted store
    ///
    /// # Safety
    /// `obj + offset` must be a strong reference field of a live object.
    #[inline]
    pub unsafe fn write_volatile_field(&self, obj: ObjRef, offset: usize, val: ObjRef) {
        self.check("write_volatile_field");
        self.store_slot(ref_slot(obj, offset), val, Access::Volatile, RcEffect::Rc);
    }

    /// Release counted store, for publishing
    ///
    /// # Safety
    /// `obj + offset` must be a strong reference field of a live object.
    #[inline]
    pub unsafe fn write_ordered_field(&self, obj: ObjRef, offset: usize, val: ObjRef) {
        self.check("write_ordered_field");
        self.store_slot(ref_slot(obj, offset), val, Access::Ordered, RcEffect::Rc);
    }

    /// Raw store with no count traffic
    ///
    /// # Safety
    /// As [`Self::write_ref_field`]; the caller keeps both counts right.
    #[inline]
    pub unsafe fn write_ref_field_no_rc(&self, obj: ObjRef, offset: usize, val: ObjRef) {
        self.check("write_ref_field_no_rc");
        self.store_slot(ref_slot(obj, offset), val, Access::Plain, RcEffect::NoRc);
    }

    /// Store whose new value was already counted by the caller
    ///
    /// # Safety
    /// As [`Self::write_ref_field`]; the caller transfers one count on `val`.
    #[inline]
    pub unsafe fn write_ref_field_no_inc(&self, obj: ObjRef, offset: usize, val: ObjRef) {
        self.check("write_ref_field_no_inc");
        self.store_slot(ref_slot(obj, offset), val, Access::Plain, RcEffect::NoInc);
    }

    /// Store that hands the old value's count to the caller
    ///
    /// # Safety
    /// As [`Self::write_ref_field`]; the caller must drop the returned count.
    #[inline]
    pub unsafe fn write_ref_field_no_dec(&self, obj: ObjRef, offset: usize, val: ObjRef) -> ObjRef {
        self.check("write_ref_field_no_dec");
        self.store_slot(ref_slot(obj, offset), val, Access::Plain, RcEffect::NoDec)
    }

    /// Volatile store whose new value was already counted
    ///
    /// # Safety
    /// As [`Self::write_ref_field_no_inc`].
    #[inline]
    pub unsafe fn write_volatile_field_no_inc(&self, obj: ObjRef, offset: usize, val: ObjRef) {
        self.check("write_volatile_field_no_inc");
        self.store_slot(ref_slot(obj, offset), val, Access::Volatile, RcEffect::NoInc);
    }

    /// Volatile store that hands the old value's count to the caller
    ///
    /// # Safety
    /// As [`Self::write_ref_field_no_dec`].
    #[inline]
    pub unsafe fn write_volatile_field_no_dec(&self, obj: ObjRef, offset: usize, val: ObjRef) -> ObjRef {
        self.check("write_volatile_field_no_dec");
        self.store_slot(ref_slot(obj, offset), val, Access::Volatile, RcEffect::NoDec)
    }

    /// Compare-and-swap a reference field
    ///
    /// On success the slot's count moves from `expected` to `new`.
    ///
    /// # Returns
    /// Whether the swap happened
    ///
    /// # Safety
    /// `obj + offset` must be a strong reference field of a live object.
    pub unsafe fn cas_ref_field(&self, obj: ObjRef, offset: usize, expected: ObjRef, new: ObjRef) -> bool {
        self.check("cas_ref_field");
        let slot = ref_slot(obj, offset);
        let rc = self.rt.rc();
        self.rt.satb.pre_write(slot);
        rc.inc_ref(new);
        match slot.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(old) => {
                rc.dec_ref(old);
                true
            },
            Err(_) => {
                rc.dec_ref(new);
                false
            },
        }
    }

    /// Plain counted load
    ///
    /// # Returns
    /// The referenced object with one count owned by the caller
    ///
    /// # Safety
    /// `obj + offset` must be a strong reference field of a live object.
    #[inline]
    pub unsafe fn load_ref_field(&self, obj: ObjRef, offset: usize) -> ObjRef {
        self.check("load_ref_field");
        self.load_slot(ref_slot(obj, offset), Access::Plain)
    }

    /// Sequentially consistent counted load
    ///
    /// # Safety
    /// `obj + offset` must be a strong reference field of a live object.
    #[inline]
    pub unsafe fn load_volatile_field(&self, obj: ObjRef, offset: usize) -> ObjRef {
        self.check("load_volatile_field");
        self.load_slot(ref_slot(obj, offset), Access::Volatile)
    }

    /// Acquire counted load, pairing with [`Self::write_ordered_field`]
    ///
    /// # Safety
    /// `obj + offset` must be a strong reference field of a live object.
    #[inline]
    pub unsafe fn load_ordered_field(&self, obj: ObjRef, offset: usize) -> ObjRef {
        self.check("load_ordered_field");
        self.load_slot(ref_slot(obj, offset), Access::Ordered)
    }

    /// Raw load; no count is taken
    ///
    /// # Safety
    /// `obj + offset` must be a reference field of a live object, and the
    /// caller must keep the target alive by other means.
    #[inline]
    pub unsafe fn load_ref_field_norc(&self, obj: ObjRef, offset: usize) -> ObjRef {
        self.check("load_ref_field_norc");
        ref_slot(obj, offset).load(Ordering::Relaxed)
    }

    /// Raw sequentially consistent load; no count is taken
    ///
    /// # Safety
    /// As [`Self::load_ref_field_norc`].
    #[inline]
    pub unsafe fn load_volatile_field_norc(&self, obj: ObjRef, offset: usize) -> ObjRef {
        self.check("load_volatile_field_norc");
        ref_slot(obj, offset).load(Ordering::SeqCst)
    }

    // ========================================================================
    // Static fields
    // ========================================================================

    /// Counted store into a static reference slot
    ///
    /// # Safety
    /// `addr` must be a static reference slot of a registered class.
    #[inline]
    pub unsafe fn write_static_field(&self, addr: usize, val: ObjRef, is_volatile: bool) {
        self.check("write_static_field");
        self.store_slot(ref_slot(addr, 0), val, Access::for_volatile(is_volatile), RcEffect::Rc);
    }

    /// Static store whose new value was already counted
    ///
    /// # Safety
    /// As [`Self::write_static_field`]; the caller transfers one count.
    #[inline]
    pub unsafe fn write_static_field_no_inc(&self, addr: usize, val: ObjRef, is_volatile: bool) {
        self.check("write_static_field_no_inc");
        self.store_slot(ref_slot(addr, 0), val, Access::for_volatile(is_volatile), RcEffect::NoInc);
    }

    /// Raw static store
    ///
    /// # Safety
    /// As [`Self::write_static_field`]; the caller keeps the counts right.
    #[inline]
    pub unsafe fn write_static_field_no_rc(&self, addr: usize, val: ObjRef) {
        self.check("write_static_field_no_rc");
        self.store_slot(ref_slot(addr, 0), val, Access::Plain, RcEffect::NoRc);
    }

    /// Counted load from a static reference slot
    ///
    /// # Safety
    /// `addr` must be a static reference slot of a registered class.
    #[inline]
    pub unsafe fn load_static_field(&self, addr: usize, is_volatile: bool) -> ObjRef {
        self.check("load_static_field");
        self.load_slot(ref_slot(addr, 0), Access::for_volatile(is_volatile))
    }

    /// Raw load from a static reference slot
    ///
    /// # Safety
    /// As [`Self::load_static_field`]; no count is taken.
    #[inline]
    pub unsafe fn load_static_field_norc(&self, addr: usize) -> ObjRef {
        self.check("load_static_field_norc");
        ref_slot(addr, 0).load(Ordering::Relaxed)
    }

    // ========================================================================
    // Local variables
    // ========================================================================

    /// Replace a counted local variable
    ///
    /// Locals are scanned as roots, so no pre-write hook is needed.
    #[inline]
    pub fn write_ref_var(&self, var: &mut ObjRef, val: ObjRef) {
        let rc = self.rt.rc();
        rc.inc_ref(val);
        let old = std::mem::replace(var, val);
        rc.dec_ref(old);
    }

    /// Replace a local with a value whose count the caller transfers
    #[inline]
    pub fn write_ref_var_no_inc(&self, var: &mut ObjRef, val: ObjRef) {
        let old = std::mem::replace(var, val);
        self.rt.rc().dec_ref(old);
    }

    /// Drop a local's count and null it
    #[inline]
    pub fn release_ref_var(&self, var: &mut ObjRef) {
        let old = std::mem::replace(var, NULL);
        self.rt.rc().dec_ref(old);
    }
}
