//! Weak Barriers - Weak fields and reference-object referents
//!
//! A weak slot holds a weak count on its target. The count keeps the
//! target's memory (never its contents) valid, so a load can always
//! inspect the header and decide:
//!
//! - target alive → take a strong count and return it
//! - target released or waiting for its finalizer → return null
//!
//! Referent slots of reference objects are weak slots with one extra
//! policy bit. Once the referent has been cleared (by reference
//! processing or `reference_clear_referent`), the reference carries
//! `REFERENT_CLEARED`:
//!
//! - a plain store is rejected: the slot stays null, the rejection is
//!   counted and logged at debug level
//! - a store with `resurrect` drops the bit and proceeds as a normal weak
//!   store, visible to the next processing pass

use crate::barrier::{Access, FieldBarrier};
use crate::logging::RuntimeEvent;
use crate::object::header::STATE_REFERENT_CLEARED;
use crate::object::{class_of, get_header, ref_slot, ObjRef, ReferenceKind, NULL, REFERENT_OFFSET};
use crate::stats::RcStats;
use std::sync::atomic::AtomicUsize;

impl<'rt> FieldBarrier<'rt> {
    #[inline]
    fn store_weak_slot(&self, slot: &AtomicUsize, val: ObjRef, access: Access) {
        let rc = self.rt.rc();
        self.rt.satb.pre_write(slot);
        rc.weak_inc(val);
        let old = slot.swap(val, access.store_order());
        rc.weak_dec(old);
    }

    // ========================================================================
    // Weak fields
    // ========================================================================

    /// Store a weak reference field
    ///
    /// # Safety
    /// `obj + offset` must be a weak reference field of a live object.
    #[inline]
    pub unsafe fn write_weak_field(&self, obj: ObjRef, offset: usize, val: ObjRef, is_volatile: bool) {
        self.check("write_weak_field");
        self.store_weak_slot(ref_slot(obj, offset), val, Access::for_volatile(is_volatile));
    }

    /// Load a weak reference field
    ///
    /// # Returns
    /// The target with one strong count owned by the caller, or null if
    /// the target is dead
    ///
    /// # Safety
    /// `obj + offset` must be a weak reference field of a live object.
    #[inline]
    pub unsafe fn load_weak_field(&self, obj: ObjRef, offset: usize, is_volatile: bool) -> ObjRef {
        self.check("load_weak_field");
        let access = Access::for_volatile(is_volatile);
        self.rt
            .rc()
            .load_weak_and_inc(ref_slot(obj, offset), access.load_order())
    }

    // ========================================================================
    // Referents
    // ========================================================================

    /// Store the referent of a reference object
    ///
    /// # Returns
    /// `false` if the store was rejected because the referent had been
    /// cleared and `resurrect` was not set
    ///
    /// # Safety
    /// `reference` must be a live instance of a reference class.
    pub unsafe fn write_referent_field(&self, reference: ObjRef, val: ObjRef, resurrect: bool) -> bool {
        self.check("write_referent_field");
        let header = get_header(reference);
        if header.has(STATE_REFERENT_CLEARED) {
            if !resurrect {
                RcStats::bump(&self.rt.rc_stats.referent_rejected);
                self.rt.logger.log(RuntimeEvent::ReferentStoreRejected {
                    reference,
                    referent: val,
                });
                return false;
            }
            header.clear(STATE_REFERENT_CLEARED);
        }
        self.store_weak_slot(ref_slot(reference, REFERENT_OFFSET), val, Access::Volatile);
        true
    }

    /// Load the referent of a reference object
    ///
    /// Phantom references always load null. A live referent is published to
    /// an active mark, so a concurrent collection keeps it.
    ///
    /// # Safety
    /// `reference` must be a live instance of a reference class.
    pub unsafe fn reference_get_referent(&self, reference: ObjRef) -> ObjRef {
        self.check("reference_get_referent");
        if class_of(reference).and_then(|c| c.reference_kind()) == Some(ReferenceKind::Phantom) {
            return NULL;
        }
        let rc = self.rt.rc();
        let referent = rc.load_weak_and_inc(
            ref_slot(reference, REFERENT_OFFSET),
            Access::Volatile.load_order(),
        );
        rc.weak_ref_get_barrier(referent);
        referent
    }

    /// Clear the referent of a reference object
    ///
    /// Later plain referent stores are rejected until a resurrecting store.
    ///
    /// # Safety
    /// `reference` must be a live instance of a reference class.
    pub unsafe fn reference_clear_referent(&self, reference: ObjRef) {
        self.check("reference_clear_referent");
        let header = get_header(reference);
        self.store_weak_slot(ref_slot(reference, REFERENT_OFFSET), NULL, Access::Volatile);
        header.set(STATE_REFERENT_CLEARED);
    }
}

#[cfg(test)]
mod tests {
    use crate::fatal::panic_handler;
    use crate::logging::RuntimeEvent;
    use crate::object::{ClassBuilder, FieldKind, ReferenceKind};
    use crate::{Runtime, RuntimeConfig, KB, MB};

    fn runtime() -> Runtime {
        let config = RuntimeConfig {
            heap_size: 4 * MB,
            heap_start_size: 256 * KB,
            heap_growth_limit: 4 * MB,
            verify_heap_addresses: true,
            ..Default::default()
        };
        let rt = Runtime::new(config).unwrap();
        rt.set_abort_handler(panic_handler);
        rt
    }

    #[test]
    fn test_weak_field_loads_null_after_release() {
        let rt = runtime();
        let class = rt
            .register_class(ClassBuilder::new("Cache").field("entry", FieldKind::WeakRef))
            .unwrap();
        let entry = class.field_offset("entry").unwrap();
        let cache = rt.new_obj_for_class(&class).unwrap();
        let value = rt.new_obj(48, 8).unwrap();

        unsafe {
            rt.barrier().write_weak_field(cache, entry, value, false);
            assert_eq!(rt.rc().ref_count(value), 1, "weak store takes no strong count");
            assert_eq!(rt.rc().weak_ref_count(value), 1);

            let loaded = rt.barrier().load_weak_field(cache, entry, true);
            assert_eq!(loaded, value);
            rt.rc().dec_ref(loaded);

            rt.rc().dec_ref(value);
            assert!(rt.heap().is_allocated(value), "weak slot keeps the memory");
            assert_eq!(rt.barrier().load_weak_field(cache, entry, false), 0);
        }

        rt.rc().dec_ref(cache);
        assert_eq!(rt.heap().block_count(), 0);
    }

    #[test]
    fn test_referent_resurrect_policy() {
        let rt = runtime();
        let class = rt
            .register_class(ClassBuilder::new("WeakRef").reference(ReferenceKind::Weak))
            .unwrap();
        let reference = rt.new_obj_for_class(&class).unwrap();
        let a = rt.new_obj(48, 8).unwrap();
        let b = rt.new_obj(48, 8).unwrap();

        unsafe {
            assert!(rt.barrier().write_referent_field(reference, a, false));
            rt.barrier().reference_clear_referent(reference);
            assert_eq!(rt.barrier().reference_get_referent(reference), 0);
            assert_eq!(rt.rc().weak_ref_count(a), 0);

            assert!(!rt.barrier().write_referent_field(reference, b, false));
            assert_eq!(rt.barrier().reference_get_referent(reference), 0, "slot stays null");
            assert_eq!(rt.rc_stats().referent_rejected, 1);
            assert_eq!(
                rt.logger()
                    .count_matching(|e| matches!(e, RuntimeEvent::ReferentStoreRejected { .. })),
                1
            );

            assert!(rt.barrier().write_referent_field(reference, b, true));
            let got = rt.barrier().reference_get_referent(reference);
            assert_eq!(got, b);
            rt.rc().dec_ref(got);
            assert!(rt.barrier().write_referent_field(reference, a, false), "bit dropped");
        }

        rt.rc().dec_ref(reference);
        rt.rc().dec_ref(a);
        rt.rc().dec_ref(b);
        assert_eq!(rt.heap().block_count(), 0);
    }

    #[test]
    fn test_phantom_referent_reads_null() {
        let rt = runtime();
        let class = rt
            .register_class(ClassBuilder::new("PhantomRef").reference(ReferenceKind::Phantom))
            .unwrap();
        let reference = rt.new_obj_for_class(&class).unwrap();
        let a = rt.new_obj(48, 8).unwrap();

        unsafe {
            assert!(rt.barrier().write_referent_field(reference, a, false));
            assert_eq!(rt.barrier().reference_get_referent(reference), 0);
        }
        assert_eq!(rt.rc().weak_ref_count(a), 1);
        rt.rc().dec_ref(reference);
        assert_eq!(rt.rc().weak_ref_count(a), 0, "release drops the referent's weak count");
        rt.rc().dec_ref(a);
    }

    #[test]
    fn test_referent_read_published_while_marking() {
        let rt = runtime();
        let class = rt
            .register_class(ClassBuilder::new("SoftRef").reference(ReferenceKind::Soft))
            .unwrap();
        let reference = rt.new_obj_for_class(&class).unwrap();
        let a = rt.new_obj(48, 8).unwrap();

        unsafe {
            rt.barrier().write_referent_field(reference, a, false);
            rt.satb().start_marking();
            let got = rt.barrier().reference_get_referent(reference);
            rt.satb().stop_marking();
            rt.rc().dec_ref(got);
        }
        let mut published = Vec::new();
        rt.satb().drain(|o| published.push(o));
        assert!(published.contains(&a));

        rt.rc().dec_ref(reference);
        rt.rc().dec_ref(a);
    }
}
