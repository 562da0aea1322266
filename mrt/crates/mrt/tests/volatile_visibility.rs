//! Volatile Field Tests - Cross-thread visibility of volatile accesses
//!
//! A writer thread stores through the volatile barrier and a reader thread
//! spins on volatile loads of the same field. Every primitive kind and the
//! counted reference field are covered, plus release/acquire publication of
//! plain data behind a volatile flag.

mod common;

use common::{RuntimeFixture, TEST_TIMEOUT};
use mrt::barrier::{Access, FieldValue};
use mrt::object::{ClassBuilder, ClassMetadata, FieldKind};
use mrt::{ObjRef, NULL};
use std::fmt::Debug;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

/// `Cell` with one field of every primitive kind and one reference
fn cell_class(fixture: &RuntimeFixture) -> Arc<ClassMetadata> {
    fixture
        .rt
        .register_class(
            ClassBuilder::new("VolatileCell")
                .field("z", FieldKind::Boolean)
                .field("b", FieldKind::Byte)
                .field("s", FieldKind::Short)
                .field("c", FieldKind::Char)
                .field("i", FieldKind::Int)
                .field("j", FieldKind::Long)
                .field("f", FieldKind::Float)
                .field("d", FieldKind::Double)
                .field("ref", FieldKind::Ref),
        )
        .expect("VolatileCell registers")
}

fn offset(class: &ClassMetadata, name: &str) -> usize {
    class
        .field_offset(name)
        .unwrap_or_else(|| panic!("field {} missing", name))
}

/// Store `value` on one thread and spin until another thread observes it
fn assert_volatile_visible<T>(fixture: &RuntimeFixture, cell: ObjRef, offset: usize, value: T)
where
    T: FieldValue + PartialEq + Debug + Send + Sync,
{
    let rt = &fixture.rt;
    let start = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            start.wait();
            unsafe { rt.barrier().store_field(cell, offset, value, Access::Volatile) };
        });

        let reader = s.spawn(|| {
            start.wait();
            let deadline = Instant::now() + TEST_TIMEOUT;
            loop {
                let seen: T = unsafe { rt.barrier().load_field(cell, offset, Access::Volatile) };
                if seen == value {
                    return seen;
                }
                assert!(Instant::now() < deadline, "volatile store of {:?} never became visible", value);
                std::hint::spin_loop();
            }
        });
        assert_eq!(reader.join().unwrap(), value);
    });
}

#[test]
fn test_volatile_primitive_stores_visible_across_threads() {
    let fixture = RuntimeFixture::with_defaults();
    let class = cell_class(&fixture);
    let cell = fixture.rt.new_obj_for_class(&class).unwrap();

    assert_volatile_visible(&fixture, cell, offset(&class, "z"), true);
    assert_volatile_visible(&fixture, cell, offset(&class, "b"), -7i8);
    assert_volatile_visible(&fixture, cell, offset(&class, "s"), -12_345i16);
    assert_volatile_visible(&fixture, cell, offset(&class, "c"), 0x263Au16);
    assert_volatile_visible(&fixture, cell, offset(&class, "i"), 0x7eed_beefi32);
    assert_volatile_visible(&fixture, cell, offset(&class, "j"), -0x1234_5678_9abc_def0i64);
    assert_volatile_visible(&fixture, cell, offset(&class, "f"), 2.5f32);
    assert_volatile_visible(&fixture, cell, offset(&class, "d"), -1.0e300f64);

    // Neighbouring fields are untouched by the narrower stores.
    let barrier = fixture.rt.barrier();
    unsafe {
        assert!(barrier.load_field::<bool>(cell, offset(&class, "z"), Access::Volatile));
        assert_eq!(barrier.load_field::<i8>(cell, offset(&class, "b"), Access::Volatile), -7);
        assert_eq!(barrier.load_field::<u16>(cell, offset(&class, "c"), Access::Volatile), 0x263A);
    }

    fixture.rt.rc().dec_ref(cell);
    assert_eq!(fixture.rt.total_heap_obj(), 0);
}

#[test]
fn test_volatile_reference_store_visible_across_threads() {
    let fixture = RuntimeFixture::with_defaults();
    let class = cell_class(&fixture);
    let slot = offset(&class, "ref");
    let cell = fixture.rt.new_obj_for_class(&class).unwrap();
    let target = fixture.new_node();
    let rt = &fixture.rt;
    let start = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            start.wait();
            unsafe { rt.barrier().write_volatile_field(cell, slot, target) };
        });

        let reader = s.spawn(|| {
            start.wait();
            let deadline = Instant::now() + TEST_TIMEOUT;
            loop {
                // Counted load: the reader owns one count on a non-null result.
                let seen = unsafe { rt.barrier().load_volatile_field(cell, slot) };
                if seen != NULL {
                    return seen;
                }
                assert!(Instant::now() < deadline, "volatile reference store never became visible");
                std::hint::spin_loop();
            }
        });

        let seen = reader.join().unwrap();
        assert_eq!(seen, target);
        rt.rc().dec_ref(seen);
    });

    assert_eq!(rt.rc().ref_count(target), 2, "creator and field");
    rt.rc().dec_ref(target);
    rt.rc().dec_ref(cell);
    assert_eq!(rt.total_heap_obj(), 0);
}

#[test]
fn test_volatile_flag_publishes_plain_fields() {
    let fixture = RuntimeFixture::with_defaults();
    let class = cell_class(&fixture);
    let (flag, payload, ratio) = (offset(&class, "z"), offset(&class, "j"), offset(&class, "d"));
    let rt = &fixture.rt;

    for round in 0..200i64 {
        let cell = rt.new_obj_for_class(&class).unwrap();
        let start = Barrier::new(2);

        thread::scope(|s| {
            s.spawn(|| {
                start.wait();
                let barrier = rt.barrier();
                unsafe {
                    barrier.store_field(cell, payload, round * 31 + 1, Access::Plain);
                    barrier.store_field(cell, ratio, round as f64 / 4.0, Access::Plain);
                    barrier.store_field(cell, flag, true, Access::Volatile);
                }
            });

            s.spawn(|| {
                start.wait();
                let barrier = rt.barrier();
                let deadline = Instant::now() + TEST_TIMEOUT;
                while !unsafe { barrier.load_field::<bool>(cell, flag, Access::Volatile) } {
                    assert!(Instant::now() < deadline, "flag never published");
                    std::hint::spin_loop();
                }
                unsafe {
                    assert_eq!(barrier.load_field::<i64>(cell, payload, Access::Plain), round * 31 + 1);
                    assert_eq!(barrier.load_field::<f64>(cell, ratio, Access::Plain), round as f64 / 4.0);
                }
            });
        });

        rt.rc().dec_ref(cell);
    }
    assert_eq!(rt.total_heap_obj(), 0);
}
