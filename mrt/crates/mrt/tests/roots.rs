//! Root Tests - Root categories and the new-root log
//!
//! Covers how the visitor sees each root category, the logging protocol
//! driven by visit flags, and the thread-list lock discipline.

mod common;

use common::RuntimeFixture;
use mrt::roots::RootInfo;
use mrt::{ObjRef, RootType, VisitRootFlags};

fn collect(fixture: &RuntimeFixture, flags: VisitRootFlags) -> Vec<(ObjRef, RootInfo)> {
    let mut seen = Vec::new();
    fixture
        .rt
        .visit_roots(flags, &mut |obj: ObjRef, info: &RootInfo| seen.push((obj, *info)));
    seen
}

#[test]
fn test_new_roots_logging_protocol() {
    let fixture = RuntimeFixture::with_defaults();
    let rt = &fixture.rt;
    let before = fixture.new_node();
    let g_before = rt.new_global_ref(before);

    // Logging is off: nothing is recorded.
    assert!(collect(&fixture, VisitRootFlags::NEW_ROOTS).is_empty());

    // Full walk that turns logging on afterwards.
    let all = collect(
        &fixture,
        VisitRootFlags::ALL_ROOTS | VisitRootFlags::START_LOGGING_NEW_ROOTS,
    );
    assert_eq!(all, vec![(before, RootInfo::global(RootType::JniGlobal))]);
    assert!(rt.roots().is_logging_new_roots());

    let mutator = rt.gc_init_thread_local(false).unwrap();
    let local = fixture.new_node();
    let global = fixture.new_node();
    mutator.new_local_ref(local);
    let g_after = rt.new_global_ref(global);
    rt.add_vm_root(RootType::InternedString, global);

    let new_roots = collect(&fixture, VisitRootFlags::NEW_ROOTS);
    assert_eq!(new_roots.len(), 3);
    assert!(new_roots.contains(&(local, RootInfo::new(RootType::JniLocal, mutator.tid()))));
    assert!(new_roots.contains(&(global, RootInfo::global(RootType::JniGlobal))));
    assert!(new_roots.contains(&(global, RootInfo::global(RootType::InternedString))));

    // A plain NEW_ROOTS visit does not consume the log.
    assert_eq!(collect(&fixture, VisitRootFlags::NEW_ROOTS).len(), 3);

    // Clearing takes effect after the visit.
    let cleared = collect(
        &fixture,
        VisitRootFlags::NEW_ROOTS | VisitRootFlags::CLEAR_ROOT_LOG,
    );
    assert_eq!(cleared.len(), 3);
    assert!(collect(&fixture, VisitRootFlags::NEW_ROOTS).is_empty());
    assert_eq!(rt.roots().new_root_count(), 0);

    // Stop logging; later registrations are not recorded.
    collect(&fixture, VisitRootFlags::NEW_ROOTS | VisitRootFlags::STOP_LOGGING_NEW_ROOTS);
    let late = fixture.new_node();
    let g_late = rt.new_global_ref(late);
    assert!(collect(&fixture, VisitRootFlags::NEW_ROOTS).is_empty());

    // Cleanup
    mutator.delete_local_ref(local);
    assert!(rt.remove_vm_root(RootType::InternedString, global));
    for handle in [g_before, g_after, g_late] {
        rt.delete_global_ref(handle);
    }
    for obj in [before, local, global, late] {
        rt.rc().dec_ref(obj);
    }
    drop(mutator);
    assert_eq!(rt.total_heap_obj(), 0);
}

#[test]
fn test_new_roots_skip_deleted_registrations() {
    let fixture = RuntimeFixture::with_defaults();
    let rt = &fixture.rt;
    collect(&fixture, VisitRootFlags::ALL_ROOTS | VisitRootFlags::START_LOGGING_NEW_ROOTS);

    // Global: the only count left is the global's, deleting it frees the node.
    let global = fixture.new_node();
    let handle = rt.new_global_ref(global);
    rt.rc().dec_ref(global);
    rt.delete_global_ref(handle);
    assert_eq!(rt.total_heap_obj(), 0);
    assert!(collect(&fixture, VisitRootFlags::NEW_ROOTS).is_empty());
    assert_eq!(rt.roots().new_root_count(), 0, "stale entry dropped from the log");

    // VM root and thread-owned roots take the same path.
    let mutator = rt.gc_init_thread_local(false).unwrap();
    let interned = fixture.new_node();
    let local = fixture.new_node();
    let framed = fixture.new_node();
    let pushed = fixture.new_node();
    rt.add_vm_root(RootType::InternedString, interned);
    mutator.new_local_ref(local);
    mutator.push_local_frame();
    mutator.new_local_ref(framed);
    mutator.push_root(RootType::NativeStack, pushed);
    for obj in [interned, local, framed, pushed] {
        rt.rc().dec_ref(obj);
    }
    assert_eq!(collect(&fixture, VisitRootFlags::NEW_ROOTS).len(), 4);

    assert!(rt.remove_vm_root(RootType::InternedString, interned));
    mutator.delete_local_ref(local);
    assert!(mutator.pop_root());
    mutator.pop_local_frame();
    assert_eq!(rt.total_heap_obj(), 0);
    assert!(collect(&fixture, VisitRootFlags::NEW_ROOTS).is_empty());

    // One of two registrations of the same object survives.
    let shared = fixture.new_node();
    let first = rt.new_global_ref(shared);
    let second = rt.new_global_ref(shared);
    rt.delete_global_ref(first);
    assert_eq!(
        collect(&fixture, VisitRootFlags::NEW_ROOTS),
        vec![(shared, RootInfo::global(RootType::JniGlobal))]
    );

    rt.delete_global_ref(second);
    rt.rc().dec_ref(shared);
    drop(mutator);
    assert!(collect(&fixture, VisitRootFlags::NEW_ROOTS).is_empty());
    assert_eq!(rt.total_heap_obj(), 0);
}

#[test]
fn test_class_loader_walk_only_sees_sticky_roots() {
    let fixture = RuntimeFixture::with_defaults();
    let rt = &fixture.rt;
    let class = rt
        .register_class(
            mrt::object::ClassBuilder::new("Holder").static_field("INSTANCE", mrt::object::FieldKind::Ref),
        )
        .unwrap();
    let slot = class.static_ref_slots().next().unwrap();
    let sticky = fixture.new_node();
    let interned = fixture.new_node();
    let global = fixture.new_node();
    unsafe { rt.barrier().write_static_field(slot, sticky, false) };
    rt.add_vm_root(RootType::InternedString, interned);
    let handle = rt.new_global_ref(global);

    let loader_roots = collect(&fixture, VisitRootFlags::ALL_ROOTS | VisitRootFlags::CLASS_LOADER);
    assert_eq!(loader_roots, vec![(sticky, RootInfo::global(RootType::StickyClass))]);

    let all: Vec<ObjRef> = collect(&fixture, VisitRootFlags::ALL_ROOTS)
        .into_iter()
        .map(|(obj, _)| obj)
        .collect();
    for obj in [sticky, interned, global] {
        assert!(all.contains(&obj));
    }

    unsafe { rt.barrier().write_static_field(slot, 0, false) };
    rt.remove_vm_root(RootType::InternedString, interned);
    rt.delete_global_ref(handle);
    for obj in [sticky, interned, global] {
        rt.rc().dec_ref(obj);
    }
    assert_eq!(rt.total_heap_obj(), 0);
}

#[test]
fn test_try_visit_reports_busy_lock() {
    let fixture = RuntimeFixture::with_defaults();
    let rt = fixture.rt.clone();
    let guard = rt.threads().lock().lock().unwrap();

    let other = std::thread::spawn({
        let rt = rt.clone();
        move || rt.try_visit_roots(VisitRootFlags::ALL_ROOTS, &mut |_: ObjRef, _: &RootInfo| {})
    });
    assert!(!other.join().unwrap(), "lock held elsewhere");

    drop(guard);
    assert!(rt.try_visit_roots(VisitRootFlags::ALL_ROOTS, &mut |_: ObjRef, _: &RootInfo| {}));
}

#[test]
#[should_panic(expected = "thread list lock re-entered")]
fn test_visiting_from_a_visitor_is_fatal() {
    let fixture = RuntimeFixture::with_defaults();
    let rt = &fixture.rt;
    let obj = fixture.new_node();
    let _handle = rt.new_global_ref(obj);
    rt.visit_roots(VisitRootFlags::ALL_ROOTS, &mut |_: ObjRef, _: &RootInfo| {
        rt.visit_roots(VisitRootFlags::ALL_ROOTS, &mut |_: ObjRef, _: &RootInfo| {});
    });
}

#[test]
fn test_weak_globals_cleared_after_release() {
    let fixture = RuntimeFixture::with_defaults();
    let rt = &fixture.rt;
    let obj = fixture.new_node();
    let weak = rt.new_weak_global_ref(obj);

    let mut visited = Vec::new();
    rt.visit_weak_global_roots(|o| visited.push(o));
    assert_eq!(visited, vec![obj]);

    rt.rc().dec_ref(obj);
    assert_eq!(rt.decode_weak_global_ref(weak), 0);
    assert!(!fixture.is_freed(obj), "weak global still holds the block");

    assert_eq!(rt.clear_dead_weak_globals(), 1);
    assert!(fixture.is_freed(obj));
    rt.delete_weak_global_ref(weak);
    assert_eq!(rt.total_heap_obj(), 0);
}
