//! MRT Benchmarks
//!
//! Count operations, field barriers, allocation and collection.
//! Run with: `cargo bench --package mrt`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use mrt::object::{ClassBuilder, ClassMetadata, FieldKind};
use mrt::{GcReason, ObjRef, Runtime, RuntimeConfig, MB};
use std::sync::Arc;

fn create_runtime() -> Runtime {
    let config = RuntimeConfig {
        heap_size: 256 * MB,
        heap_start_size: 16 * MB,
        heap_growth_limit: 256 * MB,
        init_gc_threshold: 128 * MB,
        ..Default::default()
    };
    Runtime::new(config).unwrap()
}

fn node_class(rt: &Runtime) -> (Arc<ClassMetadata>, usize) {
    let class = rt
        .register_class(
            ClassBuilder::new("BenchNode")
                .field("next", FieldKind::Ref)
                .field("value", FieldKind::Long),
        )
        .unwrap();
    let next = class.field_offset("next").unwrap();
    (class, next)
}

fn bench_counting(c: &mut Criterion) {
    let mut group = c.benchmark_group("counting");
    let rt = create_runtime();
    let obj = rt.new_obj(64, 8).unwrap();
    let rc = rt.rc();

    group.bench_function("inc_dec_atomic", |b| {
        b.iter(|| {
            rc.inc_ref(black_box(obj));
            rc.dec_ref(black_box(obj));
        })
    });

    group.bench_function("inc_dec_fast", |b| {
        b.iter(|| {
            rc.inc_ref_fast(black_box(obj));
            rc.dec_ref_fast(black_box(obj));
        })
    });

    let perm = rt.perm_new_obj(64, 8).unwrap();
    group.bench_function("inc_dec_permanent", |b| {
        b.iter(|| {
            rc.inc_ref(black_box(perm));
            rc.dec_ref(black_box(perm));
        })
    });

    group.finish();
    rc.dec_ref(obj);
}

fn bench_barriers(c: &mut Criterion) {
    let mut group = c.benchmark_group("barriers");
    let rt = create_runtime();
    let (class, next) = node_class(&rt);
    let holder = rt.new_obj_for_class(&class).unwrap();
    let targets: Vec<ObjRef> = (0..2).map(|_| rt.new_obj_for_class(&class).unwrap()).collect();
    let barrier = rt.barrier();

    group.bench_function("write_ref_field", |b| {
        let mut i = 0;
        b.iter(|| {
            i ^= 1;
            unsafe { barrier.write_ref_field(holder, next, targets[i]) };
        })
    });

    group.bench_function("load_ref_field", |b| {
        b.iter(|| {
            let loaded = unsafe { barrier.load_ref_field(holder, next) };
            rt.rc().dec_ref(black_box(loaded));
        })
    });

    group.bench_function("load_volatile_field_norc", |b| {
        b.iter(|| black_box(unsafe { barrier.load_volatile_field_norc(holder, next) }))
    });

    group.finish();
    for obj in targets.into_iter().chain([holder]) {
        rt.rc().dec_ref(obj);
    }
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    let rt = create_runtime();
    let (class, _) = node_class(&rt);

    for &size in &[32usize, 64, 256, 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("new_free_{}", size), |b| {
            b.iter(|| {
                let obj = rt.new_obj(black_box(size), 8).unwrap();
                rt.rc().dec_ref(obj);
            })
        });
    }

    group.bench_function("new_obj_for_class", |b| {
        b.iter(|| {
            let obj = rt.new_obj_for_class(&class).unwrap();
            rt.rc().dec_ref(obj);
        })
    });

    group.finish();
}

fn bench_release_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("release");
    let rt = create_runtime();
    let (class, next) = node_class(&rt);

    for &len in &[10usize, 1000] {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_function(format!("chain_{}", len), |b| {
            b.iter_batched(
                || {
                    let head = rt.new_obj_for_class(&class).unwrap();
                    let mut tail = head;
                    for _ in 1..len {
                        let node = rt.new_obj_for_class(&class).unwrap();
                        unsafe { rt.barrier().write_ref_field(tail, next, node) };
                        rt.rc().dec_ref(node);
                        tail = node;
                    }
                    head
                },
                |head| rt.rc().dec_ref(head),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection");
    group.sample_size(20);
    let rt = create_runtime();
    let (class, next) = node_class(&rt);

    group.bench_function("reclaim_100_rings", |b| {
        b.iter_batched(
            || {
                for _ in 0..100 {
                    let a = rt.new_obj_for_class(&class).unwrap();
                    let b = rt.new_obj_for_class(&class).unwrap();
                    unsafe {
                        rt.barrier().write_ref_field(a, next, b);
                        rt.barrier().write_ref_field(b, next, a);
                    }
                    rt.rc().dec_ref(a);
                    rt.rc().dec_ref(b);
                }
            },
            |_| black_box(rt.gc_start(GcReason::ForceGC)),
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_counting,
    bench_barriers,
    bench_allocation,
    bench_release_chain,
    bench_collection
);
criterion_main!(benches);
