//! Test Utilities for the MRT integration suite
//!
//! A fixture owns one runtime with a small heap and the panicking abort
//! handler, so fatal violations surface as test failures instead of
//! aborting the test binary.

#![allow(dead_code)]

use mrt::fatal::panic_handler;
use mrt::object::{ClassBuilder, ClassMetadata, FieldKind};
use mrt::{ObjRef, Runtime, RuntimeConfig, KB, MB};
use std::sync::Arc;
use std::time::Duration;

/// Default heap size for tests (16MB)
pub const DEFAULT_HEAP_SIZE: usize = 16 * MB;

/// Maximum time a test waits for background work
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Runtime fixture
// ============================================================================

/// Test fixture for runtime operations
pub struct RuntimeFixture {
    pub rt: Arc<Runtime>,
    /// `Node { next: Ref, other: Ref, value: Long }`
    pub node: Arc<ClassMetadata>,
    pub next: usize,
    pub other: usize,
}

impl RuntimeFixture {
    /// Fixture with address verification and safe-region checks on
    pub fn with_defaults() -> Self {
        Self::with_config(RuntimeConfig {
            heap_size: DEFAULT_HEAP_SIZE,
            heap_start_size: MB,
            heap_growth_limit: DEFAULT_HEAP_SIZE,
            verify_heap_addresses: true,
            check_saferegion: true,
            ..Default::default()
        })
    }

    /// Fixture whose heap holds `heap_size` bytes at most
    pub fn with_heap_size(heap_size: usize) -> Self {
        Self::with_config(RuntimeConfig {
            heap_size,
            heap_start_size: (heap_size / 4).max(64 * KB).min(heap_size),
            heap_growth_limit: heap_size,
            heap_min_free: 64 * KB,
            heap_max_free: 256 * KB,
            ..Default::default()
        })
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let rt = Arc::new(Runtime::new(config).expect("runtime initialization should succeed"));
        rt.set_abort_handler(panic_handler);
        let node = rt
            .register_class(
                ClassBuilder::new("Node")
                    .field("next", FieldKind::Ref)
                    .field("other", FieldKind::Ref)
                    .field("value", FieldKind::Long),
            )
            .expect("Node registers");
        let next = node.field_offset("next").expect("next field");
        let other = node.field_offset("other").expect("other field");
        Self {
            rt,
            node,
            next,
            other,
        }
    }

    /// New `Node`; the caller owns one count
    pub fn new_node(&self) -> ObjRef {
        self.rt
            .new_obj_for_class(&self.node)
            .unwrap_or_else(|e| panic!("Node allocation failed: {}", e))
    }

    /// `from.next = to`, counted
    pub fn link(&self, from: ObjRef, to: ObjRef) {
        unsafe { self.rt.barrier().write_ref_field(from, self.next, to) };
    }

    /// `from.other = to`, counted
    pub fn link_other(&self, from: ObjRef, to: ObjRef) {
        unsafe { self.rt.barrier().write_ref_field(from, self.other, to) };
    }

    /// Build a ring of `n` nodes and drop every external count
    ///
    /// # Returns
    /// The ring members, all unreachable
    pub fn garbage_ring(&self, n: usize) -> Vec<ObjRef> {
        let nodes: Vec<ObjRef> = (0..n).map(|_| self.new_node()).collect();
        for i in 0..n {
            self.link(nodes[i], nodes[(i + 1) % n]);
        }
        for &node in &nodes {
            self.rt.rc().dec_ref(node);
        }
        nodes
    }

    pub fn is_live(&self, obj: ObjRef) -> bool {
        self.rt.is_valid_obj_addr(obj)
    }

    pub fn is_freed(&self, obj: ObjRef) -> bool {
        !self.rt.heap().is_allocated(obj)
    }
}

impl Drop for RuntimeFixture {
    fn drop(&mut self) {
        self.rt.gc_fini_global();
    }
}

// ============================================================================
// Assertion helpers
// ============================================================================

/// Assert every object is still a live object
#[track_caller]
pub fn assert_all_live(fixture: &RuntimeFixture, objects: &[ObjRef], context: &str) {
    for &obj in objects {
        assert!(
            fixture.is_live(obj),
            "{}: object {:#x} was reclaimed while still reachable",
            context,
            obj
        );
    }
}

/// Assert every object has been returned to the heap
#[track_caller]
pub fn assert_all_freed(fixture: &RuntimeFixture, objects: &[ObjRef], context: &str) {
    for &obj in objects {
        assert!(
            fixture.is_freed(obj),
            "{}: object {:#x} is still allocated",
            context,
            obj
        );
    }
}

/// Poll `cond` until it holds or [`TEST_TIMEOUT`] passes
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
