//! # MRT - Reference-Counted Managed Runtime
//!
//! MRT is the memory core of a managed-language runtime. Objects live in a
//! mapped heap, carry a 32-byte header with strong and weak counts, and are
//! reclaimed the moment their last strong reference goes away. A tracing
//! collector behind the [`gc::Collector`] seam picks up the reference cycles
//! counting alone cannot free.
//!
//! ## Overview
//!
//! - **Object model**: header words, class metadata with self-relative
//!   descriptors, and GC type information describing reference slots
//! - **Field barriers**: every field store of compiled code, with plain,
//!   volatile and ordered variants and a pre-write hook for the collector
//! - **RC engine**: atomic and thread-unsafe counting, weak counts, deferred
//!   release and release through the finalizer queue
//! - **Roots**: per-thread records, global and weak-global references,
//!   VM roots and static fields, visited under the thread-list lock
//! - **GC coordination**: triggers, per-reason throttling, stop-the-world
//!   through the polling page, and completion callbacks
//!
//! ## Quick Start
//!
//! ```rust
//! use mrt::object::{ClassBuilder, FieldKind};
//! use mrt::{GcReason, Runtime, RuntimeConfig};
//!
//! fn main() -> mrt::Result<()> {
//!     let rt = Runtime::new(RuntimeConfig::default())?;
//!     let node = rt.register_class(ClassBuilder::new("Node").field("next", FieldKind::Ref))?;
//!     let next = node.field_offset("next").unwrap();
//!
//!     let _mutator = rt.gc_init_thread_local(true)?;
//!
//!     // Two nodes pointing at each other: a cycle counting cannot free.
//!     let a = rt.new_obj_for_class(&node)?;
//!     let b = rt.new_obj_for_class(&node)?;
//!     unsafe {
//!         rt.barrier().write_ref_field(a, next, b);
//!         rt.barrier().write_ref_field(b, next, a);
//!     }
//!     rt.rc().dec_ref(a);
//!     rt.rc().dec_ref(b);
//!     assert!(rt.heap().is_allocated(a));
//!
//!     // The tracing collector reclaims it.
//!     rt.gc_start(GcReason::ForceGC);
//!     assert!(!rt.heap().is_allocated(a));
//!     Ok(())
//! }
//! ```
//!
//! ## Reference counting
//!
//! ```text
//!   new_obj ──► rc = 1 ──inc/dec──► rc = 0 ──► finalizable? ──yes──► finalizer queue
//!                                     │                                   │
//!                                     ▼                                   ▼
//!                              dec children ◄─────────────────────── finalizer ran
//!                                     │
//!                     weak = 0 ? ─────┴───── weak > 0 ?
//!                        │                        │
//!                      free               weak-collected, freed by
//!                                         the last weak holder
//! ```
//!
//! ## Threads
//!
//! Threads that touch managed memory attach with
//! [`Runtime::gc_init_thread_local`] and keep the returned [`Mutator`] on
//! their stack. Collections stop the world: they arm the polling page and
//! wait until every attached thread is parked at a yieldpoint or inside a
//! safe region.
//!
//! ## Modules
//!
//! - [`barrier`]: Field barriers
//! - [`config`]: Runtime configuration and validation
//! - [`error`]: Recoverable errors
//! - [`fatal`]: Invariant violations and the abort path
//! - [`gc`]: Collection triggers, throttling and the collector seam
//! - [`heap`]: Mapped heap and the heap oracle
//! - [`logging`]: Structured runtime events
//! - [`object`]: Header layout, class metadata and GC type information
//! - [`rc`]: Reference counting, cycle patterns and reference processing
//! - [`roots`]: Root registry and thread list
//! - [`runtime`]: The runtime, mutators, allocation and diagnostics
//! - [`stats`]: Counters and histograms
//! - [`util`]: Alignment and atomic helpers

// Object model and memory
pub mod heap;
pub mod object;

// Reference counting and barriers
pub mod barrier;
pub mod rc;

// Roots and collection
pub mod gc;
pub mod roots;

// Runtime
pub mod config;
pub mod error;
pub mod fatal;
pub mod logging;
pub mod runtime;
pub mod stats;

// Utilities
pub mod util;

pub use config::{RuntimeConfig, KB, MB};
pub use error::{MrtError, Result};
pub use fatal::FatalError;
pub use gc::{GcOutcome, GcReason, GcSummary};
pub use object::{ObjRef, NULL};
pub use roots::{GlobalRef, RootType, VisitRootFlags, WeakGlobalRef};
pub use runtime::{Mutator, Runtime, RuntimeSnapshot};

/// MRT version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize a runtime with configuration read from the environment
///
/// See [`RuntimeConfig::from_env`] for the recognized variables. The
/// reference processor thread is started.
///
/// # Examples
///
/// ```rust
/// let rt = mrt::init()?;
/// let obj = rt.new_obj(64, 8)?;
/// rt.rc().dec_ref(obj);
/// rt.gc_fini_global();
/// # Ok::<(), mrt::MrtError>(())
/// ```
pub fn init() -> Result<std::sync::Arc<Runtime>> {
    Runtime::gc_init_global(RuntimeConfig::from_env())
}
