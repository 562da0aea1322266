//! Runtime Module - The managed-memory runtime context
//!
//! [`Runtime`] owns every piece of process-wide state the runtime needs:
//! - the heap and its counters
//! - the class registry
//! - root tables and the attached thread list
//! - the safepoint, the GC coordinator and the tracing collector
//! - the finalizer queue, reference processor and cycle-pattern store
//!
//! Nothing lives in ambient globals. Compiled code and native glue receive
//! a `&Runtime` (or an attached [`Mutator`]) and reach everything through
//! it.
//!
//! ## Lifecycle
//!
//! ```text
//! gc_init_global ──► gc_init_thread_local (per thread) ──► ... ──► Mutator dropped
//!       │                                                            │
//!       └──────────────────────── gc_fini_global ◄───────────────────┘
//! ```

pub mod alloc;
pub mod diagnostics;
pub mod finalizer;
pub mod mutator;
pub mod safepoint;

pub use diagnostics::RuntimeSnapshot;
pub use finalizer::{FinalizerHook, FinalizerQueue};
pub use mutator::Mutator;
pub use safepoint::Safepoint;

use crate::barrier::{FieldBarrier, PreWriteBarrier};
use crate::config::RuntimeConfig;
use crate::error::{MrtError, Result};
use crate::fatal::{AbortHandler, FatalError, FatalReporter};
use crate::gc::{
    Collector, GcCoordinator, GcFinishCallback, GcOutcome, GcReason, GcSummary, TracingCollector,
};
use crate::heap::{HeapOracle, MappedHeap};
use crate::logging::{RuntimeEvent, RuntimeLogger};
use crate::object::{ClassBuilder, ClassMetadata, ClassRegistry, ObjRef, NULL};
use crate::rc::reference::ReferencePass;
use crate::rc::{CycleJob, CyclePatternStore, RcEngine, ReferenceProcessor};
use crate::roots::{
    GlobalRef, MutatorState, RootCensus, RootInfo, RootRegistry, RootType, RootVisitor, ThreadList,
    ThreadListGuard, ThreadRecord, VisitRootFlags, WeakGlobalRef,
};
use crate::stats::{GcStats, GcStatsSnapshot, RcStats, RcStatsSnapshot};
use crate::util::current_thread_id;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runtime - the managed-memory runtime context
///
/// # Thread Safety
///
/// `Runtime` is `Send + Sync`. Threads that touch managed memory while a
/// collection may run must attach with [`Runtime::gc_init_thread_local`].
///
/// # Examples
///
/// ```rust
/// use mrt::{GcReason, Runtime, RuntimeConfig};
///
/// let rt = Runtime::new(RuntimeConfig::default()).unwrap();
/// let obj = rt.new_obj(64, 8).unwrap();
/// let handle = rt.new_global_ref(obj);
/// rt.rc().dec_ref(obj);
///
/// assert!(rt.gc_start(GcReason::ForceGC).is_completed());
/// assert!(rt.heap().is_allocated(obj), "global reference keeps it");
///
/// rt.delete_global_ref(handle);
/// assert!(!rt.heap().is_allocated(obj));
/// ```
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) logger: RuntimeLogger,
    pub(crate) reporter: FatalReporter,

    pub(crate) heap: Box<dyn HeapOracle>,
    pub(crate) classes: ClassRegistry,

    pub(crate) rc_stats: RcStats,
    pub(crate) gc_stats: GcStats,
    pub(crate) satb: PreWriteBarrier,

    pub(crate) roots: RootRegistry,
    pub(crate) threads: ThreadList,
    pub(crate) safepoint: Safepoint,

    pub(crate) coordinator: GcCoordinator,
    pub(crate) collector: Box<dyn Collector>,
    pub(crate) cycles: CyclePatternStore,
    pub(crate) references: ReferenceProcessor,
    pub(crate) finalizers: FinalizerQueue,

    /// Set by `gc_fini_global`
    finalized: AtomicBool,
}

impl Runtime {
    /// Create a runtime with the bundled heap and collector
    ///
    /// # Returns
    /// `Configuration` for an invalid config, `HeapInitialization` if the
    /// heap or polling page cannot be mapped
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let collector = Box::new(TracingCollector::new(config.effective_gc_threads()));
        Self::with_collector(config, collector)
    }

    /// Create a runtime driving an external tracing engine
    pub fn with_collector(config: RuntimeConfig, collector: Box<dyn Collector>) -> Result<Self> {
        config.validate()?;
        let heap = Box::new(MappedHeap::new(&config)?);
        Self::with_parts(config, heap, collector)
    }

    /// Create a runtime from an explicit heap and collector
    pub fn with_parts(
        config: RuntimeConfig,
        heap: Box<dyn HeapOracle>,
        collector: Box<dyn Collector>,
    ) -> Result<Self> {
        config.validate()?;
        let classes = ClassRegistry::with_bootstrap_classes()?;
        let safepoint = Safepoint::new()?;

        log::info!(
            "runtime initialised: heap [{:#x}, {:#x}), collector {}, {} bootstrap classes",
            heap.lower_bound(),
            heap.upper_bound(),
            collector.name(),
            classes.len()
        );

        Ok(Self {
            logger: RuntimeLogger::new(config.logger.clone()),
            reporter: FatalReporter::default(),
            heap,
            classes,
            rc_stats: RcStats::new(),
            gc_stats: GcStats::new(),
            satb: PreWriteBarrier::new(),
            roots: RootRegistry::new(),
            threads: ThreadList::new(),
            safepoint,
            coordinator: GcCoordinator::new(&config),
            collector,
            cycles: CyclePatternStore::new(config.cycle_candidate_limit),
            references: ReferenceProcessor::new(),
            finalizers: FinalizerQueue::new(),
            finalized: AtomicBool::new(false),
            config,
        })
    }

    /// Create a shared runtime and start its reference processor thread
    pub fn gc_init_global(config: RuntimeConfig) -> Result<Arc<Self>> {
        let rt = Arc::new(Self::new(config)?);
        rt.start_reference_daemon()?;
        Ok(rt)
    }

    /// Shut the runtime down
    ///
    /// Stops the reference processor, runs every pending finalizer and the
    /// queued cycle-pattern jobs. Threads can no longer attach afterwards.
    pub fn gc_fini_global(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.with_saferegion(|| self.references.stop(true));
        let finalized = self.run_finalization();
        let jobs = self.cycles.run_pending_jobs(&self.logger);
        log::info!(
            "runtime finalized: {} finalizers run, {} cycle-pattern jobs run",
            finalized,
            jobs
        );
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    // ========================================================================
    // Fatal errors
    // ========================================================================

    /// Report a fatal invariant violation and never return
    pub(crate) fn fatal(&self, err: FatalError) -> ! {
        self.reporter.fatal(err, |out| self.write_fatal_dump(out))
    }

    /// Replace the handler run after a fatal violation is reported
    pub fn set_abort_handler(&self, handler: AbortHandler) {
        self.reporter.set_handler(handler);
    }

    /// Fatal violations reported so far
    pub fn fatal_count(&self) -> u64 {
        self.reporter.reported()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &dyn HeapOracle {
        &*self.heap
    }

    /// Reference-count operations
    #[inline]
    pub fn rc(&self) -> RcEngine<'_> {
        RcEngine::new(self)
    }

    /// Field barriers
    #[inline]
    pub fn barrier(&self) -> FieldBarrier<'_> {
        FieldBarrier::new(self)
    }

    pub fn rc_stats(&self) -> RcStatsSnapshot {
        self.rc_stats.snapshot()
    }

    /// Zero every reference-count counter
    pub fn reset_rc_stats(&self) {
        self.rc_stats.reset();
    }

    pub fn gc_stats(&self) -> GcStatsSnapshot {
        self.gc_stats.snapshot()
    }

    pub fn satb(&self) -> &PreWriteBarrier {
        &self.satb
    }

    pub fn cycles(&self) -> &CyclePatternStore {
        &self.cycles
    }

    pub fn logger(&self) -> &RuntimeLogger {
        &self.logger
    }

    pub fn roots(&self) -> &RootRegistry {
        &self.roots
    }

    pub fn threads(&self) -> &ThreadList {
        &self.threads
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub fn references(&self) -> &ReferenceProcessor {
        &self.references
    }

    pub fn finalizers(&self) -> &FinalizerQueue {
        &self.finalizers
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn coordinator(&self) -> &GcCoordinator {
        &self.coordinator
    }

    pub fn collector(&self) -> &dyn Collector {
        &*self.collector
    }

    /// Address of the page read by compiled yieldpoints
    pub fn polling_page(&self) -> usize {
        self.safepoint.polling_page()
    }

    // ========================================================================
    // Classes
    // ========================================================================

    /// Register a class and its static reference slots
    ///
    /// Reference-typed statics become `StickyClass` roots.
    pub fn register_class(&self, builder: ClassBuilder) -> Result<Arc<ClassMetadata>> {
        let class = self.classes.register(builder)?;
        let slots: Vec<usize> = class.static_ref_slots().collect();
        if !slots.is_empty() {
            self.roots.add_static_slots(&slots);
        }
        Ok(class)
    }

    /// Look up a registered class by name
    pub fn class(&self, name: &str) -> Result<Arc<ClassMetadata>> {
        self.classes.require(name)
    }

    // ========================================================================
    // Thread attachment
    // ========================================================================

    /// Attach the calling thread as a mutator
    ///
    /// The record is inserted while the thread is still marked safe, so a
    /// collection that is already waiting never counts it as running.
    ///
    /// # Returns
    /// `InvalidState` if the thread is already attached or the runtime has
    /// been finalized
    pub fn gc_init_thread_local(&self, is_main: bool) -> Result<Mutator<'_>> {
        if self.is_finalized() {
            return Err(MrtError::InvalidState {
                expected: "running runtime".to_string(),
                actual: "finalized".to_string(),
            });
        }

        let record = Arc::new(ThreadRecord::new(current_thread_id(), is_main));
        record.set_state(MutatorState::Saferegion);
        {
            let guard = self.lock_thread_list();
            if !self.threads.insert(&guard, Arc::clone(&record)) {
                return Err(MrtError::InvalidState {
                    expected: "detached thread".to_string(),
                    actual: format!("thread {} already attached", record.tid()),
                });
            }
        }
        self.safepoint.leave_saferegion(&record);
        log::debug!("thread {} attached (main: {})", record.tid(), is_main);
        Ok(Mutator::new(self, record))
    }

    /// Detach a mutator, dropping every root it owns
    pub fn gc_fini_thread_local(&self, mutator: Mutator<'_>) {
        mutator.detach();
    }

    fn lock_thread_list(&self) -> ThreadListGuard<'_> {
        match self.threads.lock().lock() {
            Ok(guard) => guard,
            Err(err) => self.fatal(err),
        }
    }

    /// Run `f` with the calling mutator (if any) inside a safe region
    ///
    /// Used around every wait that may outlast a collection request.
    pub(crate) fn with_saferegion<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.threads.current() {
            Some(record) if record.state() == MutatorState::Running => {
                self.safepoint.enter_saferegion(&record);
                let result = f();
                self.safepoint.leave_saferegion(&record);
                result
            },
            _ => f(),
        }
    }

    // ========================================================================
    // Root visitation
    // ========================================================================

    /// Visit roots selected by `flags`, waiting for the thread-list lock
    ///
    /// Re-entrant use from inside a visitor is fatal.
    pub fn visit_roots(&self, flags: VisitRootFlags, visitor: &mut dyn RootVisitor) {
        let guard = self.lock_thread_list();
        self.visit_roots_locked(&guard, flags, visitor);
    }

    /// Visit roots only if the thread-list lock is free
    ///
    /// # Returns
    /// `false` if the lock was busy and nothing was visited
    pub fn try_visit_roots(&self, flags: VisitRootFlags, visitor: &mut dyn RootVisitor) -> bool {
        match self.threads.lock().try_lock() {
            Ok(Some(guard)) => {
                self.visit_roots_locked(&guard, flags, visitor);
                true
            },
            Ok(None) => false,
            Err(err) => self.fatal(err),
        }
    }

    fn visit_roots_locked(
        &self,
        _guard: &ThreadListGuard<'_>,
        flags: VisitRootFlags,
        visitor: &mut dyn RootVisitor,
    ) {
        let full = flags.visits_all() && !flags.contains(VisitRootFlags::CLASS_LOADER);

        if full {
            for record in self.threads.snapshot() {
                record.visit_roots(visitor);
            }
        }

        if flags.visits_all() {
            self.roots.visit(flags, visitor);
        } else {
            let mut thread_roots = |census: &mut RootCensus| {
                for record in self.threads.snapshot() {
                    record.visit_roots(census);
                }
            };
            self.roots
                .visit_with_thread_roots(flags, &mut thread_roots, visitor);
        }

        if full {
            let finalizing = RootInfo::global(RootType::Finalizing);
            for obj in self.finalizers.held_objects() {
                visitor.visit_root(obj, &finalizing);
            }
            let cleanup = RootInfo::global(RootType::ReferenceCleanup);
            for obj in self.references.queued() {
                visitor.visit_root(obj, &cleanup);
            }
        }

        self.roots.apply_log_flags(flags);
    }

    // ========================================================================
    // Native-interface roots
    // ========================================================================

    /// Create a global reference, taking one count on `obj`
    pub fn new_global_ref(&self, obj: ObjRef) -> GlobalRef {
        self.rc().inc_ref(obj);
        self.roots.add_global(obj)
    }

    /// Delete a global reference, dropping its count
    pub fn delete_global_ref(&self, handle: GlobalRef) {
        if let Some(obj) = self.roots.remove_global(handle) {
            self.rc().dec_ref(obj);
        }
    }

    /// Object behind a global reference, without taking a count
    pub fn global_ref(&self, handle: GlobalRef) -> ObjRef {
        self.roots.global(handle).unwrap_or(NULL)
    }

    /// Create a weak global reference, taking one weak count on `obj`
    pub fn new_weak_global_ref(&self, obj: ObjRef) -> WeakGlobalRef {
        self.rc().weak_inc(obj);
        self.roots.add_weak_global(obj)
    }

    pub fn delete_weak_global_ref(&self, handle: WeakGlobalRef) {
        if let Some(obj) = self.roots.remove_weak_global(handle) {
            self.rc().weak_dec(obj);
        }
    }

    /// Resolve a weak global reference
    ///
    /// # Returns
    /// The object with one strong count owned by the caller, or null if it
    /// has been released
    pub fn decode_weak_global_ref(&self, handle: WeakGlobalRef) -> ObjRef {
        let Some(slot) = self.roots.weak_global_slot(handle) else {
            return NULL;
        };
        let obj = slot.lock();
        if *obj != NULL && self.rc().inc_resurrect_weak(*obj) {
            *obj
        } else {
            NULL
        }
    }

    /// Visit live weak global roots while mutators may clear them
    pub fn visit_weak_global_roots(&self, mut visitor: impl FnMut(ObjRef)) {
        self.roots.visit_weak_globals_concurrent(
            |obj| {
                visitor(obj);
                true
            },
            |_| {},
        );
    }

    /// Clear weak globals whose target has been released
    ///
    /// # Returns
    /// Number of slots cleared
    pub fn clear_dead_weak_globals(&self) -> usize {
        let mut cleared = Vec::new();
        self.roots.visit_weak_globals(
            |obj| !unsafe { crate::object::get_header(obj) }.is_released(),
            |obj| cleared.push(obj),
        );
        for &obj in &cleared {
            self.rc().weak_dec(obj);
        }
        cleared.len()
    }

    /// Register a VM-internal root, taking one count on `obj`
    pub fn add_vm_root(&self, root_type: RootType, obj: ObjRef) {
        self.rc().inc_ref(obj);
        self.roots.add_vm_root(root_type, obj);
    }

    pub fn remove_vm_root(&self, root_type: RootType, obj: ObjRef) -> bool {
        let removed = self.roots.remove_vm_root(root_type, obj);
        if removed {
            self.rc().dec_ref(obj);
        }
        removed
    }

    /// Drop every VM-internal root and its count
    pub fn clear_vm_roots(&self) -> usize {
        let roots = self.roots.drain_vm_roots();
        for &(_, obj) in &roots {
            self.rc().dec_ref(obj);
        }
        roots.len()
    }

    /// Register static reference slots as roots
    ///
    /// The slots are read at every visit; stores into them go through the
    /// static field barriers.
    pub fn register_gc_roots(&self, slots: &[usize]) {
        self.roots.add_static_slots(slots);
    }

    // ========================================================================
    // GC coordination
    // ========================================================================

    /// Request a collection
    ///
    /// Runs the cycle on the calling thread. Blocking reasons wait for a
    /// running cycle to finish; the others give up. Finalizers never run
    /// here; they run on the reference processor or via
    /// [`Runtime::run_finalization`]. Cycle-pattern jobs and the finish
    /// callback run after the caller has left its safe region, so they may
    /// touch managed memory.
    pub fn gc_start(&self, reason: GcReason) -> GcOutcome {
        if !self.coordinator.is_trigger_gc_enabled() {
            return GcOutcome::Disabled;
        }
        if self.coordinator.is_gc_thread() {
            return GcOutcome::AlreadyRunning;
        }

        // An attached caller waits for the GC lock and the cycle inside a
        // safe region, so the stop-the-world wait does not count it.
        let Some(_exclusive) = self.with_saferegion(|| self.coordinator.acquire(reason)) else {
            return GcOutcome::AlreadyRunning;
        };
        let outcome = self.with_saferegion(|| self.start_cycle(reason));
        if let GcOutcome::Completed(summary) = &outcome {
            self.finish_cycle(summary);
        }
        outcome
    }

    fn start_cycle(&self, reason: GcReason) -> GcOutcome {
        if let Err(since_last_ms) = self.coordinator.check_throttle(reason, &self.config) {
            self.gc_stats.record_throttled();
            self.logger.log(RuntimeEvent::GcThrottled {
                reason: reason.to_string(),
                since_last_ms,
            });
            return GcOutcome::Throttled;
        }
        self.coordinator.record_trigger(reason);
        self.logger.log(RuntimeEvent::GcTriggered {
            reason: reason.to_string(),
        });

        self.run_cycle(reason)
    }

    fn run_cycle(&self, reason: GcReason) -> GcOutcome {
        let cycle = self.coordinator.begin_cycle();
        let start = Instant::now();

        self.safepoint.request_safepoint();
        let timeout_ms = self.config.safepoint_timeout_ms;
        if let Err(waiting_threads) = self
            .safepoint
            .wait_for_safepoint(&self.threads, Duration::from_millis(timeout_ms))
        {
            self.safepoint.release_safepoint();
            self.gc_stats.record_timeout();
            log::warn!(
                "GC cycle {} ({}) abandoned: {} thread(s) missed the safepoint",
                cycle,
                reason,
                waiting_threads
            );
            self.logger.log(RuntimeEvent::SafepointTimeout {
                waiting_threads,
                timeout_ms,
            });
            self.coordinator.end_cycle();
            return GcOutcome::Aborted;
        }

        self.logger.log(RuntimeEvent::CycleStart {
            cycle,
            reason: reason.to_string(),
        });
        let result = self.collector.collect(self, reason);
        self.clear_dead_weak_globals();
        let immediate = self.references.is_immediate();
        if immediate {
            self.process_references();
        }
        self.safepoint.release_safepoint();

        let pause = start.elapsed();
        let pause_us = pause.as_micros() as u64;
        self.gc_stats.record_cycle(
            reason.index(),
            pause_us,
            result.reclaimed.objects,
            result.reclaimed.bytes,
        );
        self.logger.log(RuntimeEvent::CycleEnd {
            cycle,
            duration_ms: pause.as_secs_f64() * 1000.0,
            reclaimed_objects: result.reclaimed.objects,
            reclaimed_bytes: result.reclaimed.bytes as usize,
        });

        let stats = self.heap.stats();
        stats.reset_gc_window();
        self.coordinator
            .update_threshold(stats.live_bytes(), &self.config);

        if !immediate {
            self.references.trigger();
        }

        GcOutcome::Completed(GcSummary {
            cycle,
            reason,
            reclaimed_objects: result.reclaimed.objects,
            reclaimed_bytes: result.reclaimed.bytes,
            pause_us,
        })
    }

    /// Post-cycle work, run outside the caller's safe region while the GC
    /// lock is still held
    fn finish_cycle(&self, summary: &GcSummary) {
        self.cycles.run_pending_jobs(&self.logger);
        self.coordinator.notify_finished(summary);
        self.coordinator.end_cycle();
    }

    pub fn set_trigger_gc_enabled(&self, enabled: bool) {
        self.coordinator.set_trigger_gc_enabled(enabled);
    }

    pub fn is_trigger_gc_enabled(&self) -> bool {
        self.coordinator.is_trigger_gc_enabled()
    }

    pub fn set_allow_user_gc_before_oom(&self, allow: bool) {
        self.coordinator.set_allow_user_gc_before_oom(allow);
    }

    pub fn is_allow_user_gc_before_oom(&self) -> bool {
        self.coordinator.is_allow_user_gc_before_oom()
    }

    /// Check whether the calling thread is running a collection
    pub fn is_gc_thread(&self) -> bool {
        self.coordinator.is_gc_thread()
    }

    pub fn is_gc_running(&self) -> bool {
        self.coordinator.is_gc_running()
    }

    /// Wait for the running collection (if any) to finish
    ///
    /// The wait is bounded by `gc_wait_timeout_ms`; an attached caller
    /// waits inside a safe region.
    ///
    /// # Returns
    /// `false` if the timeout expired first
    pub fn wait_gc_stopped(&self) -> bool {
        if self.is_gc_thread() {
            return true;
        }
        let timeout = Duration::from_millis(self.config.gc_wait_timeout_ms);
        self.with_saferegion(|| self.coordinator.wait_stopped(timeout))
    }

    /// Install (or remove) the callback run after every completed cycle
    pub fn set_gc_finish_callback(&self, callback: Option<GcFinishCallback>) {
        self.coordinator.set_finish_callback(callback);
    }

    /// Completed cycles and the longest pause in milliseconds
    pub fn gc_counts(&self) -> (u64, u64) {
        (self.gc_stats.cycles(), self.gc_stats.max_pause_us() / 1000)
    }

    // ========================================================================
    // Cycle-pattern jobs
    // ========================================================================

    /// Queue a job for the cycle-pattern store; it runs after the next cycle
    pub fn send_cycle_pattern_job(&self, job: CycleJob) {
        self.cycles.send_job(job);
    }

    /// Save the learned patterns after every cycle
    pub fn set_periodic_save_job(&self, enabled: bool) {
        self.cycles.set_periodic_save(enabled);
    }

    /// Learn from recorded patterns after every cycle
    pub fn set_periodic_learn_job(&self, enabled: bool) {
        self.cycles.set_periodic_learn(enabled);
    }

    pub fn send_save_cp_job(&self) {
        self.cycles.send_job(CycleJob::Save);
    }

    pub fn is_cycle_pattern_updated(&self) -> bool {
        self.cycles.is_updated()
    }

    pub fn has_dynamic_load_pattern(&self, class: &str) -> bool {
        self.cycles.has_dynamic_load_pattern(class)
    }

    pub fn set_has_dynamic_load_pattern(&self, class: &str) {
        self.cycles.set_has_dynamic_load_pattern(class);
    }

    /// Run queued cycle-pattern jobs now
    pub fn run_cycle_pattern_jobs(&self) -> usize {
        self.cycles.run_pending_jobs(&self.logger)
    }

    // ========================================================================
    // Reference processing and finalization
    // ========================================================================

    /// Process references at the end of every cycle (`true`) or on the
    /// processor thread (`false`)
    pub fn set_reference_process_mode(&self, immediate: bool) {
        self.references.set_immediate(immediate);
    }

    /// Wake the reference processor thread
    ///
    /// # Returns
    /// `false` if no processor thread is running
    pub fn trigger_ref_processor(&self) -> bool {
        self.references.trigger()
    }

    /// Run one reference-processing pass on the calling thread
    pub fn process_references(&self) -> ReferencePass {
        let pass = self.references.process(self);
        self.logger.log(RuntimeEvent::ReferenceStats {
            cleared: pass.cleared,
            enqueued: pass.enqueued,
            finalizers_processed: self.rc_stats.finalizers_run.load(Ordering::Relaxed),
        });
        pass
    }

    pub fn is_ref_processor_working(&self) -> bool {
        self.references.is_working()
    }

    /// Stop the reference processor thread
    ///
    /// With `finalize_on_stop`, pending finalizers run before it exits.
    pub fn stop_process_references(&self, finalize_on_stop: bool) {
        self.with_saferegion(|| self.references.stop(finalize_on_stop));
    }

    /// Start the reference processor thread
    pub fn start_reference_daemon(self: &Arc<Self>) -> Result<()> {
        self.references
            .start_daemon(Arc::clone(self))
            .map_err(|e| MrtError::ResourceExhausted {
                resource: format!("reference processor thread: {}", e),
            })
    }

    /// Run every pending finalizer on the calling thread
    ///
    /// # Returns
    /// Number of objects finalized
    pub fn run_finalization(&self) -> usize {
        self.finalizers.run(self)
    }

    /// Install the language-level finalizer
    pub fn set_finalizer_hook(&self, hook: FinalizerHook) {
        self.finalizers.set_hook(hook);
    }

    /// Take the next enqueued reference; the caller owns its count
    pub fn poll_reference_queue(&self) -> ObjRef {
        self.references.poll().unwrap_or(NULL)
    }

    /// Log the sizes of the reference and finalizer queues
    pub fn log_refqueues_size(&self) {
        log::info!(
            "reference queues: {} registered, {} enqueued, {} awaiting finalization",
            self.references.registered_count(),
            self.references.queue_len(),
            self.finalizers.pending_count()
        );
    }
}
