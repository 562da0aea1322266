//! GC Module - Collection triggering and coordination
//!
//! Reference counting frees most objects immediately; a tracing cycle is
//! only needed for reference cycles and for out-of-memory recovery. This
//! module decides *when* a cycle runs:
//!
//! - **Trigger reasons** ([`GcReason`]) - user request, heuristic heap
//!   growth, out-of-memory, native allocation pressure, forced
//! - **Throttle** - user-requested collections run at most once per
//!   `min_user_trigger_interval` (120 s by default) and native-pressure
//!   collections once per `min_native_trigger_interval`. Forced, OOM and
//!   heuristic collections bypass it.
//! - **Exclusion** - one cycle at a time. Blocking reasons wait for a
//!   running cycle to finish; the others return immediately.
//! - **Rendezvous** - [`GcCoordinator::wait_stopped`] is a bounded wait for
//!   the collector to become idle.
//!
//! *How* a cycle collects is behind the [`Collector`] seam.

pub mod collector;

pub use collector::{CollectionResult, Collector, TracingCollector};

use crate::config::RuntimeConfig;
use crate::stats::GC_REASON_COUNT;
use crate::util::current_thread_id;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a collection was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum GcReason {
    /// Explicit request; the caller waits for the cycle
    User = 0,
    /// Explicit request made only if the heap looks worth collecting
    UserCheck = 1,
    /// Explicit request; the caller does not wait
    UserNi = 2,
    /// Allocation failed; bypasses the throttle
    Oom = 3,
    /// Allocation crossed the growth threshold
    Heuristic = 4,
    /// Forced by the runtime or tests; bypasses the throttle
    ForceGC = 5,
    /// Native allocation pressure
    Native = 6,
}

impl GcReason {
    pub const ALL: [GcReason; GC_REASON_COUNT] = [
        GcReason::User,
        GcReason::UserCheck,
        GcReason::UserNi,
        GcReason::Oom,
        GcReason::Heuristic,
        GcReason::ForceGC,
        GcReason::Native,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            GcReason::User => "User",
            GcReason::UserCheck => "UserCheck",
            GcReason::UserNi => "UserNi",
            GcReason::Oom => "OOM",
            GcReason::Heuristic => "Heuristic",
            GcReason::ForceGC => "ForceGC",
            GcReason::Native => "Native",
        }
    }

    /// The requester waits for the cycle to complete
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            GcReason::User | GcReason::UserCheck | GcReason::Oom | GcReason::ForceGC
        )
    }

    /// Minimum time between two accepted triggers of this reason
    pub fn min_interval(self, config: &RuntimeConfig) -> Duration {
        match self {
            GcReason::User | GcReason::UserCheck | GcReason::UserNi => {
                config.min_user_trigger_interval
            },
            GcReason::Native => config.min_native_trigger_interval,
            GcReason::Oom | GcReason::Heuristic | GcReason::ForceGC => Duration::ZERO,
        }
    }
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Summary of a completed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    pub cycle: u64,
    pub reason: GcReason,
    pub reclaimed_objects: u64,
    pub reclaimed_bytes: u64,
    pub pause_us: u64,
}

/// Result of a trigger request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    /// Triggering is disabled
    Disabled,
    /// Dropped by the per-reason throttle
    Throttled,
    /// Another cycle is running and the reason does not wait
    AlreadyRunning,
    /// The cycle ran
    Completed(GcSummary),
    /// Mutators did not reach the safepoint in time
    Aborted,
}

impl GcOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, GcOutcome::Completed(_))
    }
}

/// Collector activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum GcPhase {
    Idle = 0,
    Running = 1,
}

/// Callback run on the collector thread after every completed cycle
pub type GcFinishCallback = Arc<dyn Fn(&GcSummary) + Send + Sync>;

/// Trigger policy and collector exclusion
pub struct GcCoordinator {
    trigger_enabled: AtomicBool,
    allow_user_gc_before_oom: AtomicBool,

    /// Reference point for trigger timestamps
    epoch: Instant,
    /// Nanoseconds since `epoch` plus one; 0 means never
    last_trigger: [AtomicU64; GC_REASON_COUNT],

    /// Held for the whole cycle
    gc_mutex: Mutex<()>,

    phase: AtomicU8,
    phase_lock: Mutex<()>,
    phase_changed: Condvar,
    gc_thread: AtomicU64,

    cycle: AtomicU64,
    /// Bytes allocated since the last cycle that trigger a heuristic GC
    threshold: AtomicUsize,
    finish_callback: RwLock<Option<GcFinishCallback>>,
}

impl GcCoordinator {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            trigger_enabled: AtomicBool::new(config.trigger_gc_enabled),
            allow_user_gc_before_oom: AtomicBool::new(config.allow_user_gc_before_oom),
            epoch: Instant::now(),
            last_trigger: Default::default(),
            gc_mutex: Mutex::new(()),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            phase_lock: Mutex::new(()),
            phase_changed: Condvar::new(),
            gc_thread: AtomicU64::new(0),
            cycle: AtomicU64::new(0),
            threshold: AtomicUsize::new(config.init_gc_threshold),
            finish_callback: RwLock::new(None),
        }
    }

    // === Switches ===

    pub fn set_trigger_gc_enabled(&self, enabled: bool) {
        self.trigger_enabled.store(enabled, Ordering::Release);
    }

    pub fn is_trigger_gc_enabled(&self) -> bool {
        self.trigger_enabled.load(Ordering::Acquire)
    }

    pub fn set_allow_user_gc_before_oom(&self, allow: bool) {
        self.allow_user_gc_before_oom.store(allow, Ordering::Release);
    }

    pub fn is_allow_user_gc_before_oom(&self) -> bool {
        self.allow_user_gc_before_oom.load(Ordering::Acquire)
    }

    // === Throttle ===

    fn now_stamp(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64 + 1
    }

    /// Check the per-reason throttle without recording anything
    ///
    /// # Returns
    /// `Err(ms)` with the time since the last accepted trigger if the
    /// request must be dropped
    pub fn check_throttle(&self, reason: GcReason, config: &RuntimeConfig) -> Result<(), u64> {
        let interval = reason.min_interval(config);
        if interval.is_zero() {
            return Ok(());
        }
        let last = self.last_trigger[reason.index()].load(Ordering::Acquire);
        if last == 0 {
            return Ok(());
        }
        let since = Duration::from_nanos(self.now_stamp().saturating_sub(last));
        if since < interval {
            Err(since.as_millis() as u64)
        } else {
            Ok(())
        }
    }

    /// Remember that `reason` was accepted now
    pub fn record_trigger(&self, reason: GcReason) {
        self.last_trigger[reason.index()].store(self.now_stamp(), Ordering::Release);
    }

    /// Forget every trigger timestamp
    pub fn reset_throttle(&self) {
        for stamp in &self.last_trigger {
            stamp.store(0, Ordering::Release);
        }
    }

    // === Exclusion ===

    /// Acquire the collector lock
    ///
    /// Blocking reasons wait; others give up if a cycle is running.
    pub(crate) fn acquire(&self, reason: GcReason) -> Option<MutexGuard<'_, ()>> {
        if reason.is_blocking() {
            Some(self.gc_mutex.lock())
        } else {
            self.gc_mutex.try_lock()
        }
    }

    /// Enter the running phase on the calling thread
    pub(crate) fn begin_cycle(&self) -> u64 {
        let _guard = self.phase_lock.lock();
        self.gc_thread.store(current_thread_id(), Ordering::Release);
        self.phase.store(GcPhase::Running as u8, Ordering::Release);
        self.cycle.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Return to idle and wake every waiter
    pub(crate) fn end_cycle(&self) {
        let _guard = self.phase_lock.lock();
        self.phase.store(GcPhase::Idle as u8, Ordering::Release);
        self.gc_thread.store(0, Ordering::Release);
        self.phase_changed.notify_all();
    }

    pub fn phase(&self) -> GcPhase {
        if self.phase.load(Ordering::Acquire) == GcPhase::Running as u8 {
            GcPhase::Running
        } else {
            GcPhase::Idle
        }
    }

    pub fn is_gc_running(&self) -> bool {
        self.phase() == GcPhase::Running
    }

    /// Check whether the calling thread is running a cycle
    pub fn is_gc_thread(&self) -> bool {
        self.gc_thread.load(Ordering::Acquire) == current_thread_id()
    }

    /// Wait until no cycle is running
    ///
    /// # Returns
    /// `false` if `timeout` expired first
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.phase_lock.lock();
        while self.is_gc_running() {
            if self
                .phase_changed
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return !self.is_gc_running();
            }
        }
        true
    }

    /// Cycles started so far
    pub fn cycle_count(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    // === Heuristic ===

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Check whether allocation since the last cycle warrants one
    pub fn should_trigger_heuristic(&self, bytes_since_gc: usize) -> bool {
        bytes_since_gc >= self.threshold()
    }

    /// Recompute the heuristic threshold from the live size after a cycle
    ///
    /// The threshold is `max(init_gc_threshold, live * (water_level - 1))`.
    pub fn update_threshold(&self, live_bytes: usize, config: &RuntimeConfig) {
        let grown = (live_bytes as f64 * (config.gc_water_level - 1.0)) as usize;
        self.threshold
            .store(grown.max(config.init_gc_threshold), Ordering::Relaxed);
    }

    // === Completion ===

    pub fn set_finish_callback(&self, callback: Option<GcFinishCallback>) {
        *self.finish_callback.write() = callback;
    }

    pub(crate) fn notify_finished(&self, summary: &GcSummary) {
        let callback = self.finish_callback.read().clone();
        if let Some(callback) = callback {
            callback(summary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_policy() {
        let config = RuntimeConfig::default();
        assert_eq!(GcReason::User.min_interval(&config), Duration::from_secs(120));
        assert!(GcReason::ForceGC.min_interval(&config).is_zero());
        assert!(GcReason::Oom.min_interval(&config).is_zero());
        assert!(GcReason::User.is_blocking());
        assert!(!GcReason::Heuristic.is_blocking());
        assert_eq!(GcReason::Oom.to_string(), "OOM");
        for (i, reason) in GcReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }

    #[test]
    fn test_user_trigger_throttled() {
        let config = RuntimeConfig::default();
        let coordinator = GcCoordinator::new(&config);

        assert!(coordinator.check_throttle(GcReason::User, &config).is_ok());
        coordinator.record_trigger(GcReason::User);
        assert!(coordinator.check_throttle(GcReason::User, &config).is_err());
        assert!(
            coordinator.check_throttle(GcReason::UserCheck, &config).is_ok(),
            "each reason has its own clock"
        );

        coordinator.record_trigger(GcReason::ForceGC);
        assert!(coordinator.check_throttle(GcReason::ForceGC, &config).is_ok());

        coordinator.reset_throttle();
        assert!(coordinator.check_throttle(GcReason::User, &config).is_ok());
    }

    #[test]
    fn test_throttle_interval_expires() {
        let config = RuntimeConfig {
            min_user_trigger_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let coordinator = GcCoordinator::new(&config);
        coordinator.record_trigger(GcReason::User);
        std::thread::sleep(Duration::from_millis(20));
        assert!(coordinator.check_throttle(GcReason::User, &config).is_ok());
    }

    #[test]
    fn test_non_blocking_acquire() {
        let coordinator = GcCoordinator::new(&RuntimeConfig::default());
        let guard = coordinator.acquire(GcReason::User).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| assert!(coordinator.acquire(GcReason::Heuristic).is_none()));
        });
        drop(guard);
        assert!(coordinator.acquire(GcReason::UserNi).is_some());
    }

    #[test]
    fn test_wait_stopped() {
        let coordinator = GcCoordinator::new(&RuntimeConfig::default());
        assert!(coordinator.wait_stopped(Duration::from_millis(1)));

        coordinator.begin_cycle();
        assert!(coordinator.is_gc_running());
        assert!(coordinator.is_gc_thread());
        assert!(!coordinator.wait_stopped(Duration::from_millis(10)));

        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(!coordinator.is_gc_thread());
                assert!(coordinator.wait_stopped(Duration::from_secs(5)));
            });
            std::thread::sleep(Duration::from_millis(10));
            coordinator.end_cycle();
        });
        assert_eq!(coordinator.cycle_count(), 1);
    }

    #[test]
    fn test_threshold_update() {
        let config = RuntimeConfig::default();
        let coordinator = GcCoordinator::new(&config);
        assert_eq!(coordinator.threshold(), config.init_gc_threshold);

        coordinator.update_threshold(1000 * 1024 * 1024, &config);
        let grown = coordinator.threshold();
        assert!((199 * 1024 * 1024..=200 * 1024 * 1024).contains(&grown));
        coordinator.update_threshold(1024, &config);
        assert_eq!(coordinator.threshold(), config.init_gc_threshold);
        assert!(coordinator.should_trigger_heuristic(config.init_gc_threshold));
    }

    #[test]
    fn test_finish_callback() {
        let coordinator = GcCoordinator::new(&RuntimeConfig::default());
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);
        coordinator.set_finish_callback(Some(Arc::new(move |summary: &GcSummary| {
            seen.fetch_add(summary.cycle, Ordering::Relaxed);
        })));

        coordinator.notify_finished(&GcSummary {
            cycle: 3,
            reason: GcReason::ForceGC,
            reclaimed_objects: 0,
            reclaimed_bytes: 0,
            pause_us: 0,
        });
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }
}
