//! Runtime Logging and Tracing
//!
//! Structured event log for collector and reference-count activity, used for:
//! - Post-mortem analysis of GC trigger decisions
//! - Tests that assert a policy path was taken
//! - Human or JSON console output when `verbose` is set
//!
//! Every event is also forwarded to the `log` facade at its level, so an
//! embedding application sees the same stream through its own logger.
//!
//! Log Levels:
//! - ERROR: Allocation failures
//! - WARN: Throttled triggers, safe-point timeouts
//! - INFO: GC cycles
//! - DEBUG: Policy decisions (rejected referent stores, cycle-pattern jobs)
//! - TRACE: Per-object operations

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for runtime events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Runtime event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// A collection was requested and accepted
    GcTriggered { reason: String },

    /// A collection request was dropped by the per-reason throttle
    GcThrottled { reason: String, since_last_ms: u64 },

    /// GC cycle started
    CycleStart { cycle: u64, reason: String },

    /// GC cycle completed
    CycleEnd {
        cycle: u64,
        duration_ms: f64,
        reclaimed_objects: u64,
        reclaimed_bytes: usize,
    },

    /// Allocation failure after the OOM collection and retry
    AllocationFailure { size: usize, heap_used: usize },

    /// Mutators did not reach a safe point in time
    SafepointTimeout { waiting_threads: usize, timeout_ms: u64 },

    /// A deferred cycle-pattern job ran
    CyclePatternJob { job: String, patterns: usize },

    /// A finalizer completed for an object
    ObjectFinalized { address: usize, class: String },

    /// A referent store into a cleared reference was rejected
    ReferentStoreRejected { reference: usize, referent: usize },

    /// Reference processing pass completed
    ReferenceStats {
        cleared: u64,
        enqueued: u64,
        finalizers_processed: u64,
    },
}

/// Runtime logger configuration
#[derive(Debug, Clone)]
pub struct RuntimeLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,

    /// Maximum number of stored events; older events are dropped
    pub capacity: usize,
}

impl Default for RuntimeLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            console: false,
            json: false,
            timestamps: true,
            capacity: 4096,
        }
    }
}

/// Runtime logger - structured event log owned by the runtime context
pub struct RuntimeLogger {
    config: RuntimeLoggerConfig,
    events: Mutex<Vec<(Instant, RuntimeEvent)>>,
    enabled: AtomicBool,
}

impl RuntimeLogger {
    /// Create new runtime logger
    pub fn new(config: RuntimeLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable logging
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable logging
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a runtime event
    pub fn log(&self, event: RuntimeEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = Self::event_level(&event);
        if level > self.config.level {
            return;
        }

        log::log!(level.to_log(), "{}", Self::human(&event));

        if self.config.console {
            self.output_console(&event);
        }

        let mut events = self.events.lock();
        if events.len() >= self.config.capacity && !events.is_empty() {
            events.remove(0);
        }
        events.push((Instant::now(), event));
    }

    /// Get log level for event
    fn event_level(event: &RuntimeEvent) -> LogLevel {
        match event {
            RuntimeEvent::AllocationFailure { .. } => LogLevel::Error,
            RuntimeEvent::GcThrottled { .. } | RuntimeEvent::SafepointTimeout { .. } => {
                LogLevel::Warn
            },
            RuntimeEvent::GcTriggered { .. }
            | RuntimeEvent::CycleStart { .. }
            | RuntimeEvent::CycleEnd { .. }
            | RuntimeEvent::ReferenceStats { .. } => LogLevel::Info,
            RuntimeEvent::CyclePatternJob { .. } | RuntimeEvent::ReferentStoreRejected { .. } => {
                LogLevel::Debug
            },
            RuntimeEvent::ObjectFinalized { .. } => LogLevel::Trace,
        }
    }

    /// Output to console
    fn output_console(&self, event: &RuntimeEvent) {
        let prefix = if self.config.timestamps {
            format!("[{}] ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        if self.config.json {
            if let Ok(json_str) = serde_json::to_string(event) {
                println!("{}{}", prefix, json_str);
            }
        } else {
            println!("{}{}", prefix, Self::human(event));
        }
    }

    /// Render in human-readable format
    fn human(event: &RuntimeEvent) -> String {
        match event {
            RuntimeEvent::GcTriggered { reason } => format!("[GC] Triggered (reason: {})", reason),
            RuntimeEvent::GcThrottled {
                reason,
                since_last_ms,
            } => format!(
                "[GC] Trigger throttled (reason: {}, {}ms since last)",
                reason, since_last_ms
            ),
            RuntimeEvent::CycleStart { cycle, reason } => {
                format!("[GC] Cycle {} started (reason: {})", cycle, reason)
            },
            RuntimeEvent::CycleEnd {
                cycle,
                duration_ms,
                reclaimed_objects,
                reclaimed_bytes,
            } => format!(
                "[GC] Cycle {} completed ({:.2}ms, reclaimed {} objects / {} bytes)",
                cycle, duration_ms, reclaimed_objects, reclaimed_bytes
            ),
            RuntimeEvent::AllocationFailure { size, heap_used } => format!(
                "[GC] Allocation failure: {} bytes (heap used: {})",
                size, heap_used
            ),
            RuntimeEvent::SafepointTimeout {
                waiting_threads,
                timeout_ms,
            } => format!(
                "[GC] Safe point not reached by {} threads within {}ms",
                waiting_threads, timeout_ms
            ),
            RuntimeEvent::CyclePatternJob { job, patterns } => {
                format!("[RC] Cycle pattern job {} ({} patterns)", job, patterns)
            },
            RuntimeEvent::ObjectFinalized { address, class } => {
                format!("[RC] Finalized {:#x} ({})", address, class)
            },
            RuntimeEvent::ReferentStoreRejected {
                reference,
                referent,
            } => format!(
                "[RC] Referent store {:#x} -> {:#x} rejected: reference already cleared",
                reference, referent
            ),
            RuntimeEvent::ReferenceStats {
                cleared,
                enqueued,
                finalizers_processed,
            } => format!(
                "[GC] References: {} cleared, {} enqueued, {} finalizers",
                cleared, enqueued, finalizers_processed
            ),
        }
    }

    /// Get all events
    pub fn get_events(&self) -> Vec<(Instant, RuntimeEvent)> {
        self.events.lock().clone()
    }

    /// Count stored events matching a predicate
    pub fn count_matching(&self, pred: impl Fn(&RuntimeEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|(_, e)| pred(e)).count()
    }

    /// Clear all events
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Get event count
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for RuntimeLogger {
    fn default() -> Self {
        Self::new(RuntimeLoggerConfig::default())
    }
}
