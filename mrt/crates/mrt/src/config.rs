//! Configuration Module - Runtime Tuning Parameters
//!
//! Manages the heap sizing, GC trigger policy and debug checks of the
//! managed runtime. The heap parameters mirror the global GC initialisation
//! call made by the embedding VM at start-up.

use crate::logging::RuntimeLoggerConfig;
use std::time::Duration;

/// Main configuration for the managed runtime
///
/// # Examples
///
/// ```rust
/// use mrt::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     heap_size: 64 * 1024 * 1024,
///     heap_start_size: 16 * 1024 * 1024,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Initial heap footprint in bytes
    ///
    /// Allocation grows the footprint towards `heap_growth_limit`.
    /// Default: 16MB
    pub heap_start_size: usize,

    /// Reserved heap size in bytes
    ///
    /// One anonymous mapping of this size is created at start-up.
    /// Default: 256MB
    pub heap_size: usize,

    /// Soft footprint ceiling
    ///
    /// Footprint grows past this only when `ignore_max_footprint` is set.
    /// Default: heap_size
    pub heap_growth_limit: usize,

    /// Minimum footprint growth step
    ///
    /// Default: 512KB
    pub heap_min_free: usize,

    /// Maximum footprint growth step
    ///
    /// Default: 8MB
    pub heap_max_free: usize,

    /// Target live/footprint ratio (0.0 - 1.0)
    ///
    /// Default: 0.5
    pub heap_target_utilization: f64,

    /// Allow growth up to `heap_size` regardless of `heap_growth_limit`
    ///
    /// Default: false
    pub ignore_max_footprint: bool,

    /// Allocated bytes since the last cycle that trigger a heuristic GC
    ///
    /// Default: 20MB
    pub init_gc_threshold: usize,

    /// Threshold multiplier applied to live bytes after each cycle
    ///
    /// Default: 1.2
    pub gc_water_level: f64,

    /// Minimum interval between blocking (user-requested) collections
    ///
    /// Forced and out-of-memory collections bypass it.
    /// Default: 120s
    pub min_user_trigger_interval: Duration,

    /// Minimum interval between native-allocation-pressure collections
    ///
    /// Default: 1s
    pub min_native_trigger_interval: Duration,

    /// Native bytes that trigger a native-pressure GC
    ///
    /// Default: 80MB
    pub native_gc_threshold: usize,

    /// Accept GC trigger requests at all
    ///
    /// Default: true
    pub trigger_gc_enabled: bool,

    /// Run a user collection before reporting out-of-memory
    ///
    /// Default: true
    pub allow_user_gc_before_oom: bool,

    /// Check safe-region protocol on barrier entry points
    ///
    /// Default: true in debug builds
    pub check_saferegion: bool,

    /// Validate every RC target against the allocation table
    ///
    /// Heap-bound checks always run; this adds the exact membership check.
    /// Default: true in debug builds
    pub verify_heap_addresses: bool,

    /// Bounded wait for mutators to reach a safe point (milliseconds)
    ///
    /// Default: 1000ms
    pub safepoint_timeout_ms: u64,

    /// Bounded wait used by `wait_gc_stopped` (milliseconds)
    ///
    /// Default: 5000ms
    pub gc_wait_timeout_ms: u64,

    /// Maximum number of recorded cycle candidates
    ///
    /// Default: 4096
    pub cycle_candidate_limit: usize,

    /// Number of marking threads used by the bundled collector
    ///
    /// If None, auto-detects: min(4, num_cpus / 2), at least 1.
    pub gc_threads: Option<usize>,

    /// Enable verbose runtime logging
    ///
    /// Default: false
    pub verbose: bool,

    /// Structured event log settings
    pub logger: RuntimeLoggerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_start_size: 16 * MB,
            heap_size: 256 * MB,
            heap_growth_limit: 256 * MB,
            heap_min_free: 512 * KB,
            heap_max_free: 8 * MB,
            heap_target_utilization: 0.5,
            ignore_max_footprint: false,
            init_gc_threshold: 20 * MB,
            gc_water_level: 1.2,
            min_user_trigger_interval: Duration::from_secs(120),
            min_native_trigger_interval: Duration::from_secs(1),
            native_gc_threshold: 80 * MB,
            trigger_gc_enabled: true,
            allow_user_gc_before_oom: true,
            check_saferegion: cfg!(debug_assertions),
            verify_heap_addresses: cfg!(debug_assertions),
            safepoint_timeout_ms: 1000,
            gc_wait_timeout_ms: 5000,
            cycle_candidate_limit: 4096,
            gc_threads: None,
            verbose: false,
            logger: RuntimeLoggerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    /// Returns error if configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size == 0 {
            return Err(ConfigError::InvalidHeapSize(
                "heap_size must be > 0".to_string(),
            ));
        }

        if self.heap_start_size == 0 || self.heap_start_size > self.heap_size {
            return Err(ConfigError::InvalidHeapSize(
                "heap_start_size must be between 1 and heap_size".to_string(),
            ));
        }

        if self.heap_growth_limit < self.heap_start_size || self.heap_growth_limit > self.heap_size {
            return Err(ConfigError::InvalidHeapSize(
                "heap_growth_limit must be between heap_start_size and heap_size".to_string(),
            ));
        }

        if self.heap_min_free > self.heap_max_free {
            return Err(ConfigError::InvalidHeapSize(
                "heap_min_free cannot exceed heap_max_free".to_string(),
            ));
        }

        if !(0.05..=0.95).contains(&self.heap_target_utilization) {
            return Err(ConfigError::InvalidRatio(
                "heap_target_utilization must be between 0.05 and 0.95".to_string(),
            ));
        }

        if self.gc_water_level < 1.0 {
            return Err(ConfigError::InvalidRatio(
                "gc_water_level must be >= 1.0".to_string(),
            ));
        }

        if self.init_gc_threshold == 0 {
            return Err(ConfigError::InvalidThreshold(
                "init_gc_threshold must be > 0".to_string(),
            ));
        }

        if let Some(threads) = self.gc_threads {
            if threads == 0 {
                return Err(ConfigError::InvalidGcThreads(
                    "gc_threads must be > 0".to_string(),
                ));
            }
        }

        if self.safepoint_timeout_ms == 0 || self.gc_wait_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "timeouts must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - MRT_HEAP_SIZE
    /// - MRT_HEAP_START_SIZE
    /// - MRT_GC_THRESHOLD
    /// - MRT_USER_GC_INTERVAL_MS
    /// - MRT_TRIGGER_GC
    /// - MRT_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export MRT_HEAP_SIZE=536870912  # 512MB
    /// export MRT_TRIGGER_GC=0
    /// export MRT_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("MRT_HEAP_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.heap_size = size;
                config.heap_growth_limit = size;
            }
        }

        if let Ok(val) = std::env::var("MRT_HEAP_START_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.heap_start_size = size;
            }
        }

        if let Ok(val) = std::env::var("MRT_GC_THRESHOLD") {
            if let Ok(size) = val.parse::<usize>() {
                config.init_gc_threshold = size;
            }
        }

        if let Ok(val) = std::env::var("MRT_USER_GC_INTERVAL_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.min_user_trigger_interval = Duration::from_millis(ms);
            }
        }

        if let Ok(val) = std::env::var("MRT_TRIGGER_GC") {
            config.trigger_gc_enabled = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("MRT_VERBOSE") {
            config.verbose = parse_flag(&val);
            config.logger.console = config.verbose;
        }

        config
    }

    /// Marking threads to use, resolving the auto-detect default
    pub fn effective_gc_threads(&self) -> usize {
        self.gc_threads
            .unwrap_or_else(|| (num_cpus::get() / 2).clamp(1, 4))
    }
}

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Invalid ratio: {0}")]
    InvalidRatio(String),

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("Invalid GC threads: {0}")]
    InvalidGcThreads(String),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
}

// ============================================================================
// Helper constants
// ============================================================================

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.init_gc_threshold, 20 * MB);
        assert_eq!(config.min_user_trigger_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_heap_size() {
        let config = RuntimeConfig {
            heap_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RuntimeConfig {
            heap_start_size: 512 * MB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_growth_limit() {
        let config = RuntimeConfig {
            heap_size: 32 * MB,
            heap_start_size: 16 * MB,
            heap_growth_limit: 8 * MB,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHeapSize(_))
        ));
    }

    #[test]
    fn test_invalid_water_level() {
        let config = RuntimeConfig {
            gc_water_level: 0.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRatio(_))));
    }

    #[test]
    fn test_effective_gc_threads() {
        let config = RuntimeConfig {
            gc_threads: Some(3),
            ..Default::default()
        };
        assert_eq!(config.effective_gc_threads(), 3);

        let auto = RuntimeConfig::default().effective_gc_threads();
        assert!((1..=4).contains(&auto));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("no"));
    }
}
