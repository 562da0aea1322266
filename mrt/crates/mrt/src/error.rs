//! Error Module - MRT Error Types
//!
//! Recoverable failures surfaced by the runtime. Barrier and reference-count
//! primitives never return these: their failures are either fatal (see
//! [`crate::fatal`]) or silent policy such as a dead weak referent loading as
//! null.
//!
//! # Error Categories
//!
//! ## Allocation Errors
//! - `OutOfMemory` - Heap exhausted after the OOM collection and one retry
//! - `HeapInitialization` - The heap mapping could not be reserved
//!
//! ## Usage Errors
//! - `InvalidArgument` - Caller passed a malformed request
//! - `UnknownClass` - Class name not present in the registry
//! - `InvalidState` - Operation not allowed in the current runtime state
//!
//! ## Configuration Errors
//! - `Configuration` - Invalid runtime configuration
//!
//! ## Coordination Errors
//! - `Timeout` - A bounded wait expired
//! - `ResourceExhausted` - A fixed-capacity table is full

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for recoverable runtime operations
///
/// # Examples
///
/// ```rust
/// use mrt::error::MrtError;
///
/// fn report(err: MrtError) {
///     match err {
///         MrtError::OutOfMemory { requested, available } => {
///             eprintln!("OOM: requested {}, available {}", requested, available);
///         }
///         other => eprintln!("runtime error: {}", other),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum MrtError {
    /// Out of memory
    ///
    /// **When returned:** Allocation still fails after an out-of-memory
    /// collection and a single retry.
    ///
    /// **Recovery strategy:** The language layer raises its out-of-memory
    /// exception; the runtime stays consistent.
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Heap initialization failed
    ///
    /// **When returned:** The anonymous mapping backing the heap or the
    /// polling page could not be created.
    #[error("Heap initialization failed: {0}")]
    HeapInitialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Invalid argument
    ///
    /// **Example scenarios:**
    /// - Alignment not a power of two
    /// - Array allocation requested for a non-array class
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Class lookup failed
    #[error("Unknown class: {0}")]
    UnknownClass(String),

    /// Invalid state
    ///
    /// **Example scenario:** Attaching a thread after `gc_fini_global`.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Operation timeout
    ///
    /// **Example scenario:** Mutators did not reach a safe point before
    /// `safepoint_timeout_ms` expired.
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Resource exhausted
    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },
}

impl MrtError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MrtError::OutOfMemory { .. } | MrtError::Timeout(_) | MrtError::ResourceExhausted { .. }
        )
    }

    /// Check if this error indicates a bug in the caller or the runtime
    pub fn is_bug(&self) -> bool {
        matches!(self, MrtError::InvalidState { .. })
    }
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, MrtError>;

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let oom = MrtError::OutOfMemory {
            requested: 64,
            available: 0,
        };
        assert!(oom.is_recoverable());
        assert!(!oom.is_bug());

        let state = MrtError::InvalidState {
            expected: "Running".to_string(),
            actual: "Finalized".to_string(),
        };
        assert!(state.is_bug());
        assert!(!state.is_recoverable());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: MrtError = ConfigError::InvalidHeapSize("heap_size must be > 0".into()).into();
        assert!(err.to_string().contains("heap_size must be > 0"));
    }

    #[test]
    fn test_ensure_macro() {
        fn check(v: usize) -> Result<usize> {
            ensure!(v > 0, MrtError::InvalidArgument("zero".into()));
            Ok(v)
        }
        assert!(check(0).is_err());
        assert_eq!(check(3).unwrap(), 3);
    }
}
