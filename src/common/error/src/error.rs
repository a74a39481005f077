//! Core error types for Rivulet.

use thiserror::Error;

/// Result type alias using `RivuletError`.
pub type RivuletResult<T> = std::result::Result<T, RivuletError>;

/// Generic boxed error for external error sources.
pub type GenericError = Box<dyn std::error::Error + Send + Sync>;

/// Core error type for Rivulet operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RivuletError {
    /// Type mismatch or invalid type operation.
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Invalid value provided.
    #[error("ValueError: {0}")]
    ValueError(String),

    /// Query evaluation error (unknown identifier, bad keyword argument, ...).
    #[error("EvaluationError: {0}")]
    EvaluationError(String),

    /// Query planning error.
    #[error("PlanningError: {0}")]
    PlanningError(String),

    /// Filter expression compilation error.
    #[error("CompilationError: {0}")]
    CompilationError(String),

    /// Storage transport error (dial, stream receive, bad frame).
    #[error("StorageError: {0}")]
    StorageError(String),

    /// Query execution error.
    #[error("ExecutionError: {0}")]
    ExecutionError(String),

    /// Memory limit exceeded.
    #[error("ResourceExhausted: {0}")]
    ResourceExhausted(String),

    /// Query cancelled. Kept separate from `ExecutionError` so that
    /// cancellation can be told apart from failure.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error (bug in Rivulet).
    #[error("InternalError: {0}")]
    InternalError(String),

    /// IO error.
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("SerdeJsonError: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// External error from third-party libraries.
    #[error("ExternalError: {0}")]
    ExternalError(GenericError),
}

impl RivuletError {
    /// Create a new `TypeError`.
    pub fn type_error<S: Into<String>>(msg: S) -> Self {
        Self::TypeError(msg.into())
    }

    /// Create a new `ValueError`.
    pub fn value_error<S: Into<String>>(msg: S) -> Self {
        Self::ValueError(msg.into())
    }

    /// Create a new `EvaluationError`.
    pub fn evaluation<S: Into<String>>(msg: S) -> Self {
        Self::EvaluationError(msg.into())
    }

    /// Create a new `PlanningError`.
    pub fn planning<S: Into<String>>(msg: S) -> Self {
        Self::PlanningError(msg.into())
    }

    /// Create a new `CompilationError`.
    pub fn compilation<S: Into<String>>(msg: S) -> Self {
        Self::CompilationError(msg.into())
    }

    /// Create a new `StorageError`.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::StorageError(msg.into())
    }

    /// Create a new `ExecutionError`.
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::ExecutionError(msg.into())
    }

    /// Create a resource exhausted error.
    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a cancellation error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new `InternalError`.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::InternalError(msg.into())
    }

    /// Whether this error represents cooperative cancellation rather than a
    /// failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Ensure a condition holds, returning the given error variant if not.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            return Err($crate::RivuletError::ExecutionError($msg.to_string()));
        }
    };
    ($cond:expr, $variant:ident: $($msg:tt)*) => {
        if !$cond {
            return Err($crate::RivuletError::$variant(format!($($msg)*)));
        }
    };
}

/// Return early with a `ValueError`.
#[macro_export]
macro_rules! value_err {
    ($($arg:tt)*) => {
        return Err($crate::RivuletError::ValueError(format!($($arg)*)))
    };
}

/// Return early with a `TypeError`.
#[macro_export]
macro_rules! type_err {
    ($($arg:tt)*) => {
        return Err($crate::RivuletError::TypeError(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RivuletError::type_error("expected Float, got String");
        assert_eq!(err.to_string(), "TypeError: expected Float, got String");
    }

    #[test]
    fn test_cancellation_is_distinguished() {
        assert!(RivuletError::cancelled("query cancelled").is_cancellation());
        assert!(!RivuletError::execution("boom").is_cancellation());
    }

    #[test]
    fn test_error_constructors() {
        let _ = RivuletError::evaluation("undefined identifier \"x\"");
        let _ = RivuletError::planning("no procedure for kind");
        let _ = RivuletError::compilation("expression does not evaluate to boolean");
        let _ = RivuletError::storage("stream receive failed");
        let _ = RivuletError::resource_exhausted("memory limit exceeded");
        let _ = RivuletError::internal("unexpected state");
    }
}
