//! Unified error handling for graphforge
//!
//! Every fallible operation in the crate returns [`GraphResult`]. Errors are
//! grouped into three categories that drive how a caller should react:
//! - Configuration errors (bad arity, unsupported data type or shape,
//!   unregistered target). The caller should fix the graph or pick another
//!   target.
//! - Programmer errors (target mismatch between node and backend, memory
//!   manager used before finalize, dangling handle). These indicate a broken
//!   caller contract.
//! - Runtime errors (insufficient padding, allocation failure, a failing
//!   task). The caller may re-plan with a different configuration.

use std::fmt;

use crate::graph::types::{NodeId, Target};

/// Unified error type for graphforge
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    // ========== Configuration Errors ==========
    /// Node has the wrong number of inputs or outputs, or a required input is unbound
    #[error("Invalid arity for node {node}: {reason}")]
    InvalidArity { node: NodeId, reason: String },

    /// Data type not handled by the node or backend
    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// Tensor shapes are incompatible
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Node kind not supported by a backend
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// No backend registered for the requested target
    #[error("No backend registered for target {0}")]
    UnregisteredTarget(Target),

    /// Invalid graph or context configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An edge connects nodes assigned to different targets
    #[error("Edge crosses targets: {0}")]
    CrossTargetEdge(String),

    // ========== Programmer Errors ==========
    /// Node assigned to a different target than the backend handling it
    #[error("Target mismatch: backend {expected} asked to handle {actual}")]
    TargetMismatch { expected: Target, actual: Target },

    /// Memory manager used before finalize
    #[error("Memory manager not finalized: {0}")]
    MemoryManagerNotFinalized(String),

    /// Tensor handle missing, released or aliasing released storage
    #[error("Invalid tensor handle: {0}")]
    InvalidHandle(String),

    /// Connection would make the graph cyclic
    #[error("Connection {producer} -> {consumer} would create a cycle")]
    GraphCycle { producer: NodeId, consumer: NodeId },

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    // ========== Runtime Errors ==========
    /// Operator access window does not fit the padded input
    #[error("Insufficient padding: {0}")]
    InsufficientPadding(String),

    /// Backing buffer allocation failed
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// A workload task failed while running
    #[error("Task for node {node} failed: {reason}")]
    TaskFailed { node: NodeId, reason: String },

    /// File I/O error (config loading, log files)
    #[error("I/O error: {0}")]
    Io(String),
}

impl GraphError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            GraphError::InvalidArity { .. }
            | GraphError::UnsupportedDataType(_)
            | GraphError::ShapeMismatch(_)
            | GraphError::UnsupportedOperation(_)
            | GraphError::UnregisteredTarget(_)
            | GraphError::InvalidConfiguration(_)
            | GraphError::CrossTargetEdge(_) => ErrorCategory::Configuration,

            GraphError::TargetMismatch { .. }
            | GraphError::MemoryManagerNotFinalized(_)
            | GraphError::InvalidHandle(_)
            | GraphError::GraphCycle { .. }
            | GraphError::InternalError(_) => ErrorCategory::Programmer,

            GraphError::InsufficientPadding(_)
            | GraphError::AllocationFailed(_)
            | GraphError::TaskFailed { .. }
            | GraphError::Io(_) => ErrorCategory::Runtime,
        }
    }

    /// Whether the caller can recover by changing the graph or configuration
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Runtime
        )
    }

    /// Whether this error indicates a broken caller contract
    pub fn is_programmer_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Programmer)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad graph or unsupported combination, reported from validation
    Configuration,
    /// Broken caller contract
    Programmer,
    /// Failure discovered while sizing or running operators
    Runtime,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Programmer => write!(f, "Programmer"),
            ErrorCategory::Runtime => write!(f, "Runtime"),
        }
    }
}

impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        GraphError::Io(err.to_string())
    }
}

/// Helper type alias for Results using GraphError
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Outcome of a validation step: success or a textual failure reason
pub type Status = GraphResult<()>;

/// Return early with a configuration error when a condition holds
///
/// # Examples
/// ```ignore
/// return_error_on!(shape.is_empty(), ShapeMismatch, "empty shape for node {}", id);
/// ```
#[macro_export]
macro_rules! return_error_on {
    ($cond:expr, $variant:ident, $($arg:tt)*) => {
        if $cond {
            return Err($crate::error::GraphError::$variant(format!($($arg)*)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_category() {
        let err = GraphError::UnsupportedDataType("QASYMM8 softmax".to_string());
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(err.is_recoverable());
        assert!(!err.is_programmer_error());
    }

    #[test]
    fn test_programmer_category() {
        let err = GraphError::TargetMismatch {
            expected: Target::Cpu,
            actual: Target::GpuCompute,
        };
        assert_eq!(err.category(), ErrorCategory::Programmer);
        assert!(err.is_programmer_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_runtime_category() {
        let err = GraphError::InsufficientPadding("kernel 5x5 on 3x3 input".to_string());
        assert_eq!(err.category(), ErrorCategory::Runtime);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = GraphError::InvalidArity {
            node: NodeId(3),
            reason: "expected 1 input, got 2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid arity for node 3: expected 1 input, got 2"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.json");
        let err: GraphError = io.into();
        assert_eq!(err.category(), ErrorCategory::Runtime);
        assert!(err.to_string().contains("missing.json"));
    }

    #[test]
    fn test_return_error_on_macro() {
        fn check(len: usize) -> Status {
            return_error_on!(len == 0, ShapeMismatch, "empty tensor of len {}", len);
            Ok(())
        }
        assert!(check(1).is_ok());
        assert_eq!(
            check(0),
            Err(GraphError::ShapeMismatch("empty tensor of len 0".to_string()))
        );
    }
}
