use thiserror::Error;

/// Result type for liveness checks
pub type LivenessResult<T> = Result<T, LivenessError>;

/// Transport-level failures of a liveness check
#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("Liveness check of {0} timed out")]
    Timeout(String),

    #[error("Liveness check failed: {0}")]
    Request(String),
}

/// Errors of a whole validation call
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// The pool no longer accepts tasks
    #[error("Validation pool is shut down")]
    PoolClosed,

    /// Workers stopped before every task was answered
    #[error("Validation incomplete: {received} of {expected} results")]
    Incomplete { expected: usize, received: usize },
}
