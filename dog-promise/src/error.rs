use std::time::Duration;

use thiserror::Error;

/// Result type for promise operations
pub type PromiseResult<T> = Result<T, PromiseError>;

/// Rejection reasons produced by the library itself.
///
/// Promises are generic over their rejection type; any reason type only has
/// to be constructible from a `PromiseError` so that wait failures and
/// producer failures can be reported in the caller's own error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromiseError {
    #[error("Promise rejected: {0}")]
    Rejected(String),

    #[error("Cannot wait on a promise that has no wait function")]
    NoWaitFunction,

    #[error("Invoking the wait function did not settle the promise")]
    WaitDidNotSettle,

    #[error("Task producer failed: {0}")]
    Producer(String),

    #[error("Invalid concurrency: {0}")]
    InvalidConcurrency(String),

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Observability setup failed: {0}")]
    Observability(String),
}

impl PromiseError {
    /// Create a generic rejection
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create a producer failure
    pub fn producer(msg: impl Into<String>) -> Self {
        Self::Producer(msg.into())
    }

    /// Create a backend failure
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create an observability setup failure
    pub fn observability(msg: impl Into<String>) -> Self {
        Self::Observability(msg.into())
    }

    /// Raised while constructing or configuring, never while scheduling
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidConcurrency(_) | Self::UnknownOption(_))
    }

    /// Raised by `wait` when the deferred work could not settle the promise
    pub fn is_wait_failure(&self) -> bool {
        matches!(self, Self::NoWaitFunction | Self::WaitDidNotSettle)
    }
}
