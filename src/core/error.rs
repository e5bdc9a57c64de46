use std::time::Duration;
use thiserror::Error;

/// Failure of one runner invocation, as seen by the caller.
///
/// A retryable conflict never shows up here directly: it is either absorbed
/// by a later successful attempt or surfaces as [`RunError::RetriesExhausted`].
#[derive(Error, Debug)]
pub enum RunError<E> {
    /// The unit of work (or the session) failed with a non-retryable error.
    /// The original error is carried unchanged.
    #[error("{0}")]
    Operation(E),

    #[error("transaction did not succeed after {max_retries} retries")]
    RetriesExhausted { max_retries: u32 },

    #[error("transaction cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("transaction timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },
}

impl<E> RunError<E> {
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// Returns the original operation error, if this is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }

    pub fn as_operation(&self) -> Option<&E> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }
}

/// Invalid retry policy values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("max_retries must be >= 1")]
    ZeroRetries,

    #[error("backoff_base must be > 0")]
    ZeroBackoffBase,

    #[error("backoff_factor must be > 1, got {0}")]
    InvalidBackoffFactor(f64),

    #[error("jitter range [{low}, {high}) is empty or negative")]
    InvalidJitter { low: f64, high: f64 },

    #[error("max_backoff ({max:?}) is below backoff_base ({base:?})")]
    BackoffCapBelowBase { base: Duration, max: Duration },

    #[error("deadline must be > 0")]
    ZeroDeadline,
}
