// ============================================================================
// txretry Library
// ============================================================================
//
// Client-side retry of serializable transactions. Optimistic databases abort
// a transaction when it conflicts with a concurrent one even though every
// statement succeeded; the client is expected to roll back and run the whole
// transaction again. `TransactionRunner` does that with bounded attempts and
// exponential, jittered backoff.
//
// ============================================================================

pub mod core;
pub mod memory;
pub mod retry;
pub mod transaction;

pub use self::core::{
    ConfigError, ErrorClass, ErrorClassifier, MessageClassifier, RunError, SqlState,
    SqlStateClassifier,
};
pub use retry::{JitterRange, RetryPolicy, Sleeper, TokioSleeper, TransactionRunner, run_transaction};
pub use transaction::{RunReport, RunState, Session, TransactionScope};

/// Re-exported so callers can name the unit-of-work return type.
pub use futures::future::BoxFuture;
/// Re-exported for [`TransactionRunner::with_cancellation`].
pub use tokio_util::sync::CancellationToken;
