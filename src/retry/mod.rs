// ============================================================================
// Retry Module
// ============================================================================
//
// Policy (how long to wait, how many times), the sleeper used for the waits
// and the runner that drives attempts through the transaction state machine.
//
// ============================================================================

pub mod policy;
pub mod runner;
pub mod sleep;

pub use policy::{JitterRange, RetryPolicy};
pub use runner::{TransactionRunner, run_transaction};
pub use sleep::{Sleeper, TokioSleeper};
