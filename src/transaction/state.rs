// ============================================================================
// Runner State Machine
// ============================================================================
//
// One runner invocation moves through:
//
//   Idle ──> Attempting ──> Committed
//    │          │  ▲  ├──> Aborted
//    │          │  │  ├──> Exhausted
//    │          ▼  │  └──> Cancelled
//    │  RolledBackPendingRetry ──> Cancelled
//    └──────────────────────────> Cancelled
//
// ============================================================================

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No transaction acquired yet.
    Idle,

    /// A transaction scope is open and the unit of work is running.
    Attempting,

    /// A conflict was rolled back; waiting out the backoff.
    RolledBackPendingRetry,

    /// The unit of work succeeded and the transaction committed.
    Committed,

    /// A fatal error ended the invocation.
    Aborted,

    /// Every attempt hit a conflict.
    Exhausted,

    /// Cancelled externally or by the deadline.
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Committed | RunState::Aborted | RunState::Exhausted | RunState::Cancelled
        )
    }

    pub fn can_transition(&self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (*self, to),
            (Idle, Attempting)
                | (Idle, Cancelled)
                | (Attempting, Committed)
                | (Attempting, RolledBackPendingRetry)
                | (Attempting, Aborted)
                | (Attempting, Exhausted)
                | (Attempting, Cancelled)
                | (RolledBackPendingRetry, Attempting)
                | (RolledBackPendingRetry, Cancelled)
        )
    }

    /// Returns the new state, or `None` if the move is not allowed.
    pub fn transition(self, to: RunState) -> Option<RunState> {
        self.can_transition(to).then_some(to)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Idle => "IDLE",
            RunState::Attempting => "ATTEMPTING",
            RunState::RolledBackPendingRetry => "ROLLED_BACK_PENDING_RETRY",
            RunState::Committed => "COMMITTED",
            RunState::Aborted => "ABORTED",
            RunState::Exhausted => "EXHAUSTED",
            RunState::Cancelled => "CANCELLED",
        };
        write!(f, "{label}")
    }
}

/// What happened during one runner invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Number of times the unit of work was started.
    pub attempts: u32,

    /// Backoff waits performed, in order.
    pub backoffs: Vec<Duration>,

    pub final_state: RunState,

    pub elapsed: Duration,
}

impl RunReport {
    pub(crate) fn new() -> Self {
        Self {
            attempts: 0,
            backoffs: Vec::new(),
            final_state: RunState::Idle,
            elapsed: Duration::ZERO,
        }
    }

    pub fn sleeps(&self) -> usize {
        self.backoffs.len()
    }

    pub fn total_backoff(&self) -> Duration {
        self.backoffs.iter().sum()
    }

    pub fn committed(&self) -> bool {
        self.final_state == RunState::Committed
    }
}
