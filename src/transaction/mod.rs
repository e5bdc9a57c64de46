// ============================================================================
// Transaction Scoping
// ============================================================================
//
// The session collaborator, the scoped transaction guard and the state
// machine a runner invocation walks through.
//
// ============================================================================

pub mod scope;
pub mod session;
pub mod state;

pub use scope::TransactionScope;
pub use session::Session;
pub use state::{RunReport, RunState};
