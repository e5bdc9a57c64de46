// ============================================================================
// In-Memory Optimistic Backend
// ============================================================================
//
// A small serializable key/value engine that implements `Session`. Writes are
// buffered per transaction and validated at commit (first committer wins);
// a lost validation is a SQLSTATE 40001 serialization failure, the same
// signal a distributed SQL database sends when a transaction must restart.
//
// ============================================================================

pub mod accounts;
pub mod error;
pub mod session;
pub mod store;

pub use error::{MemoryError, Result};
pub use session::MemorySession;
pub use store::MemoryStore;
