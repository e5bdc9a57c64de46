use async_trait::async_trait;

/// A database session bound to one open connection.
///
/// Only the transaction-control surface is part of this trait. Statement
/// execution and row fetching are backend-specific and are used by the unit
/// of work directly, the runner never calls them.
///
/// Implementations wrap a driver connection (`tokio_postgres::Client`,
/// `sqlx::PgConnection`, ...) or, in tests, [`MemorySession`](crate::memory::MemorySession).
#[async_trait]
pub trait Session: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start a transaction (`BEGIN`).
    async fn begin(&mut self) -> Result<(), Self::Error>;

    /// Commit the current transaction (`COMMIT`). An optimistic database may
    /// report a serialization conflict here.
    async fn commit(&mut self) -> Result<(), Self::Error>;

    /// Abandon the current transaction's writes (`ROLLBACK`). The session
    /// stays usable for a new transaction.
    async fn rollback(&mut self) -> Result<(), Self::Error>;

    /// Synchronous, best-effort rollback used when a transaction scope is
    /// dropped without being finished.
    ///
    /// `Drop` cannot await, so implementations typically mark the session and
    /// issue the `ROLLBACK` before the next statement.
    fn start_rollback(&mut self);
}
