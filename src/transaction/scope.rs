use super::Session;
use std::ops::{Deref, DerefMut};
use tracing::debug;

/// An open transaction on a borrowed session.
///
/// The scope holds the session exclusively until it is finished with
/// [`commit`](Self::commit) or [`rollback`](Self::rollback). Dropping an
/// unfinished scope (early return, panic, cancelled future) calls
/// [`Session::start_rollback`], so the transaction is released on every exit
/// path.
pub struct TransactionScope<'s, S: Session> {
    session: &'s mut S,
    open: bool,
}

impl<'s, S: Session> TransactionScope<'s, S> {
    /// Begin a transaction on `session`.
    pub async fn begin(session: &'s mut S) -> Result<Self, S::Error> {
        session.begin().await?;
        Ok(Self {
            session,
            open: true,
        })
    }

    pub fn session(&mut self) -> &mut S {
        self.session
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Commit the transaction. On error the database has already discarded
    /// it, so the scope is closed either way.
    pub async fn commit(mut self) -> Result<(), S::Error> {
        self.open = false;
        self.session.commit().await
    }

    /// Roll the transaction back explicitly.
    pub async fn rollback(mut self) -> Result<(), S::Error> {
        self.open = false;
        self.session.rollback().await
    }
}

impl<S: Session> Deref for TransactionScope<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session
    }
}

impl<S: Session> DerefMut for TransactionScope<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session
    }
}

impl<S: Session> Drop for TransactionScope<'_, S> {
    fn drop(&mut self) {
        if self.open {
            debug!("transaction scope dropped while open, starting rollback");
            self.session.start_rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryError, MemoryStore};

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let store = MemoryStore::new();
        let mut session = store.session();

        let mut scope = TransactionScope::begin(&mut session).await.unwrap();
        assert!(scope.is_open());
        scope.put("a", 10).await.unwrap();
        scope.commit().await.unwrap();

        assert_eq!(store.value("a").await, Some(10));
        assert!(!session.is_in_transaction());
    }

    #[tokio::test]
    async fn test_explicit_rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut session = store.session();

        let mut scope = TransactionScope::begin(&mut session).await.unwrap();
        scope.session().put("a", 10).await.unwrap();
        scope.rollback().await.unwrap();

        assert_eq!(store.value("a").await, None);
        assert!(!session.is_in_transaction());
    }

    #[tokio::test]
    async fn test_drop_starts_rollback() {
        let store = MemoryStore::new();
        let mut session = store.session();

        {
            let mut scope = TransactionScope::begin(&mut session).await.unwrap();
            scope.put("a", 10).await.unwrap();
        }

        assert!(!session.is_in_transaction());
        assert_eq!(store.value("a").await, None);

        // The session is usable for a new transaction afterwards.
        let scope = TransactionScope::begin(&mut session).await.unwrap();
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_failure_yields_no_scope() {
        let store = MemoryStore::new();
        let mut session = store.session();
        session.close();

        let result = TransactionScope::begin(&mut session).await;
        assert!(matches!(result, Err(MemoryError::ConnectionClosed)));
    }
}
