use super::MemoryStore;
use super::error::{MemoryError, Result};
use super::store::Versioned;
use crate::transaction::Session;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    InTransaction,
    Closed,
}

/// Read and write sets of the open transaction.
#[derive(Debug, Default)]
struct PendingTxn {
    /// Version of every key the transaction has observed, first sighting wins.
    observed: HashMap<String, u64>,
    /// Buffered writes, `None` deletes.
    writes: BTreeMap<String, Option<i64>>,
    /// Scanned prefixes with the commit sequence current at scan time. A later
    /// commit under the prefix is a phantom.
    scanned: Vec<(String, u64)>,
    /// Set once a statement hit a serialization failure; only rollback is
    /// accepted afterwards.
    doomed: bool,
}

/// A connection to a [`MemoryStore`].
///
/// Outside a transaction each statement commits on its own. Inside one,
/// reads are validated to be repeatable (a concurrent commit to a key already
/// read aborts the statement with a serialization failure) and writes are
/// buffered until [`Session::commit`].
pub struct MemorySession {
    id: u64,
    store: MemoryStore,
    state: SessionState,
    txn: Option<PendingTxn>,
}

impl MemorySession {
    pub(crate) fn new(id: u64, store: MemoryStore) -> Self {
        Self {
            id,
            store,
            state: SessionState::Active,
            txn: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_in_transaction(&self) -> bool {
        self.state == SessionState::InTransaction
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Closed
    }

    /// Close the session, discarding any open transaction.
    pub fn close(&mut self) {
        self.txn = None;
        self.state = SessionState::Closed;
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<i64>> {
        self.check_statement()?;

        if let Some(txn) = &self.txn {
            if let Some(buffered) = txn.writes.get(key) {
                return Ok(*buffered);
            }
        }

        let current = self.read_committed(key).await;
        self.observe(key, current.version)?;
        Ok(current.value)
    }

    pub async fn put(&mut self, key: &str, value: i64) -> Result<()> {
        self.write(key, Some(value)).await
    }

    /// Insert a new key; fails with a constraint violation if it exists.
    pub async fn insert(&mut self, key: &str, value: i64) -> Result<()> {
        if self.get(key).await?.is_some() {
            return Err(MemoryError::ConstraintViolation(format!(
                "duplicate key '{key}'"
            )));
        }
        self.write(key, Some(value)).await
    }

    /// Delete `key`, returning whether it existed.
    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        let existed = self.get(key).await?.is_some();
        if existed {
            self.write(key, None).await?;
        }
        Ok(existed)
    }

    /// Live entries whose key starts with `prefix`, ordered by key.
    pub async fn scan(&mut self, prefix: &str) -> Result<Vec<(String, i64)>> {
        self.check_statement()?;

        let (committed, seq): (Vec<(String, Versioned)>, u64) = {
            let data = self.store.inner().data.read().await;
            let rows = data
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), *v))
                .collect();
            (rows, self.store.inner().commit_seq.load(Ordering::SeqCst))
        };

        if let Some(txn) = self.txn.as_mut() {
            txn.scanned.push((prefix.to_string(), seq));
        }

        let mut merged = BTreeMap::new();
        for (key, current) in committed {
            self.observe(&key, current.version)?;
            if let Some(value) = current.value {
                merged.insert(key, value);
            }
        }

        if let Some(txn) = &self.txn {
            for (key, buffered) in txn.writes.range(prefix.to_string()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                match buffered {
                    Some(value) => merged.insert(key.clone(), *value),
                    None => merged.remove(key),
                };
            }
        }

        Ok(merged.into_iter().collect())
    }

    fn check_open(&self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(MemoryError::ConnectionClosed);
        }
        Ok(())
    }

    fn check_statement(&self) -> Result<()> {
        self.check_open()?;
        if self.txn.as_ref().is_some_and(|txn| txn.doomed) {
            return Err(MemoryError::TransactionState(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .into(),
            ));
        }
        self.store.take_fault()
    }

    async fn read_committed(&self, key: &str) -> Versioned {
        let data = self.store.inner().data.read().await;
        data.get(key).copied().unwrap_or(Versioned::ABSENT)
    }

    /// Record the version seen for `key`; a different version than the one
    /// seen earlier in the same transaction means a concurrent commit.
    fn observe(&mut self, key: &str, version: u64) -> Result<()> {
        let Some(txn) = self.txn.as_mut() else {
            return Ok(());
        };

        match txn.observed.get(key) {
            Some(&seen) if seen != version => {
                debug!(session = self.id, key, "read of concurrently modified key");
                txn.doomed = true;
                Err(MemoryError::serialization_failure(format!(
                    "key '{key}' changed during transaction"
                )))
            }
            Some(_) => Ok(()),
            None => {
                txn.observed.insert(key.to_string(), version);
                Ok(())
            }
        }
    }

    async fn write(&mut self, key: &str, value: Option<i64>) -> Result<()> {
        self.check_statement()?;

        if self.txn.is_some() {
            let current = self.read_committed(key).await;
            self.observe(key, current.version)?;
            if let Some(txn) = self.txn.as_mut() {
                txn.writes.insert(key.to_string(), value);
            }
            return Ok(());
        }

        let mut data = self.store.inner().data.write().await;
        let version = self.store.inner().commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        data.insert(key.to_string(), Versioned { value, version });
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    type Error = MemoryError;

    async fn begin(&mut self) -> Result<()> {
        self.check_open()?;
        if self.state == SessionState::InTransaction {
            return Err(MemoryError::TransactionState(
                "Transaction already active".into(),
            ));
        }

        self.txn = Some(PendingTxn::default());
        self.state = SessionState::InTransaction;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        let Some(txn) = self.txn.take() else {
            return Err(MemoryError::TransactionState("No active transaction".into()));
        };
        self.state = SessionState::Active;

        if txn.doomed {
            return Err(MemoryError::serialization_failure(
                "transaction aborted by an earlier conflict",
            ));
        }

        let inner = self.store.inner();
        let mut data = inner.data.write().await;

        if self.store.take_injected_conflict() {
            debug!(session = self.id, "injected commit conflict");
            return Err(MemoryError::serialization_failure("injected conflict"));
        }

        for (key, &seen) in &txn.observed {
            let current = data.get(key).map_or(0, |v| v.version);
            if current != seen {
                debug!(session = self.id, key = key.as_str(), seen, current, "commit validation failed");
                return Err(MemoryError::serialization_failure(format!(
                    "write-write conflict detected on key '{key}'"
                )));
            }
        }

        for (prefix, seq) in &txn.scanned {
            let phantom = data
                .iter()
                .find(|(k, v)| k.starts_with(prefix.as_str()) && v.version > *seq);
            if let Some((key, _)) = phantom {
                debug!(session = self.id, prefix = prefix.as_str(), key = key.as_str(), "phantom under scanned prefix");
                return Err(MemoryError::serialization_failure(format!(
                    "key '{key}' committed under scanned prefix '{prefix}'"
                )));
            }
        }

        if txn.writes.is_empty() {
            return Ok(());
        }

        let version = inner.commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
        for (key, value) in txn.writes {
            data.insert(key, Versioned { value, version });
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        if self.txn.take().is_none() {
            return Err(MemoryError::TransactionState("No active transaction".into()));
        }
        self.state = SessionState::Active;
        Ok(())
    }

    fn start_rollback(&mut self) {
        if self.txn.take().is_some() {
            self.state = SessionState::Active;
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}
