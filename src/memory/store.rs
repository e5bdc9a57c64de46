use super::MemorySession;
use super::error::{MemoryError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// A committed value and the commit sequence number that wrote it.
///
/// Deletes leave a tombstone (`value: None`) so later validation still sees
/// the version change. Keys never written have version 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Versioned {
    pub value: Option<i64>,
    pub version: u64,
}

impl Versioned {
    pub const ABSENT: Versioned = Versioned {
        value: None,
        version: 0,
    };
}

pub(crate) struct StoreInner {
    pub data: RwLock<HashMap<String, Versioned>>,
    pub commit_seq: AtomicU64,
    next_session_id: AtomicU64,
    injected_conflicts: AtomicU32,
    injected_fault: Mutex<Option<MemoryError>>,
}

/// Shared in-memory key/value database with optimistic, serializable
/// transactions.
///
/// Every [`MemorySession`] opened from the same store sees the same data.
/// Transactions buffer their writes and validate, at commit, that nothing
/// they read or wrote was committed by someone else in the meantime (first
/// committer wins). A failed validation is reported as
/// [`MemoryError::SerializationFailure`], SQLSTATE `40001`.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                data: RwLock::new(HashMap::new()),
                commit_seq: AtomicU64::new(0),
                next_session_id: AtomicU64::new(1),
                injected_conflicts: AtomicU32::new(0),
                injected_fault: Mutex::new(None),
            }),
        }
    }

    /// Open a new session on this store.
    pub fn session(&self) -> MemorySession {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        MemorySession::new(id, self.clone())
    }

    /// Committed value of `key`, outside of any transaction.
    pub async fn value(&self, key: &str) -> Option<i64> {
        let data = self.inner.data.read().await;
        data.get(key).and_then(|v| v.value)
    }

    /// All live committed entries, ordered by key.
    pub async fn snapshot(&self) -> BTreeMap<String, i64> {
        let data = self.inner.data.read().await;
        data.iter()
            .filter_map(|(k, v)| v.value.map(|value| (k.clone(), value)))
            .collect()
    }

    /// Number of successful commits, autocommit statements included.
    pub fn commit_count(&self) -> u64 {
        self.inner.commit_seq.load(Ordering::SeqCst)
    }

    /// Make the next `n` transaction commits fail with a serialization
    /// failure, whatever their read/write sets.
    pub fn inject_conflicts(&self, n: u32) {
        self.inner.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Make the next statement on any session fail with `err`.
    pub fn inject_fault(&self, err: MemoryError) -> Result<()> {
        *self.inner.injected_fault.lock()? = Some(err);
        Ok(())
    }

    pub(crate) fn inner(&self) -> &StoreInner {
        &self.inner
    }

    pub(crate) fn take_fault(&self) -> Result<()> {
        match self.inner.injected_fault.lock()?.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn take_injected_conflict(&self) -> bool {
        self.inner
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
