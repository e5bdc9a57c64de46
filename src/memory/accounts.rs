//! Bank-account units of work over a [`MemorySession`].
//!
//! The classic demonstration workload for serializable retries: two
//! concurrent transfers touching the same account conflict, and one of them
//! has to run again.

use super::{MemoryError, MemorySession};
use crate::core::SqlState;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const PREFIX: &str = "accounts/";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountsError {
    #[error(transparent)]
    Db(#[from] MemoryError),

    #[error("insufficient funds in {account}: have {balance}, need {amount}")]
    InsufficientFunds {
        account: Uuid,
        balance: i64,
        amount: i64,
    },

    #[error("account {0} not found")]
    UnknownAccount(Uuid),
}

impl SqlState for AccountsError {
    fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Db(err) => err.sqlstate(),
            _ => None,
        }
    }
}

fn key(id: &Uuid) -> String {
    format!("{PREFIX}{id}")
}

/// Create two accounts holding 1000 and 250, returning their ids.
pub async fn create_accounts(session: &mut MemorySession) -> Result<[Uuid; 2], AccountsError> {
    let ids = [Uuid::new_v4(), Uuid::new_v4()];
    open_account(session, ids[0], 1000).await?;
    open_account(session, ids[1], 250).await?;
    debug!(first = %ids[0], second = %ids[1], "create_accounts()");
    Ok(ids)
}

pub async fn open_account(
    session: &mut MemorySession,
    id: Uuid,
    balance: i64,
) -> Result<(), AccountsError> {
    session.insert(&key(&id), balance).await?;
    Ok(())
}

pub async fn balance(session: &mut MemorySession, id: Uuid) -> Result<i64, AccountsError> {
    session
        .get(&key(&id))
        .await?
        .ok_or(AccountsError::UnknownAccount(id))
}

/// All account balances, ordered by account key.
pub async fn balances(session: &mut MemorySession) -> Result<Vec<(Uuid, i64)>, AccountsError> {
    let rows = session.scan(PREFIX).await?;
    Ok(rows
        .into_iter()
        .filter_map(|(k, v)| Uuid::parse_str(&k[PREFIX.len()..]).ok().map(|id| (id, v)))
        .collect())
}

/// Move `amount` from `from` to `to`. Fails without writing anything when
/// `from` cannot cover it.
pub async fn transfer_funds(
    session: &mut MemorySession,
    from: Uuid,
    to: Uuid,
    amount: i64,
) -> Result<(), AccountsError> {
    let from_balance = balance(session, from).await?;
    if from_balance < amount {
        return Err(AccountsError::InsufficientFunds {
            account: from,
            balance: from_balance,
            amount,
        });
    }

    let to_balance = balance(session, to).await?;
    session.put(&key(&from), from_balance - amount).await?;
    session.put(&key(&to), to_balance + amount).await?;

    debug!(%from, %to, amount, "transfer_funds()");
    Ok(())
}

/// Remove every account, returning how many were deleted.
pub async fn delete_accounts(session: &mut MemorySession) -> Result<usize, AccountsError> {
    let mut deleted = 0;
    for (k, _) in session.scan(PREFIX).await? {
        if session.delete(&k).await? {
            deleted += 1;
        }
    }
    debug!(deleted, "delete_accounts()");
    Ok(deleted)
}
