use crate::core::{SERIALIZATION_FAILURE, SqlState};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("restart transaction: serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Transaction state error: {0}")]
    TransactionState(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl MemoryError {
    pub fn serialization_failure(detail: impl Into<String>) -> Self {
        Self::SerializationFailure(detail.into())
    }
}

impl SqlState for MemoryError {
    fn sqlstate(&self) -> Option<&str> {
        Some(match self {
            Self::SerializationFailure(_) => SERIALIZATION_FAILURE,
            Self::ConstraintViolation(_) => "23505",
            Self::ConnectionClosed => "08003",
            Self::TransactionState(_) => "25000",
            Self::Lock(_) => "XX000",
        })
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;

impl<T> From<std::sync::PoisonError<T>> for MemoryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
