pub mod classify;
pub mod error;

pub use classify::{
    ErrorClass, ErrorClassifier, MessageClassifier, SERIALIZATION_FAILURE, SqlState,
    SqlStateClassifier,
};
pub use error::{ConfigError, RunError};
