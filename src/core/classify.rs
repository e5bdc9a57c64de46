use std::fmt;

/// SQLSTATE reported by serializable databases when a transaction must be
/// restarted.
pub const SERIALIZATION_FAILURE: &str = "40001";

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Serialization / transient conflict: roll back, back off, run again.
    Retryable,
    /// Everything else: propagate immediately.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        };
        write!(f, "{label}")
    }
}

/// Maps an error reported during an attempt into an [`ErrorClass`].
///
/// Implementations must be deterministic: the same error always yields the
/// same class.
pub trait ErrorClassifier<E>: Send + Sync {
    fn classify(&self, err: &E) -> ErrorClass;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, err: &E) -> ErrorClass {
        self(err)
    }
}

/// Errors that can expose a SQLSTATE code.
pub trait SqlState {
    fn sqlstate(&self) -> Option<&str>;
}

/// Classifies by SQLSTATE code. Only `40001` is retryable by default.
#[derive(Debug, Clone)]
pub struct SqlStateClassifier {
    retryable: Vec<String>,
}

impl SqlStateClassifier {
    pub fn new() -> Self {
        Self {
            retryable: vec![SERIALIZATION_FAILURE.to_string()],
        }
    }

    /// Treat an additional SQLSTATE as retryable (e.g. `40P01`, deadlock detected).
    pub fn with_code(mut self, code: &str) -> Self {
        if !self.retryable.iter().any(|c| c == code) {
            self.retryable.push(code.to_string());
        }
        self
    }

    pub fn codes(&self) -> &[String] {
        &self.retryable
    }
}

impl Default for SqlStateClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: SqlState> ErrorClassifier<E> for SqlStateClassifier {
    fn classify(&self, err: &E) -> ErrorClass {
        match err.sqlstate() {
            Some(code) if self.retryable.iter().any(|c| c == code) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Classifies by case-insensitive substring match on the error message.
///
/// Useful for drivers that surface conflicts only as text, or for error
/// types that wrap the driver error (`anyhow::Error`, boxed errors).
#[derive(Debug, Clone)]
pub struct MessageClassifier {
    patterns: Vec<String>,
}

impl MessageClassifier {
    pub fn new<I, P>(patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for MessageClassifier {
    fn default() -> Self {
        Self::new([
            "restart transaction",
            "serialization failure",
            "could not serialize access",
            "write-write conflict",
        ])
    }
}

impl<E: fmt::Display> ErrorClassifier<E> for MessageClassifier {
    fn classify(&self, err: &E) -> ErrorClass {
        let lower = err.to_string().to_lowercase();
        if self.patterns.iter().any(|p| lower.contains(p.as_str())) {
            ErrorClass::Retryable
        } else {
            ErrorClass::Fatal
        }
    }
}
