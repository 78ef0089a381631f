//! Uniform success/failure wrapper returned by every cache layer

use crate::error::{CacheError, ErrorKind};

/// Message carried by every miss, from any layer or the orchestrator.
pub const ITEM_DOES_NOT_EXIST: &str = "item does not exist";

/// Result of a cache operation.
///
/// Layers never raise for expected conditions: a miss, an unreachable remote
/// store or a corrupt stored value all come back as a failed `Outcome`, so the
/// orchestrator only ever branches on [`Outcome::is_success`] and
/// [`Outcome::kind`].
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct Outcome<V = ()> {
    success: bool,
    data: Option<V>,
    error_message: String,
    kind: Option<ErrorKind>,
}

impl<V> Outcome<V> {
    /// Successful outcome holding `value`
    pub fn success(value: V) -> Self {
        Self {
            success: true,
            data: Some(value),
            error_message: String::new(),
            kind: None,
        }
    }

    /// Failed outcome built from an error
    pub fn from_error(error: &CacheError) -> Self {
        Self::failure(error.kind(), error.to_string())
    }

    /// Failed outcome with an explicit kind and message
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_message: message.into(),
            kind: Some(kind),
        }
    }

    pub fn not_found() -> Self {
        Self::failure(ErrorKind::NotFound, ITEM_DOES_NOT_EXIST)
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == Some(ErrorKind::NotFound)
    }

    /// Failure classification, `None` on success
    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    /// Empty on success
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn data(&self) -> Option<&V> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<V> {
        self.data
    }

    /// Map the carried value, keeping failure details untouched
    pub fn map<U, F: FnOnce(V) -> U>(self, f: F) -> Outcome<U> {
        Outcome {
            success: self.success,
            data: self.data.map(f),
            error_message: self.error_message,
            kind: self.kind,
        }
    }

    /// Same failure, different payload type. The data is dropped.
    pub fn cast<U>(self) -> Outcome<U> {
        Outcome {
            success: self.success,
            data: None,
            error_message: self.error_message,
            kind: self.kind,
        }
    }
}

impl Outcome<()> {
    /// Successful outcome without a payload
    pub fn done() -> Self {
        Self::success(())
    }
}

impl<V> From<Result<V, CacheError>> for Outcome<V> {
    fn from(result: Result<V, CacheError>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(e) => Self::from_error(&e),
        }
    }
}
