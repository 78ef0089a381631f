//! Cache error types

use redis::RedisError;

/// Boxed error returned by caller-supplied loaders
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification carried by every failed [`Outcome`](crate::Outcome)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Key absent or expired. A normal miss.
    NotFound,
    /// Remote store could not be reached. Opens the circuit.
    Unreachable,
    /// Malformed stored value or encode/decode fault.
    Serialization,
    /// Anything else.
    Unexpected,
}

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("item does not exist")]
    NotFound,

    #[error("Remote store unreachable: {0}")]
    Unreachable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid loader tag {0:?}")]
    InvalidTag(String),

    #[error("Loader error: {0}")]
    Loader(#[from] BoxError),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::Unreachable(_) => ErrorKind::Unreachable,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::InvalidTag(_) | Self::Loader(_) | Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// True for failures that mean the remote store is down, as opposed to
    /// a bad request or bad data.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
            || e.is_timeout()
        {
            Self::Unreachable(e.to_string())
        } else {
            Self::Unexpected(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_projection() {
        assert_eq!(CacheError::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            CacheError::Unreachable("refused".into()).kind(),
            ErrorKind::Unreachable
        );
        assert_eq!(
            CacheError::InvalidTag(String::new()).kind(),
            ErrorKind::Unexpected
        );

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(
            CacheError::from(json_err).kind(),
            ErrorKind::Serialization
        );
    }

    #[test]
    fn test_redis_errors_are_classified() {
        let io: RedisError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(CacheError::from(io).is_unreachable());

        let type_err: RedisError = (redis::ErrorKind::TypeError, "wrong type").into();
        assert!(!CacheError::from(type_err).is_unreachable());
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(CacheError::NotFound.to_string(), "item does not exist");
    }
}
