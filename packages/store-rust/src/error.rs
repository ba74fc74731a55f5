//! Store error types.
//!
//! [`StoreError`] surfaces only from backend construction and from the
//! internal I/O helpers. The `ConfigStore` operations themselves report
//! failures as `false` returns, readiness changes and log lines.

use confdb_core::IdError;

/// Errors produced while opening or driving a backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid identifier: {0}")]
    Id(#[from] IdError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: StoreError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn config_error_message() {
        let err = StoreError::InvalidConfig("missing url".into());
        assert_eq!(err.to_string(), "invalid configuration: missing url");
    }
}
