use thiserror::Error;

/// Errors from repository operations (used by trait definitions in hookflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// A write-once field or unique key was written twice with different data.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Stored data violates an invariant (e.g. duplicate step records).
    #[error("store corruption: {0}")]
    Corruption(String),
}

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(String),

    #[error("failed to parse config file: {0}")]
    Parse(String),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    /// The store handed to the engine does not match `persistence`.
    #[error("persistence mode mismatch: configured {configured}, supplied {supplied}")]
    PersistenceMismatch {
        configured: &'static str,
        supplied: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");

        let err = RepositoryError::Corruption("2 rows for (r, s)".to_string());
        assert!(err.to_string().contains("corruption"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid {
            field: "retry.max_attempts",
            reason: "must be at least 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for 'retry.max_attempts': must be at least 1"
        );
    }
}
