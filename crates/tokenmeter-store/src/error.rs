//! Error types for tokenmeter storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
///
/// Missing records are not errors; lookups return `Option`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A record with the same key already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend cannot run a multi-statement transaction.
    ///
    /// Callers fall back to sequential writes with compensation.
    #[error("multi-statement transactions are not supported by this store")]
    TransactionsUnsupported,
}

impl StoreError {
    /// Whether this error reports a missing transaction capability.
    #[must_use]
    pub const fn is_transactions_unsupported(&self) -> bool {
        matches!(self, Self::TransactionsUnsupported)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("migration failed: {err}"))
    }
}
