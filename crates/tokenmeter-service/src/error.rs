//! Service error types.

use tokenmeter_core::BillingError;
use tokenmeter_store::StoreError;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, CreditError>;

/// Errors surfaced by the credit services.
///
/// "Not found" and "already resolved" are outcomes, not errors; see
/// [`crate::CompletionOutcome`] and [`crate::FailOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    /// Input rejected before any I/O.
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid process configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CreditError {
    /// Whether the caller supplied invalid input.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        match self {
            Self::Billing(err) => err.is_validation(),
            Self::Store(_) | Self::Config(_) => false,
        }
    }
}
