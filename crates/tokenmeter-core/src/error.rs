//! Error types for tokenmeter.

use crate::ids::IdError;

/// Result type for tokenmeter domain operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors raised by domain validation and configuration.
///
/// Every variant except [`BillingError::Configuration`] is raised before any
/// I/O happens.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BillingError {
    /// A token count was negative.
    #[error("token counts must be non-negative: input={input_tokens}, output={output_tokens}")]
    NegativeTokens {
        /// Input token count as supplied.
        input_tokens: i64,
        /// Output token count as supplied.
        output_tokens: i64,
    },

    /// A cost or credit amount was negative where it must not be.
    #[error("{field} must be non-negative, got {value}")]
    NegativeAmount {
        /// Name of the offending field.
        field: &'static str,
        /// The supplied value.
        value: f64,
    },

    /// Page number below 1.
    #[error("page must be >= 1, got {0}")]
    InvalidPage(u32),

    /// Page size outside `1..=MAX_PAGE_SIZE`.
    #[error("page_size must be between 1 and {max}, got {page_size}")]
    InvalidPageSize {
        /// The supplied page size.
        page_size: u32,
        /// The largest accepted page size.
        max: u32,
    },

    /// Status filter that is not a known transaction status.
    #[error("unknown transaction status {0:?}, expected pending, completed or failed")]
    UnknownStatus(String),

    /// Model id missing from the registry.
    #[error("unknown model {model_id:?}; available models: {}", .available.join(", "))]
    UnknownModel {
        /// The requested model id.
        model_id: String,
        /// Every model id the registry knows, sorted.
        available: Vec<String>,
    },

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BillingError {
    /// Whether this error is an input-validation failure.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}
