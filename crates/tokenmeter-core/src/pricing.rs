//! Credit pricing.
//!
//! Converts token usage into credits using a model's CNY pricing.

use crate::error::{BillingError, Result};
use crate::models::{ModelConfig, ModelRegistry};

/// Value of one credit in CNY (1 credit = ¥0.001).
pub const CREDIT_TO_CNY_RATE: f64 = 0.001;

/// Calculate the credit cost of a completed request.
///
/// The thinking multiplier is applied to output tokens only when thinking was
/// requested and the model supports it. The result is rounded to two decimals.
///
/// # Errors
///
/// Returns `BillingError::NegativeTokens` if either count is negative.
#[allow(clippy::cast_precision_loss)]
pub fn calculate_cost_in_credits(
    input_tokens: i64,
    output_tokens: i64,
    model_config: &ModelConfig,
    thinking_enabled: bool,
) -> Result<f64> {
    if input_tokens < 0 || output_tokens < 0 {
        return Err(BillingError::NegativeTokens {
            input_tokens,
            output_tokens,
        });
    }

    let pricing = &model_config.pricing;
    let multiplier = if thinking_enabled && model_config.supports_thinking {
        pricing.thinking_output_multiplier
    } else {
        1.0
    };

    let input_cny = (input_tokens as f64 / 1000.0) * pricing.input_cost_per_1k;
    let output_cny = (output_tokens as f64 / 1000.0) * pricing.output_cost_per_1k * multiplier;

    Ok(round_credits((input_cny + output_cny) / CREDIT_TO_CNY_RATE))
}

/// Round a credit amount to two decimal places.
#[must_use]
pub fn round_credits(credits: f64) -> f64 {
    (credits * 100.0).round() / 100.0
}

impl ModelRegistry {
    /// Estimate the cost of a request before it is dispatched.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::UnknownModel` or `BillingError::NegativeTokens`.
    pub fn estimate_cost(
        &self,
        model_id: &str,
        estimated_input_tokens: i64,
        estimated_output_tokens: i64,
        thinking_enabled: bool,
    ) -> Result<f64> {
        let config = self.get_model_config(model_id)?;
        calculate_cost_in_credits(
            estimated_input_tokens,
            estimated_output_tokens,
            config,
            thinking_enabled,
        )
    }
}
