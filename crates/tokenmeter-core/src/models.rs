//! Static model registry.
//!
//! The registry maps model ids to their pricing and capabilities. It is built
//! once at startup, either from the built-in table or from a JSON document, and
//! never mutated afterwards; share it behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{BillingError, Result};

/// Per-model token pricing in CNY.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Cost in CNY per 1,000 input tokens.
    pub input_cost_per_1k: f64,

    /// Cost in CNY per 1,000 output tokens.
    pub output_cost_per_1k: f64,

    /// Multiplier applied to output cost when thinking mode is used.
    #[serde(default = "default_thinking_multiplier")]
    pub thinking_output_multiplier: f64,
}

const fn default_thinking_multiplier() -> f64 {
    1.0
}

impl ModelPricing {
    /// Pricing without a thinking surcharge.
    #[must_use]
    pub const fn new(input_cost_per_1k: f64, output_cost_per_1k: f64) -> Self {
        Self {
            input_cost_per_1k,
            output_cost_per_1k,
            thinking_output_multiplier: 1.0,
        }
    }

    /// Set the thinking-mode output multiplier.
    #[must_use]
    pub const fn with_thinking_multiplier(mut self, multiplier: f64) -> Self {
        self.thinking_output_multiplier = multiplier;
        self
    }
}

/// Configuration for one supported model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model id as sent to the provider (e.g. "qwen-plus").
    pub model_id: String,

    /// Token pricing.
    pub pricing: ModelPricing,

    /// Maximum output tokens per request.
    pub max_tokens: u32,

    /// Whether the model has a thinking mode.
    #[serde(default)]
    pub supports_thinking: bool,
}

/// Immutable lookup table of model configurations.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelConfig>,
}

impl ModelRegistry {
    /// Build a registry from a list of model configurations.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Configuration` if the list is empty, contains a
    /// duplicate id, or has negative prices or a multiplier below 1.
    pub fn from_models(models: Vec<ModelConfig>) -> Result<Self> {
        if models.is_empty() {
            return Err(BillingError::Configuration(
                "model registry must contain at least one model".into(),
            ));
        }

        let mut map = HashMap::with_capacity(models.len());
        for model in models {
            let pricing = &model.pricing;
            if pricing.input_cost_per_1k < 0.0 || pricing.output_cost_per_1k < 0.0 {
                return Err(BillingError::Configuration(format!(
                    "model {} has a negative price",
                    model.model_id
                )));
            }
            if pricing.thinking_output_multiplier < 1.0 {
                return Err(BillingError::Configuration(format!(
                    "model {} has a thinking multiplier below 1.0",
                    model.model_id
                )));
            }
            if let Some(previous) = map.insert(model.model_id.clone(), model) {
                return Err(BillingError::Configuration(format!(
                    "duplicate model id {}",
                    previous.model_id
                )));
            }
        }

        Ok(Self { models: map })
    }

    /// Parse a registry from a JSON array of model configurations.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::Configuration` if the JSON is malformed or the
    /// table is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let models: Vec<ModelConfig> = serde_json::from_str(json)
            .map_err(|e| BillingError::Configuration(format!("invalid model table: {e}")))?;
        Self::from_models(models)
    }

    /// The built-in model table.
    #[must_use]
    pub fn builtin() -> Self {
        let models = [
            ModelConfig {
                model_id: "qwen-plus".into(),
                pricing: ModelPricing::new(0.0008, 0.002).with_thinking_multiplier(4.0),
                max_tokens: 8192,
                supports_thinking: true,
            },
            ModelConfig {
                model_id: "qwen-turbo".into(),
                pricing: ModelPricing::new(0.0003, 0.0006).with_thinking_multiplier(10.0),
                max_tokens: 8192,
                supports_thinking: true,
            },
            ModelConfig {
                model_id: "qwen-max".into(),
                pricing: ModelPricing::new(0.0024, 0.0096),
                max_tokens: 8192,
                supports_thinking: false,
            },
            ModelConfig {
                model_id: "deepseek-v3".into(),
                pricing: ModelPricing::new(0.002, 0.008),
                max_tokens: 8192,
                supports_thinking: false,
            },
        ];

        Self {
            models: models
                .into_iter()
                .map(|m| (m.model_id.clone(), m))
                .collect(),
        }
    }

    /// Look up a model by id.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::UnknownModel` listing every available id.
    pub fn get_model_config(&self, model_id: &str) -> Result<&ModelConfig> {
        self.models
            .get(model_id)
            .ok_or_else(|| BillingError::UnknownModel {
                model_id: model_id.to_string(),
                available: self.model_ids(),
            })
    }

    /// All configured models, sorted by id.
    #[must_use]
    pub fn get_all_models(&self) -> Vec<&ModelConfig> {
        let mut models: Vec<_> = self.models.values().collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    /// All configured model ids, sorted.
    #[must_use]
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the registry knows `model_id`.
    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
