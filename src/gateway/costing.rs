use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

/// Model name that carries the fallback rate in pricing files.
pub const DEFAULT_PRICING_KEY: &str = "*";

/// Per-model USD rate table. Rates are per 1K tokens and are applied to
/// input and output token counts independently.
#[derive(Clone, Debug)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
    fallback: ModelPricing,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelPricing {
    pub input_usd_per_1k_tokens: f64,
    pub output_usd_per_1k_tokens: f64,
}

impl ModelPricing {
    pub const fn new(input_usd_per_1k_tokens: f64, output_usd_per_1k_tokens: f64) -> Self {
        Self {
            input_usd_per_1k_tokens,
            output_usd_per_1k_tokens,
        }
    }
}

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("invalid pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid pricing entry for model {model}: expected object")]
    InvalidModelEntry { model: String },
    #[error("invalid pricing entry for model {model}: missing both input/output cost")]
    MissingCosts { model: String },
    #[error("invalid pricing entry for model {model}: invalid cost value for {field}")]
    InvalidCostValue { model: String, field: &'static str },
    #[error("read pricing file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert("gpt-4o".to_string(), ModelPricing::new(0.005, 0.015));
        models.insert("gpt-3.5-turbo".to_string(), ModelPricing::new(0.0005, 0.0015));
        Self {
            models,
            fallback: ModelPricing::new(0.001, 0.002),
        }
    }
}

impl PricingTable {
    pub fn empty(fallback: ModelPricing) -> Self {
        Self {
            models: HashMap::new(),
            fallback,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PricingTableError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, PricingTableError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_json_value(&value)
    }

    /// Accepts `{model: {input_cost_per_token | input_cost_per_1k_tokens,
    /// output_cost_per_token | output_cost_per_1k_tokens}}`. Entries are
    /// merged over the built-in table; a `"*"` entry replaces the fallback.
    pub fn from_json_value(value: &serde_json::Value) -> Result<Self, PricingTableError> {
        let Some(root) = value.as_object() else {
            return Err(PricingTableError::InvalidRoot);
        };

        let mut table = Self::default();
        for (model, entry) in root {
            let Some(obj) = entry.as_object() else {
                return Err(PricingTableError::InvalidModelEntry {
                    model: model.clone(),
                });
            };

            let input = parse_cost_per_1k(obj, "input_cost_per_token", "input_cost_per_1k_tokens")
                .map(|usd| validate_cost(usd, model, "input_cost"))
                .transpose()?;
            let output =
                parse_cost_per_1k(obj, "output_cost_per_token", "output_cost_per_1k_tokens")
                    .map(|usd| validate_cost(usd, model, "output_cost"))
                    .transpose()?;

            if input.is_none() && output.is_none() {
                return Err(PricingTableError::MissingCosts {
                    model: model.clone(),
                });
            }

            let pricing = ModelPricing::new(input.unwrap_or(0.0), output.unwrap_or(0.0));
            if model == DEFAULT_PRICING_KEY {
                table.fallback = pricing;
            } else {
                table.models.insert(model.clone(), pricing);
            }
        }

        Ok(table)
    }

    pub fn model_pricing(&self, model: &str) -> &ModelPricing {
        self.models.get(model).unwrap_or(&self.fallback)
    }

    pub fn estimate_cost_usd(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let pricing = self.model_pricing(model);
        (input_tokens as f64 / 1000.0) * pricing.input_usd_per_1k_tokens
            + (output_tokens as f64 / 1000.0) * pricing.output_usd_per_1k_tokens
    }
}

fn parse_cost_per_1k(
    obj: &serde_json::Map<String, serde_json::Value>,
    per_token_key: &'static str,
    per_1k_key: &'static str,
) -> Option<f64> {
    obj.get(per_1k_key)
        .and_then(|value| value.as_f64())
        .or_else(|| {
            obj.get(per_token_key)
                .and_then(|value| value.as_f64())
                .map(|per_token| per_token * 1000.0)
        })
}

fn validate_cost(usd: f64, model: &str, field: &'static str) -> Result<f64, PricingTableError> {
    if !usd.is_finite() || usd < 0.0 {
        return Err(PricingTableError::InvalidCostValue {
            model: model.to_string(),
            field,
        });
    }
    Ok(usd)
}
