//! Model id → provider family and price lookup.
//!
//! Explicit registrations win; otherwise a small set of family rules decides
//! the provider. Prices default to zero unless registered.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::DispatchError;
use super::provider::ProviderKind;

/// Provider family and per-token prices for one model id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub kind: ProviderKind,
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
}

impl ModelSpec {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            input_price: 0.0,
            output_price: 0.0,
        }
    }

    pub fn with_prices(mut self, input_price: f64, output_price: f64) -> Self {
        self.input_price = input_price;
        self.output_price = output_price;
        self
    }

    /// Cost of a completion given its token usage.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 * self.input_price + completion_tokens as f64 * self.output_price
    }
}

const COMPLETION_MODELS: &[&str] = &[
    "davinci-002",
    "babbage-002",
    "text-davinci-003",
    "text-davinci-002",
    "gpt-4-base",
    "gpt-3.5-turbo-instruct",
];

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelSpec>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, model_id: impl Into<String>, spec: ModelSpec) -> Self {
        self.models.insert(model_id.into(), spec);
        self
    }

    pub fn insert(&mut self, model_id: impl Into<String>, spec: ModelSpec) {
        self.models.insert(model_id.into(), spec);
    }

    /// Resolve the spec for `model_id`.
    pub fn resolve(&self, model_id: &str) -> Result<ModelSpec, DispatchError> {
        if let Some(spec) = self.models.get(model_id) {
            return Ok(*spec);
        }
        family_of(model_id)
            .map(ModelSpec::new)
            .ok_or_else(|| DispatchError::InvalidModel(model_id.to_string()))
    }

    pub fn kind_of(&self, model_id: &str) -> Result<ProviderKind, DispatchError> {
        self.resolve(model_id).map(|s| s.kind)
    }

    /// Input price used to order candidates cheapest-first.
    pub fn input_price(&self, model_id: &str) -> f64 {
        self.resolve(model_id).map(|s| s.input_price).unwrap_or(0.0)
    }
}

fn family_of(model_id: &str) -> Option<ProviderKind> {
    if COMPLETION_MODELS.contains(&model_id) {
        return Some(ProviderKind::OpenAICompletion);
    }
    if model_id.starts_with("gpt-4")
        || model_id.starts_with("gpt-3.5-turbo")
        || model_id.starts_with("ft:gpt-")
    {
        return Some(ProviderKind::OpenAIChat);
    }
    if model_id.starts_with("claude-") {
        return Some(ProviderKind::AnthropicChat);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_rules() {
        let c = ModelCatalog::new();
        assert_eq!(c.kind_of("gpt-4-1106-preview").unwrap(), ProviderKind::OpenAIChat);
        assert_eq!(c.kind_of("ft:gpt-3.5-turbo:org::abc").unwrap(), ProviderKind::OpenAIChat);
        assert_eq!(c.kind_of("gpt-3.5-turbo-instruct").unwrap(), ProviderKind::OpenAICompletion);
        assert_eq!(c.kind_of("gpt-4-base").unwrap(), ProviderKind::OpenAICompletion);
        assert_eq!(c.kind_of("claude-2.1").unwrap(), ProviderKind::AnthropicChat);
    }

    #[test]
    fn test_unknown_model_is_invalid() {
        let err = ModelCatalog::new().resolve("llama-70b").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidModel(ref id) if id == "llama-70b"));
    }

    #[test]
    fn test_registration_overrides_family() {
        let c = ModelCatalog::new().register(
            "gpt-4",
            ModelSpec::new(ProviderKind::OpenAIChat).with_prices(0.00003, 0.00006),
        );
        assert_eq!(c.input_price("gpt-4"), 0.00003);
        assert_eq!(c.input_price("gpt-4-0613"), 0.0);
        let spec = c.resolve("gpt-4").unwrap();
        assert!((spec.cost(1000, 500) - 0.06).abs() < 1e-12);
    }
}
