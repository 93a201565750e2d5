//! Completion dispatcher: one logical request → provider calls → filtered results.
//!
//! ```text
//! complete(request, is_valid)
//!   ├─ resolve model ids → single ProviderKind → registered Provider
//!   ├─ num_candidates = n × candidates_per_completion
//!   │    batch provider:  one execute(n = num_candidates)
//!   │    otherwise:       num_candidates concurrent execute(n = 1)
//!   ├─ partition by is_valid (order preserved)
//!   ├─ shortfall policy when valid < n
//!   └─ counters: cost of valid results, timings of returned results
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::catalog::ModelCatalog;
use super::error::DispatchError;
use super::provider::{Provider, ProviderKind, ProviderRequest};
use super::types::{CompletionResult, Prompt, SamplingParams, ShortfallPolicy};

/// Default attempts per provider call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// A logical generation request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_ids: Vec<String>,
    pub prompt: Prompt,
    pub max_tokens: Option<u32>,
    /// Results wanted.
    pub n: usize,
    pub max_attempts: u32,
    /// Oversampling factor applied before validation.
    pub candidates_per_completion: usize,
    pub shortfall: ShortfallPolicy,
    pub params: SamplingParams,
}

impl CompletionRequest {
    pub fn new(model_ids: impl IntoIterator<Item = impl Into<String>>, prompt: Prompt) -> Self {
        Self {
            model_ids: model_ids.into_iter().map(Into::into).collect(),
            prompt,
            max_tokens: None,
            n: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            candidates_per_completion: 1,
            shortfall: ShortfallPolicy::Error,
            params: SamplingParams::default(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn n(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn candidates_per_completion(mut self, k: usize) -> Self {
        self.candidates_per_completion = k;
        self
    }

    pub fn shortfall(mut self, policy: ShortfallPolicy) -> Self {
        self.shortfall = policy;
        self
    }

    pub fn params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn num_candidates(&self) -> usize {
        self.n * self.candidates_per_completion.max(1)
    }
}

#[derive(Debug, Default)]
struct DispatchStats {
    running_cost: f64,
    timings: BTreeMap<String, Vec<f64>>,
    wait_times: BTreeMap<String, Vec<f64>>,
}

/// Routes completion requests to the provider registered for each model family.
pub struct CompletionDispatcher {
    catalog: Arc<ModelCatalog>,
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    stats: Mutex<DispatchStats>,
}

impl CompletionDispatcher {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self {
            catalog,
            providers: HashMap::new(),
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    /// Register the provider for its own kind, replacing any previous one.
    pub fn register(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    fn resolve(&self, model_ids: &[String]) -> Result<&Arc<dyn Provider>, DispatchError> {
        let Some(first) = model_ids.first() else {
            return Err(DispatchError::InvalidModel(String::new()));
        };
        let kind = self.catalog.kind_of(first)?;
        for model_id in &model_ids[1..] {
            let other = self.catalog.kind_of(model_id)?;
            if other != kind {
                return Err(DispatchError::MixedProvider {
                    kinds: format!("{kind}, {other}"),
                });
            }
        }
        self.providers
            .get(&kind)
            .ok_or(DispatchError::ProviderUnavailable(kind))
    }

    /// Generate `n × candidates_per_completion` candidates and return at most `n`.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        is_valid: &(dyn Fn(&str) -> bool + Send + Sync),
    ) -> Result<Vec<CompletionResult>, DispatchError> {
        let provider = self.resolve(&request.model_ids)?;
        let num_candidates = request.num_candidates();
        if num_candidates == 0 {
            return Ok(Vec::new());
        }

        let candidates = if provider.supports_batch() {
            provider
                .execute(&ProviderRequest {
                    model_ids: request.model_ids.clone(),
                    prompt: request.prompt.clone(),
                    max_tokens: request.max_tokens,
                    n: u32::try_from(num_candidates).unwrap_or(u32::MAX),
                    max_attempts: request.max_attempts,
                    params: request.params.clone(),
                })
                .await?
        } else {
            let single = ProviderRequest {
                model_ids: request.model_ids.clone(),
                prompt: request.prompt.clone(),
                max_tokens: request.max_tokens,
                n: 1,
                max_attempts: request.max_attempts,
                params: request.params.clone(),
            };
            try_join_all((0..num_candidates).map(|_| provider.execute(&single)))
                .await?
                .into_iter()
                .flatten()
                .collect()
        };

        let (valid, invalid): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|r| is_valid(&r.completion));
        let num_valid = valid.len();
        let success_rate = num_valid as f64 / num_candidates as f64;
        if success_rate < 1.0 {
            info!(
                valid = num_valid,
                candidates = num_candidates,
                success_rate_pct = success_rate * 100.0,
                "`is_valid` success rate below 100%"
            );
        }

        let valid_cost: f64 = valid.iter().map(|r| r.cost).sum();
        let responses = if num_valid < request.n {
            match request.shortfall {
                ShortfallPolicy::Error => {
                    return Err(DispatchError::InsufficientValidCompletions {
                        valid: num_valid,
                        candidates: num_candidates,
                    })
                }
                ShortfallPolicy::Continue => valid,
                ShortfallPolicy::PadInvalids => {
                    let needed = request.n - num_valid;
                    let mut padded = valid;
                    padded.extend(invalid.into_iter().take(needed));
                    warn!(
                        valid = num_valid,
                        padded = needed,
                        total = padded.len(),
                        "Padded valid responses with invalid responses"
                    );
                    padded
                }
            }
        } else {
            valid
        };

        self.record(valid_cost, &responses);
        Ok(responses.into_iter().take(request.n).collect())
    }

    /// Single-result convenience; fails unless exactly one valid completion comes back.
    pub async fn complete_single(
        &self,
        request: &CompletionRequest,
        is_valid: &(dyn Fn(&str) -> bool + Send + Sync),
    ) -> Result<String, DispatchError> {
        let request = CompletionRequest {
            n: 1,
            shortfall: ShortfallPolicy::Error,
            ..request.clone()
        };
        let mut results = self.complete(&request, is_valid).await?;
        match results.pop() {
            Some(r) if results.is_empty() => Ok(r.completion),
            _ => Err(DispatchError::InsufficientValidCompletions {
                valid: 0,
                candidates: request.num_candidates(),
            }),
        }
    }

    fn record(&self, cost: f64, responses: &[CompletionResult]) {
        let mut stats = self.stats.lock();
        stats.running_cost += cost;
        for r in responses {
            stats
                .timings
                .entry(r.model_id.clone())
                .or_default()
                .push(r.api_duration_secs);
            stats
                .wait_times
                .entry(r.model_id.clone())
                .or_default()
                .push(r.wait_secs());
        }
    }

    pub fn running_cost(&self) -> f64 {
        self.stats.lock().running_cost
    }

    pub fn reset_cost(&self) {
        self.stats.lock().running_cost = 0.0;
    }

    /// API durations per model id, in call order.
    pub fn model_timings(&self) -> BTreeMap<String, Vec<f64>> {
        self.stats.lock().timings.clone()
    }

    /// Rate-limit and retry wait per model id, in call order.
    pub fn model_wait_times(&self) -> BTreeMap<String, Vec<f64>> {
        self.stats.lock().wait_times.clone()
    }

    pub fn log_model_timings(&self) {
        let stats = self.stats.lock();
        info!(total_cost = stats.running_cost, "Dispatcher cost");
        for (model_id, timings) in &stats.timings {
            let waits = stats.wait_times.get(model_id).map(Vec::as_slice).unwrap_or(&[]);
            info!(
                model_id = %model_id,
                calls = timings.len(),
                mean_response_secs = mean(timings),
                mean_wait_secs = mean(waits),
                max_wait_secs = waits.iter().copied().fold(0.0_f64, f64::max),
                min_wait_secs = waits.iter().copied().reduce(f64::min).unwrap_or(0.0),
                "Model timings"
            );
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
