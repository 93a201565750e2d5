//! Dataset driver: fan rollouts and judgements out over a bounded task set.
//!
//! ```text
//! run_debates(swap)
//!   ├─ pass(swap)            ── up to 1 + batch_retries batches while rows stay incomplete
//!   └─ pass(true)            ── sequential rollouts only, into <dataset>_swap.jsonl
//!
//! batch
//!   load rows[..limit] → JoinSet { Semaphore → RolloutEngine::run } → write back → save
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use debate_engine::checkpoint::CheckpointStore;
use debate_engine::llm::CompletionDispatcher;
use debate_engine::rollout::{RolloutEngine, RolloutOutcome};
use debate_engine::transcript::Transcript;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::dataset::{swap_path, Dataset};
use crate::setup;

/// Rows looked at by one batch and how many of them are complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub complete: usize,
}

impl BatchSummary {
    pub fn all_complete(&self) -> bool {
        self.complete == self.processed
    }
}

pub struct Driver {
    config: RunnerConfig,
    dispatcher: Arc<CompletionDispatcher>,
}

impl Driver {
    pub fn new(config: RunnerConfig, dispatcher: Arc<CompletionDispatcher>) -> Self {
        Self { config, dispatcher }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn dataset_path(&self, swap: bool) -> PathBuf {
        if swap {
            swap_path(&self.config.dataset)
        } else {
            self.config.dataset.clone()
        }
    }

    /// Concurrent examples: each one may hold BoN calls in flight at once.
    pub fn permits(&self) -> usize {
        (self.config.api.num_threads / self.config.agents.max_bon()).max(1)
    }

    fn limit(&self, limit: Option<usize>, rows: usize) -> usize {
        limit.or(self.config.limit).unwrap_or(rows).min(rows)
    }

    /// Run every pass the rollout type needs. True when every row is complete.
    pub async fn run_debates(&self, swap: bool, limit: Option<usize>) -> Result<bool> {
        let mut all_complete = self.run_pass(swap, limit).await?;
        // Sequential transcripts fix the speaking order, so the swapped order
        // has to be rolled out rather than swapped at judging time.
        if self.config.rollout.rollout_type.is_sequential() && !swap {
            all_complete &= self.run_pass(true, limit).await?;
        }
        Ok(all_complete)
    }

    async fn run_pass(&self, swap: bool, limit: Option<usize>) -> Result<bool> {
        let path = self.dataset_path(swap);
        if swap && !path.exists() {
            let source = Dataset::load(&self.config.dataset)?;
            let rows = source.rows.iter().map(|r| r.reset()).collect();
            Dataset::new(&path, rows).save()?;
            info!(path = %path.display(), "Created swapped dataset");
        }

        let attempts = self.config.batch_retries + 1;
        for attempt in 0..attempts {
            let summary = self.run_batch(&path, swap, limit).await?;
            if summary.all_complete() {
                return Ok(true);
            }
            if attempt + 1 < attempts {
                warn!(
                    attempt,
                    incomplete = summary.processed - summary.complete,
                    "Rows still incomplete, rerunning batch"
                );
            }
        }
        Ok(false)
    }

    /// One pass over the incomplete rows of `path`.
    pub async fn run_batch(
        &self,
        path: &Path,
        swap: bool,
        limit: Option<usize>,
    ) -> Result<BatchSummary> {
        let mut dataset = Dataset::load(path)?;
        let limit = self.limit(limit, dataset.rows.len());
        let pending: Vec<usize> = (0..limit).filter(|&i| !dataset.rows[i].complete).collect();

        let engine = Arc::new(
            RolloutEngine::new(
                self.config.method,
                self.config.rollout.clone(),
                self.config.cache_dir(swap),
                setup::build_participants(&self.config, &self.dispatcher),
                self.dispatcher.clone(),
            )
            .context("Failed to build rollout engine")?,
        );
        let sem = Arc::new(Semaphore::new(self.permits()));
        let mut join_set: JoinSet<(usize, Result<RolloutOutcome, String>)> = JoinSet::new();
        let mut task_rows: HashMap<task::Id, usize> = HashMap::new();

        for index in pending {
            let engine = engine.clone();
            let sem = sem.clone();
            let example = dataset.rows[index].example();
            let handle = join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let outcome = engine
                    .run(index as u64, &example, swap)
                    .await
                    .map_err(|e| e.to_string());
                (index, outcome)
            });
            task_rows.insert(handle.id(), index);
        }

        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Rollout task panicked");
                    match task_rows.get(&e.id()) {
                        Some(&index) => (index, Err(e.to_string())),
                        None => continue,
                    }
                }
            };
            let row = &mut dataset.rows[index];
            match outcome {
                Ok(outcome) => {
                    row.complete = outcome.complete;
                    row.transcript = Some(outcome.transcript);
                }
                Err(e) => {
                    error!(index, error = %e, "Rollout aborted");
                    row.complete = false;
                    row.transcript = Some(format!("Error occurred on debate {index}. Error message: {e}."));
                }
            }
        }

        let complete = dataset.rows[..limit].iter().filter(|r| r.complete).count();
        info!(
            processed = limit,
            complete,
            "Processed {limit} rows. {complete} were complete."
        );
        dataset.save()?;
        Ok(BatchSummary {
            processed: limit,
            complete,
        })
    }

    /// Judge every completed transcript and record the answers.
    ///
    /// Swapped judgements are written to the `_swap` dataset so the plain one
    /// keeps its unswapped transcripts.
    pub async fn run_judge(
        &self,
        swap: bool,
        round_limit: Option<usize>,
        limit: Option<usize>,
    ) -> Result<BatchSummary> {
        let sequential = self.config.rollout.rollout_type.is_sequential();
        let source = self.dataset_path(swap && sequential);
        let mut dataset = Dataset::load(&source)?;
        let limit = self.limit(limit, dataset.rows.len());

        let incomplete = dataset.rows[..limit].iter().filter(|r| !r.complete).count();
        if incomplete > 0 {
            bail!("{incomplete} rows in {} are incomplete, run debates first", source.display());
        }
        let Some(judge) = setup::build_judge(&self.config, &self.dispatcher) else {
            bail!("no [agents.judge] configured");
        };
        let judge = Arc::new(judge);
        let sem = Arc::new(Semaphore::new(self.config.api.num_threads.max(1)));
        let mut join_set: JoinSet<(usize, Result<(String, String), String>)> = JoinSet::new();
        let mut task_rows: HashMap<task::Id, usize> = HashMap::new();

        for index in 0..limit {
            let transcript = dataset.rows[index].transcript.clone().unwrap_or_default();
            let judge = judge.clone();
            let sem = sem.clone();
            let handle = join_set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let decided = async {
                    let t = Transcript::from_json(&transcript).map_err(|e| e.to_string())?;
                    let decision = judge
                        .decide(t, swap, round_limit)
                        .await
                        .map_err(|e| e.to_string())?;
                    let json = decision.transcript.to_json().map_err(|e| e.to_string())?;
                    Ok((decision.judgement, json))
                };
                (index, decided.await)
            });
            task_rows.insert(handle.id(), index);
        }

        while let Some(joined) = join_set.join_next().await {
            let (index, decided) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Judge task panicked");
                    match task_rows.get(&e.id()) {
                        Some(&index) => (index, Err(e.to_string())),
                        None => continue,
                    }
                }
            };
            let row = &mut dataset.rows[index];
            match decided {
                Ok((judgement, transcript)) => {
                    row.answer_judge = Some(judgement);
                    row.complete_judge = Some(true);
                    row.transcript = Some(transcript);
                }
                Err(e) => {
                    warn!(index, error = %e, "Judge failed");
                    row.complete_judge = Some(false);
                }
            }
        }

        let complete = dataset.rows[..limit]
            .iter()
            .filter(|r| r.complete_judge == Some(true))
            .count();
        info!(processed = limit, complete, swap, "Judged {limit} rows. {complete} were complete.");

        let destination = self.dataset_path(swap);
        Dataset::new(&destination, dataset.rows).save()?;
        self.dispatcher.log_model_timings();
        Ok(BatchSummary {
            processed: limit,
            complete,
        })
    }

    /// Closed steps recorded for `index`, for progress reporting.
    pub fn checkpointed_steps(&self, index: u64, swap: bool) -> Result<usize> {
        let store = CheckpointStore::open(&self.config.cache_dir(swap), index)?;
        Ok(store.resume_point().step)
    }
}
