//! Resumable rollout of one example.
//!
//! ```text
//! run(index, row, swap)
//!   ├─ CheckpointStore::open + resume_point   (skip committed steps)
//!   └─ while step < num_steps
//!        ├─ simultaneous: [cross-examiner] → both debaters concurrently
//!        │                → token-limit policy → save "transcript"
//!        └─ sequential:   [cross-examiner] → first debater → second debater
//!                         → save "transcript"
//! ```
//!
//! A recoverable turn failure ends the run with `complete = false` and a
//! diagnostic string in place of the transcript. The caller retries the
//! whole run; finished agent calls come back from the checkpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::config::{RolloutConfig, RolloutKind, TokenLimitPolicy};
use super::state::{StepTracker, TransitionError};
use crate::agents::{Debater, Judge, Method, TurnError, TurnJudges, TOKEN_LIMIT_ARGUMENT};
use crate::checkpoint::{CheckpointError, CheckpointStore, TRANSCRIPT_SLOT};
use crate::llm::CompletionDispatcher;
use crate::transcript::{
    Answers, DebaterNames, Round, RoundType, Side, Transcript, TranscriptError,
};

/// Input columns of one dataset example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleRow {
    pub question: String,
    #[serde(rename = "correct answer")]
    pub correct_answer: String,
    #[serde(rename = "negative answer")]
    pub negative_answer: String,
    #[serde(default)]
    pub story: String,
    #[serde(default)]
    pub story_title: Option<String>,
    #[serde(default)]
    pub question_set_id: Option<String>,
}

/// Judges lent to one side's debater.
#[derive(Default)]
pub struct SideJudges {
    pub bon: Option<Judge>,
    pub critic: Option<Judge>,
    pub critique_pm: Option<Judge>,
}

impl SideJudges {
    fn lend(&self) -> TurnJudges<'_> {
        TurnJudges {
            bon: self.bon.as_ref(),
            critic: self.critic.as_ref(),
            critique_pm: self.critique_pm.as_ref(),
        }
    }
}

#[derive(Default)]
pub struct Participants {
    pub correct: Option<Debater>,
    pub incorrect: Option<Debater>,
    pub cross_examiner: Option<Judge>,
    pub correct_judges: SideJudges,
    pub incorrect_judges: SideJudges,
}

impl Participants {
    pub fn debater(&self, side: Side) -> Option<&Debater> {
        match side {
            Side::Correct => self.correct.as_ref(),
            Side::Incorrect => self.incorrect.as_ref(),
        }
    }

    pub fn judges(&self, side: Side) -> &SideJudges {
        match side {
            Side::Correct => &self.correct_judges,
            Side::Incorrect => &self.incorrect_judges,
        }
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("at least one debater or a cross-examiner must be provided")]
    NoParticipants,

    #[error("sequential rollouts need both debaters")]
    SequentialNeedsBothDebaters,

    #[error("critique refinement is not supported for sequential rollouts")]
    SequentialRefinement,

    #[error("debater names must differ, both are {0:?}")]
    DuplicateNames(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("transcript: {0}")]
    Transcript(#[from] TranscriptError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("step {step} lost its checkpoint: {source}")]
    Step {
        step: usize,
        #[source]
        source: TurnError,
    },
}

/// Result of one `run` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutOutcome {
    /// Transcript JSON, or the failure diagnostic when incomplete.
    pub transcript: String,
    pub complete: bool,
}

pub struct RolloutEngine {
    method: Method,
    config: RolloutConfig,
    cache_dir: PathBuf,
    participants: Participants,
    dispatcher: Arc<CompletionDispatcher>,
}

impl RolloutEngine {
    pub fn new(
        method: Method,
        config: RolloutConfig,
        cache_dir: impl Into<PathBuf>,
        participants: Participants,
        dispatcher: Arc<CompletionDispatcher>,
    ) -> Result<Self, RolloutError> {
        let p = &participants;
        if p.correct.is_none() && p.incorrect.is_none() && p.cross_examiner.is_none() {
            return Err(RolloutError::NoParticipants);
        }
        if method == Method::Debate && config.name1 == config.name2 {
            return Err(RolloutError::DuplicateNames(config.name1.clone()));
        }
        if config.rollout_type.is_sequential() {
            if p.correct.is_none() || p.incorrect.is_none() {
                return Err(RolloutError::SequentialNeedsBothDebaters);
            }
            let refines = [Side::Correct, Side::Incorrect].into_iter().any(|side| {
                p.judges(side).critic.is_some()
                    || p.debater(side).is_some_and(|d| d.config().cbon > 0)
            });
            if refines {
                return Err(RolloutError::SequentialRefinement);
            }
        }
        Ok(Self {
            method,
            config,
            cache_dir: cache_dir.into(),
            participants,
            dispatcher,
        })
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    fn names(&self, swap: bool) -> DebaterNames {
        let p = &self.participants;
        let (correct, incorrect) = match self.method {
            Method::Debate if swap => (Some(&self.config.name2), Some(&self.config.name1)),
            Method::Debate => (Some(&self.config.name1), Some(&self.config.name2)),
            Method::Consultancy => {
                let consultant = self.config.consultant_name.as_ref();
                (
                    consultant.filter(|_| p.correct.is_some()),
                    consultant.filter(|_| p.incorrect.is_some()),
                )
            }
        };
        DebaterNames {
            correct: correct.cloned(),
            incorrect: incorrect.cloned(),
            cross_examiner: self
                .config
                .cross_examiner_name
                .clone()
                .filter(|_| p.cross_examiner.is_some()),
            judge: None,
        }
    }

    fn initial_transcript(&self, index: u64, row: &ExampleRow, swap: bool) -> Transcript {
        let answers = Answers {
            correct: row.correct_answer.clone(),
            incorrect: row.negative_answer.clone(),
        };
        Transcript::new(index, row.question.clone(), answers, self.names(swap))
            .story(row.story_title.clone(), row.story.clone())
            .question_set_id(row.question_set_id.clone())
            .swapped(swap)
            .rollout_type(self.config.rollout_type.as_str())
    }

    /// Run (or resume) the rollout for one example.
    pub async fn run(
        &self,
        index: u64,
        row: &ExampleRow,
        swap: bool,
    ) -> Result<RolloutOutcome, RolloutError> {
        let store = CheckpointStore::open(&self.cache_dir, index)?;
        let resume = store.resume_point();
        let mut transcript = match resume.transcript {
            Some(json) => Transcript::from_json(&json)?,
            None => self.initial_transcript(index, row, swap),
        };
        if resume.step > 0 {
            info!(index, step = resume.step, "Resuming rollout from checkpoint");
        }

        let num_steps = self.config.num_steps;
        let mut tracker = StepTracker::new(resume.step);
        let mut transcript_string = transcript.to_json()?;
        let mut failed = false;

        while tracker.committed_steps() < num_steps && !transcript.token_limit_reached() {
            tracker.begin()?;
            let step = tracker.step();
            let started = Instant::now();
            let result = match self.config.rollout_type {
                RolloutKind::Simultaneous => {
                    self.simultaneous_step(&mut transcript, step, &store, started)
                        .await
                }
                RolloutKind::Sequential => {
                    self.sequential_step(&mut transcript, step, &store, swap, started)
                        .await
                }
            };
            match result {
                Ok(()) => {
                    tracker.commit()?;
                    let elapsed = started.elapsed().as_secs_f64();
                    info!(
                        index,
                        step,
                        elapsed_secs = elapsed,
                        "Step {step} completed in {elapsed:.3} (index {index})"
                    );
                    transcript_string = transcript.to_json()?;
                }
                Err(source) if source.is_recoverable() => {
                    let message = format!(
                        "Error occurred on debate {index}, step {step}. Error message: {source}."
                    );
                    info!(index, step, error = %source, "{message}");
                    tracker.fail(&message)?;
                    transcript_string = message;
                    failed = true;
                    break;
                }
                Err(source) => return Err(RolloutError::Step { step, source }),
            }
        }

        let complete =
            !failed && (tracker.committed_steps() >= num_steps || transcript.token_limit_reached());
        if complete {
            if self.participants.correct.is_some() || self.participants.incorrect.is_some() {
                self.dispatcher.log_model_timings();
            }
            info!(index, steps = tracker.committed_steps(), "Completed: {index}");
        }
        debug!(index, status = %tracker.status_line(), "Rollout finished");

        Ok(RolloutOutcome {
            transcript: transcript_string,
            complete,
        })
    }

    async fn simultaneous_step(
        &self,
        t: &mut Transcript,
        step: usize,
        store: &CheckpointStore,
        started: Instant,
    ) -> Result<(), TurnError> {
        let mut round = Round::new(RoundType::Sim);
        let mut response = Round::new(RoundType::Sim);
        if let Some(examiner) = self.participants.cross_examiner.as_ref().filter(|_| step != 0) {
            let (question, raw) = examiner.take_turn(t, step, store).await?;
            round.cross_examiner = Some(question.into());
            response.cross_examiner = Some(raw.into());
        }
        t.push_round(round, response);

        let snapshot = t.clone();
        let mut turns = FuturesUnordered::new();
        for side in [Side::Correct, Side::Incorrect] {
            if let Some(debater) = self.participants.debater(side) {
                let judges = self.participants.judges(side).lend();
                let snapshot = &snapshot;
                turns.push(async move {
                    debater
                        .take_turn(snapshot, step, store, judges)
                        .await
                        .map(|output| (side, output))
                });
            }
        }

        let mut token_limit_hit = false;
        // The first failure drops the remaining turn.
        while let Some(result) = turns.next().await {
            let (side, output) = result?;
            token_limit_hit |= output.argument == TOKEN_LIMIT_ARGUMENT;
            patch_side(t, side, output.argument, output.audit)?;
        }

        if token_limit_hit {
            info!(
                index = t.index,
                step,
                policy = ?self.config.token_limit_policy,
                "Token limit reached for one debater, ending the debate"
            );
            if self.config.token_limit_policy == TokenLimitPolicy::OverrideBoth {
                let method = self.method;
                let participants = &self.participants;
                if let Some(open) = t.last_round_mut() {
                    for side in [Side::Correct, Side::Incorrect] {
                        if method == Method::Debate || participants.debater(side).is_some() {
                            open.set_side(side, TOKEN_LIMIT_ARGUMENT);
                        }
                    }
                }
            }
            t.mark_token_limit_reached();
        }

        t.record_step_duration(started.elapsed().as_secs_f64());
        store.save(step, TRANSCRIPT_SLOT, t.to_json()?)?;
        Ok(())
    }

    async fn sequential_step(
        &self,
        t: &mut Transcript,
        step: usize,
        store: &CheckpointStore,
        swap: bool,
        started: Instant,
    ) -> Result<(), TurnError> {
        let kind = if step == 0 {
            RoundType::Sim
        } else {
            RoundType::Seq
        };
        t.push_round(Round::new(kind), Round::new(kind));
        if let Some(examiner) = self.participants.cross_examiner.as_ref().filter(|_| step != 0) {
            let (question, raw) = examiner.take_turn(t, step, store).await?;
            let mut round = Round::new(kind);
            let mut response = Round::new(kind);
            round.cross_examiner = Some(question.into());
            response.cross_examiner = Some(raw.into());
            t.patch_last(round, response)?;
        }

        let order = if swap {
            [Side::Incorrect, Side::Correct]
        } else {
            [Side::Correct, Side::Incorrect]
        };
        // Opening arguments are written blind: the first debater's step-0
        // argument is only revealed once both are in.
        let mut pending = None;
        for (position, side) in order.into_iter().enumerate() {
            let Some(debater) = self.participants.debater(side) else {
                continue;
            };
            let judges = TurnJudges {
                bon: self.participants.judges(side).bon.as_ref(),
                ..TurnJudges::default()
            };
            let output = debater.take_turn(t, step, store, judges).await?;
            if position == 0 && step == 0 {
                pending = Some((side, output));
                continue;
            }
            if let Some((first_side, first)) = pending.take() {
                patch_side(t, first_side, first.argument, first.audit)?;
            }
            patch_side(t, side, output.argument, output.audit)?;
        }
        if let Some((first_side, first)) = pending.take() {
            patch_side(t, first_side, first.argument, first.audit)?;
        }

        t.record_step_duration(started.elapsed().as_secs_f64());
        store.save(step, TRANSCRIPT_SLOT, t.to_json()?)?;
        Ok(())
    }
}

/// Write one side's argument and audit into the open round.
fn patch_side(
    t: &mut Transcript,
    side: Side,
    argument: String,
    audit: String,
) -> Result<(), TranscriptError> {
    let mut round = t.last_round().cloned().ok_or(TranscriptError::NoOpenRound)?;
    let mut response = t
        .responses()
        .last()
        .cloned()
        .ok_or(TranscriptError::NoOpenRound)?;
    round.set_side(side, argument);
    response.set_side(side, audit);
    t.patch_last(round, response)
}
