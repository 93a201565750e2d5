//! Step state machine: phases, legal transitions, and a timestamped log.
//!
//! ```text
//! Pending(k) → Running(k) → Committed(k) → Running(k+1) → …
//!                         ↘ Failed(k)
//! ```
//!
//! A step is `Committed` only after its transcript slot is durably written.
//! `Failed` is terminal for the run; the outer driver re-invokes the rollout
//! and the checkpoint decides where it resumes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Resumed or created, no step started yet.
    Pending,
    /// Agents are producing the current step.
    Running,
    /// The current step's round is checkpointed.
    Committed,
    /// The current step raised; terminal.
    Failed,
}

impl StepPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Committed => write!(f, "committed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

fn is_legal_transition(from: StepPhase, to: StepPhase) -> bool {
    use StepPhase::*;

    matches!(
        (from, to),
        (Pending, Running) | (Running, Committed) | (Running, Failed) | (Committed, Running)
    )
}

/// A single recorded phase change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTransition {
    pub step: usize,
    pub from: StepPhase,
    pub to: StepPhase,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error for invalid phase changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub step: usize,
    pub from: StepPhase,
    pub to: StepPhase,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid step transition {} → {} at step {}",
            self.from, self.to, self.step
        )
    }
}

impl std::error::Error for TransitionError {}

/// Tracks which step a rollout is on and what phase it is in.
#[derive(Debug, Clone)]
pub struct StepTracker {
    step: usize,
    phase: StepPhase,
    transitions: Vec<StepTransition>,
}

impl StepTracker {
    /// Start at `step`, the number of steps already committed on disk.
    pub fn new(step: usize) -> Self {
        Self {
            step,
            phase: StepPhase::Pending,
            transitions: Vec::new(),
        }
    }

    /// Index of the step currently (or next to be) run.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn transitions(&self) -> &[StepTransition] {
        &self.transitions
    }

    fn advance(&mut self, to: StepPhase, reason: Option<&str>) -> Result<(), TransitionError> {
        if !is_legal_transition(self.phase, to) {
            return Err(TransitionError {
                step: self.step,
                from: self.phase,
                to,
            });
        }
        tracing::debug!(step = self.step, from = %self.phase, to = %to, "Step transition");
        self.transitions.push(StepTransition {
            step: self.step,
            from: self.phase,
            to,
            timestamp: Utc::now(),
            reason: reason.map(String::from),
        });
        self.phase = to;
        Ok(())
    }

    /// Enter the next step. After a commit this moves the step index forward.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        let next_step = match self.phase {
            StepPhase::Committed => self.step + 1,
            _ => self.step,
        };
        let previous = std::mem::replace(&mut self.step, next_step);
        self.advance(StepPhase::Running, None)
            .inspect_err(|_| self.step = previous)
    }

    pub fn commit(&mut self) -> Result<(), TransitionError> {
        self.advance(StepPhase::Committed, None)
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.advance(StepPhase::Failed, Some(reason))
    }

    /// Number of steps committed, counting those restored from the checkpoint.
    pub fn committed_steps(&self) -> usize {
        match self.phase {
            StepPhase::Committed => self.step + 1,
            _ => self.step,
        }
    }

    pub fn status_line(&self) -> String {
        format!(
            "[{}] step {} | {} transitions",
            self.phase,
            self.step,
            self.transitions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tracker() {
        let tracker = StepTracker::new(0);
        assert_eq!(tracker.phase(), StepPhase::Pending);
        assert_eq!(tracker.committed_steps(), 0);
        assert!(tracker.transitions().is_empty());
    }

    #[test]
    fn test_steps_advance_on_commit() {
        let mut tracker = StepTracker::new(2);
        tracker.begin().unwrap();
        assert_eq!(tracker.step(), 2);
        tracker.commit().unwrap();
        assert_eq!(tracker.committed_steps(), 3);
        tracker.begin().unwrap();
        assert_eq!(tracker.step(), 3);
        tracker.commit().unwrap();
        assert_eq!(tracker.committed_steps(), 4);
        assert_eq!(tracker.transitions().len(), 4);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut tracker = StepTracker::new(0);
        tracker.begin().unwrap();
        tracker.fail("boom").unwrap();
        assert!(tracker.phase().is_terminal());
        assert_eq!(tracker.committed_steps(), 0);
        let err = tracker.begin().unwrap_err();
        assert_eq!(err.from, StepPhase::Failed);
        assert_eq!(
            tracker.transitions().last().and_then(|t| t.reason.as_deref()),
            Some("boom")
        );
    }

    #[test]
    fn test_commit_requires_running() {
        let mut tracker = StepTracker::new(0);
        let err = tracker.commit().unwrap_err();
        assert_eq!(err.to, StepPhase::Committed);
        assert!(err.to_string().contains("pending → committed"));
    }
}
