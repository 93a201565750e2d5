//! Dataset driver for resumable debate rollouts and judging.
//!
//! Reads a JSON Lines dataset, runs one rollout per incomplete row through
//! [`debate_engine::rollout::RolloutEngine`], and writes transcripts and
//! judge answers back into the file.

pub mod config;
pub mod dataset;
pub mod driver;
pub mod setup;
