//! Per-example checkpoint file.
//!
//! One JSON array per example id. Element `i` holds the named result slots of
//! step `i` (`responses_<side>`, `critiques_<side>`, `refinement_<side>`,
//! `response_judge`, `transcript`). A step is closed once its `transcript`
//! slot exists; an open step keeps its finer-grained slots so finished LLM
//! calls are reused on resume.
//!
//! Every save rewrites the whole array through a temp file and a rename.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Slot whose presence marks a step as closed.
pub const TRANSCRIPT_SLOT: &str = "transcript";

pub type CheckpointEntry = Map<String, Value>;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("cannot save step {step}: only {len} steps recorded")]
    StepGap { step: usize, len: usize },
}

/// Where a rollout picks up after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// Number of closed steps.
    pub step: usize,
    /// Transcript JSON from the last closed step.
    pub transcript: Option<String>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    entries: Mutex<Vec<CheckpointEntry>>,
}

impl CheckpointStore {
    /// Open `<cache_dir>/<id>.json`. A missing or unparsable file starts empty.
    pub fn open(cache_dir: &Path, id: u64) -> Result<Self, CheckpointError> {
        fs::create_dir_all(cache_dir).map_err(|source| CheckpointError::Io {
            path: cache_dir.to_path_buf(),
            source,
        })?;
        let path = cache_dir.join(format!("{id}.json"));
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<CheckpointEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupted checkpoint file, starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Count closed steps and drop anything recorded past the first open one.
    pub fn resume_point(&self) -> ResumePoint {
        let mut entries = self.entries.lock();
        let step = entries
            .iter()
            .take_while(|e| e.contains_key(TRANSCRIPT_SLOT))
            .count();
        if entries.len() > step + 1 {
            warn!(
                path = %self.path.display(),
                kept = step + 1,
                dropped = entries.len() - step - 1,
                "Discarding checkpoint entries past the first open step"
            );
            entries.truncate(step + 1);
        }
        let transcript = step
            .checked_sub(1)
            .and_then(|i| entries[i].get(TRANSCRIPT_SLOT))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        ResumePoint { step, transcript }
    }

    pub fn get(&self, step: usize, key: &str) -> Option<Value> {
        self.entries.lock().get(step).and_then(|e| e.get(key)).cloned()
    }

    /// Typed read; a slot of the wrong shape is treated as absent.
    pub fn get_as<T: DeserializeOwned>(&self, step: usize, key: &str) -> Option<T> {
        let value = self.get(step, key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(step, key, error = %e, "Ignoring malformed checkpoint slot");
                None
            }
        }
    }

    /// Record `key` for `step` and rewrite the file.
    pub fn save(&self, step: usize, key: &str, value: impl Serialize) -> Result<(), CheckpointError> {
        let value = serde_json::to_value(value)?;
        let mut entries = self.entries.lock();
        if step > entries.len() {
            return Err(CheckpointError::StepGap {
                step,
                len: entries.len(),
            });
        }
        if step == entries.len() {
            entries.push(Map::new());
        }
        entries[step].insert(key.to_string(), value);
        self.write(&entries)?;
        debug!(step, key, path = %self.path.display(), "Saved checkpoint slot");
        Ok(())
    }

    fn write(&self, entries: &[CheckpointEntry]) -> Result<(), CheckpointError> {
        let temp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string(entries)?;
        fs::write(&temp_path, content).map_err(|source| CheckpointError::Io {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_store_resumes_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 3).unwrap();
        assert_eq!(
            store.resume_point(),
            ResumePoint {
                step: 0,
                transcript: None
            }
        );
        assert_eq!(store.path(), dir.path().join("3.json"));
    }

    #[test]
    fn test_partial_step_keeps_slots_and_resumes_there() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CheckpointStore::open(dir.path(), 0).unwrap();
            store.save(0, "responses_correct", vec!["a"]).unwrap();
            store.save(0, TRANSCRIPT_SLOT, "{\"t\":0}").unwrap();
            store.save(1, "responses_correct", vec!["b"]).unwrap();
        }
        let store = CheckpointStore::open(dir.path(), 0).unwrap();
        let resume = store.resume_point();
        assert_eq!(resume.step, 1);
        assert_eq!(resume.transcript.as_deref(), Some("{\"t\":0}"));
        let cached: Vec<String> = store.get_as(1, "responses_correct").unwrap();
        assert_eq!(cached, vec!["b"]);
    }

    #[test]
    fn test_corrupt_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("5.json"), "[{\"transcript\": ").unwrap();
        let store = CheckpointStore::open(dir.path(), 5).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.resume_point().step, 0);
    }

    #[test]
    fn test_step_gap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 1).unwrap();
        let err = store.save(2, "k", 1).unwrap_err();
        assert!(matches!(err, CheckpointError::StepGap { step: 2, len: 0 }));
    }

    #[test]
    fn test_entries_after_open_step_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let entries = json!([
            {"transcript": "t0"},
            {"responses_correct": ["x"]},
            {"transcript": "stale"}
        ]);
        fs::write(dir.path().join("9.json"), entries.to_string()).unwrap();
        let store = CheckpointStore::open(dir.path(), 9).unwrap();
        let resume = store.resume_point();
        assert_eq!(resume.step, 1);
        assert_eq!(resume.transcript.as_deref(), Some("t0"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_save_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), 2).unwrap();
        store.save(0, "k", "v").unwrap();
        let first = fs::read_to_string(store.path()).unwrap();
        store.save(0, "k", "v").unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), first);
        assert!(!dir.path().join("2.json.tmp").exists());
    }
}
