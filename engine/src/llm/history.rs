//! On-disk prompt/response audit log, one file per provider call.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{CompletionResult, Prompt};

const RESPONSE_SEPARATOR: &str = "\n\n======RESPONSE======\n\n";

/// Audit log rooted at a directory. Write failures are logged, never raised.
#[derive(Debug, Clone)]
pub struct PromptHistory {
    dir: PathBuf,
}

impl PromptHistory {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the prompt to a fresh file and return its path.
    pub fn record_prompt(&self, prompt: &Prompt) -> Option<PathBuf> {
        let name = format!(
            "{}_{}_prompt.txt",
            Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f"),
            Uuid::new_v4().simple()
        );
        let path = self.dir.join(name);
        let result = serde_json::to_string_pretty(prompt)
            .map_err(io::Error::from)
            .and_then(|json| fs::write(&path, unescape_newlines(&json)));
        match result {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write prompt history");
                None
            }
        }
    }

    /// Append the responses to a file created by [`record_prompt`](Self::record_prompt).
    pub fn record_responses(&self, path: &Path, responses: &[CompletionResult]) {
        let result = serde_json::to_string_pretty(responses)
            .map_err(io::Error::from)
            .and_then(|json| {
                let mut file = OpenOptions::new().append(true).open(path)?;
                file.write_all(RESPONSE_SEPARATOR.as_bytes())?;
                file.write_all(unescape_newlines(&json).as_bytes())
            });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to append responses to history");
        }
    }

    /// Delete history files whose modification time is older than `age`.
    pub fn prune_older_than(&self, age: Duration) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let cutoff = SystemTime::now().checked_sub(age);
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| cutoff.is_some_and(|c| modified < c))
                .unwrap_or(false);
            if is_stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        debug!(removed, dir = %self.dir.display(), "Pruned prompt history");
        removed
    }
}

fn unescape_newlines(json: &str) -> String {
    json.replace("\\n", "\n")
}
