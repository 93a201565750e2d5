//! JSON Lines dataset with result columns written back in place.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use debate_engine::rollout::ExampleRow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// One dataset line. Columns this crate does not know about survive a rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
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
    #[serde(default)]
    pub complete: bool,
    /// Transcript JSON, or a failure diagnostic while incomplete.
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_judge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_judge: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetRow {
    pub fn example(&self) -> ExampleRow {
        ExampleRow {
            question: self.question.clone(),
            correct_answer: self.correct_answer.clone(),
            negative_answer: self.negative_answer.clone(),
            story: self.story.clone(),
            story_title: self.story_title.clone(),
            question_set_id: self.question_set_id.clone(),
        }
    }

    /// Copy of the inputs with every result column cleared.
    pub fn reset(&self) -> Self {
        Self {
            complete: false,
            transcript: None,
            answer_judge: None,
            complete_judge: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    path: PathBuf,
    pub rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset {}", path.display()))?;
        let rows = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("{}:{}: malformed row", path.display(), i + 1))
            })
            .collect::<Result<Vec<DatasetRow>>>()?;
        debug!(path = %path.display(), rows = rows.len(), "Loaded dataset");
        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }

    pub fn new(path: impl Into<PathBuf>, rows: Vec<DatasetRow>) -> Self {
        Self {
            path: path.into(),
            rows,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the whole file through a temp file and a rename.
    pub fn save(&self) -> Result<()> {
        let mut out = String::new();
        for row in &self.rows {
            out.push_str(&serde_json::to_string(row).context("Failed to serialize dataset row")?);
            out.push('\n');
        }
        let temp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&temp_path, out)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn complete_count(&self) -> usize {
        self.rows.iter().filter(|r| r.complete).count()
    }
}

/// `<dir>/<stem>_swap.jsonl` next to `path`.
pub fn swap_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_swap.jsonl"))
}
