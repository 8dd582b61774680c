use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Header of a daily result file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub total_matches: usize,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed: Vec<String>,
}

/// Contents of a daily result file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultFile {
    pub metadata: ResultMetadata,
    #[serde(default)]
    pub matches: Vec<Value>,
}

/// Writes extracted matches to one JSON file per day, merged by `match_id`
#[derive(Debug, Clone)]
pub struct ResultStore {
    directory: PathBuf,
}

impl ResultStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// `matches_DDMMYY.json` for the given day
    pub fn file_for(&self, day: NaiveDate) -> PathBuf {
        self.directory.join(format!("matches_{}.json", day.format("%d%m%y")))
    }

    pub async fn load(&self, path: &Path) -> Result<ResultFile> {
        if !path.exists() {
            return Ok(ResultFile::default());
        }
        let contents = fs::read_to_string(path)
            .await
            .context(format!("Failed to read result file: {}", path.display()))?;
        serde_json::from_str(&contents).context(format!("Failed to parse result file: {}", path.display()))
    }

    /// Ids of the matches already stored in `path`
    pub async fn stored_ids(&self, path: &Path) -> Result<HashSet<String>> {
        let file = self.load(path).await?;
        Ok(file.matches.iter().filter_map(match_id).map(str::to_string).collect())
    }

    /// Merge results into `path`.
    ///
    /// A match replaces any earlier entry with the same `match_id`. A match
    /// that now succeeded leaves the failed list.
    pub async fn save_to(&self, path: &Path, matches: &[Value], failed: &[String]) -> Result<()> {
        let mut file = self.load(path).await?;

        for incoming in matches {
            let id = match_id(incoming);
            match id.and_then(|id| file.matches.iter().position(|m| match_id(m) == Some(id))) {
                Some(index) => file.matches[index] = incoming.clone(),
                None => file.matches.push(incoming.clone()),
            }
        }

        let succeeded: BTreeSet<&str> = file.matches.iter().filter_map(match_id).collect();
        let mut failed_ids: BTreeSet<String> = file.metadata.failed.drain(..).collect();
        failed_ids.extend(failed.iter().cloned());
        file.metadata.failed = failed_ids
            .into_iter()
            .filter(|id| !succeeded.contains(id.as_str()))
            .collect();

        file.metadata.total_matches = file.matches.len();
        file.metadata.last_update = Some(Utc::now());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(&file).context("Failed to serialize results")?;
        fs::write(path, contents)
            .await
            .context(format!("Failed to write result file: {}", path.display()))?;

        debug!("Wrote {} matches to {}", file.matches.len(), path.display());
        info!(
            saved = matches.len(),
            failed = file.metadata.failed.len(),
            "Results saved to {}",
            path.display()
        );
        Ok(())
    }
}

fn match_id(value: &Value) -> Option<&str> {
    value.get("match_id").and_then(Value::as_str)
}
