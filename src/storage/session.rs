use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, warn};

use crate::error::{Result, ScraperError};

/// Outcome recorded for a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Completed,
    Failed,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialEntry {
    pub data: Value,
    pub status: MatchStatus,
    pub timestamp: DateTime<Utc>,
}

/// Checkpoint of a scraping run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub total_matches: usize,
    pub completed_matches: Vec<String>,
    pub failed_matches: Vec<String>,
    pub current_match_index: usize,
    pub partial_data: BTreeMap<String, PartialEntry>,
    #[serde(default)]
    pub is_complete: bool,
}

impl SessionState {
    fn new(total_matches: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id: format!("session_{}", Local::now().format("%Y%m%d_%H%M%S")),
            start_time: now,
            last_update: now,
            total_matches,
            completed_matches: Vec::new(),
            failed_matches: Vec::new(),
            current_match_index: 0,
            partial_data: BTreeMap::new(),
            is_complete: false,
        }
    }
}

/// Durable storage for a single session checkpoint
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, state: &SessionState) -> Result<()>;

    /// `None` when no checkpoint exists
    async fn load(&self) -> Result<Option<SessionState>>;

    async fn clear(&self) -> Result<()>;
}

/// Checkpoint kept as a pretty-printed JSON file
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    path: PathBuf,
}

impl JsonSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn session_error(action: &str, path: &Path, err: impl std::fmt::Display) -> ScraperError {
    ScraperError::Session(format!("failed to {} {}: {}", action, path.display(), err))
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn save(&self, state: &SessionState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| session_error("create", &dir, e))?;

        let contents = serde_json::to_vec_pretty(state).map_err(|e| session_error("serialize", &self.path, e))?;

        // Write next to the target and rename so a crash never leaves half a file
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &contents)
            .await
            .map_err(|e| session_error("write", &tmp_path, e))?;
        fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await
            .map_err(|e| session_error("open", &tmp_path, e))?
            .sync_all()
            .await
            .map_err(|e| session_error("sync", &tmp_path, e))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| session_error("replace", &self.path, e))?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<SessionState>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(session_error("read", &self.path, e)),
        };
        let state = serde_json::from_str(&contents).map_err(|e| session_error("parse", &self.path, e))?;
        Ok(Some(state))
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(session_error("remove", &self.path, e)),
        }
    }
}

/// Summary of the active session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub total_matches: usize,
    pub completed_matches: usize,
    pub failed_matches: usize,
    pub current_index: usize,
    pub completion_percentage: f64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub is_complete: bool,
}

/// Tracks per-match progress and persists it after every change
pub struct SessionManager {
    store: Box<dyn SessionStore>,
    current: Mutex<Option<SessionState>>,
    /// Keeps checkpoint writes in mutation order
    writes: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Box<dyn SessionStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    async fn persist(&self, state: &SessionState) {
        if let Err(e) = self.store.save(state).await {
            error!("Failed to save session: {}", e);
        }
    }

    async fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SessionState),
    {
        let _write = self.writes.lock().await;
        let snapshot = {
            let mut current = self.current.lock();
            let Some(state) = current.as_mut() else {
                return false;
            };
            f(state);
            state.last_update = Utc::now();
            state.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    pub async fn create_session(&self, total_matches: usize) -> String {
        let _write = self.writes.lock().await;
        let state = SessionState::new(total_matches);
        let session_id = state.session_id.clone();
        self.persist(&state).await;
        *self.current.lock() = Some(state);

        info!("Created new session: {}", session_id);
        session_id
    }

    /// Load the stored checkpoint, if any, and make it current
    pub async fn load_session(&self) -> Option<String> {
        match self.store.load().await {
            Ok(Some(state)) => {
                let session_id = state.session_id.clone();
                info!("Loaded existing session: {}", session_id);
                *self.current.lock() = Some(state);
                Some(session_id)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Failed to load session: {}", e);
                None
            }
        }
    }

    pub async fn save_match_progress(&self, match_id: &str, data: Value, status: MatchStatus) {
        let saved = self.update(|state| {
            match status {
                MatchStatus::Completed => {
                    if !state.completed_matches.iter().any(|id| id == match_id) {
                        state.completed_matches.push(match_id.to_string());
                    }
                    state.failed_matches.retain(|id| id != match_id);
                }
                MatchStatus::Failed => {
                    if !state.failed_matches.iter().any(|id| id == match_id) {
                        state.failed_matches.push(match_id.to_string());
                    }
                }
                MatchStatus::Partial => {}
            }
            state.partial_data.insert(
                match_id.to_string(),
                PartialEntry {
                    data,
                    status,
                    timestamp: Utc::now(),
                },
            );
        })
        .await;

        if saved {
            info!("Saved progress for match {} (status: {:?})", match_id, status);
        } else {
            warn!("No active session to save progress");
        }
    }

    pub async fn update_current_match_index(&self, index: usize) {
        self.update(|state| state.current_match_index = index).await;
    }

    pub fn is_match_completed(&self, match_id: &str) -> bool {
        self.current
            .lock()
            .as_ref()
            .map_or(false, |state| state.completed_matches.iter().any(|id| id == match_id))
    }

    pub fn get_partial_data(&self, match_id: &str) -> Option<PartialEntry> {
        self.current
            .lock()
            .as_ref()
            .and_then(|state| state.partial_data.get(match_id).cloned())
    }

    /// Data checkpointed for completed matches, in completion order
    pub fn completed_results(&self) -> Vec<Value> {
        let current = self.current.lock();
        let Some(state) = current.as_ref() else {
            return Vec::new();
        };
        state
            .completed_matches
            .iter()
            .filter_map(|id| state.partial_data.get(id))
            .filter(|entry| entry.status == MatchStatus::Completed && !entry.data.is_null())
            .map(|entry| entry.data.clone())
            .collect()
    }

    pub fn session_summary(&self) -> Option<SessionSummary> {
        let current = self.current.lock();
        let state = current.as_ref()?;
        let completion_percentage = if state.total_matches == 0 {
            0.0
        } else {
            state.completed_matches.len() as f64 / state.total_matches as f64 * 100.0
        };

        Some(SessionSummary {
            session_id: state.session_id.clone(),
            total_matches: state.total_matches,
            completed_matches: state.completed_matches.len(),
            failed_matches: state.failed_matches.len(),
            current_index: state.current_match_index,
            completion_percentage,
            start_time: state.start_time,
            last_update: state.last_update,
            is_complete: state.is_complete,
        })
    }

    pub async fn complete_session(&self) {
        let mut session_id = None;
        self.update(|state| {
            state.is_complete = true;
            session_id = Some(state.session_id.clone());
        })
        .await;
        if let Some(session_id) = session_id {
            info!("Completed session: {}", session_id);
        }
    }

    /// Remove the stored checkpoint and forget the current session
    pub async fn cleanup_session(&self) -> Result<()> {
        let _write = self.writes.lock().await;
        self.store.clear().await?;
        *self.current.lock() = None;
        info!("Cleaned up session file");
        Ok(())
    }

    /// Filter out matches the current session already completed
    pub fn resume_from_checkpoint(&self, match_ids: &[String]) -> Vec<String> {
        let current = self.current.lock();
        let Some(state) = current.as_ref() else {
            return match_ids.to_vec();
        };

        let completed: HashSet<&str> = state.completed_matches.iter().map(String::as_str).collect();
        let remaining: Vec<String> = match_ids
            .iter()
            .filter(|id| !completed.contains(id.as_str()))
            .cloned()
            .collect();

        info!(
            "Resuming session: {} completed, {} remaining",
            completed.len(),
            remaining.len()
        );
        remaining
    }

    pub fn current(&self) -> Option<SessionState> {
        self.current.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_in(dir: &tempfile::TempDir) -> (JsonSessionStore, SessionManager) {
        let store = JsonSessionStore::new(dir.path().join("session.json"));
        let manager = SessionManager::new(Box::new(store.clone()));
        (store, manager)
    }

    #[tokio::test]
    async fn test_state_round_trip_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = manager_in(&dir);

        manager.create_session(3).await;
        manager.save_match_progress("m1", json!({"home": "A"}), MatchStatus::Completed).await;
        manager.save_match_progress("m2", Value::Null, MatchStatus::Failed).await;

        let saved = manager.current().unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.completed_matches, saved.completed_matches);
        assert_eq!(loaded.failed_matches, saved.failed_matches);
        assert_eq!(loaded.total_matches, 3);
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_session_id_format() {
        let dir = tempfile::tempdir().unwrap();
        let (_, manager) = manager_in(&dir);

        let id = manager.create_session(1).await;
        assert!(id.starts_with("session_"));
        assert_eq!(id.len(), "session_20240101_120000".len());
    }

    #[tokio::test]
    async fn test_completed_match_leaves_failed_list() {
        let dir = tempfile::tempdir().unwrap();
        let (_, manager) = manager_in(&dir);
        manager.create_session(2).await;

        manager.save_match_progress("m1", Value::Null, MatchStatus::Failed).await;
        manager.save_match_progress("m1", json!({"ok": true}), MatchStatus::Completed).await;
        manager.save_match_progress("m1", json!({"ok": true}), MatchStatus::Completed).await;

        let state = manager.current().unwrap();
        assert_eq!(state.completed_matches, vec!["m1"]);
        assert!(state.failed_matches.is_empty());
        assert!(manager.is_match_completed("m1"));
        assert_eq!(manager.get_partial_data("m1").unwrap().status, MatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_matches() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = manager_in(&dir);
        manager.create_session(3).await;
        manager.save_match_progress("m2", json!({}), MatchStatus::Completed).await;
        manager.update_current_match_index(2).await;

        let resumed = SessionManager::new(Box::new(store));
        let ids: Vec<String> = ["m1", "m2", "m3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(resumed.resume_from_checkpoint(&ids), ids);

        assert!(resumed.load_session().await.is_some());
        assert_eq!(resumed.resume_from_checkpoint(&ids), vec!["m1", "m3"]);
        assert_eq!(resumed.current().unwrap().current_match_index, 2);
    }

    #[tokio::test]
    async fn test_completed_results_come_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = manager_in(&dir);
        manager.create_session(3).await;
        manager.save_match_progress("m1", json!({"match_id": "m1"}), MatchStatus::Completed).await;
        manager.save_match_progress("m2", Value::Null, MatchStatus::Failed).await;
        manager.save_match_progress("m3", json!({"match_id": "m3"}), MatchStatus::Completed).await;

        let resumed = SessionManager::new(Box::new(store));
        assert!(resumed.completed_results().is_empty());
        resumed.load_session().await;
        assert_eq!(
            resumed.completed_results(),
            vec![json!({"match_id": "m1"}), json!({"match_id": "m3"})]
        );
    }

    #[tokio::test]
    async fn test_summary_handles_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let (_, manager) = manager_in(&dir);
        assert!(manager.session_summary().is_none());

        manager.create_session(0).await;
        assert_eq!(manager.session_summary().unwrap().completion_percentage, 0.0);
    }

    #[tokio::test]
    async fn test_complete_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = manager_in(&dir);
        manager.create_session(1).await;
        manager.complete_session().await;
        assert!(store.load().await.unwrap().unwrap().is_complete);

        manager.cleanup_session().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        assert!(manager.current().is_none());
        // Clearing twice is fine
        manager.cleanup_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_without_session_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = manager_in(&dir);
        manager.save_match_progress("m1", Value::Null, MatchStatus::Completed).await;
        assert!(!manager.is_match_completed("m1"));
        assert!(store.load().await.unwrap().is_none());
    }
}
