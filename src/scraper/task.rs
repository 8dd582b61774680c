use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// A unit of work for the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Unique identifier for this task
    pub task_id: String,

    /// What to process, usually a match id
    pub payload: String,

    /// Lower values run first
    pub priority: i32,

    /// How many times this task has been re-queued
    pub retry_count: u32,

    /// Re-queue limit
    pub max_retries: u32,

    /// Submission time, breaks priority ties
    pub created_at: DateTime<Utc>,
}

impl WorkerTask {
    pub fn new(payload: impl Into<String>, priority: i32, max_retries: u32) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            payload: payload.into(),
            priority,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Copy of this task for another attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

/// Outcome of a worker task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Identifier of the task this result belongs to
    pub task_id: String,

    /// Payload of the task
    pub payload: String,

    pub success: bool,

    /// Data produced on success
    pub data: Option<Value>,

    /// Error message on failure
    pub error: Option<String>,

    /// Time spent on the last attempt
    pub processing_time: Duration,

    /// Worker slot that ran the last attempt
    pub worker_id: usize,
}
