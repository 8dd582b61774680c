use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{error, warn};

use crate::browser::driver::{DriverError, DriverErrorKind};
use crate::cli::config::ErrorSettings;

/// Failure taxonomy of the per-match error ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UrlVerification,
    ContentVerification,
    ElementNotFound,
    Network,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::UrlVerification,
        ErrorKind::ContentVerification,
        ErrorKind::ElementNotFound,
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UrlVerification => "URL_VERIFICATION",
            ErrorKind::ContentVerification => "CONTENT_VERIFICATION",
            ErrorKind::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Transport-level kinds get a longer retry delay
    fn delay_multiplier(&self) -> f64 {
        match self {
            ErrorKind::Network | ErrorKind::Timeout => 1.5,
            _ => 1.0,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a structured driver failure onto the ledger taxonomy
pub fn classify(error: &DriverError) -> ErrorKind {
    match error.kind {
        DriverErrorKind::Timeout => ErrorKind::Timeout,
        DriverErrorKind::NoSuchElement | DriverErrorKind::NotInteractable => ErrorKind::ElementNotFound,
        DriverErrorKind::Connection | DriverErrorKind::WebDriver => ErrorKind::Network,
        DriverErrorKind::UrlMismatch => ErrorKind::UrlVerification,
        DriverErrorKind::ContentMismatch => ErrorKind::ContentVerification,
        DriverErrorKind::Other => ErrorKind::Unknown,
    }
}

/// One recorded failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_type: ErrorKind,
    pub match_id: String,
    pub tab_index: usize,
    pub attempt: u32,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Ledger {
    history: HashMap<String, Vec<ErrorContext>>,
    failed: HashSet<String>,
    retry_queue: VecDeque<String>,
}

/// Per-match error history, permanent failures and the retry queue
#[derive(Debug)]
pub struct ErrorHandler {
    max_retries: u32,
    base_retry_delay: Duration,
    ledger: Mutex<Ledger>,
}

impl ErrorHandler {
    pub fn new(max_retries: u32, base_retry_delay: Duration) -> Self {
        Self {
            max_retries,
            base_retry_delay,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn from_settings(settings: &ErrorSettings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_millis(settings.base_retry_delay_ms),
        )
    }

    /// Record a failure and decide whether the match gets another attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once `attempt`
    /// reaches `max_retries`, at which point the match is permanently failed.
    pub fn handle_error(
        &self,
        error: &DriverError,
        match_id: &str,
        tab_index: usize,
        attempt: u32,
    ) -> Option<Duration> {
        let error_type = classify(error);
        let context = ErrorContext {
            error_type,
            match_id: match_id.to_string(),
            tab_index,
            attempt,
            error_message: error.message.clone(),
            timestamp: Utc::now(),
        };

        let mut ledger = self.ledger.lock();
        ledger
            .history
            .entry(match_id.to_string())
            .or_default()
            .push(context);

        warn!(
            "Error processing match {} (tab {}), attempt {}: {} - {}",
            match_id,
            tab_index,
            attempt,
            error_type,
            error.summary()
        );

        if attempt < self.max_retries {
            return Some(self.retry_delay(attempt, error_type));
        }

        ledger.failed.insert(match_id.to_string());
        error!(
            "Match {} failed after {} attempts: {} - {}",
            match_id,
            attempt,
            error_type,
            error.summary()
        );
        None
    }

    fn retry_delay(&self, attempt: u32, error_type: ErrorKind) -> Duration {
        let exponent = attempt as i32 - 1;
        let secs = self.base_retry_delay.as_secs_f64() * error_type.delay_multiplier() * 2f64.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// Queue a match for a later pass unless it is permanently failed or already queued
    pub fn add_to_retry_queue(&self, match_id: &str) {
        let mut ledger = self.ledger.lock();
        if ledger.failed.contains(match_id) || ledger.retry_queue.iter().any(|id| id == match_id) {
            return;
        }
        ledger.retry_queue.push_back(match_id.to_string());
    }

    /// Take up to `batch_size` matches off the front of the retry queue
    pub fn get_retry_batch(&self, batch_size: usize) -> Vec<String> {
        let mut ledger = self.ledger.lock();
        let take = batch_size.min(ledger.retry_queue.len());
        ledger.retry_queue.drain(..take).collect()
    }

    pub fn has_retries(&self) -> bool {
        !self.ledger.lock().retry_queue.is_empty()
    }

    /// Count of recorded errors per kind; every kind is present
    pub fn error_summary(&self) -> BTreeMap<ErrorKind, usize> {
        let ledger = self.ledger.lock();
        let mut summary: BTreeMap<ErrorKind, usize> = ErrorKind::ALL.iter().map(|kind| (*kind, 0)).collect();
        for context in ledger.history.values().flatten() {
            *summary.entry(context.error_type).or_default() += 1;
        }
        summary
    }

    pub fn error_history(&self, match_id: &str) -> Vec<ErrorContext> {
        self.ledger
            .lock()
            .history
            .get(match_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_failed(&self, match_id: &str) -> bool {
        self.ledger.lock().failed.contains(match_id)
    }

    pub fn failed_matches(&self) -> Vec<String> {
        let mut failed: Vec<String> = self.ledger.lock().failed.iter().cloned().collect();
        failed.sort();
        failed
    }
}
