use thiserror::Error;

use crate::browser::driver::DriverError;

/// Errors surfaced by the scraping core
#[derive(Debug, Error)]
pub enum ScraperError {
    /// Every tab is busy or the pool is empty
    #[error("no tabs available")]
    NoTabsAvailable,

    /// `process_batch` was called before a tab pool was attached
    #[error("tab pool not configured")]
    TabPoolNotConfigured,

    /// Shutdown was requested while the operation was waiting or retrying
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// The worker pool is not accepting work
    #[error("worker pool is not running")]
    WorkerPoolStopped,

    /// Failure reported by the browser driver
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Session checkpoint could not be read or written
    #[error("session store error: {0}")]
    Session(String),
}

impl ScraperError {
    /// True when the error came from a cancellation request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScraperError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ScraperError>;
