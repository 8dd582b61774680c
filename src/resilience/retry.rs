use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::browser::driver::{DriverError, DriverErrorKind};
use crate::cli::config::RetrySettings;
use crate::error::ScraperError;
use crate::resilience::network::Connectivity;

/// Message fragments of transport-level failures
pub const NETWORK_ERROR_SIGNATURES: [&str; 11] = [
    "net::ERR_INTERNET_DISCONNECTED",
    "net::ERR_PROXY_CONNECTION_FAILED",
    "net::ERR_CONNECTION_TIMED_OUT",
    "net::ERR_CONNECTION_RESET",
    "net::ERR_NAME_NOT_RESOLVED",
    "net::ERR_NETWORK_CHANGED",
    "net::ERR_CONNECTION_REFUSED",
    "net::ERR_FAILED",
    "chrome not reachable",
    "disconnected",
    "timeout",
];

/// True for connection and timeout failures or any known network signature
pub fn is_network_error(error: &DriverError) -> bool {
    matches!(error.kind, DriverErrorKind::Connection | DriverErrorKind::Timeout)
        || NETWORK_ERROR_SIGNATURES
            .iter()
            .any(|signature| error.message.contains(signature))
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryManager {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Fraction of the delay added or removed at random
    pub jitter_factor: f64,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}

impl RetryManager {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            exponential_base: settings.exponential_base,
            jitter_factor: settings.jitter_factor,
        }
    }

    /// Delay before retrying after the given 0-based attempt.
    ///
    /// Capped at `max_delay` before jitter, so the result never exceeds
    /// `max_delay * (1 + jitter_factor)` and never drops below zero.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut delay = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        if !delay.is_finite() {
            delay = max;
        }
        delay = delay.min(max);

        let jitter = if self.jitter_factor > 0.0 {
            delay * self.jitter_factor * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };

        Duration::try_from_secs_f64((delay + jitter).max(0.0)).unwrap_or(Duration::ZERO)
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// Errors rejected by `is_retryable` are returned at once. After the last
    /// attempt the last error is returned.
    pub async fn retry_operation<F, Fut, T, E, P>(&self, mut operation: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("Operation succeeded on attempt {}", attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => {
                    if attempt + 1 >= self.max_attempts {
                        error!(
                            "Operation failed after {} attempts. Last error: {}",
                            self.max_attempts, e
                        );
                        return Err(e);
                    }
                    let delay = self.calculate_delay(attempt);
                    warn!(
                        "Operation failed on attempt {}/{}: {}. Retrying in {:.2}s...",
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Retry on every error
    pub async fn retry<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_operation(operation, |_| true).await
    }
}

/// Retries browser operations, pausing while the network is down
pub struct NetworkRetryManager {
    policy: RetryManager,
    connectivity: Arc<dyn Connectivity>,
    reconnect_timeout: Duration,
}

impl NetworkRetryManager {
    pub fn new(settings: &RetrySettings, connectivity: Arc<dyn Connectivity>) -> Self {
        Self {
            policy: RetryManager::new(settings),
            connectivity,
            reconnect_timeout: Duration::from_secs(settings.reconnect_timeout_secs),
        }
    }

    /// Run a browser operation with retries.
    ///
    /// Waiting for the network to come back does not use up an attempt.
    /// Cancelling `token` aborts before the next attempt or mid-backoff.
    pub async fn retry_network_operation<F, Fut, T>(
        &self,
        mut operation: F,
        token: &CancellationToken,
    ) -> Result<T, ScraperError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let max_attempts = self.policy.max_attempts;

        for attempt in 0..max_attempts {
            if token.is_cancelled() {
                return Err(ScraperError::Cancelled);
            }

            if !self.connectivity.is_connected().await {
                warn!("Network down, waiting for reconnection before retrying...");
                let reconnected = tokio::select! {
                    _ = token.cancelled() => return Err(ScraperError::Cancelled),
                    connected = self.connectivity.wait_for_connection(self.reconnect_timeout) => connected,
                };
                if reconnected {
                    info!("Network reconnected. Resuming operation...");
                }
            }

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("Operation succeeded on attempt {}", attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if is_network_error(&err) {
                warn!(
                    "Network error: {}. Will wait for reconnection and retry.",
                    err.summary()
                );
            }

            if attempt + 1 >= max_attempts {
                error!(
                    "Operation failed after {} attempts. Last error: {}",
                    max_attempts,
                    err.summary()
                );
                return Err(ScraperError::Driver(err));
            }

            let delay = self.policy.calculate_delay(attempt);
            warn!(
                "Operation failed on attempt {}/{}: {}. Retrying in {:.2}s...",
                attempt + 1,
                max_attempts,
                err.summary(),
                delay.as_secs_f64()
            );

            tokio::select! {
                _ = token.cancelled() => return Err(ScraperError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts is at least 1, so the loop always returns
        Err(ScraperError::Cancelled)
    }
}
