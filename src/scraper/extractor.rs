use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::browser::driver::{DriverError, DriverErrorKind};
use crate::browser::tabs::TabPool;
use crate::cli::config::ExtractionSettings;
use crate::error::ScraperError;
use crate::resilience::classifier::ErrorHandler;
use crate::resilience::retry::NetworkRetryManager;
use crate::scraper::batch::MatchProcessor;

const CURRENT_URL_SCRIPT: &str = "return window.location.href;";

/// Fill the `{id}` placeholder of a match URL template
pub fn build_match_url(template: &str, match_id: &str) -> Result<Url, url::ParseError> {
    Url::parse(&template.replace("{id}", match_id))
}

/// Loads a match page in its tab, checks it and reads the match data
pub struct PageExtractor {
    tabs: Arc<TabPool>,
    retry: Arc<NetworkRetryManager>,
    errors: Arc<ErrorHandler>,
    settings: ExtractionSettings,
    load_timeout: Duration,
    token: CancellationToken,
}

impl PageExtractor {
    pub fn new(
        tabs: Arc<TabPool>,
        retry: Arc<NetworkRetryManager>,
        errors: Arc<ErrorHandler>,
        settings: ExtractionSettings,
        load_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            tabs,
            retry,
            errors,
            settings,
            load_timeout,
            token,
        }
    }

    /// One pass over a match: load, verify, extract
    async fn extract_once(&self, match_id: &str, tab_index: usize) -> Result<Value, ScraperError> {
        let url = build_match_url(&self.settings.match_url_template, match_id).map_err(|e| {
            DriverError::new(DriverErrorKind::Other, format!("invalid match URL for {}: {}", match_id, e))
        })?;

        self.retry
            .retry_network_operation(|| self.tabs.load_url(tab_index, url.as_str(), self.load_timeout), &self.token)
            .await?;

        if self.settings.verify_url {
            let current = self.tabs.execute_in_tab(tab_index, CURRENT_URL_SCRIPT).await?;
            let current = current.as_str().unwrap_or_default();
            if !current.contains(match_id) {
                return Err(DriverError::new(
                    DriverErrorKind::UrlMismatch,
                    format!("expected a page for {}, landed on '{}'", match_id, current),
                )
                .into());
            }
        }

        let data = self.tabs.execute_in_tab(tab_index, &self.settings.script).await?;
        match data {
            Value::Object(mut fields) if !fields.is_empty() => {
                fields.insert("match_id".to_string(), Value::String(match_id.to_string()));
                Ok(Value::Object(fields))
            }
            other => Err(DriverError::new(
                DriverErrorKind::ContentMismatch,
                format!("no match data on page for {} (got {})", match_id, other),
            )
            .into()),
        }
    }
}

#[async_trait]
impl MatchProcessor for PageExtractor {
    async fn process(&self, match_id: String, tab_index: usize) -> Option<Value> {
        let mut attempt = 1;
        loop {
            let err = match self.extract_once(&match_id, tab_index).await {
                Ok(data) => {
                    if attempt > 1 {
                        info!("Extracted match {} on attempt {}", match_id, attempt);
                    }
                    return Some(data);
                }
                Err(ScraperError::Cancelled) => {
                    debug!("Extraction of {} cancelled", match_id);
                    return None;
                }
                Err(ScraperError::Driver(e)) => e,
                Err(other) => DriverError::new(DriverErrorKind::Other, other.to_string()),
            };

            let delay = self.errors.handle_error(&err, &match_id, tab_index, attempt)?;
            debug!("Retrying match {} in {:?}", match_id, delay);
            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
