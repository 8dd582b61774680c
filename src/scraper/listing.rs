use chrono::{Local, NaiveDate};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::browser::driver::{DriverError, DriverErrorKind};
use crate::browser::tabs::TabPool;
use crate::cli::config::ListingSettings;
use crate::error::ScraperError;
use crate::resilience::retry::NetworkRetryManager;

/// The listing is read in the first tab, before any batch claims it
const LISTING_TAB: usize = 0;

/// Day whose scheduled matches are scraped
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchDay {
    Today,
    Tomorrow,
}

impl MatchDay {
    /// Calendar date of this day in local time
    pub fn date(self) -> NaiveDate {
        let today = Local::now().date_naive();
        match self {
            MatchDay::Today => today,
            MatchDay::Tomorrow => today.succ_opt().unwrap_or(today),
        }
    }
}

impl fmt::Display for MatchDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchDay::Today => write!(f, "today"),
            MatchDay::Tomorrow => write!(f, "tomorrow"),
        }
    }
}

/// Turn the listing script's result into unique, non-empty ids
fn parse_ids(value: Value) -> Result<Vec<String>, DriverError> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => {
            return Err(DriverError::new(
                DriverErrorKind::ContentMismatch,
                format!("listing script returned {} instead of an id list", other),
            ))
        }
    };

    let mut seen = HashSet::new();
    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(id) => Some(id.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect())
}

/// Reads the ids of scheduled matches from the listing page
pub struct MatchLister {
    tabs: Arc<TabPool>,
    retry: Arc<NetworkRetryManager>,
    settings: ListingSettings,
    load_timeout: Duration,
    token: CancellationToken,
}

impl MatchLister {
    pub fn new(
        tabs: Arc<TabPool>,
        retry: Arc<NetworkRetryManager>,
        settings: ListingSettings,
        load_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            tabs,
            retry,
            settings,
            load_timeout,
            token,
        }
    }

    /// Ids scheduled for `day`, with the day they were found for.
    ///
    /// An empty schedule today falls back to tomorrow's.
    pub async fn list(&self, day: MatchDay) -> Result<(MatchDay, Vec<String>), ScraperError> {
        self.load_listing().await?;

        if day == MatchDay::Today {
            let ids = self.read_ids().await?;
            if !ids.is_empty() {
                info!("Found {} matches for today", ids.len());
                return Ok((MatchDay::Today, ids));
            }
            info!("No matches found for today. Checking tomorrow's schedule.");
            self.load_listing().await?;
        }

        self.switch_to_tomorrow().await?;
        let ids = self.read_ids().await?;
        info!("Found {} matches for tomorrow", ids.len());
        Ok((MatchDay::Tomorrow, ids))
    }

    async fn load_listing(&self) -> Result<(), ScraperError> {
        debug!("Loading listing page {}", self.settings.url);
        self.retry
            .retry_network_operation(
                || self.tabs.load_url(LISTING_TAB, &self.settings.url, self.load_timeout),
                &self.token,
            )
            .await
    }

    async fn read_ids(&self) -> Result<Vec<String>, ScraperError> {
        let value = self
            .retry
            .retry_network_operation(
                || self.tabs.execute_in_tab(LISTING_TAB, &self.settings.script),
                &self.token,
            )
            .await?;
        Ok(parse_ids(value)?)
    }

    async fn switch_to_tomorrow(&self) -> Result<(), ScraperError> {
        let switched = self
            .tabs
            .execute_in_tab(LISTING_TAB, &self.settings.tomorrow_script)
            .await?;
        if switched.as_bool() != Some(true) {
            return Err(DriverError::new(
                DriverErrorKind::ContentMismatch,
                "tomorrow's schedule is not available on the listing page",
            )
            .into());
        }

        tokio::select! {
            _ = self.token.cancelled() => Err(ScraperError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(self.settings.settle_ms)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::driver::MockBrowserDriver;
    use crate::cli::config::{RetrySettings, TabSettings};
    use crate::resilience::network::MockConnectivity;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Listing page whose schedule is `today` until the tomorrow control is used
    fn listing_page(
        today: Value,
        tomorrow: Option<Value>,
        clicks: Arc<AtomicUsize>,
    ) -> MockBrowserDriver {
        let on_tomorrow = Arc::new(AtomicBool::new(false));
        let mut driver = MockBrowserDriver::new();
        driver
            .expect_window_handles()
            .returning(|| Ok(vec!["main".to_string()]));
        driver.expect_switch_to().returning(|_| Ok(()));
        driver.expect_navigate().returning(|_| Ok(()));
        driver.expect_execute_script().returning(move |script| {
            if script.contains("readyState") {
                Ok(json!("complete"))
            } else if script.contains("goTomorrow") {
                clicks.fetch_add(1, Ordering::SeqCst);
                on_tomorrow.store(tomorrow.is_some(), Ordering::SeqCst);
                Ok(json!(tomorrow.is_some()))
            } else if on_tomorrow.load(Ordering::SeqCst) {
                Ok(tomorrow.clone().unwrap_or(Value::Null))
            } else {
                Ok(today.clone())
            }
        });
        driver
    }

    async fn lister(driver: MockBrowserDriver) -> MatchLister {
        let tabs = Arc::new(TabPool::new(
            Arc::new(driver),
            TabSettings {
                max_tabs: 1,
                min_load_interval_ms: 0,
                ready_poll_interval_ms: 5,
                ..TabSettings::default()
            },
        ));
        assert!(tabs.setup().await);

        let mut connectivity = MockConnectivity::new();
        connectivity.expect_is_connected().returning(|| true);
        let retry = NetworkRetryManager::new(
            &RetrySettings {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 5,
                ..RetrySettings::default()
            },
            Arc::new(connectivity),
        );

        MatchLister::new(
            tabs,
            Arc::new(retry),
            ListingSettings {
                url: "https://scores.example.com/basketball/".to_string(),
                script: "return listIds();".to_string(),
                tomorrow_script: "return goTomorrow();".to_string(),
                settle_ms: 0,
            },
            Duration::from_secs(1),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_parse_ids() {
        let ids = parse_ids(json!(["a1", " b2 ", "", "a1", 42, null])).unwrap();
        assert_eq!(ids, vec!["a1", "b2", "42"]);
        assert!(parse_ids(Value::Null).unwrap().is_empty());
        assert_eq!(
            parse_ids(json!({"ids": []})).unwrap_err().kind,
            DriverErrorKind::ContentMismatch
        );
    }

    #[tokio::test]
    async fn test_today_schedule_is_used_when_present() {
        let clicks = Arc::new(AtomicUsize::new(0));
        let driver = listing_page(json!(["m1", "m2"]), Some(json!(["t1"])), clicks.clone());

        let (day, ids) = lister(driver).await.list(MatchDay::Today).await.unwrap();

        assert_eq!(day, MatchDay::Today);
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(clicks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_today_falls_back_to_tomorrow() {
        let clicks = Arc::new(AtomicUsize::new(0));
        let driver = listing_page(json!([]), Some(json!(["t1", "t2", "t1"])), clicks.clone());

        let (day, ids) = lister(driver).await.list(MatchDay::Today).await.unwrap();

        assert_eq!(day, MatchDay::Tomorrow);
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(clicks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_tomorrow_control_is_an_error() {
        let clicks = Arc::new(AtomicUsize::new(0));
        let driver = listing_page(json!(["m1"]), None, clicks);

        let err = lister(driver).await.list(MatchDay::Tomorrow).await.unwrap_err();
        match err {
            ScraperError::Driver(e) => assert_eq!(e.kind, DriverErrorKind::ContentMismatch),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_tomorrow_is_the_day_after_today() {
        assert_eq!(MatchDay::Today.date().succ_opt(), Some(MatchDay::Tomorrow.date()));
        assert_eq!(MatchDay::Tomorrow.to_string(), "tomorrow");
    }
}
