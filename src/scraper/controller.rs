use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::driver::BrowserDriver;
use crate::browser::session::{BrowserLauncher, WebDriverLauncher};
use crate::browser::tabs::TabPool;
use crate::cli::config::ScraperConfig;
use crate::monitor::performance::PerformanceMonitor;
use crate::monitor::resources::ResourceManager;
use crate::resilience::classifier::{ErrorHandler, ErrorKind};
use crate::resilience::network::{Connectivity, NetworkHealth, NetworkMonitor};
use crate::resilience::retry::NetworkRetryManager;
use crate::scraper::batch::{BatchConfig, BatchProcessor, MatchProcessor, TabBoundHandler};
use crate::scraper::extractor::PageExtractor;
use crate::scraper::listing::{MatchDay, MatchLister};
use crate::scraper::task::WorkerTask;
use crate::scraper::worker_pool::WorkerPool;
use crate::storage::results::ResultStore;
use crate::storage::session::{JsonSessionStore, MatchStatus, SessionManager, SessionStore};

/// Where the matches of a run come from
#[derive(Debug, Clone)]
pub enum MatchSource {
    /// Explicit ids, stored with today's results
    Ids(Vec<String>),
    /// Everything scheduled on the listing page for a day
    Day(MatchDay),
}

/// Outcome of a scraping run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session_id: String,
    /// Day the results belong to
    pub day: MatchDay,
    pub results_file: PathBuf,
    /// Matches this run set out to process, after resuming and skipping
    pub total_matches: usize,
    /// Includes matches recovered from the checkpoint of a resumed session
    pub results: Vec<Value>,
    /// Already in the result file, not scraped again
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    /// Matches never attempted because the run stopped early
    pub pending: Vec<String>,
    pub batches: usize,
    pub browser_restarts: u32,
    pub cancelled: bool,
    pub errors: BTreeMap<ErrorKind, usize>,
    pub elapsed: Duration,
}

/// A running browser and the tabs opened in it
struct Browser {
    driver: Arc<dyn BrowserDriver>,
    tabs: Arc<TabPool>,
}

/// Drives a full scraping run over a list of match ids
pub struct ScrapeController {
    config: ScraperConfig,
    launcher: Arc<dyn BrowserLauncher>,
    connectivity: Arc<dyn Connectivity>,
    watcher: Option<Arc<NetworkMonitor>>,
    health: Arc<NetworkHealth>,
    retry: Arc<NetworkRetryManager>,
    errors: Arc<ErrorHandler>,
    performance: Arc<PerformanceMonitor>,
    resources: Arc<ResourceManager>,
    session: SessionManager,
    results: ResultStore,
    token: CancellationToken,
}

impl ScrapeController {
    /// Create a controller that drives a real WebDriver browser
    pub fn new(config: ScraperConfig, token: CancellationToken) -> Result<Self> {
        config.validate().context("Invalid scraper configuration")?;

        let monitor = Arc::new(NetworkMonitor::new(&config.network));
        let launcher = Arc::new(WebDriverLauncher::new(config.browser.clone()));
        let store = Box::new(JsonSessionStore::new(config.session.session_file.clone()));

        let mut controller = Self::with_components(config, launcher, monitor.clone(), store, token);
        controller.watcher = Some(monitor);
        Ok(controller)
    }

    /// Create a controller from explicit collaborators
    pub fn with_components(
        config: ScraperConfig,
        launcher: Arc<dyn BrowserLauncher>,
        connectivity: Arc<dyn Connectivity>,
        store: Box<dyn SessionStore>,
        token: CancellationToken,
    ) -> Self {
        let performance = Arc::new(PerformanceMonitor::new(Duration::from_secs(
            config.resources.sample_interval_secs,
        )));
        let resources = Arc::new(ResourceManager::new(config.resources.clone(), performance.clone()));

        Self {
            health: Arc::new(NetworkHealth::new(&config.network)),
            retry: Arc::new(NetworkRetryManager::new(&config.retry, connectivity.clone())),
            errors: Arc::new(ErrorHandler::from_settings(&config.errors)),
            session: SessionManager::new(store),
            results: ResultStore::new(config.output.directory.clone()),
            watcher: None,
            config,
            launcher,
            connectivity,
            performance,
            resources,
            token,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn errors(&self) -> &ErrorHandler {
        &self.errors
    }

    /// Scrape every match, resuming the stored session when asked
    pub async fn run(&self, source: MatchSource, resume: bool) -> Result<RunReport> {
        let background = self.token.child_token();
        let mut monitors: Vec<JoinHandle<()>> = vec![
            self.performance.spawn_sampler(background.clone()),
            self.resources.spawn_monitor(background.clone()),
        ];
        if let Some(watcher) = &self.watcher {
            monitors.push(watcher.spawn_watcher(background.clone()));
        }

        let report = self.run_session(source, resume).await;

        background.cancel();
        for monitor in monitors {
            if let Err(e) = monitor.await {
                debug!("Monitor task ended abnormally: {}", e);
            }
        }
        report
    }

    async fn run_session(&self, source: MatchSource, resume: bool) -> Result<RunReport> {
        let started = Instant::now();

        let mut browser = self.start_browser().await?;
        let outcome = self.run_in_browser(&mut browser, source, resume).await;
        self.shutdown_browser(&browser).await;
        let mut report = outcome?;

        if !report.cancelled && report.pending.is_empty() {
            self.session.complete_session().await;
        }

        self.performance.log_final_metrics();
        info!("Error summary: {:?}", self.errors.error_summary());

        report.errors = self.errors.error_summary();
        report.browser_restarts = self.resources.resource_summary().browser_restarts;
        report.elapsed = started.elapsed();
        Ok(report)
    }

    async fn run_in_browser(&self, browser: &mut Browser, source: MatchSource, resume: bool) -> Result<RunReport> {
        let (day, match_ids) = match source {
            MatchSource::Ids(ids) => (MatchDay::Today, ids),
            MatchSource::Day(day) => match self.lister(browser.tabs.clone()).list(day).await {
                Ok(listed) => listed,
                Err(e) if e.is_cancelled() => (day, Vec::new()),
                Err(e) => return Err(e).context(format!("Failed to list matches for {}", day)),
            },
        };

        let results_file = self.results.file_for(day.date());
        let (match_ids, skipped) = self.skip_stored(&results_file, match_ids).await;
        let (session_id, remaining, recovered) = self.open_session(&match_ids, resume).await;

        if !recovered.is_empty() {
            info!("Restoring {} results from the checkpoint", recovered.len());
            self.store_results(&results_file, &recovered, &[]).await;
        }

        let mut report = self.scrape(browser, &remaining, &results_file).await?;
        let mut results = recovered;
        results.append(&mut report.results);
        report.results = results;
        report.session_id = session_id;
        report.day = day;
        report.results_file = results_file;
        report.skipped = skipped;
        Ok(report)
    }

    /// Drop matches already present in the result file
    async fn skip_stored(&self, results_file: &Path, match_ids: Vec<String>) -> (Vec<String>, Vec<String>) {
        if !self.config.output.skip_existing {
            return (match_ids, Vec::new());
        }
        let stored = match self.results.stored_ids(results_file).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Could not read stored results, scraping everything: {:#}", e);
                return (match_ids, Vec::new());
            }
        };

        let (skipped, remaining): (Vec<String>, Vec<String>) =
            match_ids.into_iter().partition(|id| stored.contains(id));
        if !skipped.is_empty() {
            info!("Skipping {} matches already in {}", skipped.len(), results_file.display());
        }
        (remaining, skipped)
    }

    /// Returns the session id, the matches still to scrape and the results
    /// a resumed checkpoint already holds
    async fn open_session(&self, match_ids: &[String], resume: bool) -> (String, Vec<String>, Vec<Value>) {
        if resume {
            if let Some(session_id) = self.session.load_session().await {
                let finished = self.session.current().map_or(true, |state| state.is_complete);
                if !finished {
                    let remaining = self.session.resume_from_checkpoint(match_ids);
                    return (session_id, remaining, self.session.completed_results());
                }
                info!("Stored session {} already complete, starting a new one", session_id);
            }
        }
        let session_id = self.session.create_session(match_ids.len()).await;
        (session_id, match_ids.to_vec(), Vec::new())
    }

    /// Merge into the result file; a failed write is logged, the checkpoint still has the data
    async fn store_results(&self, results_file: &Path, matches: &[Value], failed: &[String]) {
        if matches.is_empty() && failed.is_empty() {
            return;
        }
        if let Err(e) = self.results.save_to(results_file, matches, failed).await {
            error!("Failed to write results: {:#}", e);
        }
    }

    async fn start_browser(&self) -> Result<Browser> {
        self.resources.capture_process_baseline();
        let driver = self.launcher.launch().await.context("Failed to start browser")?;
        let tabs = Arc::new(TabPool::new(driver.clone(), self.config.tabs.clone()));

        if !tabs.setup().await {
            if let Err(e) = driver.quit().await {
                debug!("Error closing browser after failed setup: {}", e);
            }
            anyhow::bail!("Failed to set up {} browser tab(s)", self.config.tabs.max_tabs);
        }

        self.resources.register_tab_pool(tabs.clone());
        Ok(Browser { driver, tabs })
    }

    async fn shutdown_browser(&self, browser: &Browser) {
        self.resources.unregister_tab_pool();
        browser.tabs.cleanup().await;
        if let Err(e) = browser.driver.quit().await {
            error!("Error closing browser: {}", e);
        }
    }

    async fn restart_browser(&self, browser: &mut Browser) -> Result<()> {
        warn!("Restarting browser...");
        self.shutdown_browser(browser).await;
        *browser = self.start_browser().await.context("Failed to restart browser")?;
        self.resources.record_browser_restart();
        Ok(())
    }

    fn lister(&self, tabs: Arc<TabPool>) -> MatchLister {
        MatchLister::new(
            tabs,
            self.retry.clone(),
            self.config.listing.clone(),
            Duration::from_secs(self.config.browser.page_load_timeout_secs),
            self.token.clone(),
        )
    }

    fn extractor(&self, tabs: Arc<TabPool>) -> Arc<dyn MatchProcessor> {
        Arc::new(PageExtractor::new(
            tabs,
            self.retry.clone(),
            self.errors.clone(),
            self.config.extraction.clone(),
            Duration::from_secs(self.config.browser.page_load_timeout_secs),
            self.token.clone(),
        ))
    }

    async fn scrape(&self, browser: &mut Browser, matches: &[String], results_file: &Path) -> Result<RunReport> {
        let batches = BatchProcessor::new(BatchConfig::from_settings(&self.config.batch, self.config.tabs.max_tabs))
            .with_tab_pool(browser.tabs.clone())
            .with_resource_manager(self.resources.clone())
            .with_performance_monitor(self.performance.clone());
        let mut processor = self.extractor(browser.tabs.clone());

        let total = matches.len();
        let mut processed = 0;
        let mut batch_count = 0;
        let mut results = Vec::new();
        let mut failed = Vec::new();

        info!("Starting to process {} matches", total);

        while batches.should_continue_processing(processed, total) && !self.token.is_cancelled() {
            if !self.connectivity.is_connected().await {
                warn!("Network down, waiting for reconnection before next batch...");
                let timeout = Duration::from_secs(self.config.retry.reconnect_timeout_secs);
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    connected = self.connectivity.wait_for_connection(timeout) => {
                        if !connected {
                            self.health.record_failure();
                        }
                    }
                }
            }

            let size = batches.get_adaptive_batch_size().max(1);
            let end = (processed + size).min(total);
            let batch = &matches[processed..end];

            self.performance.start_batch(batch.len());
            let batch_start = Instant::now();
            let (successes, failures) = batches.process_batch(batch, processor.clone(), None).await?;
            let batch_time = self.performance.end_batch(successes.len(), failures.len());

            self.health
                .record_response_time(batch_start.elapsed() / batch.len().max(1) as u32);
            self.health
                .record_success_rate(successes.len() as f64 / batch.len().max(1) as f64);
            if successes.is_empty() {
                self.health.record_failure();
            } else {
                self.health.record_success();
            }

            let mut batch_failed = Vec::new();
            for id in failures {
                if self.errors.is_failed(&id) {
                    batch_failed.push(id);
                } else {
                    self.errors.add_to_retry_queue(&id);
                }
            }

            self.store_results(results_file, &successes, &batch_failed).await;
            for value in &successes {
                match value.get("match_id").and_then(Value::as_str) {
                    Some(id) => {
                        self.session
                            .save_match_progress(id, value.clone(), MatchStatus::Completed)
                            .await
                    }
                    None => debug!("Result without match_id, not checkpointed"),
                }
            }
            for id in &batch_failed {
                self.session.save_match_progress(id, Value::Null, MatchStatus::Failed).await;
            }

            results.extend(successes);
            failed.extend(batch_failed);
            processed = end;
            batch_count += 1;
            self.session.update_current_match_index(processed).await;
            self.performance.log_progress(total, batch_time);

            if self.resources.should_restart_browser() || browser.tabs.needs_browser_restart() {
                self.restart_browser(browser).await?;
                batches.set_tab_pool(browser.tabs.clone());
                processor = self.extractor(browser.tabs.clone());
            }

            if processed < total && !self.token.is_cancelled() {
                let delay = batches.get_adaptive_delay().max(self.health.recommended_delay());
                debug!("Waiting {:?} before next batch", delay);
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if !self.token.is_cancelled() && self.errors.has_retries() {
            let (recovered, lost) = self.retry_pass(&browser.tabs, processor).await;
            self.store_results(results_file, &recovered, &lost).await;
            for value in &recovered {
                if let Some(id) = value.get("match_id").and_then(Value::as_str) {
                    self.session
                        .save_match_progress(id, value.clone(), MatchStatus::Completed)
                        .await;
                }
            }
            for id in &lost {
                self.session.save_match_progress(id, Value::Null, MatchStatus::Failed).await;
            }
            results.extend(recovered);
            failed.extend(lost);
        }

        // Anything still queued was never retried
        let mut never_retried = Vec::new();
        while self.errors.has_retries() {
            never_retried.extend(self.errors.get_retry_batch(usize::MAX));
        }
        self.store_results(results_file, &[], &never_retried).await;
        failed.extend(never_retried);

        let cancelled = self.token.is_cancelled();
        if cancelled {
            warn!("Run cancelled after {} of {} matches", processed, total);
        }

        Ok(RunReport {
            session_id: String::new(),
            day: MatchDay::Today,
            results_file: results_file.to_path_buf(),
            total_matches: total,
            results,
            skipped: Vec::new(),
            failed,
            pending: matches[processed..].to_vec(),
            batches: batch_count,
            browser_restarts: 0,
            cancelled,
            errors: BTreeMap::new(),
            elapsed: Duration::ZERO,
        })
    }

    /// Give queued failures one more pass through the worker pool
    async fn retry_pass(&self, tabs: &Arc<TabPool>, processor: Arc<dyn MatchProcessor>) -> (Vec<Value>, Vec<String>) {
        let queued = self.errors.get_retry_batch(usize::MAX);
        info!("Retrying {} failed matches", queued.len());

        let settings = self.config.workers.clone();
        let handler = TabBoundHandler::new(
            tabs.clone(),
            processor,
            Duration::from_secs(self.config.batch.worker_timeout_secs),
        );
        let pool = WorkerPool::new(settings.clone(), Arc::new(handler));
        pool.start();

        let mut submitted = Vec::new();
        for id in queued {
            match pool.submit_task(WorkerTask::new(id.clone(), 0, settings.max_task_retries)) {
                Ok(()) => submitted.push(id),
                Err(e) => {
                    error!("Could not queue retry for {}: {}", id, e);
                }
            }
        }

        // Room for every re-queue of a task to run to its deadline
        let wait = Duration::from_secs(settings.task_timeout_secs) * (settings.max_task_retries + 1);
        let mut recovered = Vec::new();
        let mut lost = Vec::new();
        let mut outstanding: HashSet<String> = submitted.iter().cloned().collect();

        while !outstanding.is_empty() {
            let result = tokio::select! {
                _ = self.token.cancelled() => None,
                result = pool.get_result(wait) => result,
            };
            let Some(result) = result else {
                warn!("Retry pass stopped with {} matches outstanding", outstanding.len());
                break;
            };
            outstanding.remove(&result.payload);
            match result.data {
                Some(data) if result.success => recovered.push(data),
                _ => lost.push(result.payload),
            }
        }

        pool.stop().await;
        lost.extend(outstanding);
        info!("Retry pass recovered {} matches, {} still failed", recovered.len(), lost.len());
        (recovered, lost)
    }
}
