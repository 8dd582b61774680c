use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::browser::tabs::TabPool;
use crate::cli::config::BatchSettings;
use crate::error::{Result, ScraperError};
use crate::monitor::performance::PerformanceMonitor;
use crate::monitor::resources::ResourceManager;
use crate::scraper::task::WorkerTask;
use crate::scraper::worker_pool::TaskHandler;

/// Consecutive fully failed batches that stop the run
const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;

/// Processes one match on the tab it was handed.
///
/// `None` or an empty value means the match failed.
#[async_trait]
pub trait MatchProcessor: Send + Sync {
    async fn process(&self, match_id: String, tab_index: usize) -> Option<Value>;
}

#[async_trait]
impl<F, Fut> MatchProcessor for F
where
    F: Fn(String, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Value>> + Send + 'static,
{
    async fn process(&self, match_id: String, tab_index: usize) -> Option<Value> {
        (self)(match_id, tab_index).await
    }
}

/// Tuning for one run
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub base_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub success_threshold: f64,
    pub worker_timeout: Duration,
    pub max_tabs: usize,
}

impl BatchConfig {
    pub fn from_settings(settings: &BatchSettings, max_tabs: usize) -> Self {
        Self {
            base_batch_size: settings.base_batch_size,
            min_batch_size: settings.min_batch_size,
            max_batch_size: settings.max_batch_size,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            success_threshold: settings.success_threshold,
            worker_timeout: Duration::from_secs(settings.worker_timeout_secs),
            max_tabs,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from_settings(&BatchSettings::default(), 1)
    }
}

/// Rolling counters across batches
#[derive(Debug, Clone, Serialize)]
pub struct BatchMetrics {
    pub successful_matches: usize,
    pub failed_matches: usize,
    pub total_processing_time: Duration,
    pub consecutive_failures: u32,
    pub last_success_rate: f64,
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self {
            successful_matches: 0,
            failed_matches: 0,
            total_processing_time: Duration::ZERO,
            consecutive_failures: 0,
            last_success_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_matches: usize,
    pub successful_matches: usize,
    pub failed_matches: usize,
    pub success_rate: f64,
    pub total_processing_time: Duration,
    pub consecutive_failures: u32,
    pub last_success_rate: f64,
}

/// How a single match on a tab ended
#[derive(Debug)]
pub(crate) enum UnitOutcome {
    Success { value: Value, tab: usize, elapsed: Duration },
    Empty { tab: usize, elapsed: Duration },
    TimedOut { tab: usize, elapsed: Duration },
    Panicked { tab: usize, elapsed: Duration },
    NoTab,
}

impl UnitOutcome {
    fn describe(&self) -> &'static str {
        match self {
            UnitOutcome::Success { .. } => "success",
            UnitOutcome::Empty { .. } => "no data extracted",
            UnitOutcome::TimedOut { .. } => "worker timeout",
            UnitOutcome::Panicked { .. } => "processor panicked",
            UnitOutcome::NoTab => "no tabs available",
        }
    }

    fn timing(&self) -> Option<(usize, Duration)> {
        match self {
            UnitOutcome::Success { tab, elapsed, .. }
            | UnitOutcome::Empty { tab, elapsed }
            | UnitOutcome::TimedOut { tab, elapsed }
            | UnitOutcome::Panicked { tab, elapsed } => Some((*tab, *elapsed)),
            UnitOutcome::NoTab => None,
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Claim a tab, run the processor on it under `timeout` and release the tab
pub(crate) async fn process_on_tab(
    pool: &TabPool,
    processor: &dyn MatchProcessor,
    match_id: &str,
    timeout: Duration,
) -> UnitOutcome {
    let tab = match pool.get_next_tab() {
        Ok(tab) => tab,
        Err(e) => {
            warn!("No tabs available for match {}: {}", match_id, e);
            return UnitOutcome::NoTab;
        }
    };
    debug!("Got tab {} for match {}", tab, match_id);

    let started = Instant::now();
    let work = async {
        if !pool.switch_to_tab(tab).await {
            error!("Failed to switch to tab {} for match {}", tab, match_id);
            return None;
        }
        processor.process(match_id.to_string(), tab).await
    };

    let outcome = match tokio::time::timeout(timeout, AssertUnwindSafe(work).catch_unwind()).await {
        Ok(Ok(Some(value))) if is_truthy(&value) => {
            info!("Successfully processed match {} with tab {}", match_id, tab);
            pool.mark_tab_healthy(tab);
            UnitOutcome::Success {
                value,
                tab,
                elapsed: started.elapsed(),
            }
        }
        Ok(Ok(_)) => {
            warn!("Failed to process match {} with tab {}", match_id, tab);
            pool.mark_tab_unhealthy(tab);
            UnitOutcome::Empty {
                tab,
                elapsed: started.elapsed(),
            }
        }
        Ok(Err(_)) => {
            error!("Processor panicked on match {} with tab {}", match_id, tab);
            pool.mark_tab_unhealthy(tab);
            UnitOutcome::Panicked {
                tab,
                elapsed: started.elapsed(),
            }
        }
        Err(_) => {
            error!(
                "Worker timeout processing match {} with tab {} after {:?}",
                match_id, tab, timeout
            );
            pool.mark_tab_unhealthy(tab);
            UnitOutcome::TimedOut {
                tab,
                elapsed: started.elapsed(),
            }
        }
    };

    pool.record_processing_time(tab, started.elapsed());
    outcome
}

/// Fans matches out over the tab pool and adapts batch size and pacing
pub struct BatchProcessor {
    config: BatchConfig,
    tab_pool: RwLock<Option<Arc<TabPool>>>,
    resources: Option<Arc<ResourceManager>>,
    performance: Option<Arc<PerformanceMonitor>>,
    metrics: Mutex<BatchMetrics>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        info!(
            "Initialized batch processor with {:?} worker timeout and {} max tabs",
            config.worker_timeout, config.max_tabs
        );
        Self {
            config,
            tab_pool: RwLock::new(None),
            resources: None,
            performance: None,
            metrics: Mutex::new(BatchMetrics::default()),
        }
    }

    pub fn with_tab_pool(self, pool: Arc<TabPool>) -> Self {
        *self.tab_pool.write() = Some(pool);
        self
    }

    pub fn with_resource_manager(mut self, resources: Arc<ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_performance_monitor(mut self, performance: Arc<PerformanceMonitor>) -> Self {
        self.performance = Some(performance);
        self
    }

    /// Swap in a new pool, e.g. after a browser restart
    pub fn set_tab_pool(&self, pool: Arc<TabPool>) {
        *self.tab_pool.write() = Some(pool);
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Process matches in parallel, one tab per match.
    ///
    /// Returns the extracted values and the ids of failed matches. Per-match
    /// failures never make this fail; only a missing tab pool does.
    pub async fn process_batch(
        &self,
        matches: &[String],
        processor: Arc<dyn MatchProcessor>,
        max_workers: Option<usize>,
    ) -> Result<(Vec<Value>, Vec<String>)> {
        let pool = self
            .tab_pool
            .read()
            .clone()
            .ok_or(ScraperError::TabPoolNotConfigured)?;

        if matches.is_empty() {
            debug!("Empty batch, nothing to do");
            return Ok((Vec::new(), Vec::new()));
        }

        let workers = max_workers.unwrap_or(self.config.max_tabs).max(1);
        let batch_start = Instant::now();
        info!(
            "Processing batch of {} matches with {} workers (timeout: {:?})",
            matches.len(),
            workers,
            self.config.worker_timeout
        );

        let permits = Arc::new(Semaphore::new(workers));
        let mut units = JoinSet::new();
        for match_id in matches {
            let pool = Arc::clone(&pool);
            let processor = Arc::clone(&processor);
            let permits = Arc::clone(&permits);
            let match_id = match_id.clone();
            let timeout = self.config.worker_timeout;

            units.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => process_on_tab(&pool, processor.as_ref(), &match_id, timeout).await,
                    Err(_) => UnitOutcome::NoTab,
                };
                (match_id, outcome)
            });
        }

        let mut pending: HashSet<&String> = matches.iter().collect();
        let mut successful = Vec::new();
        let mut failed = Vec::new();

        while let Some(joined) = units.join_next().await {
            let (match_id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Batch worker aborted: {}", e);
                    continue;
                }
            };
            pending.remove(&match_id);

            if let (Some(performance), Some((tab, elapsed))) = (&self.performance, outcome.timing()) {
                performance.record_tab_time(tab, elapsed);
                performance.record_match_time(&match_id, elapsed);
            }

            match outcome {
                UnitOutcome::Success { value, .. } => successful.push(value),
                other => {
                    debug!("Match {} failed: {}", match_id, other.describe());
                    failed.push(match_id);
                }
            }
        }

        // Units that never reported back
        failed.extend(pending.into_iter().cloned());

        let elapsed = batch_start.elapsed();
        self.update_metrics(successful.len(), failed.len(), elapsed);
        info!(
            "Batch completed in {:.1}s: {} successful, {} failed",
            elapsed.as_secs_f64(),
            successful.len(),
            failed.len()
        );

        Ok((successful, failed))
    }

    fn update_metrics(&self, successful: usize, failed: usize, elapsed: Duration) {
        let mut metrics = self.metrics.lock();
        let total = successful + failed;
        if total > 0 {
            metrics.last_success_rate = successful as f64 / total as f64;
        }
        if successful > 0 {
            metrics.consecutive_failures = 0;
        } else {
            metrics.consecutive_failures += 1;
        }
        metrics.successful_matches += successful;
        metrics.failed_matches += failed;
        metrics.total_processing_time += elapsed;
    }

    /// Shrink fast on failures, grow slowly on success
    pub fn get_adaptive_batch_size(&self) -> usize {
        if let Some(resources) = &self.resources {
            if resources.should_shrink_batch() {
                debug!("Resources under pressure, using minimum batch size");
                return self.config.min_batch_size;
            }
        }

        let metrics = self.metrics.lock();
        let base = self.config.base_batch_size as f64;

        if metrics.consecutive_failures > 0 {
            let shrunk = (base * 0.8f64.powi(metrics.consecutive_failures as i32)) as usize;
            shrunk.max(self.config.min_batch_size)
        } else if metrics.last_success_rate > self.config.success_threshold {
            ((base * 1.2) as usize).min(self.config.max_batch_size)
        } else {
            self.config.base_batch_size
        }
    }

    pub fn get_adaptive_delay(&self) -> Duration {
        let metrics = self.metrics.lock();
        let base = self.config.base_delay;

        let delay = if metrics.consecutive_failures > 0 {
            base.mul_f64(1.5f64.powi(metrics.consecutive_failures.min(64) as i32))
        } else if metrics.last_success_rate < self.config.success_threshold {
            base.mul_f64(1.5)
        } else {
            base
        };
        delay.min(self.config.max_delay)
    }

    /// False once every match is done or too many batches failed in a row
    pub fn should_continue_processing(&self, total_processed: usize, total_matches: usize) -> bool {
        if total_processed >= total_matches {
            return false;
        }
        let consecutive_failures = self.metrics.lock().consecutive_failures;
        if consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD {
            warn!("Too many consecutive failures, stopping processing");
            return false;
        }
        true
    }

    pub fn metrics(&self) -> BatchMetrics {
        self.metrics.lock().clone()
    }

    pub fn get_metrics_summary(&self) -> MetricsSummary {
        let metrics = self.metrics.lock();
        let total = metrics.successful_matches + metrics.failed_matches;
        MetricsSummary {
            total_matches: total,
            successful_matches: metrics.successful_matches,
            failed_matches: metrics.failed_matches,
            success_rate: if total > 0 {
                metrics.successful_matches as f64 / total as f64
            } else {
                0.0
            },
            total_processing_time: metrics.total_processing_time,
            consecutive_failures: metrics.consecutive_failures,
            last_success_rate: metrics.last_success_rate,
        }
    }
}

/// Worker pool handler that runs each task's match on a pooled tab
pub struct TabBoundHandler {
    pool: Arc<TabPool>,
    processor: Arc<dyn MatchProcessor>,
    timeout: Duration,
}

impl TabBoundHandler {
    pub fn new(pool: Arc<TabPool>, processor: Arc<dyn MatchProcessor>, timeout: Duration) -> Self {
        Self {
            pool,
            processor,
            timeout,
        }
    }
}

#[async_trait]
impl TaskHandler for TabBoundHandler {
    async fn handle(&self, task: &WorkerTask, _worker_id: usize) -> anyhow::Result<Value> {
        match process_on_tab(&self.pool, self.processor.as_ref(), &task.payload, self.timeout).await {
            UnitOutcome::Success { value, .. } => Ok(value),
            other => anyhow::bail!("match {} failed: {}", task.payload, other.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::driver::fake::FakeBrowser;
    use crate::cli::config::{ResourceSettings, TabSettings, WorkerSettings};
    use crate::scraper::worker_pool::WorkerPool;
    use serde_json::json;

    async fn tab_pool(max_tabs: usize) -> Arc<TabPool> {
        let pool = TabPool::new(
            Arc::new(FakeBrowser::new()),
            TabSettings {
                max_tabs,
                min_load_interval_ms: 0,
                ..TabSettings::default()
            },
        );
        assert!(pool.setup().await);
        Arc::new(pool)
    }

    fn config(max_tabs: usize) -> BatchConfig {
        BatchConfig {
            max_tabs,
            worker_timeout: Duration::from_secs(2),
            ..BatchConfig::default()
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn skip_m2() -> Arc<dyn MatchProcessor> {
        Arc::new(|id: String, _tab: usize| async move {
            if id == "m2" {
                None
            } else {
                Some(json!({ "id": id }))
            }
        })
    }

    #[tokio::test]
    async fn test_process_batch_splits_successes_and_failures() {
        let processor = BatchProcessor::new(config(2)).with_tab_pool(tab_pool(2).await);

        let (successes, failures) = processor
            .process_batch(&ids(&["m1", "m2", "m3"]), skip_m2(), Some(2))
            .await
            .unwrap();

        assert_eq!(successes.len(), 2);
        assert!(successes.contains(&json!({"id": "m1"})));
        assert!(successes.contains(&json!({"id": "m3"})));
        assert_eq!(failures, vec!["m2"]);

        let summary = processor.get_metrics_summary();
        assert_eq!(summary.total_matches, 3);
        assert_eq!(summary.consecutive_failures, 0);
        assert!((summary.last_success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_process_batch_requires_tab_pool() {
        let processor = BatchProcessor::new(config(1));
        let err = processor
            .process_batch(&ids(&["m1"]), skip_m2(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScraperError::TabPoolNotConfigured));
    }

    #[tokio::test]
    async fn test_more_matches_than_tabs() {
        let processor = BatchProcessor::new(config(2)).with_tab_pool(tab_pool(2).await);
        let matches = ids(&["a", "b", "c", "d", "e"]);

        let (successes, failures) = processor.process_batch(&matches, skip_m2(), None).await.unwrap();

        assert_eq!(successes.len(), 5);
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_leaves_metrics_untouched() {
        let processor = BatchProcessor::new(config(1)).with_tab_pool(tab_pool(1).await);
        let (successes, failures) = processor.process_batch(&[], skip_m2(), None).await.unwrap();

        assert!(successes.is_empty() && failures.is_empty());
        let metrics = processor.metrics();
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.last_success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_timed_out_match_fails_and_marks_tab() {
        let pool = tab_pool(1).await;
        let processor = BatchProcessor::new(BatchConfig {
            worker_timeout: Duration::from_millis(50),
            ..config(1)
        })
        .with_tab_pool(pool.clone());

        let slow: Arc<dyn MatchProcessor> = Arc::new(|id: String, _tab: usize| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Some(json!({ "id": id }))
        });
        let (successes, failures) = processor.process_batch(&ids(&["m1"]), slow, None).await.unwrap();

        assert!(successes.is_empty());
        assert_eq!(failures, vec!["m1"]);
        let stats = &pool.tab_stats()[0];
        assert!(!stats.is_healthy);
        assert!(!stats.in_use);
    }

    #[tokio::test]
    async fn test_panicking_processor_fails_only_that_match() {
        let processor = BatchProcessor::new(config(2)).with_tab_pool(tab_pool(2).await);
        let flaky: Arc<dyn MatchProcessor> = Arc::new(|id: String, _tab: usize| async move {
            if id.starts_with("boom") {
                panic!("processor crashed on {}", id);
            }
            Some(json!({ "id": id }))
        });

        let (successes, failures) = processor
            .process_batch(&ids(&["ok1", "boom", "ok2"]), flaky, None)
            .await
            .unwrap();

        assert_eq!(successes.len(), 2);
        assert_eq!(failures, vec!["boom"]);
    }

    #[tokio::test]
    async fn test_circuit_breaker_after_three_failed_batches() {
        let processor = BatchProcessor::new(config(1)).with_tab_pool(tab_pool(1).await);
        let nothing: Arc<dyn MatchProcessor> = Arc::new(|_id: String, _tab: usize| async move { None::<Value> });

        for round in 0..3 {
            assert!(processor.should_continue_processing(round, 10));
            processor
                .process_batch(&ids(&["m"]), nothing.clone(), None)
                .await
                .unwrap();
        }

        assert_eq!(processor.metrics().consecutive_failures, 3);
        assert!(!processor.should_continue_processing(3, 10));
    }

    #[test]
    fn test_should_continue_stops_when_done() {
        let processor = BatchProcessor::new(config(1));
        assert!(processor.should_continue_processing(0, 1));
        assert!(!processor.should_continue_processing(1, 1));
        assert!(!processor.should_continue_processing(0, 0));
    }

    #[test]
    fn test_adaptive_batch_size_shrinks_with_failures() {
        let processor = BatchProcessor::new(BatchConfig {
            base_batch_size: 10,
            min_batch_size: 2,
            max_batch_size: 12,
            ..config(1)
        });

        let mut previous = usize::MAX;
        for k in 0..30 {
            processor.metrics.lock().consecutive_failures = k;
            let size = processor.get_adaptive_batch_size();
            assert!(size <= previous);
            assert!(size >= 2);
            previous = size;
        }
        assert_eq!(previous, 2);
    }

    #[test]
    fn test_adaptive_batch_size_grows_on_success() {
        let processor = BatchProcessor::new(BatchConfig {
            base_batch_size: 5,
            max_batch_size: 10,
            ..config(1)
        });
        assert_eq!(processor.get_adaptive_batch_size(), 6);

        processor.metrics.lock().last_success_rate = 0.5;
        assert_eq!(processor.get_adaptive_batch_size(), 5);
    }

    #[test]
    fn test_adaptive_delay_grows_and_caps() {
        let processor = BatchProcessor::new(config(1));
        assert_eq!(processor.get_adaptive_delay(), Duration::from_secs(3));

        let mut previous = Duration::ZERO;
        for k in 0..100 {
            processor.metrics.lock().consecutive_failures = k;
            let delay = processor.get_adaptive_delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }

        let mut metrics = processor.metrics.lock();
        metrics.consecutive_failures = 0;
        metrics.last_success_rate = 0.5;
        drop(metrics);
        assert_eq!(processor.get_adaptive_delay(), Duration::from_millis(4500));
    }

    #[test]
    fn test_resource_pressure_forces_minimum_size() {
        let performance = Arc::new(PerformanceMonitor::new(Duration::from_secs(5)));
        let resources = Arc::new(ResourceManager::new(ResourceSettings::default(), performance.clone()));
        let processor = BatchProcessor::new(BatchConfig {
            base_batch_size: 3,
            ..config(1)
        })
        .with_resource_manager(resources.clone());
        assert_eq!(processor.get_adaptive_batch_size(), 3);

        performance.record_memory_sample(900.0, 0.0);
        tokio_test::block_on(resources.check_resources());
        assert_eq!(processor.get_adaptive_batch_size(), 1);
    }

    #[tokio::test]
    async fn test_tab_bound_handler_in_worker_pool() {
        let handler = TabBoundHandler::new(tab_pool(1).await, skip_m2(), Duration::from_secs(2));
        let workers = WorkerPool::new(
            WorkerSettings {
                max_workers: 1,
                ..WorkerSettings::default()
            },
            Arc::new(handler),
        );
        workers.start();

        workers.submit_task(WorkerTask::new("m1", 0, 0)).unwrap();
        workers.submit_task(WorkerTask::new("m2", 0, 0)).unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let result = workers.get_result(Duration::from_secs(3)).await.unwrap();
            outcomes.push((result.payload, result.success));
        }
        outcomes.sort();
        assert_eq!(outcomes, vec![("m1".to_string(), true), ("m2".to_string(), false)]);
        workers.stop().await;
    }
}
