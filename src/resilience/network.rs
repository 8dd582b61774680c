use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::config::NetworkSettings;

const WINDOW: usize = 50;

/// Whether the scraper can currently reach the outside world
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_connected(&self) -> bool;

    /// Block until connected or `timeout` elapses. Returns the final state.
    async fn wait_for_connection(&self, timeout: Duration) -> bool;
}

/// HTTP HEAD probe with a cached result refreshed by a background watcher
pub struct NetworkMonitor {
    client: reqwest::Client,
    probe_url: String,
    poll_interval: Duration,
    connected: AtomicBool,
    last_probe: Mutex<Option<Instant>>,
}

impl NetworkMonitor {
    pub fn new(settings: &NetworkSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.probe_timeout_ms))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            client,
            probe_url: settings.probe_url.clone(),
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            connected: AtomicBool::new(true),
            last_probe: Mutex::new(None),
        }
    }

    /// Probe now and refresh the cached state
    pub async fn probe(&self) -> bool {
        let connected = match self.client.head(&self.probe_url).send().await {
            Ok(response) => {
                debug!(status = %response.status(), "Connectivity probe answered");
                true
            }
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
        };

        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        *self.last_probe.lock() = Some(Instant::now());

        if was_connected && !connected {
            warn!("Network connection lost");
        } else if !was_connected && connected {
            info!("Network connection restored");
        }
        connected
    }

    fn cached(&self) -> Option<bool> {
        let last = (*self.last_probe.lock())?;
        if last.elapsed() < self.poll_interval {
            Some(self.connected.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Keep the cached state fresh until the token is cancelled
    pub fn spawn_watcher(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.poll_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Connectivity watcher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.probe().await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Connectivity for NetworkMonitor {
    async fn is_connected(&self) -> bool {
        match self.cached() {
            Some(connected) => connected,
            None => self.probe().await,
        }
    }

    async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.is_connected().await {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!("Network still down after {:?}", timeout);
                return false;
            }
            let pause = self.poll_interval.max(Duration::from_millis(100));
            tokio::time::sleep(pause.min(timeout - elapsed)).await;
            // Force a fresh probe on the next round
            *self.last_probe.lock() = None;
        }
    }
}

/// Snapshot of network health
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub avg_response_time: Option<f64>,
    pub max_response_time: Option<f64>,
    pub min_response_time: Option<f64>,
    pub response_time_stddev: Option<f64>,
    pub avg_success_rate: Option<f64>,
    pub min_success_rate: Option<f64>,
}

#[derive(Debug)]
struct HealthState {
    response_times: VecDeque<f64>,
    success_rates: VecDeque<f64>,
    consecutive_failures: u32,
    last_check: Instant,
    is_healthy: bool,
}

/// Rolling view of response times and batch success rates
#[derive(Debug)]
pub struct NetworkHealth {
    response_time_threshold: f64,
    success_rate_threshold: f64,
    max_consecutive_failures: u32,
    check_interval: Duration,
    state: Mutex<HealthState>,
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64) {
    if window.len() == WINDOW {
        window.pop_front();
    }
    window.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation
fn stddev(values: &VecDeque<f64>) -> Option<f64> {
    let avg = mean(values)?;
    if values.len() < 2 {
        return Some(0.0);
    }
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

impl NetworkHealth {
    pub fn new(settings: &NetworkSettings) -> Self {
        Self {
            response_time_threshold: Duration::from_millis(settings.response_time_threshold_ms).as_secs_f64(),
            success_rate_threshold: settings.success_rate_threshold,
            max_consecutive_failures: settings.max_consecutive_failures,
            check_interval: Duration::from_secs(settings.health_check_interval_secs),
            state: Mutex::new(HealthState {
                response_times: VecDeque::with_capacity(WINDOW),
                success_rates: VecDeque::with_capacity(WINDOW),
                consecutive_failures: 0,
                last_check: Instant::now(),
                is_healthy: true,
            }),
        }
    }

    #[cfg(test)]
    fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn record_response_time(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        push_bounded(&mut state.response_times, elapsed.as_secs_f64());
        self.evaluate(&mut state);
    }

    pub fn record_success_rate(&self, rate: f64) {
        let mut state = self.state.lock();
        push_bounded(&mut state.success_rates, rate);
        self.evaluate(&mut state);
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        self.evaluate(&mut state);
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        self.evaluate(&mut state);
    }

    pub fn stats(&self) -> NetworkStats {
        let state = self.state.lock();
        let fold = |values: &VecDeque<f64>, f: fn(f64, f64) -> f64| values.iter().copied().reduce(f);
        NetworkStats {
            is_healthy: state.is_healthy,
            consecutive_failures: state.consecutive_failures,
            avg_response_time: mean(&state.response_times),
            max_response_time: fold(&state.response_times, f64::max),
            min_response_time: fold(&state.response_times, f64::min),
            response_time_stddev: stddev(&state.response_times),
            avg_success_rate: mean(&state.success_rates),
            min_success_rate: fold(&state.success_rates, f64::min),
        }
    }

    pub fn should_continue_processing(&self) -> bool {
        let state = self.state.lock();
        if !state.is_healthy {
            warn!(
                "Network unhealthy: {} consecutive failures",
                state.consecutive_failures
            );
        }
        state.is_healthy
    }

    /// Pause to apply before the next batch under current conditions
    pub fn recommended_delay(&self) -> Duration {
        let state = self.state.lock();
        if !state.is_healthy {
            return Duration::from_secs(30);
        }
        if state.consecutive_failures > 0 {
            return Duration::from_secs_f64(5.0 * 1.5f64.powi(state.consecutive_failures as i32));
        }
        if let Some(avg) = mean(&state.response_times) {
            if avg > self.response_time_threshold {
                return Duration::from_secs_f64(avg * 2.0);
            }
        }
        Duration::from_secs(1)
    }

    /// Re-evaluate health, at most once per check interval
    fn evaluate(&self, state: &mut HealthState) {
        if state.last_check.elapsed() < self.check_interval {
            return;
        }
        state.last_check = Instant::now();

        if state.consecutive_failures >= self.max_consecutive_failures {
            state.is_healthy = false;
            warn!(
                "Network marked unhealthy: {} consecutive failures",
                state.consecutive_failures
            );
            return;
        }

        if let Some(avg) = mean(&state.response_times) {
            if avg > self.response_time_threshold {
                state.is_healthy = false;
                warn!(
                    "Network marked unhealthy: average response time {:.1}s exceeds threshold {:.1}s",
                    avg, self.response_time_threshold
                );
                return;
            }
        }

        if let Some(avg) = mean(&state.success_rates) {
            if avg < self.success_rate_threshold {
                state.is_healthy = false;
                warn!(
                    "Network marked unhealthy: success rate {:.1}% below threshold {:.1}%",
                    avg * 100.0,
                    self.success_rate_threshold * 100.0
                );
                return;
            }
        }

        state.is_healthy = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(probe_url: String) -> NetworkSettings {
        NetworkSettings {
            probe_url,
            probe_timeout_ms: 500,
            poll_interval_secs: 1,
            ..NetworkSettings::default()
        }
    }

    #[tokio::test]
    async fn test_probe_counts_any_response_as_connected() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let monitor = NetworkMonitor::new(&settings(server.uri()));
        assert!(monitor.is_connected().await);
        assert!(monitor.wait_for_connection(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_unreachable_probe_reports_disconnected() {
        let monitor = NetworkMonitor::new(&settings("http://127.0.0.1:1".to_string()));
        assert!(!monitor.is_connected().await);
        assert!(!monitor.wait_for_connection(Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_cached_result_is_reused_within_poll_interval() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let monitor = NetworkMonitor::new(&settings(server.uri()));
        assert!(monitor.is_connected().await);
        assert!(monitor.is_connected().await);
    }

    fn health() -> NetworkHealth {
        NetworkHealth::new(&NetworkSettings::default()).with_check_interval(Duration::ZERO)
    }

    #[test]
    fn test_consecutive_failures_make_network_unhealthy() {
        let health = health();
        health.record_failure();
        health.record_failure();
        assert!(health.should_continue_processing());
        assert_eq!(health.recommended_delay(), Duration::from_secs_f64(5.0 * 1.5 * 1.5));

        health.record_failure();
        assert!(!health.should_continue_processing());
        assert_eq!(health.recommended_delay(), Duration::from_secs(30));

        health.record_success();
        assert!(health.should_continue_processing());
        assert_eq!(health.recommended_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_low_success_rate_is_unhealthy() {
        let health = health();
        health.record_success_rate(0.5);
        assert!(!health.stats().is_healthy);
    }

    #[test]
    fn test_slow_responses_double_the_delay() {
        let health = NetworkHealth::new(&NetworkSettings::default());
        health.record_response_time(Duration::from_secs(6));
        health.record_response_time(Duration::from_secs(8));

        // Health is only re-evaluated after the check interval
        assert!(health.stats().is_healthy);
        assert_eq!(health.recommended_delay(), Duration::from_secs(14));

        let stats = health.stats();
        assert_eq!(stats.avg_response_time, Some(7.0));
        assert_eq!(stats.max_response_time, Some(8.0));
        assert_eq!(stats.min_response_time, Some(6.0));
    }

    #[test]
    fn test_windows_are_bounded() {
        let health = health();
        for _ in 0..(WINDOW + 10) {
            health.record_success_rate(1.0);
        }
        assert_eq!(health.state.lock().success_rates.len(), WINDOW);
    }
}
