use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MEMORY_WINDOW: usize = 120;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Run-level timing counters
#[derive(Debug, Default)]
struct PerformanceMetrics {
    successful_matches: usize,
    failed_matches: usize,
    /// Cumulative processing time per tab index
    tab_times: BTreeMap<usize, Duration>,
    /// Latest processing time per match
    match_times: HashMap<String, Duration>,
    batch_times: Vec<Duration>,
    batch_started: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryStats {
    samples: VecDeque<f64>,
    peak_mb: f64,
    cpu_percent: f32,
}

/// Memory and CPU usage of this process
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemorySummary {
    pub current_memory_mb: f64,
    pub peak_memory_mb: f64,
    pub average_memory_mb: f64,
    pub cpu_percent: f32,
    pub samples: usize,
}

/// Batch and match timings plus a background sampler of process memory/CPU
#[derive(Debug)]
pub struct PerformanceMonitor {
    started: Instant,
    sample_interval: Duration,
    metrics: Mutex<PerformanceMetrics>,
    memory: Mutex<MemoryStats>,
}

impl PerformanceMonitor {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            sample_interval,
            metrics: Mutex::new(PerformanceMetrics::default()),
            memory: Mutex::new(MemoryStats::default()),
        }
    }

    pub fn start_batch(&self, batch_size: usize) {
        debug!(batch_size, "Batch started");
        self.metrics.lock().batch_started = Some(Instant::now());
    }

    /// Close the running batch and return its duration
    pub fn end_batch(&self, successful: usize, failed: usize) -> Option<Duration> {
        let mut metrics = self.metrics.lock();
        let started = metrics.batch_started.take()?;
        let elapsed = started.elapsed();

        metrics.batch_times.push(elapsed);
        metrics.successful_matches += successful;
        metrics.failed_matches += failed;
        Some(elapsed)
    }

    pub fn record_tab_time(&self, tab_index: usize, elapsed: Duration) {
        *self.metrics.lock().tab_times.entry(tab_index).or_default() += elapsed;
    }

    pub fn record_match_time(&self, match_id: &str, elapsed: Duration) {
        self.metrics.lock().match_times.insert(match_id.to_string(), elapsed);
    }

    pub fn average_batch_time(&self) -> Duration {
        let metrics = self.metrics.lock();
        average(&metrics.batch_times)
    }

    pub fn average_match_time(&self) -> Duration {
        let metrics = self.metrics.lock();
        let times: Vec<Duration> = metrics.match_times.values().copied().collect();
        average(&times)
    }

    pub fn processed(&self) -> (usize, usize) {
        let metrics = self.metrics.lock();
        (metrics.successful_matches, metrics.failed_matches)
    }

    /// Log progress against the number of matches in the run
    pub fn log_progress(&self, total: usize, batch_time: Option<Duration>) {
        let (successful, failed) = self.processed();
        let processed = successful + failed;
        if total == 0 {
            return;
        }

        let percentage = processed as f64 / total as f64 * 100.0;
        let mut message = format!(
            "Progress: {}/{} matches ({:.1}%) - {} successful, {} failed",
            processed, total, percentage, successful, failed
        );

        if let Some(batch_time) = batch_time {
            let per_match = if processed > 0 {
                self.started.elapsed().as_secs_f64() / processed as f64
            } else {
                0.0
            };
            message.push_str(&format!(
                " (Batch time: {:.1}s, Avg: {:.1}s/match)",
                batch_time.as_secs_f64(),
                per_match
            ));
        }

        info!("{}", message);
    }

    pub fn log_final_metrics(&self) {
        let (successful, failed) = self.processed();
        let total = successful + failed;
        let success_rate = if total > 0 {
            successful as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        info!("Performance Metrics:");
        info!("Total processing time: {:.1}s", self.started.elapsed().as_secs_f64());
        info!("Average time per match: {:.1}s", self.average_match_time().as_secs_f64());
        info!("Average batch time: {:.1}s", self.average_batch_time().as_secs_f64());
        info!("Success rate: {:.1}%", success_rate);

        let tab_times = self.metrics.lock().tab_times.clone();
        for (tab, elapsed) in tab_times {
            info!("Tab {} total processing time: {:.1}s", tab, elapsed.as_secs_f64());
        }

        let memory = self.memory_summary();
        if memory.samples > 0 {
            info!(
                "Memory: current {:.1} MB, peak {:.1} MB, average {:.1} MB",
                memory.current_memory_mb, memory.peak_memory_mb, memory.average_memory_mb
            );
        }
    }

    pub fn record_memory_sample(&self, memory_mb: f64, cpu_percent: f32) {
        let mut memory = self.memory.lock();
        if memory.samples.len() == MEMORY_WINDOW {
            memory.samples.pop_front();
        }
        memory.samples.push_back(memory_mb);
        memory.peak_mb = memory.peak_mb.max(memory_mb);
        memory.cpu_percent = cpu_percent;
    }

    pub fn memory_summary(&self) -> MemorySummary {
        let memory = self.memory.lock();
        let count = memory.samples.len();
        let average = if count > 0 {
            memory.samples.iter().sum::<f64>() / count as f64
        } else {
            0.0
        };

        MemorySummary {
            current_memory_mb: memory.samples.back().copied().unwrap_or(0.0),
            peak_memory_mb: memory.peak_mb,
            average_memory_mb: average,
            cpu_percent: memory.cpu_percent,
            samples: count,
        }
    }

    /// Sample this process every `sample_interval` until the token is cancelled
    pub fn spawn_sampler(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let pid = match sysinfo::get_current_pid() {
                Ok(pid) => pid,
                Err(e) => {
                    warn!("Memory sampling disabled: {}", e);
                    return;
                }
            };
            let mut system = System::new();
            let mut ticker = tokio::time::interval(monitor.sample_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Performance sampler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Some((memory_mb, cpu)) = sample_process(&mut system, pid) {
                            monitor.record_memory_sample(memory_mb, cpu);
                        }
                    }
                }
            }
        })
    }
}

fn sample_process(system: &mut System, pid: Pid) -> Option<(f64, f32)> {
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory().with_cpu(),
    );
    let process = system.process(pid)?;
    Some((process.memory() as f64 / BYTES_PER_MB, process.cpu_usage()))
}

fn average(times: &[Duration]) -> Duration {
    if times.is_empty() {
        return Duration::ZERO;
    }
    times.iter().sum::<Duration>() / times.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_timing_accumulates_counts() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(5));
        assert!(monitor.end_batch(1, 1).is_none());

        monitor.start_batch(3);
        assert!(monitor.end_batch(2, 1).is_some());
        monitor.start_batch(2);
        monitor.end_batch(2, 0);

        assert_eq!(monitor.processed(), (4, 1));
        assert_eq!(monitor.metrics.lock().batch_times.len(), 2);
    }

    #[test]
    fn test_tab_and_match_times() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(5));
        monitor.record_tab_time(0, Duration::from_secs(2));
        monitor.record_tab_time(0, Duration::from_secs(3));
        monitor.record_match_time("m1", Duration::from_secs(2));
        monitor.record_match_time("m2", Duration::from_secs(4));

        assert_eq!(monitor.metrics.lock().tab_times[&0], Duration::from_secs(5));
        assert_eq!(monitor.average_match_time(), Duration::from_secs(3));
        assert_eq!(monitor.average_batch_time(), Duration::ZERO);
    }

    #[test]
    fn test_memory_summary() {
        let monitor = PerformanceMonitor::new(Duration::from_secs(5));
        assert_eq!(monitor.memory_summary().samples, 0);

        monitor.record_memory_sample(100.0, 5.0);
        monitor.record_memory_sample(300.0, 10.0);
        monitor.record_memory_sample(200.0, 7.5);

        let summary = monitor.memory_summary();
        assert_eq!(summary.current_memory_mb, 200.0);
        assert_eq!(summary.peak_memory_mb, 300.0);
        assert_eq!(summary.average_memory_mb, 200.0);
        assert_eq!(summary.cpu_percent, 7.5);
    }

    #[test]
    fn test_sample_current_process() {
        let pid = sysinfo::get_current_pid().unwrap();
        let mut system = System::new();
        let (memory_mb, _cpu) = sample_process(&mut system, pid).unwrap();
        assert!(memory_mb > 0.0);
    }

    #[tokio::test]
    async fn test_sampler_stops_on_cancel() {
        let monitor = Arc::new(PerformanceMonitor::new(Duration::from_millis(10)));
        let token = CancellationToken::new();
        let handle = monitor.spawn_sampler(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(monitor.memory_summary().samples > 0);
    }
}
