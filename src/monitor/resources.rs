use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::tabs::TabPool;
use crate::cli::config::ResourceSettings;
use crate::monitor::performance::PerformanceMonitor;

/// Process names counted as browser processes
const BROWSER_PROCESS_NAMES: [&str; 4] = ["chrome", "chromedriver", "firefox", "geckodriver"];

/// Deepest parent chain followed when matching a process to the baseline
const MAX_ANCESTRY: usize = 64;

/// What the browser count needs to know about a host process
#[derive(Debug, Clone)]
struct ProcessEntry {
    pid: u32,
    parent: Option<u32>,
    name: String,
}

fn is_browser_name(name: &str) -> bool {
    let name = name.to_lowercase();
    BROWSER_PROCESS_NAMES.iter().any(|browser| name.contains(browser))
}

/// Browser processes started after the baseline was taken.
///
/// A process whose parent chain reaches a browser process from the baseline
/// belongs to a browser that was already running, such as the user's own.
fn count_new_browser_processes(processes: &[ProcessEntry], baseline: &HashSet<u32>) -> usize {
    let parents: HashMap<u32, Option<u32>> = processes.iter().map(|p| (p.pid, p.parent)).collect();
    let old_browsers: HashSet<u32> = processes
        .iter()
        .filter(|p| baseline.contains(&p.pid) && is_browser_name(&p.name))
        .map(|p| p.pid)
        .collect();

    let predates_run = |pid: u32| {
        let mut current = Some(pid);
        for _ in 0..MAX_ANCESTRY {
            match current {
                Some(pid) if old_browsers.contains(&pid) => return true,
                Some(pid) => current = parents.get(&pid).copied().flatten(),
                None => return false,
            }
        }
        false
    };

    processes
        .iter()
        .filter(|p| is_browser_name(&p.name) && !predates_run(p.pid))
        .count()
}

pub type CleanupCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct ResourceMetrics {
    active_tabs: usize,
    memory_usage_mb: f64,
    browser_processes: usize,
    last_cleanup: Option<Instant>,
    cleanup_count: u32,
    browser_restarts: u32,
}

/// Snapshot of resource usage
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub active_tabs: usize,
    pub memory_usage_mb: f64,
    pub browser_processes: usize,
    pub cleanup_count: u32,
    pub browser_restarts: u32,
    pub secs_since_cleanup: Option<f64>,
}

/// Watches memory, open windows and browser processes and cleans up when
/// thresholds are crossed
pub struct ResourceManager {
    settings: ResourceSettings,
    performance: Arc<PerformanceMonitor>,
    tab_pool: RwLock<Option<Arc<TabPool>>>,
    callbacks: Mutex<Vec<CleanupCallback>>,
    metrics: Mutex<ResourceMetrics>,
    system: Mutex<System>,
    /// Processes running before our browser was launched
    process_baseline: Mutex<Option<HashSet<u32>>>,
}

impl ResourceManager {
    pub fn new(settings: ResourceSettings, performance: Arc<PerformanceMonitor>) -> Self {
        Self {
            settings,
            performance,
            tab_pool: RwLock::new(None),
            callbacks: Mutex::new(Vec::new()),
            metrics: Mutex::new(ResourceMetrics::default()),
            system: Mutex::new(System::new()),
            process_baseline: Mutex::new(None),
        }
    }

    pub fn register_tab_pool(&self, pool: Arc<TabPool>) {
        *self.tab_pool.write() = Some(pool);
        info!("Registered tab pool for resource management");
    }

    pub fn unregister_tab_pool(&self) {
        *self.tab_pool.write() = None;
        debug!("Unregistered tab pool");
    }

    pub fn add_cleanup_callback(&self, callback: CleanupCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Run the checks every `monitor_interval_secs` until the token is cancelled
    pub fn spawn_monitor(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!("Started resource monitoring");
            let mut ticker = tokio::time::interval(Duration::from_secs(manager.settings.monitor_interval_secs));
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Stopped resource monitoring");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.check_resources().await;
                    }
                }
            }
        })
    }

    /// One monitoring pass
    pub async fn check_resources(&self) {
        let memory_mb = self.performance.memory_summary().current_memory_mb;
        let browser_processes = self.count_browser_processes();
        self.observe(memory_mb, browser_processes);

        if memory_mb > self.settings.memory_cleanup_threshold_mb {
            self.trigger_cleanup().await;
        }

        let pool = self.tab_pool.read().clone();
        if let Some(pool) = pool {
            match pool.window_count().await {
                Ok(count) => {
                    self.metrics.lock().active_tabs = count;
                    if count > self.settings.max_active_tabs {
                        warn!(count, limit = self.settings.max_active_tabs, "Too many open windows");
                        if let Err(e) = pool.close_untracked_tabs().await {
                            error!("Error cleaning up tabs: {}", e);
                        }
                    }
                }
                Err(e) => debug!("Error checking tabs: {}", e),
            }
        }
    }

    fn observe(&self, memory_mb: f64, browser_processes: usize) {
        let mut metrics = self.metrics.lock();
        metrics.memory_usage_mb = memory_mb;
        metrics.browser_processes = browser_processes;
    }

    fn host_processes(&self) -> Vec<ProcessEntry> {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                parent: process.parent().map(|parent| parent.as_u32()),
                name: process.name().to_string_lossy().into_owned(),
            })
            .collect()
    }

    /// Remember every process on the host so later counts only see browsers
    /// launched after this call. Call before starting the browser.
    pub fn capture_process_baseline(&self) {
        let baseline: HashSet<u32> = self.host_processes().iter().map(|p| p.pid).collect();
        debug!(processes = baseline.len(), "Captured process baseline");
        *self.process_baseline.lock() = Some(baseline);
    }

    fn count_browser_processes(&self) -> usize {
        let processes = self.host_processes();
        let mut baseline = self.process_baseline.lock();
        let baseline = baseline.get_or_insert_with(|| processes.iter().map(|p| p.pid).collect());
        count_new_browser_processes(&processes, baseline)
    }

    /// Clean up unless the last cleanup is within the cooldown.
    ///
    /// Returns true when a cleanup ran.
    pub async fn trigger_cleanup(&self) -> bool {
        let cooldown = Duration::from_secs(self.settings.cleanup_cooldown_secs);
        {
            let mut metrics = self.metrics.lock();
            if let Some(last) = metrics.last_cleanup {
                if last.elapsed() < cooldown {
                    debug!("Cleanup skipped, still in cooldown");
                    return false;
                }
            }
            metrics.last_cleanup = Some(Instant::now());
            metrics.cleanup_count += 1;
        }

        info!("Triggering resource cleanup...");
        self.perform_cleanup().await;
        true
    }

    /// Clean up now, ignoring the cooldown
    pub async fn force_cleanup(&self) {
        info!("Forcing immediate resource cleanup...");
        {
            let mut metrics = self.metrics.lock();
            metrics.last_cleanup = Some(Instant::now());
            metrics.cleanup_count += 1;
        }
        self.perform_cleanup().await;
    }

    async fn perform_cleanup(&self) {
        let pool = self.tab_pool.read().clone();
        if let Some(pool) = pool {
            if let Err(e) = pool.close_untracked_tabs().await {
                error!("Error cleaning up tabs: {}", e);
            }
        }

        for callback in self.callbacks.lock().iter() {
            callback();
        }

        info!("Resource cleanup completed");
    }

    pub fn is_healthy(&self) -> bool {
        let metrics = self.metrics.lock();
        metrics.memory_usage_mb < self.settings.memory_cleanup_threshold_mb
            && metrics.active_tabs <= self.settings.max_active_tabs
    }

    pub fn should_shrink_batch(&self) -> bool {
        !self.is_healthy()
    }

    pub fn should_restart_browser(&self) -> bool {
        let metrics = self.metrics.lock();
        metrics.memory_usage_mb > self.settings.memory_critical_threshold_mb
            || metrics.active_tabs > self.settings.max_active_tabs * 2
            || metrics.browser_processes > self.settings.max_browser_processes
    }

    /// Count a restart and forget stale measurements of the old browser
    pub fn record_browser_restart(&self) {
        let mut metrics = self.metrics.lock();
        metrics.browser_restarts += 1;
        metrics.active_tabs = 0;
        metrics.browser_processes = 0;
        metrics.memory_usage_mb = 0.0;
        info!("Browser restarted ({} so far)", metrics.browser_restarts);
    }

    pub fn resource_summary(&self) -> ResourceSummary {
        let metrics = self.metrics.lock();
        ResourceSummary {
            active_tabs: metrics.active_tabs,
            memory_usage_mb: metrics.memory_usage_mb,
            browser_processes: metrics.browser_processes,
            cleanup_count: metrics.cleanup_count,
            browser_restarts: metrics.browser_restarts,
            secs_since_cleanup: metrics.last_cleanup.map(|t| t.elapsed().as_secs_f64()),
        }
    }
}
