use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::browser::driver::{BrowserDriver, DriverError};
use crate::cli::config::TabSettings;
use crate::error::ScraperError;

const READY_STATE_SCRIPT: &str = "return document.readyState";

/// State of one logical tab
#[derive(Debug, Clone)]
pub struct TabState {
    pub is_healthy: bool,
    pub last_used: Instant,
    pub processing_time: Duration,
    pub failure_count: u32,
    pub current_url: Option<String>,
    /// A navigation is in flight
    pub is_loading: bool,
    pub last_load_time: Option<Instant>,
    /// Handed out by `get_next_tab` and not yet released
    pub in_use: bool,
}

impl TabState {
    fn fresh() -> Self {
        Self {
            is_healthy: true,
            last_used: Instant::now(),
            processing_time: Duration::ZERO,
            failure_count: 0,
            current_url: None,
            is_loading: false,
            last_load_time: None,
            in_use: false,
        }
    }

    fn is_available(&self) -> bool {
        !self.is_loading && !self.in_use
    }
}

/// Point-in-time view of a tab for reporting
#[derive(Debug, Clone, Serialize)]
pub struct TabStats {
    pub index: usize,
    pub is_healthy: bool,
    pub failure_count: u32,
    pub processing_time_secs: f64,
    pub idle_secs: f64,
    pub current_url: Option<String>,
    pub is_loading: bool,
    pub in_use: bool,
}

/// Fixed-capacity slots indexed by tab number
#[derive(Debug)]
struct TabArena {
    slots: Vec<Option<TabState>>,
    fallback_streak: u32,
}

impl TabArena {
    fn new(capacity: usize) -> Self {
        let mut arena = Self {
            slots: vec![None; capacity.max(1)],
            fallback_streak: 0,
        };
        arena.reset();
        arena
    }

    /// Back to a single fresh tab 0
    fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.slots[0] = Some(TabState::fresh());
        self.fallback_streak = 0;
    }

    fn insert(&mut self, index: usize, state: TabState) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = Some(state);
                true
            }
            None => false,
        }
    }

    fn get(&self, index: usize) -> Option<&TabState> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut TabState> {
        self.slots.get_mut(index).and_then(|slot| slot.as_mut())
    }

    fn iter(&self) -> impl Iterator<Item = (usize, &TabState)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|state| (index, state)))
    }

    fn len(&self) -> usize {
        self.iter().count()
    }

    fn least_recently_used<F>(&self, eligible: F) -> Option<usize>
    where
        F: Fn(&TabState) -> bool,
    {
        self.iter()
            .filter(|(_, state)| eligible(state))
            .min_by_key(|(_, state)| state.last_used)
            .map(|(index, _)| index)
    }

    fn claim(&mut self, index: usize) {
        if let Some(state) = self.get_mut(index) {
            state.last_used = Instant::now();
            state.is_loading = true;
            state.in_use = true;
        }
    }

    /// Give unhealthy tabs under the failure cap another chance
    fn recover(&mut self, max_failures: u32) -> usize {
        let mut recovered = 0;
        for slot in self.slots.iter_mut().flatten() {
            if !slot.is_healthy && slot.failure_count < max_failures {
                slot.is_healthy = true;
                slot.failure_count = 0;
                recovered += 1;
            }
        }
        recovered
    }
}

/// Failure inside `load_url`, split by whether the switch itself failed
enum LoadFailure {
    Switch(DriverError),
    Load(DriverError),
}

/// Pool of tabs in one shared browser session.
///
/// Tabs are handed out for exclusive use with [`TabPool::get_next_tab`] and
/// given back with [`TabPool::mark_tab_healthy`] or [`TabPool::mark_tab_unhealthy`].
/// Every focus-dependent step (a switch plus one driver call) goes through
/// the switch gate. The gate is held per step, never across a whole page load,
/// and a wait past `switch_timeout` proceeds without it.
pub struct TabPool {
    driver: Arc<dyn BrowserDriver>,
    settings: TabSettings,
    arena: Mutex<TabArena>,
    switch_gate: AsyncMutex<()>,
}

impl TabPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, settings: TabSettings) -> Self {
        info!(max_tabs = settings.max_tabs, "Initialized tab pool");
        Self {
            arena: Mutex::new(TabArena::new(settings.max_tabs)),
            driver,
            settings,
            switch_gate: AsyncMutex::new(()),
        }
    }

    pub fn driver(&self) -> Arc<dyn BrowserDriver> {
        self.driver.clone()
    }

    pub fn max_tabs(&self) -> usize {
        self.settings.max_tabs
    }

    /// Number of tabs currently tracked
    pub fn len(&self) -> usize {
        self.arena.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open tabs 1..max_tabs next to tab 0.
    ///
    /// Returns false when the session is unavailable or a tab fails to open.
    /// Tabs opened before the failure stay open.
    pub async fn setup(&self) -> bool {
        if let Err(e) = self.driver.window_handles().await {
            error!("No browser session available: {}", e);
            return false;
        }

        info!("Setting up {} tab(s)...", self.settings.max_tabs);
        self.arena.lock().reset();

        for index in 1..self.settings.max_tabs {
            if let Err(e) = self.driver.open_tab().await {
                error!("Failed to open tab {}: {}", index, e);
                return false;
            }
            self.arena.lock().insert(index, TabState::fresh());
            debug!("Opened and initialized tab {}", index);
        }

        info!("Successfully set up {} tab(s)", self.settings.max_tabs);
        true
    }

    /// Claim the least recently used healthy, idle tab.
    ///
    /// Falls back to recovering unhealthy tabs, then to any idle tab
    /// regardless of health. Never blocks.
    pub fn get_next_tab(&self) -> Result<usize, ScraperError> {
        let mut arena = self.arena.lock();

        if arena.len() == 0 {
            return Err(ScraperError::NoTabsAvailable);
        }

        let healthy = |state: &TabState| state.is_healthy && state.is_available();

        if let Some(index) = arena.least_recently_used(healthy) {
            arena.fallback_streak = 0;
            arena.claim(index);
            return Ok(index);
        }

        let recovered = arena.recover(self.settings.max_failures);
        if recovered > 0 {
            info!("Recovered {} unhealthy tab(s)", recovered);
        }

        if let Some(index) = arena.least_recently_used(healthy) {
            arena.fallback_streak = 0;
            arena.claim(index);
            return Ok(index);
        }

        // Last resort: an idle tab whatever its health
        if let Some(index) = arena.least_recently_used(TabState::is_available) {
            arena.fallback_streak += 1;
            warn!(
                tab = index,
                streak = arena.fallback_streak,
                "No healthy tabs, reusing an unhealthy one"
            );
            if let Some(state) = arena.get_mut(index) {
                state.is_healthy = true;
            }
            arena.claim(index);
            return Ok(index);
        }

        Err(ScraperError::NoTabsAvailable)
    }

    /// Switch session focus to a tab and check it responds.
    pub async fn switch_to_tab(&self, index: usize) -> bool {
        let _gate = self.enter_gate().await;
        self.switch_locked(index).await.is_ok()
    }

    /// Load a URL in a tab and wait for the document to complete.
    ///
    /// Waits out the remainder of `min_load_interval` since the tab's last
    /// load first. The tab stays claimed by the caller on return.
    pub async fn load_url(&self, index: usize, url: &str, timeout: Duration) -> Result<(), DriverError> {
        let wait = {
            let arena = self.arena.lock();
            let state = arena
                .get(index)
                .ok_or_else(|| DriverError::webdriver(format!("tab {} is not part of the pool", index)))?;
            state
                .last_load_time
                .map(|last| self.settings.min_load_interval().saturating_sub(last.elapsed()))
                .unwrap_or(Duration::ZERO)
        };

        if !wait.is_zero() {
            debug!(tab = index, wait_ms = wait.as_millis() as u64, "Spacing loads");
            tokio::time::sleep(wait).await;
        }

        self.set_loading(index, true);
        let result = self.try_load(index, url, timeout).await;

        match result {
            Ok(()) => {
                self.note_load(index, true);
                Ok(())
            }
            Err(LoadFailure::Switch(e)) => {
                self.set_loading(index, false);
                Err(e)
            }
            Err(LoadFailure::Load(e)) => {
                error!("Error loading URL in tab {}: {}", index, e.summary());
                self.note_load(index, false);
                Err(e)
            }
        }
    }

    /// Run a script in a tab
    pub async fn execute_in_tab(&self, index: usize, script: &str) -> Result<Value, DriverError> {
        let _gate = self.enter_gate().await;
        self.switch_locked(index).await?;
        self.driver.execute_script(script).await
    }

    /// Release a tab and reset its failure count
    pub fn mark_tab_healthy(&self, index: usize) {
        let mut arena = self.arena.lock();
        if let Some(state) = arena.get_mut(index) {
            state.is_healthy = true;
            state.failure_count = 0;
            state.is_loading = false;
            state.in_use = false;
            debug!("Tab {} marked as healthy", index);
        }
    }

    /// Release a tab and count a failure against it
    pub fn mark_tab_unhealthy(&self, index: usize) {
        let max_failures = self.settings.max_failures;
        let mut arena = self.arena.lock();
        if let Some(state) = arena.get_mut(index) {
            state.is_healthy = false;
            state.failure_count = (state.failure_count + 1).min(max_failures);
            state.is_loading = false;
            state.in_use = false;
            warn!(
                "Tab {} marked as unhealthy after {} failures",
                index, state.failure_count
            );
        }
    }

    pub fn record_processing_time(&self, index: usize, elapsed: Duration) {
        if let Some(state) = self.arena.lock().get_mut(index) {
            state.processing_time += elapsed;
        }
    }

    pub fn tab_stats(&self) -> Vec<TabStats> {
        self.arena
            .lock()
            .iter()
            .map(|(index, state)| TabStats {
                index,
                is_healthy: state.is_healthy,
                failure_count: state.failure_count,
                processing_time_secs: state.processing_time.as_secs_f64(),
                idle_secs: state.last_used.elapsed().as_secs_f64(),
                current_url: state.current_url.clone(),
                is_loading: state.is_loading,
                in_use: state.in_use,
            })
            .collect()
    }

    /// Consecutive times `get_next_tab` had to fall back to an unhealthy tab
    pub fn fallback_streak(&self) -> u32 {
        self.arena.lock().fallback_streak
    }

    /// The fallback path keeps firing; the browser itself is likely broken
    pub fn needs_browser_restart(&self) -> bool {
        self.fallback_streak() >= self.settings.fallback_escalation_threshold
    }

    /// Number of windows open in the browser, tracked or not
    pub async fn window_count(&self) -> Result<usize, DriverError> {
        Ok(self.driver.window_handles().await?.len())
    }

    /// Close windows the pool does not track, e.g. popups
    pub async fn close_untracked_tabs(&self) -> Result<usize, DriverError> {
        let _gate = self.enter_gate().await;

        let tracked = self.settings.max_tabs;
        let handles = self.driver.window_handles().await?;
        if handles.len() <= tracked {
            return Ok(0);
        }

        let mut closed = 0;
        for handle in &handles[tracked..] {
            match self.close_handle(handle).await {
                Ok(()) => closed += 1,
                Err(e) => debug!("Error closing tab {}: {}", handle, e),
            }
        }
        self.driver.switch_to(&handles[0]).await?;

        info!("Closed {} untracked tab(s)", closed);
        Ok(closed)
    }

    /// Close every tab except the first and reset to a single healthy tab
    pub async fn cleanup(&self) {
        let _gate = self.enter_gate().await;

        match self.driver.window_handles().await {
            Ok(handles) => {
                for handle in handles.iter().skip(1) {
                    if let Err(e) = self.close_handle(handle).await {
                        debug!("Error closing tab {}: {}", handle, e);
                    }
                }
                if let Some(first) = handles.first() {
                    if let Err(e) = self.driver.switch_to(first).await {
                        error!("Error during tab cleanup: {}", e);
                    }
                }
            }
            Err(e) => error!("Error during tab cleanup: {}", e),
        }

        self.arena.lock().reset();
    }

    async fn close_handle(&self, handle: &str) -> Result<(), DriverError> {
        self.driver.switch_to(handle).await?;
        self.driver.close_current().await
    }

    /// Wait up to `switch_timeout` for the gate, then go ahead without it
    async fn enter_gate(&self) -> Option<MutexGuard<'_, ()>> {
        match tokio::time::timeout(self.settings.switch_timeout(), self.switch_gate.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(
                    "Tab switch gate still busy after {:?}, proceeding",
                    self.settings.switch_timeout()
                );
                None
            }
        }
    }

    /// Switch inside a gated step; driver failures count against the tab.
    ///
    /// Returns the tab's window handle.
    async fn switch_locked(&self, index: usize) -> Result<String, DriverError> {
        let result = self.try_switch(index).await;
        if let Err(e) = &result {
            error!("Error switching to tab {}: {}", index, e.summary());
            self.record_switch_failure(index);
        }
        result
    }

    async fn try_switch(&self, index: usize) -> Result<String, DriverError> {
        let handles = self.driver.window_handles().await?;
        let handle = handles
            .get(index)
            .ok_or_else(|| DriverError::webdriver(format!("tab index {} out of range", index)))?;

        self.driver.switch_to(handle).await?;
        self.driver.execute_script(READY_STATE_SCRIPT).await?;
        Ok(handle.clone())
    }

    async fn try_load(&self, index: usize, url: &str, timeout: Duration) -> Result<(), LoadFailure> {
        let handle = {
            let _gate = self.enter_gate().await;
            let handle = self.switch_locked(index).await.map_err(LoadFailure::Switch)?;
            self.driver.navigate(url).await.map_err(LoadFailure::Load)?;
            handle
        };
        {
            let mut arena = self.arena.lock();
            if let Some(state) = arena.get_mut(index) {
                state.last_load_time = Some(Instant::now());
                state.current_url = Some(url.to_string());
            }
        }

        // Other tabs may take focus between polls
        let poll = self.settings.ready_poll_interval();
        let ready = async {
            loop {
                let state = {
                    let _gate = self.enter_gate().await;
                    self.driver.switch_to(&handle).await?;
                    self.driver.execute_script(READY_STATE_SCRIPT).await?
                };
                if state.as_str() == Some("complete") {
                    return Ok::<(), DriverError>(());
                }
                tokio::time::sleep(poll).await;
            }
        };

        match tokio::time::timeout(timeout, ready).await {
            Ok(result) => result.map_err(LoadFailure::Load),
            Err(_) => Err(LoadFailure::Load(DriverError::timeout(format!(
                "page not complete after {:?}: {}",
                timeout, url
            )))),
        }
    }

    fn set_loading(&self, index: usize, loading: bool) {
        if let Some(state) = self.arena.lock().get_mut(index) {
            state.is_loading = loading;
        }
    }

    /// Record a load outcome without releasing the caller's claim
    fn note_load(&self, index: usize, success: bool) {
        let max_failures = self.settings.max_failures;
        if let Some(state) = self.arena.lock().get_mut(index) {
            state.is_loading = false;
            if success {
                state.is_healthy = true;
                state.failure_count = 0;
            } else {
                state.is_healthy = false;
                state.failure_count = (state.failure_count + 1).min(max_failures);
            }
        }
    }

    fn record_switch_failure(&self, index: usize) {
        let max_failures = self.settings.max_failures;
        if let Some(state) = self.arena.lock().get_mut(index) {
            state.failure_count = (state.failure_count + 1).min(max_failures);
            if state.failure_count >= max_failures {
                state.is_healthy = false;
                warn!("Tab {} unhealthy after {} switch failures", index, state.failure_count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::driver::fake::FakeBrowser;
    use crate::browser::driver::MockBrowserDriver;
    use std::collections::HashSet;

    fn settings(max_tabs: usize) -> TabSettings {
        TabSettings {
            max_tabs,
            min_load_interval_ms: 0,
            ready_poll_interval_ms: 5,
            switch_timeout_ms: 500,
            ..TabSettings::default()
        }
    }

    async fn pool_with(max_tabs: usize) -> (Arc<FakeBrowser>, TabPool) {
        let browser = Arc::new(FakeBrowser::new());
        let pool = TabPool::new(browser.clone(), settings(max_tabs));
        assert!(pool.setup().await);
        (browser, pool)
    }

    fn state_of(pool: &TabPool, index: usize) -> TabStats {
        pool.tab_stats()
            .into_iter()
            .find(|s| s.index == index)
            .expect("tab exists")
    }

    #[tokio::test]
    async fn test_setup_opens_additional_tabs() {
        let (browser, pool) = pool_with(3).await;
        assert_eq!(browser.tab_count(), 3);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_setup_fails_when_tab_cannot_open() {
        let browser = Arc::new(FakeBrowser::failing_open());
        let pool = TabPool::new(browser, settings(2));
        assert!(!pool.setup().await);
        // Tab 0 always exists
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_setup_fails_without_session() {
        let mut driver = MockBrowserDriver::new();
        driver
            .expect_window_handles()
            .returning(|| Err(DriverError::connection("session deleted")));
        driver.expect_open_tab().never();

        let pool = TabPool::new(Arc::new(driver), settings(2));
        assert!(!pool.setup().await);
    }

    #[tokio::test]
    async fn test_get_next_tab_hands_out_distinct_tabs() {
        let (_browser, pool) = pool_with(2).await;

        let first = pool.get_next_tab().unwrap();
        let second = pool.get_next_tab().unwrap();
        assert_ne!(first, second);

        // Both claimed: the third call must not hand either out again
        assert!(matches!(pool.get_next_tab(), Err(ScraperError::NoTabsAvailable)));

        pool.mark_tab_healthy(first);
        assert_eq!(pool.get_next_tab().unwrap(), first);
    }

    #[tokio::test]
    async fn test_get_next_tab_prefers_least_recently_used() {
        let (_browser, pool) = pool_with(2).await;

        let first = pool.get_next_tab().unwrap();
        pool.mark_tab_healthy(first);
        let second = pool.get_next_tab().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_mark_tab_healthy_is_idempotent() {
        let (_browser, pool) = pool_with(1).await;
        pool.mark_tab_unhealthy(0);

        pool.mark_tab_healthy(0);
        pool.mark_tab_healthy(0);

        let stats = state_of(&pool, 0);
        assert!(stats.is_healthy);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_tabs_are_recovered() {
        let (_browser, pool) = pool_with(2).await;
        pool.mark_tab_unhealthy(0);
        pool.mark_tab_unhealthy(1);

        let index = pool.get_next_tab().unwrap();
        let stats = state_of(&pool, index);
        assert!(stats.is_healthy);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(pool.fallback_streak(), 0);
    }

    #[tokio::test]
    async fn test_fallback_reuses_tab_at_failure_cap_and_escalates() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = TabPool::new(
            browser,
            TabSettings {
                fallback_escalation_threshold: 2,
                ..settings(1)
            },
        );
        assert!(pool.setup().await);

        for _ in 0..3 {
            pool.mark_tab_unhealthy(0);
        }
        assert_eq!(state_of(&pool, 0).failure_count, 3);

        assert_eq!(pool.get_next_tab().unwrap(), 0);
        assert_eq!(pool.fallback_streak(), 1);
        assert!(!pool.needs_browser_restart());

        pool.mark_tab_unhealthy(0);
        assert_eq!(pool.get_next_tab().unwrap(), 0);
        assert!(pool.needs_browser_restart());

        // A normal healthy pick resets the streak
        pool.mark_tab_healthy(0);
        assert_eq!(pool.get_next_tab().unwrap(), 0);
        assert_eq!(pool.fallback_streak(), 0);
    }

    #[tokio::test]
    async fn test_switch_failures_use_hysteresis() {
        let (browser, pool) = pool_with(2).await;
        browser.break_tab(1);

        assert!(!pool.switch_to_tab(1).await);
        assert!(!pool.switch_to_tab(1).await);
        assert!(state_of(&pool, 1).is_healthy);

        assert!(!pool.switch_to_tab(1).await);
        let stats = state_of(&pool, 1);
        assert!(!stats.is_healthy);
        assert_eq!(stats.failure_count, 3);

        assert!(pool.switch_to_tab(0).await);
    }

    #[tokio::test]
    async fn test_switch_out_of_range_fails() {
        let (_browser, pool) = pool_with(1).await;
        assert!(!pool.switch_to_tab(5).await);
    }

    #[tokio::test]
    async fn test_load_url_keeps_claim_until_release() {
        let (browser, pool) = pool_with(1).await;
        let index = pool.get_next_tab().unwrap();

        pool.load_url(index, "https://example.com/match/1", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(browser.navigations(), 1);
        let stats = state_of(&pool, index);
        assert!(!stats.is_loading);
        assert!(stats.in_use);
        assert_eq!(stats.current_url.as_deref(), Some("https://example.com/match/1"));
        assert!(pool.get_next_tab().is_err());

        pool.mark_tab_healthy(index);
        assert_eq!(pool.get_next_tab().unwrap(), index);
    }

    #[tokio::test]
    async fn test_load_url_enforces_min_interval() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = TabPool::new(
            browser,
            TabSettings {
                min_load_interval_ms: 150,
                ..settings(1)
            },
        );
        assert!(pool.setup().await);

        let start = Instant::now();
        pool.load_url(0, "https://example.com/a", Duration::from_secs(1)).await.unwrap();
        pool.load_url(0, "https://example.com/b", Duration::from_secs(1)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn test_load_failure_marks_tab_unhealthy() {
        let mut driver = MockBrowserDriver::new();
        driver
            .expect_window_handles()
            .returning(|| Ok(vec!["main".to_string()]));
        driver.expect_switch_to().returning(|_| Ok(()));
        driver
            .expect_execute_script()
            .returning(|_| Ok(Value::String("complete".to_string())));
        driver
            .expect_navigate()
            .returning(|_| Err(DriverError::from_message("unknown error: net::ERR_CONNECTION_RESET")));

        let pool = TabPool::new(Arc::new(driver), settings(1));
        let index = pool.get_next_tab().unwrap();

        let err = pool
            .load_url(index, "https://example.com", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.message.contains("ERR_CONNECTION_RESET"));

        let stats = state_of(&pool, index);
        assert!(!stats.is_healthy);
        assert!(!stats.is_loading);
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_load_times_out_when_page_never_completes() {
        let mut driver = MockBrowserDriver::new();
        driver
            .expect_window_handles()
            .returning(|| Ok(vec!["main".to_string()]));
        driver.expect_switch_to().returning(|_| Ok(()));
        driver.expect_navigate().returning(|_| Ok(()));
        driver
            .expect_execute_script()
            .returning(|_| Ok(Value::String("loading".to_string())));

        let pool = TabPool::new(Arc::new(driver), settings(1));
        let err = pool
            .load_url(0, "https://example.com", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::browser::driver::DriverErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_slow_load_does_not_fail_idle_tabs() {
        let browser = Arc::new(FakeBrowser::new());
        browser.slow_loads(Duration::from_millis(300));
        let pool = Arc::new(TabPool::new(
            browser,
            TabSettings {
                switch_timeout_ms: 100,
                ..settings(2)
            },
        ));
        assert!(pool.setup().await);

        let loading = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.load_url(0, "https://example.com/slow", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..3 {
            assert!(pool.switch_to_tab(1).await);
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert!(loading.await.unwrap().is_ok());

        let idle = state_of(&pool, 1);
        assert!(idle.is_healthy);
        assert_eq!(idle.failure_count, 0);
        assert!(state_of(&pool, 0).is_healthy);
    }

    #[tokio::test]
    async fn test_busy_gate_proceeds_after_timeout() {
        let browser = Arc::new(FakeBrowser::new());
        let pool = TabPool::new(
            browser,
            TabSettings {
                switch_timeout_ms: 50,
                ..settings(2)
            },
        );
        assert!(pool.setup().await);

        let _held = pool.switch_gate.lock().await;
        let start = Instant::now();
        assert!(pool.switch_to_tab(1).await);
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(state_of(&pool, 1).failure_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let (_browser, pool) = pool_with(8).await;
        let pool = Arc::new(pool);

        let claimed: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let pool = pool.clone();
                    scope.spawn(move || pool.get_next_tab().unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<usize> = claimed.iter().copied().collect();
        assert_eq!(unique.len(), 8);
        assert!(pool.get_next_tab().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_leaves_single_tab() {
        let (browser, pool) = pool_with(3).await;
        pool.get_next_tab().unwrap();

        pool.cleanup().await;

        assert_eq!(browser.tab_count(), 1);
        assert_eq!(pool.len(), 1);
        let stats = state_of(&pool, 0);
        assert!(stats.is_healthy);
        assert!(!stats.in_use);
    }

    #[tokio::test]
    async fn test_close_untracked_tabs() {
        let (browser, pool) = pool_with(2).await;
        browser.open_tab().await.unwrap();
        browser.open_tab().await.unwrap();
        assert_eq!(pool.window_count().await.unwrap(), 4);

        assert_eq!(pool.close_untracked_tabs().await.unwrap(), 2);
        assert_eq!(browser.tab_count(), 2);
    }
}
