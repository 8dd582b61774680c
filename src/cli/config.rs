use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ScraperConfig {
    pub browser: BrowserSettings,
    pub tabs: TabSettings,
    pub batch: BatchSettings,
    pub retry: RetrySettings,
    pub errors: ErrorSettings,
    pub network: NetworkSettings,
    pub resources: ResourceSettings,
    pub workers: WorkerSettings,
    pub session: SessionSettings,
    pub extraction: ExtractionSettings,
    pub listing: ListingSettings,
    pub output: OutputSettings,
}

/// Browser session settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserSettings {
    pub browser_type: String, // "chrome" or "firefox"
    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: String,
    pub viewport: Viewport,
    pub disable_images: bool,
    pub page_load_timeout_secs: u64,
}

/// Browser viewport settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Tab pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TabSettings {
    pub max_tabs: usize,
    pub max_failures: u32,
    pub min_load_interval_ms: u64,   // Minimum spacing between loads in the same tab
    pub switch_timeout_ms: u64,      // Cap on waiting for the tab-switch gate
    pub ready_poll_interval_ms: u64, // How often document.readyState is polled
    pub fallback_escalation_threshold: u32,
}

/// Batch sizing and pacing settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BatchSettings {
    pub base_batch_size: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub success_threshold: f64,
    pub worker_timeout_secs: u64,
}

/// Backoff settings for the retry engine
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter_factor: f64,
    pub reconnect_timeout_secs: u64, // Longest wait for the network before an attempt
}

/// Per-match error ledger settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ErrorSettings {
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
}

/// Connectivity probe and network health settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkSettings {
    pub probe_url: String,
    pub probe_timeout_ms: u64,
    pub poll_interval_secs: u64,
    pub response_time_threshold_ms: u64,
    pub success_rate_threshold: f64,
    pub max_consecutive_failures: u32,
    pub health_check_interval_secs: u64,
}

/// Resource monitoring thresholds
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ResourceSettings {
    pub monitor_interval_secs: u64,
    pub sample_interval_secs: u64,
    pub memory_cleanup_threshold_mb: f64,
    pub memory_critical_threshold_mb: f64,
    pub max_active_tabs: usize,
    pub max_browser_processes: usize,
    pub cleanup_cooldown_secs: u64,
}

/// Worker pool settings for the retry pass
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_workers: usize,
    pub task_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub max_task_retries: u32,
}

/// Checkpoint settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionSettings {
    pub session_file: PathBuf,
}

/// What to load for a match and how to read it
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionSettings {
    pub match_url_template: String, // "{id}" is replaced by the match id
    pub verify_url: bool,
    pub script: String,
}

/// Where the day's scheduled matches are listed and how to read them
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ListingSettings {
    pub url: String,
    pub script: String,          // Returns an array of match ids
    pub tomorrow_script: String, // Switches the listing to tomorrow, returns false when it cannot
    pub settle_ms: u64,          // Wait after switching days before reading ids
}

/// Result output settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutputSettings {
    pub directory: PathBuf,
    pub skip_existing: bool, // Skip matches already in the day's result file
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            browser_type: "chrome".to_string(),
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            disable_images: true,
            page_load_timeout_secs: 30,
        }
    }
}

impl Default for TabSettings {
    fn default() -> Self {
        Self {
            max_tabs: 1,
            max_failures: 3,
            min_load_interval_ms: 2000,
            switch_timeout_ms: 10_000,
            ready_poll_interval_ms: 250,
            fallback_escalation_threshold: 5,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            base_batch_size: 2,
            min_batch_size: 1,
            max_batch_size: 3,
            base_delay_ms: 3000,
            max_delay_ms: 10_000,
            success_threshold: 0.7,
            worker_timeout_secs: 90,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
            jitter_factor: 0.1,
            reconnect_timeout_secs: 60,
        }
    }
}

impl Default for ErrorSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_retry_delay_ms: 2000,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_url: "https://www.flashscore.com".to_string(),
            probe_timeout_ms: 5000,
            poll_interval_secs: 5,
            response_time_threshold_ms: 5000,
            success_rate_threshold: 0.8,
            max_consecutive_failures: 3,
            health_check_interval_secs: 60,
        }
    }
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 10,
            sample_interval_secs: 5,
            memory_cleanup_threshold_mb: 800.0,
            memory_critical_threshold_mb: 1000.0,
            max_active_tabs: 10,
            max_browser_processes: 40,
            cleanup_cooldown_secs: 60,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: 1,
            task_timeout_secs: 120,
            health_check_interval_secs: 30,
            max_task_retries: 1,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_file: PathBuf::from("output/scraping_session.json"),
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            match_url_template: "https://www.flashscore.com/match/basketball/{id}/#/match-summary/match-summary".to_string(),
            verify_url: true,
            script: DEFAULT_EXTRACTION_SCRIPT.to_string(),
        }
    }
}

impl Default for ListingSettings {
    fn default() -> Self {
        Self {
            url: "https://www.flashscore.com/basketball/".to_string(),
            script: DEFAULT_LISTING_SCRIPT.to_string(),
            tomorrow_script: DEFAULT_TOMORROW_SCRIPT.to_string(),
            settle_ms: 3000,
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output/json"),
            skip_existing: true,
        }
    }
}

/// Ids of scheduled matches on the listing page
pub const DEFAULT_LISTING_SCRIPT: &str = r#"
return Array.from(document.querySelectorAll('.event__match--scheduled'))
    .map((el) => el.id || '')
    .filter((id) => id.startsWith('g_3_'))
    .map((id) => id.split('_').pop());
"#;

pub const DEFAULT_TOMORROW_SCRIPT: &str = r#"
const button = document.querySelector('.calendar__navigation--tomorrow');
if (!button) { return false; }
button.click();
return true;
"#;

/// Reads the match header. Returns null when the header has not rendered.
pub const DEFAULT_EXTRACTION_SCRIPT: &str = r#"
const text = (selector) => {
    const el = document.querySelector(selector);
    return el ? el.textContent.trim() : null;
};
const home = text('.duelParticipant__home .participant__participantName');
const away = text('.duelParticipant__away .participant__participantName');
if (!home || !away) { return null; }
return {
    home_team: home,
    away_team: away,
    start_time: text('.duelParticipant__startTime'),
    score: text('.detailScore__wrapper'),
    status: text('.fixedHeaderDuel__detailStatus'),
    league: text('.tournamentHeader__country'),
};
"#;

impl TabSettings {
    pub fn min_load_interval(&self) -> Duration {
        Duration::from_millis(self.min_load_interval_ms)
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }
}

impl ScraperConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.tabs.max_tabs == 0 {
            anyhow::bail!("tabs.max_tabs must be at least 1");
        }
        if self.tabs.max_tabs > self.resources.max_active_tabs {
            anyhow::bail!(
                "tabs.max_tabs ({}) exceeds resources.max_active_tabs ({})",
                self.tabs.max_tabs,
                self.resources.max_active_tabs
            );
        }
        let batch = &self.batch;
        if batch.min_batch_size == 0 || batch.min_batch_size > batch.max_batch_size {
            anyhow::bail!(
                "batch sizes must satisfy 0 < min ({}) <= max ({})",
                batch.min_batch_size,
                batch.max_batch_size
            );
        }
        if batch.base_batch_size < batch.min_batch_size || batch.base_batch_size > batch.max_batch_size {
            anyhow::bail!("batch.base_batch_size must lie between min and max batch size");
        }
        if batch.base_delay_ms > batch.max_delay_ms {
            anyhow::bail!("batch.base_delay_ms must not exceed batch.max_delay_ms");
        }
        if !(0.0..=1.0).contains(&batch.success_threshold) {
            anyhow::bail!("batch.success_threshold must lie in [0, 1]");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            anyhow::bail!("retry.jitter_factor must lie in [0, 1]");
        }
        if !self.extraction.match_url_template.contains("{id}") {
            anyhow::bail!("extraction.match_url_template must contain an {{id}} placeholder");
        }
        if url::Url::parse(&self.listing.url).is_err() {
            anyhow::bail!("listing.url is not a valid URL: {}", self.listing.url);
        }
        Ok(())
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "match-scraper", "match-scraper") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Profiles live under sites/
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load the default configuration, creating it on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load a named configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        config
            .validate()
            .context(format!("Invalid configuration in {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as a named profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profile_path = Self::config_dir().join("sites").join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(sites_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ScraperConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "tabs:\n  max_tabs: 3\nbatch:\n  base_batch_size: 2\n  max_batch_size: 4\n";
        let config: ScraperConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.tabs.max_tabs, 3);
        assert_eq!(config.tabs.max_failures, 3);
        assert_eq!(config.batch.max_batch_size, 4);
        assert_eq!(config.batch.min_batch_size, 1);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = ScraperConfig::default();
        config.batch.base_delay_ms = config.batch.max_delay_ms + 1;
        assert!(config.validate().is_err());

        let mut config = ScraperConfig::default();
        config.tabs.max_tabs = 0;
        assert!(config.validate().is_err());

        let mut config = ScraperConfig::default();
        config.tabs.max_tabs = config.resources.max_active_tabs + 1;
        assert!(config.validate().is_err());

        let mut config = ScraperConfig::default();
        config.extraction.match_url_template = "https://example.com/match".to_string();
        assert!(config.validate().is_err());

        let mut config = ScraperConfig::default();
        config.listing.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("profile.yaml");

        let mut config = ScraperConfig::default();
        config.tabs.max_tabs = 4;
        config.save_to_file(&path).unwrap();

        let loaded = ScraperConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.tabs.max_tabs, 4);
        assert_eq!(loaded.browser.webdriver_url, config.browser.webdriver_url);
    }
}
