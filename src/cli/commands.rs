use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::config::ScraperConfig;
use crate::scraper::controller::{MatchSource, ScrapeController};
use crate::scraper::listing::MatchDay;
use crate::storage::session::{JsonSessionStore, SessionManager};

/// Arguments of the `scrape` command
#[derive(Debug, Clone, Default)]
pub struct ScrapeOptions {
    pub ids: Vec<String>,
    /// Scrape this day's schedule instead of explicit ids
    pub day: Option<MatchDay>,
    pub file: Option<PathBuf>,
    pub profile: Option<String>,
    pub tabs: Option<usize>,
    pub resume: bool,
    pub output: Option<PathBuf>,
}

fn load_config(profile: Option<&str>) -> Result<ScraperConfig> {
    match profile {
        Some(name) => ScraperConfig::load_profile(name).context(format!("Failed to load profile: {}", name)),
        None => ScraperConfig::load_default(),
    }
}

/// Parse match ids, one per line. Blank lines and `#` comments are skipped.
fn parse_match_ids(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Drop repeated ids, keeping first occurrences in order
fn dedupe(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

async fn read_match_ids(path: &Path) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .context(format!("Failed to read match ids from {}", path.display()))?;
    Ok(parse_match_ids(&contents))
}

/// Scrape the given matches and write the results
pub async fn scrape(options: ScrapeOptions, token: CancellationToken) -> Result<()> {
    let mut config = load_config(options.profile.as_deref())?;

    if let Some(tabs) = options.tabs {
        config.tabs.max_tabs = tabs;
    }
    if let Some(output) = options.output {
        config.output.directory = output;
    }
    config.validate().context("Invalid scrape options")?;

    let source = match options.day {
        Some(day) => MatchSource::Day(day),
        None => {
            let mut ids = options.ids;
            if let Some(file) = &options.file {
                ids.extend(read_match_ids(file).await?);
            }
            let ids = dedupe(ids);
            if ids.is_empty() {
                anyhow::bail!("No match ids to scrape");
            }
            MatchSource::Ids(ids)
        }
    };

    let controller = ScrapeController::new(config, token)?;
    let report = controller.run(source, options.resume).await?;

    println!("Session: {} ({})", report.session_id, report.day);
    if !report.skipped.is_empty() {
        println!("Skipped {} matches already stored", report.skipped.len());
    }
    println!(
        "Scraped {}/{} matches in {:.1}s ({} failed, {} not attempted)",
        report.results.len(),
        report.total_matches,
        report.elapsed.as_secs_f64(),
        report.failed.len(),
        report.pending.len()
    );
    if report.browser_restarts > 0 {
        println!("Browser restarts: {}", report.browser_restarts);
    }
    println!("Results written to {}", report.results_file.display());

    if report.cancelled {
        warn!("Run was interrupted. Use --resume to continue where it stopped.");
    }
    Ok(())
}

/// Show or clear the stored session checkpoint
pub async fn session(profile: Option<String>, clear: bool) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    let manager = SessionManager::new(Box::new(JsonSessionStore::new(config.session.session_file.clone())));

    if clear {
        manager.cleanup_session().await?;
        println!("Session checkpoint removed");
        return Ok(());
    }

    if manager.load_session().await.is_none() {
        println!("No stored session at {}", config.session.session_file.display());
        return Ok(());
    }

    if let Some(summary) = manager.session_summary() {
        println!("Session ID: {}", summary.session_id);
        println!(
            "Progress: {}/{} ({:.1}%)",
            summary.completed_matches, summary.total_matches, summary.completion_percentage
        );
        println!("Failed: {}", summary.failed_matches);
        println!("Started: {}", summary.start_time);
        println!("Last Updated: {}", summary.last_update);
        println!("Complete: {}", summary.is_complete);
    }
    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = ScraperConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from the defaults when missing
pub fn manage_profile(profile_name: String) -> Result<()> {
    match ScraperConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = ScraperConfig::default();
            config.save_as_profile(&profile_name)?;
            info!("Created profile {}", profile_name);
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = ScraperConfig::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_match_ids_skips_blanks_and_comments() {
        let ids = parse_match_ids("abc123\n\n  # finals\n def456 \n");
        assert_eq!(ids, vec!["abc123", "def456"]);
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let ids = dedupe(vec!["b".into(), "a".into(), "b".into(), "c".into(), "a".into()]);
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_read_match_ids_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.txt");
        std::fs::write(&path, "m1\nm2\n").unwrap();

        assert_eq!(read_match_ids(&path).await.unwrap(), vec!["m1", "m2"]);
        assert!(read_match_ids(&dir.path().join("missing.txt")).await.is_err());
    }
}
