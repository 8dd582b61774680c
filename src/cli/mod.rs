pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::scraper::listing::MatchDay;
use crate::utils::default_log_file;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file (default location when no path is given)
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Where logs should be written besides stderr, if anywhere
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|path| path.clone().unwrap_or_else(default_log_file))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape a list of matches, or every match scheduled on a day
    Scrape {
        /// Match ids to scrape
        #[arg(required_unless_present_any = ["file", "day"])]
        ids: Vec<String>,

        /// Scrape the day's schedule from the listing page
        #[arg(short, long, value_enum, conflicts_with_all = ["ids", "file"])]
        day: Option<MatchDay>,

        /// Read match ids from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Number of browser tabs
        #[arg(short, long)]
        tabs: Option<usize>,

        /// Resume the stored session instead of starting over
        #[arg(short, long)]
        resume: bool,

        /// Directory for result files
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show or clear the stored session checkpoint
    Session {
        /// Remove the stored checkpoint
        #[arg(long)]
        clear: bool,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli, token: CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Scrape {
            ids,
            day,
            file,
            profile,
            tabs,
            resume,
            output,
        } => {
            info!("Starting scrape with profile {}", profile.as_deref().unwrap_or("default"));
            let options = commands::ScrapeOptions {
                ids,
                day,
                file,
                profile,
                tabs,
                resume,
                output,
            };
            commands::scrape(options, token).await
        }
        Commands::Session { clear, profile } => commands::session(profile, clear).await,
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
            }
        }
    }
}
