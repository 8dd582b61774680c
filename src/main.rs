use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use match_scraper::{cli, utils};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    utils::init_logging(args.verbose, args.log_path())?;

    info!("Starting match scraper v{}", env!("CARGO_PKG_VERSION"));

    // Ctrl-C stops the run at the next safe point
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch...");
            shutdown.cancel();
        }
    });

    // Process commands
    match cli::process_command(args, token).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
