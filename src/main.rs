use anyhow::Result;
use tracing::{error, info};

mod adapters;
mod browser;
mod cli;
mod process;
mod storage;
mod tasks;
mod utils;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Workers log to stderr only; stdout carries their messages
    if matches!(args.command, cli::Commands::Worker) {
        utils::init_worker_logging(args.verbose)?;
    } else {
        utils::init_logging(args.verbose, args.log_file.clone())?;
        info!("Starting scrapectl v{}", env!("CARGO_PKG_VERSION"));
    }

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
