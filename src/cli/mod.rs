pub mod commands;
pub mod config;
pub mod console;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::tasks::task::{TaskId, TaskStatus};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new scrape task
    Create {
        /// Task name
        #[arg(required = true)]
        name: String,

        /// Target to scrape, as named in the configuration
        #[arg(short, long)]
        target: String,

        /// Keyword to search for (repeatable)
        #[arg(short, long = "keyword", required = true)]
        keywords: Vec<String>,

        /// Location passed to the search
        #[arg(short, long)]
        location: Option<String>,

        /// Result pages per keyword
        #[arg(short = 'p', long, default_value_t = 1)]
        max_pages: u32,

        /// Page fetches in flight at once
        #[arg(long, default_value_t = 1)]
        concurrency: u32,

        /// Delay between requests in milliseconds
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        delay_ms: i64,

        /// Credential binding id
        #[arg(long)]
        credential: Option<String>,

        /// Proxy URL, e.g. socks5://127.0.0.1:9050
        #[arg(long)]
        proxy: Option<String>,

        /// Show the browser window
        #[arg(long)]
        headed: bool,

        /// Earliest start time (RFC 3339), picked up by `run --due`
        #[arg(long)]
        schedule_at: Option<String>,
    },

    /// List tasks
    List {
        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[arg(short, long)]
        target: Option<String>,

        /// Name substring
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one task in detail
    Show {
        #[arg(required = true)]
        id: TaskId,

        #[arg(long)]
        json: bool,
    },

    /// Page through a task's results
    Results {
        #[arg(required = true)]
        id: TaskId,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        per_page: u32,
    },

    /// Export a task's results
    Export {
        #[arg(required = true)]
        id: TaskId,

        /// Export format (json, jsonl, csv)
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete tasks and their results
    Delete {
        #[arg(required = true)]
        ids: Vec<TaskId>,
    },

    /// Start tasks and supervise them in the foreground
    Run {
        /// Tasks to start
        ids: Vec<TaskId>,

        /// Also start pending tasks whose schedule has come
        #[arg(long)]
        due: bool,

        /// Keep the console open after every task settled
        #[arg(long)]
        stay: bool,
    },

    /// Kill a worker process by pid
    Kill {
        #[arg(long, required = true)]
        pid: u32,
    },

    /// Show whether a worker process is alive and which task owns it
    PidStatus {
        #[arg(long, required = true)]
        pid: u32,
    },

    /// Reconcile tasks left behind by a previous supervisor
    Recover,

    /// List configured targets
    Targets,

    /// Show or initialise the configuration
    Config {
        /// Print the configuration file path only
        #[arg(long)]
        path: bool,

        /// Write the default configuration to the file
        #[arg(long)]
        init: bool,
    },

    /// Worker process entry point
    #[command(hide = true)]
    Worker,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    let verbose = cli.verbose;

    match cli.command {
        Commands::Create {
            name,
            target,
            keywords,
            location,
            max_pages,
            concurrency,
            delay_ms,
            credential,
            proxy,
            headed,
            schedule_at,
        } => {
            info!("Creating task '{}' on target {}", name, target);
            let request = commands::CreateRequest {
                name,
                target,
                keywords,
                location,
                max_pages,
                concurrency,
                delay_ms,
                credential,
                proxy,
                headed,
                schedule_at,
            };
            commands::create(config_path, request).await
        }
        Commands::List {
            status,
            target,
            name,
            limit,
            offset,
            json,
        } => commands::list(config_path, status, target, name, limit, offset, json).await,
        Commands::Show { id, json } => commands::show(config_path, id, json).await,
        Commands::Results { id, page, per_page } => commands::results(config_path, id, page, per_page).await,
        Commands::Export { id, format, output } => {
            info!("Exporting task {} as {}", id, format);
            commands::export(config_path, id, format, output).await
        }
        Commands::Delete { ids } => commands::delete(config_path, ids).await,
        Commands::Run { ids, due, stay } => {
            info!("Supervising tasks {:?}", ids);
            commands::run(config_path, verbose, ids, due, stay).await
        }
        Commands::Kill { pid } => commands::kill(config_path, pid).await,
        Commands::PidStatus { pid } => commands::pid_status(config_path, pid).await,
        Commands::Recover => commands::recover(config_path).await,
        Commands::Targets => commands::targets(config_path).await,
        Commands::Config { path, init } => commands::show_config(config_path, path, init).await,
        Commands::Worker => commands::worker().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_create_arguments() {
        let cli = Cli::try_parse_from([
            "scrapectl",
            "create",
            "rust jobs",
            "--target",
            "example-jobs",
            "-k",
            "rust",
            "-k",
            "tokio",
            "--max-pages",
            "3",
            "--delay-ms",
            "-5",
        ])
        .unwrap();

        match cli.command {
            Commands::Create {
                keywords,
                max_pages,
                delay_ms,
                ..
            } => {
                assert_eq!(keywords, vec!["rust", "tokio"]);
                assert_eq!(max_pages, 3);
                assert_eq!(delay_ms, -5);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["scrapectl", "list", "--status", "in-progress", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::List {
                status: Some(TaskStatus::InProgress),
                ..
            }
        ));
    }

    #[test]
    fn test_worker_is_hidden() {
        let help = Cli::command().render_help().to_string();
        assert!(!help.contains("Worker process entry point"));
        assert!(Cli::try_parse_from(["scrapectl", "worker"]).is_ok());
    }
}
