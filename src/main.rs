use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use eventsense::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "eventsense")]
#[command(version, about = "Step-tracked attribution of why a ticker moved on a given day")]
pub struct Cli {
    /// Path to eventsense.toml. Defaults to ./eventsense.toml when present.
    #[arg(short, long, global = true, env = "EVENTSENSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging for eventsense modules
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the attribution HTTP API and run event socket
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Run database path (overrides server.db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Keep runs in memory only
        #[arg(long, conflicts_with = "db_path")]
        in_memory: bool,
    },
    /// Attribute one ticker/day in-process and print the outcome
    Run {
        /// Ticker symbol, e.g. AAPL
        ticker: String,

        /// Trading day in US/Eastern, YYYY-MM-DD
        day: String,

        /// Natural-language question guiding the judge
        #[arg(short, long)]
        query: Option<String>,

        /// Skip the second retrieval pass
        #[arg(long)]
        no_second_pass: bool,

        /// Use keyword retrieval only
        #[arg(long)]
        no_hybrid: bool,

        /// Follow one hop to related entities during the second pass
        #[arg(long)]
        related_entities: bool,

        /// Persist the run to this database so `show` can read it later
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Print status and result as JSON instead of progress output
        #[arg(long)]
        json: bool,

        /// Artificial provider latency in milliseconds
        #[arg(long, default_value = "0")]
        latency_ms: u64,
    },
    /// Show a persisted run
    Show {
        run_id: String,

        /// Run database path (defaults to server.db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Print the result payload instead of the status
        #[arg(long)]
        result: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default eventsense.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = "eventsense=debug,info".to_string();
    }
    eventsense::telemetry::init(&config.logging)?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            in_memory,
        } => {
            cmd::cmd_serve(
                &config,
                cmd::ServeArgs {
                    host,
                    port,
                    db_path,
                    in_memory,
                },
            )
            .await?;
        }
        Commands::Run {
            ticker,
            day,
            query,
            no_second_pass,
            no_hybrid,
            related_entities,
            db_path,
            json,
            latency_ms,
        } => {
            cmd::cmd_run(
                &config,
                cmd::RunArgs {
                    ticker,
                    day,
                    query,
                    second_pass: !no_second_pass,
                    hybrid_retrieval: !no_hybrid,
                    related_entities,
                    db_path,
                    json,
                    latency: std::time::Duration::from_millis(latency_ms),
                },
            )
            .await?;
        }
        Commands::Show {
            run_id,
            db_path,
            result,
        } => {
            let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
            cmd::cmd_show(&db_path, &run_id, result)?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&config, cli.config.as_deref(), command)?;
        }
    }

    Ok(())
}
