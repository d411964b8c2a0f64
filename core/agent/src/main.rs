//! proctrack-agent: reports running development tools to the proctrack daemon.
//!
//! ## Subcommands
//!
//! - `collect`: scan local processes and send snapshots on an interval
//! - `health`: print the daemon's health report

mod collect;
mod collector;
mod daemon_client;
mod logging;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "proctrack-agent")]
#[command(about = "Process liveness collector")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan processes and send snapshots to the daemon
    Collect {
        /// Send a single snapshot and exit
        #[arg(long)]
        once: bool,

        /// Seconds between snapshots
        #[arg(long, value_name = "SECS", default_value_t = collect::DEFAULT_INTERVAL_SECS)]
        interval: u64,

        /// Report every process, not just development tools
        #[arg(long, conflicts_with = "pattern")]
        all: bool,

        /// Extra executable-path regex to track (repeatable)
        #[arg(long, value_name = "REGEX")]
        pattern: Vec<String>,
    },

    /// Query daemon health
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Collect {
            once,
            interval,
            all,
            pattern,
        } => {
            let options = collect::CollectOptions {
                once,
                interval_secs: interval,
                all,
                patterns: pattern,
            };
            if let Err(e) = collect::run(options) {
                tracing::error!(error = %e, "proctrack-agent collect failed");
                std::process::exit(1);
            }
        }
        Commands::Health => {
            let report = daemon_client::socket_path()
                .and_then(|socket| daemon_client::daemon_health(&socket));
            match report {
                Ok(data) => match serde_json::to_string_pretty(&data) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to render health report");
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "proctrack daemon unreachable");
                    std::process::exit(1);
                }
            }
        }
    }
}
