//! Logging setup for the agent.
//!
//! Writes human-readable events to stderr and a daily-rolling file under
//! `~/.proctrack/logs`. `PROCTRACK_DEBUG_LOG=1` forces debug level; otherwise
//! `RUST_LOG` applies, defaulting to `info`.

use fs_err as fs;
use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "agent.log";

/// Installs the global subscriber. The returned guard flushes the file
/// writer on drop and must be held for the life of the process.
pub fn init() -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    match log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            let installed = tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}

fn env_filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn debug_enabled() -> bool {
    env::var("PROCTRACK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn log_dir() -> Option<PathBuf> {
    let dir = dirs::home_dir()?.join(".proctrack").join("logs");
    fs::create_dir_all(&dir).ok()?;
    Some(dir)
}
