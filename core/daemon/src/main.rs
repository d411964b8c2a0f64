//! proctrack daemon entrypoint.
//!
//! A small, single-writer service that owns the process liveness table.
//! Collectors send snapshots over a Unix socket; each snapshot is reconciled
//! into the SQLite store, and a watchdog thread expires processes whose
//! collector went quiet.

use chrono::Utc;
use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use proctrack_protocol::{
    parse_identity, parse_limit, parse_snapshot, ErrorInfo, IngestAck, Method, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod config;
mod db;
mod error;
mod reconcile;
mod state;

use config::DaemonConfig;
use db::Db;
use error::ReconcileError;
use reconcile::Reconciler;
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            DaemonConfig::default()
        }
    };

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let reconciler = Reconciler::new(db, config.reconcile.timeout_secs, config.retry.clone());
    let shared_state = Arc::new(SharedState::new(reconciler));
    info!(
        timeout_secs = config.reconcile.timeout_secs,
        watchdog_enabled = config.watchdog.enabled,
        watchdog_interval_secs = config.watchdog.interval_secs,
        "Daemon config loaded"
    );

    let now = Utc::now().timestamp();
    if let Err(err) = shared_state.run_watchdog(now) {
        warn!(error = %err, "Startup timeout sweep failed");
    }
    match shared_state.prune_history(now, config.history.snapshot_retention_hours) {
        Ok(removed) if removed > 0 => info!(removed, "Pruned snapshot log"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "Failed to prune snapshot log"),
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "proctrack daemon started");

    if config.watchdog.enabled {
        spawn_watchdog(Arc::clone(&shared_state), config.watchdog.interval());
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_watchdog(state: Arc<SharedState>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if let Err(err) = state.run_watchdog(Utc::now().timestamp()) {
            warn!(error = %err, "Periodic timeout sweep failed");
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("PROCTRACK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".proctrack").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".proctrack").join("daemon").join("tracker.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            let trailing = &buffer[index + 1..];
            if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "timeout_secs": state.timeout_secs(),
            });
            if let Ok(active) = state.active_count() {
                data["active"] = serde_json::json!(active);
            }
            if let Ok(value) = serde_json::to_value(state.stats_snapshot()) {
                data["stats"] = value;
            }
            Response::ok(request.id, data)
        }
        Method::Ingest => handle_ingest(request, state),
        Method::GetRecent => {
            let limit = match parse_limit(request.params) {
                Ok(limit) => limit,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.recent(limit) {
                Ok(recent) => {
                    tracing::debug!(
                        rows = recent.processes.len(),
                        total = recent.total,
                        "Recent processes snapshot"
                    );
                    to_response(request.id, &recent, "recent processes")
                }
                Err(err) => Response::error(
                    request.id,
                    "store_error",
                    format!("Failed to fetch recent processes: {}", err),
                ),
            }
        }
        Method::GetProcess => {
            let identity = match parse_identity(request.params) {
                Ok(identity) => identity,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.process(identity) {
                Ok(record) => to_response(request.id, &record, "process record"),
                Err(err) => Response::error(
                    request.id,
                    "store_error",
                    format!("Failed to fetch process {}: {}", identity, err),
                ),
            }
        }
        Method::GetSnapshots => {
            let limit = match parse_limit(request.params) {
                Ok(limit) => limit,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.snapshots(limit) {
                Ok(entries) => to_response(request.id, &entries, "snapshot log"),
                Err(err) => Response::error(
                    request.id,
                    "store_error",
                    format!("Failed to fetch snapshot log: {}", err),
                ),
            }
        }
    }
}

fn handle_ingest(request: Request, state: &SharedState) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => {
            return Response::error(request.id, "invalid_params", "snapshot payload is required")
        }
    };

    let snapshot = match parse_snapshot(params) {
        Ok(snapshot) => snapshot,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    match state.ingest(&snapshot, Utc::now().timestamp()) {
        Ok(outcome) => {
            let ack = IngestAck {
                status: "reconciled".to_string(),
                observed: outcome.observed,
                timed_out: outcome.timed_out,
                absent: outcome.absent,
            };
            to_response(request.id, &ack, "ingest acknowledgment")
        }
        Err(err) => {
            warn!(error = %err, processes = snapshot.processes.len(), "Reconcile failed");
            let code = match err {
                ReconcileError::RetriesExhausted { .. } => "store_busy",
                ReconcileError::Store(_) => "store_error",
            };
            Response::error(request.id, code, format!("Failed to reconcile snapshot: {}", err))
        }
    }
}

fn to_response<T: serde::Serialize>(id: Option<String>, value: &T, label: &str) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize {}: {}", label, err),
        ),
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
