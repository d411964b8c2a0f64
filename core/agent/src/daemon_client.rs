//! Client helper for sending snapshots to the proctrack daemon.
//!
//! The daemon is the only writer. Failures are surfaced to the caller; the
//! collector loop decides whether to keep going.

use proctrack_protocol::{
    IngestAck, Method, ProcessObservation, Request, Response, Snapshot, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SOCKET_ENV: &str = "PROCTRACK_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 2_000;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for daemon response")]
    Timeout,

    #[error("Response exceeded maximum size")]
    ResponseTooLarge,

    #[error("Daemon response was empty")]
    EmptyResponse,

    #[error("Invalid daemon JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

pub fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ClientError::HomeNotFound)?;
    Ok(home.join(".proctrack").join(SOCKET_NAME))
}

/// Sends one snapshot, retrying once after a short delay.
pub fn send_snapshot(
    socket: &Path,
    processes: &[ProcessObservation],
) -> Result<IngestAck, ClientError> {
    let snapshot = Snapshot {
        processes: processes.to_vec(),
    };
    let params = serde_json::to_value(&snapshot)?;
    let build = || Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Ingest,
        id: Some(make_request_id()),
        params: Some(params.clone()),
    };

    let data = match call(socket, build()) {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to send snapshot to daemon");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            call(socket, build()).map_err(|retry_err| {
                tracing::warn!(error = %retry_err, "Retry failed sending snapshot to daemon");
                retry_err
            })?
        }
    };

    Ok(serde_json::from_value(data)?)
}

pub fn daemon_health(socket: &Path) -> Result<Value, ClientError> {
    call(
        socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetHealth,
            id: Some("health-check".to_string()),
            params: None,
        },
    )
}

fn call(socket: &Path, request: Request) -> Result<Value, ClientError> {
    let response = send_request(socket, &request)?;
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        let (code, message) = response
            .error
            .map(|err| (err.code, err.message))
            .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
        Err(ClientError::Daemon { code, message })
    }
}

fn send_request(socket: &Path, request: &Request) -> Result<Response, ClientError> {
    let mut stream = UnixStream::connect(socket).map_err(|source| ClientError::Connect {
        path: socket.to_path_buf(),
        source,
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)?;
    stream.write_all(b"\n")?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::ResponseTooLarge);
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
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::EmptyResponse);
    }

    Ok(serde_json::from_slice(response_bytes)?)
}

fn make_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    let rand = rand::thread_rng().next_u64();
    format!("snap-{}-{}-{:x}", millis, std::process::id(), rand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn read_request(stream: &mut UnixStream) -> Request {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let end = buffer
            .iter()
            .position(|b| *b == b'\n')
            .unwrap_or(buffer.len());
        serde_json::from_slice(&buffer[..end]).expect("request json")
    }

    fn reply(stream: &mut UnixStream, response: &Response) {
        serde_json::to_writer(&mut *stream, response).expect("write response");
        stream.write_all(b"\n").expect("newline");
    }

    fn observation() -> ProcessObservation {
        ProcessObservation {
            pid: 100,
            name: "cargo".to_string(),
            path: "/usr/bin/cargo".to_string(),
            start_time: 5000,
        }
    }

    fn ack() -> Value {
        serde_json::json!({
            "status": "reconciled",
            "observed": 1,
            "timed_out": 0,
            "absent": 0
        })
    }

    #[test]
    fn send_snapshot_returns_ack() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);
            assert!(matches!(request.method, Method::Ingest));
            let snapshot: Snapshot =
                serde_json::from_value(request.params.expect("params")).expect("snapshot");
            assert_eq!(snapshot.processes.len(), 1);
            reply(&mut stream, &Response::ok(request.id, ack()));
        });

        let ack = send_snapshot(&socket, &[observation()]).expect("send snapshot");
        assert_eq!(ack.status, "reconciled");
        assert_eq!(ack.observed, 1);
        server.join().expect("server");
    }

    #[test]
    fn send_snapshot_retries_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let attempts = Arc::new(AtomicUsize::new(0));
        let server_attempts = Arc::clone(&attempts);

        let server = thread::spawn(move || {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().expect("accept");
                let request = read_request(&mut stream);
                let attempt = server_attempts.fetch_add(1, Ordering::SeqCst);
                let response = if attempt == 0 {
                    Response::error(request.id, "store_busy", "busy")
                } else {
                    Response::ok(request.id, ack())
                };
                reply(&mut stream, &response);
            }
        });

        let ack = send_snapshot(&socket, &[observation()]).expect("send snapshot");
        assert_eq!(ack.status, "reconciled");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        server.join().expect("server");
    }

    #[test]
    fn daemon_errors_are_surfaced() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");

        let server = thread::spawn(move || {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().expect("accept");
                let request = read_request(&mut stream);
                reply(
                    &mut stream,
                    &Response::error(request.id, "invalid_pid", "pid must be non-zero"),
                );
            }
        });

        let err = send_snapshot(&socket, &[observation()]).unwrap_err();
        match err {
            ClientError::Daemon { code, .. } => assert_eq!(code, "invalid_pid"),
            other => panic!("unexpected error: {other}"),
        }
        server.join().expect("server");
    }

    #[test]
    fn missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("absent.sock");
        let err = daemon_health(&socket).unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(make_request_id(), make_request_id());
    }
}
