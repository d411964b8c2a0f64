#![allow(dead_code)]

use proctrack_protocol::{Method, ProcessObservation, Request, Response, PROTOCOL_VERSION};
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

pub struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn spawn_daemon(home: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_proctrack-daemon"))
        .env("HOME", home)
        .env_remove("PROCTRACK_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn proctrack-daemon");
    DaemonGuard { child }
}

pub fn write_config(home: &Path, contents: &str) {
    let dir = home.join(".proctrack").join("daemon");
    fs::create_dir_all(&dir).expect("create config dir");
    fs::write(dir.join("config.toml"), contents).expect("write config");
}

pub fn socket_path(home: &Path) -> PathBuf {
    home.join(".proctrack").join("daemon.sock")
}

pub fn db_path(home: &Path) -> PathBuf {
    home.join(".proctrack").join("daemon").join("tracker.db")
}

pub fn can_bind_socket(home: &Path) -> bool {
    let probe_path = home.join("probe.sock");
    match UnixListener::bind(&probe_path) {
        Ok(listener) => {
            drop(listener);
            let _ = fs::remove_file(&probe_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

pub fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

pub fn request(method: Method, id: &str, params: Option<Value>) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(id.to_string()),
        params,
    }
}

pub fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("failed to serialize request");
    stream.write_all(b"\n").expect("failed to write request");
    stream.flush().expect("failed to flush request");
    read_response(&mut stream)
}

pub fn send_raw_request(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    stream
        .write_all(payload)
        .expect("failed to write raw payload");
    stream.flush().expect("failed to flush raw payload");
    read_response(&mut stream)
}

pub fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("failed to parse response JSON")
}

pub fn observation(pid: u32, start_time: i64) -> ProcessObservation {
    ProcessObservation {
        pid,
        name: "node".to_string(),
        path: "/usr/local/bin/node".to_string(),
        start_time,
    }
}

pub fn ingest(socket: &Path, processes: &[ProcessObservation]) -> Response {
    send_request(
        socket,
        request(
            Method::Ingest,
            "ingest",
            Some(serde_json::json!({ "processes": processes })),
        ),
    )
}

/// Status text of the row for `pid`, if `get_recent` returns it.
pub fn status_of(socket: &Path, pid: u32) -> Option<String> {
    let response = send_request(
        socket,
        request(
            Method::GetRecent,
            "recent",
            Some(serde_json::json!({ "limit": 100 })),
        ),
    );
    if !response.ok {
        return None;
    }
    let processes = response.data?.get("processes")?.as_array()?.clone();
    processes
        .into_iter()
        .find(|row| row.get("pid").and_then(|value| value.as_u64()) == Some(pid as u64))?
        .get("status")?
        .as_str()
        .map(str::to_string)
}

pub fn wait_for_status(socket: &Path, pid: u32, expected: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if status_of(socket, pid).as_deref() == Some(expected) {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    false
}
