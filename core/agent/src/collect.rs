//! The collect loop: scan, send, sleep.

use proctrack_protocol::IngestAck;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::collector::{ProcessFilter, ProcessScanner};
use crate::daemon_client::{self, ClientError};

pub const DEFAULT_INTERVAL_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("Invalid process pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

pub struct CollectOptions {
    pub once: bool,
    pub interval_secs: u64,
    pub all: bool,
    pub patterns: Vec<String>,
}

pub fn run(options: CollectOptions) -> Result<(), CollectError> {
    let filter = if options.all {
        ProcessFilter::All
    } else {
        ProcessFilter::with_patterns(&options.patterns)?
    };
    let socket = daemon_client::socket_path()?;
    let mut scanner = ProcessScanner::new(filter);

    if options.once {
        collect_once(&mut scanner, &socket)?;
        return Ok(());
    }

    let interval = Duration::from_secs(options.interval_secs.max(1));
    tracing::info!(
        socket = %socket.display(),
        interval_secs = interval.as_secs(),
        "Collector started"
    );
    loop {
        if let Err(err) = collect_once(&mut scanner, &socket) {
            tracing::warn!(error = %err, "Snapshot not delivered; will try again next cycle");
        }
        thread::sleep(interval);
    }
}

fn collect_once(scanner: &mut ProcessScanner, socket: &Path) -> Result<IngestAck, ClientError> {
    let observations = scanner.scan();
    tracing::debug!(processes = observations.len(), "Scanned processes");
    let ack = daemon_client::send_snapshot(socket, &observations)?;
    tracing::info!(
        observed = ack.observed,
        timed_out = ack.timed_out,
        absent = ack.absent,
        "Snapshot delivered"
    );
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctrack_protocol::{Request, Response, Snapshot};
    use regex::RegexSet;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixListener;

    #[test]
    fn collect_once_sends_filtered_snapshot() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("read line");
            let request: Request = serde_json::from_str(line.trim()).expect("request");
            let snapshot: Snapshot =
                serde_json::from_value(request.params.expect("params")).expect("snapshot");
            let ack = serde_json::json!({
                "status": "reconciled",
                "observed": snapshot.processes.len(),
                "timed_out": 0,
                "absent": 0
            });
            let mut stream = stream;
            serde_json::to_writer(&mut stream, &Response::ok(request.id, ack)).expect("write");
            stream.write_all(b"\n").expect("newline");
            snapshot.processes.len()
        });

        let filter = ProcessFilter::Patterns(
            RegexSet::new(["^/proctrack-test-nothing-matches/"]).expect("set"),
        );
        let mut scanner = ProcessScanner::new(filter);
        let ack = collect_once(&mut scanner, &socket).expect("collect");

        let sent = server.join().expect("server");
        assert_eq!(sent, 0);
        assert_eq!(ack.observed, 0);
    }

    #[test]
    fn invalid_pattern_fails_before_scanning() {
        let err = run(CollectOptions {
            once: true,
            interval_secs: DEFAULT_INTERVAL_SECS,
            all: false,
            patterns: vec!["[".to_string()],
        })
        .unwrap_err();
        assert!(matches!(err, CollectError::Pattern(_)));
    }
}
