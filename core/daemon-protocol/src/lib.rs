//! IPC protocol types and validation for proctrack-daemon.
//!
//! This crate is shared by the daemon and the collector agent so both sides
//! agree on the snapshot schema. The daemon remains the authority on
//! validation: malformed observations are rejected here, before they can
//! reach the reconciler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_RECENT_LIMIT: usize = 10;
pub const MAX_RECENT_LIMIT: usize = 1000;
pub const MAX_NAME_LEN: usize = 1024;
pub const MAX_PATH_LEN: usize = 4096;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Ingest,
    GetRecent,
    GetSnapshots,
    GetProcess,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Identity of one process instance.
///
/// PIDs are recycled by the OS, so the start time is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: i64,
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time)
    }
}

/// One process reported alive by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessObservation {
    pub pid: u32,
    pub name: String,
    pub path: String,
    /// Process start time, epoch seconds.
    pub start_time: i64,
}

impl ProcessObservation {
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            start_time: self.start_time,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.pid == 0 {
            return Err(ErrorInfo::new("invalid_pid", "pid must be non-zero"));
        }
        require_text(&self.name, "name", MAX_NAME_LEN)?;
        require_text(&self.path, "path", MAX_PATH_LEN)?;
        if self.start_time < 0 {
            return Err(ErrorInfo::new(
                "invalid_start_time",
                "start_time must be epoch seconds",
            ));
        }
        Ok(())
    }
}

/// The set of processes an agent saw alive at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub processes: Vec<ProcessObservation>,
}

impl Snapshot {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        for (index, process) in self.processes.iter().enumerate() {
            process.validate().map_err(|err| ErrorInfo {
                code: err.code,
                message: format!("processes[{}]: {}", index, err.message),
            })?;
        }
        Ok(())
    }
}

pub fn parse_snapshot(params: Value) -> Result<Snapshot, ErrorInfo> {
    let snapshot: Snapshot = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("snapshot payload is invalid: {}", err),
        )
    })?;
    snapshot.validate()?;
    Ok(snapshot)
}

/// Reads the optional `limit` parameter used by the listing methods.
pub fn parse_limit(params: Option<Value>) -> Result<usize, ErrorInfo> {
    let params = match params {
        Some(params) => params,
        None => return Ok(DEFAULT_RECENT_LIMIT),
    };

    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }

    match params.get("limit") {
        None | Some(Value::Null) => Ok(DEFAULT_RECENT_LIMIT),
        Some(value) => value
            .as_u64()
            .map(|limit| (limit as usize).min(MAX_RECENT_LIMIT))
            .ok_or_else(|| {
                ErrorInfo::new("invalid_params", "limit must be a non-negative integer")
            }),
    }
}

/// Reads the `{pid, start_time}` parameters of a single-process lookup.
pub fn parse_identity(params: Option<Value>) -> Result<ProcessIdentity, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("missing_field", "pid is required"))?;
    let identity: ProcessIdentity = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new("invalid_params", format!("identity is invalid: {}", err))
    })?;
    if identity.pid == 0 {
        return Err(ErrorInfo::new("invalid_pid", "pid must be non-zero"));
    }
    if identity.start_time < 0 {
        return Err(ErrorInfo::new(
            "invalid_start_time",
            "start_time must be non-negative",
        ));
    }
    Ok(identity)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Active,
    Ended,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Active => "ACTIVE",
            ProcessStatus::Ended => "ENDED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(ProcessStatus::Active),
            "ENDED" => Some(ProcessStatus::Ended),
            _ => None,
        }
    }
}

/// A persisted process row as returned by `get_recent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub path: String,
    pub start_time: i64,
    pub last_seen: i64,
    pub status: ProcessStatus,
}

impl ProcessRecord {
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            start_time: self.start_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAck {
    pub status: String,
    pub observed: usize,
    pub timed_out: usize,
    pub absent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentProcesses {
    pub processes: Vec<ProcessRecord>,
    pub total: u64,
}

fn require_text(value: &str, field: &str, max_len: usize) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > max_len {
        return Err(ErrorInfo::new(
            "field_too_long",
            format!("{} must be {} bytes or fewer", field, max_len),
        ));
    }
    Ok(())
}
