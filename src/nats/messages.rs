use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::engine::StatusReport;
use crate::events::FileReady;
use crate::session::SessionSnapshot;

/// File-ready message published on `recorder.file.ready`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReadyMessage {
    pub device_id: String,
    pub path: String,
    pub recovered: bool,
    pub duration_ms: u64,
    pub bytes: u64,
    pub timestamp: String, // RFC3339 timestamp
}

impl FileReadyMessage {
    pub fn new(device_id: &str, file: &FileReady) -> Self {
        Self {
            device_id: device_id.to_string(),
            path: file.path.display().to_string(),
            recovered: file.recovered,
            duration_ms: file.duration_ms,
            bytes: file.bytes,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// State message published on `recorder.state.changed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedMessage {
    pub device_id: String,
    pub state: String,
    pub recording: bool,
    pub paused: bool,
    pub chunk_counter: u32,
    pub current_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub snapshot: String, // Base64-encoded 16-byte snapshot record
    pub timestamp: String,
}

impl StateChangedMessage {
    pub fn new(device_id: &str, status: &StatusReport, snapshot: &SessionSnapshot) -> Self {
        Self {
            device_id: device_id.to_string(),
            state: status.state.as_str().to_string(),
            recording: snapshot.recording,
            paused: snapshot.paused,
            chunk_counter: snapshot.chunk_counter,
            current_bytes: snapshot.current_bytes,
            error: status.last_error.clone(),
            snapshot: base64::engine::general_purpose::STANDARD.encode(snapshot.to_bytes()),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Decode the embedded snapshot record
    pub fn decode_snapshot(&self) -> Result<SessionSnapshot> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.snapshot)
            .context("Snapshot is not valid base64")?;
        SessionSnapshot::from_bytes(&bytes).context("Snapshot record is malformed")
    }
}

/// Receipt confirmation received on `recorder.file.ack`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAckMessage {
    pub device_id: String,
    pub path: String,
}
