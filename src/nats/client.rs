use anyhow::{Context, Result};
use async_nats::Client;
use futures::stream::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::messages::{FileAckMessage, FileReadyMessage, StateChangedMessage};
use crate::engine::StatusReport;
use crate::events::{EventSink, FileReady, RecorderEvent};
use crate::session::{is_temp_chunk, QueuedChunks, SessionSnapshot, SessionStore, CHUNK_EXTENSION};

pub const FILE_READY_SUBJECT: &str = "recorder.file.ready";
pub const STATE_CHANGED_SUBJECT: &str = "recorder.state.changed";
pub const FILE_ACK_SUBJECT: &str = "recorder.file.ack";

/// Events buffered between the engine and the publisher task
const SINK_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    device_id: String,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str, device_id: String) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client, device_id })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Publish a finished chunk for the transfer collaborator
    pub async fn publish_file_ready(&self, file: &FileReady) -> Result<()> {
        let message = FileReadyMessage::new(&self.device_id, file);
        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(FILE_READY_SUBJECT, payload.into())
            .await
            .context("Failed to publish file-ready")?;

        info!(
            "Published file-ready to {} ({}, recovered={})",
            FILE_READY_SUBJECT, message.path, message.recovered
        );
        Ok(())
    }

    /// Publish the current state together with its snapshot record
    pub async fn publish_state(
        &self,
        status: &StatusReport,
        snapshot: &SessionSnapshot,
    ) -> Result<()> {
        let message = StateChangedMessage::new(&self.device_id, status, snapshot);
        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(STATE_CHANGED_SUBJECT, payload.into())
            .await
            .context("Failed to publish state change")?;

        debug!(
            "Published state to {} (state={}, chunks={})",
            STATE_CHANGED_SUBJECT, message.state, message.chunk_counter
        );
        Ok(())
    }

    /// Delete handed-over chunks once the collaborator confirms receipt.
    ///
    /// Only finished or queued chunk files directly inside the recordings
    /// directory are touched.
    pub async fn spawn_ack_handler(&self, store: Arc<SessionStore>) -> Result<JoinHandle<()>> {
        let mut subscriber = self
            .client
            .subscribe(FILE_ACK_SUBJECT)
            .await
            .context("Failed to subscribe to file acks")?;

        info!("Subscribed to {}", FILE_ACK_SUBJECT);

        let device_id = self.device_id.clone();
        Ok(tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                match serde_json::from_slice::<FileAckMessage>(&msg.payload) {
                    Ok(ack) if ack.device_id == device_id => {
                        // Bare file names are relative to the recordings directory
                        let recordings = store.layout().root();
                        let path = recordings.join(&ack.path);
                        delete_acknowledged(recordings, store.queued(), &path);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to parse file ack: {}", e),
                }
            }
            info!("File ack subscription closed");
        }))
    }

    /// Event sink publishing from a background task
    pub fn into_sink(self) -> NatsEventSink {
        let (tx, mut rx) = mpsc::channel::<RecorderEvent>(SINK_CAPACITY);

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match &event {
                    RecorderEvent::FileReady(file) => self.publish_file_ready(file).await,
                    RecorderEvent::StateChanged { status, snapshot } => {
                        self.publish_state(status, snapshot).await
                    }
                };
                if let Err(e) = result {
                    error!("NATS publish failed: {:#}", e);
                }
            }
        });

        NatsEventSink { tx, _task: task }
    }
}

/// Forwards recorder events to NATS without blocking the caller
pub struct NatsEventSink {
    tx: mpsc::Sender<RecorderEvent>,
    _task: JoinHandle<()>,
}

impl EventSink for NatsEventSink {
    fn emit(&self, event: RecorderEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Dropping recorder event for NATS: {}", e);
        }
    }
}

fn delete_acknowledged(recordings: &Path, queued: &QueuedChunks, path: &Path) {
    let inside = path.parent().map(|p| p == recordings).unwrap_or(false);
    let finished = path.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXTENSION)
        && !is_temp_chunk(path);
    let was_queued = queued.contains(path);
    if !inside || !(finished || was_queued) {
        warn!("Ignoring ack for {}: not a handed-over chunk", path.display());
        return;
    }

    match std::fs::remove_file(path) {
        Ok(()) => info!("Deleted acknowledged chunk {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Acknowledged chunk {} already gone", path.display())
        }
        Err(e) => {
            warn!("Failed to delete {}: {}", path.display(), e);
            return;
        }
    }

    if was_queued {
        if let Err(e) = queued.remove(path) {
            warn!("Failed to update queued chunk ledger: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_only_delete_finished_chunks_in_recordings() {
        let dir = tempfile::tempdir().unwrap();
        let queued = QueuedChunks::new(dir.path().join("queued.list"));
        let finished = dir.path().join("20240101_000000_5s.aac");
        let temp = dir.path().join("capture_20240101_000000.aac.tmp");
        std::fs::write(&finished, b"x").unwrap();
        std::fs::write(&temp, b"x").unwrap();

        delete_acknowledged(dir.path(), &queued, &temp);
        delete_acknowledged(Path::new("/elsewhere"), &queued, &finished);
        assert!(temp.exists());
        assert!(finished.exists());

        delete_acknowledged(dir.path(), &queued, &dir.path().join("20240101_000000_5s.aac"));
        assert!(!finished.exists());
    }

    #[test]
    fn acks_delete_chunks_queued_under_temp_names() {
        let dir = tempfile::tempdir().unwrap();
        let queued = QueuedChunks::new(dir.path().join("queued.list"));
        let temp = dir.path().join("capture_20240101_000000.aac.tmp");
        std::fs::write(&temp, b"x").unwrap();
        queued.add(&temp).unwrap();

        delete_acknowledged(dir.path(), &queued, &temp);
        assert!(!temp.exists());
        assert!(!queued.contains(&temp));
    }
}
