//! Events emitted by the recording core
//!
//! Downstream collaborators (transfer queue, UI, paired-device sync) consume
//! two kinds of events: a chunk became ready, and the recorder state changed.
//! Emission never blocks the capture loop.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::StatusReport;
use crate::session::SessionSnapshot;

/// A finished chunk handed to the transfer collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReady {
    /// Finalized (or queued as-is) path
    pub path: PathBuf,
    /// True for files salvaged after a crash
    pub recovered: bool,
    pub duration_ms: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecorderEvent {
    StateChanged {
        status: StatusReport,
        snapshot: SessionSnapshot,
    },
    FileReady(FileReady),
}

/// Receives recorder events
///
/// Implementations:
/// - BroadcastSink: in-process subscribers
/// - FanoutSink: several sinks at once
/// - NatsEventSink: publishes to NATS
pub trait EventSink: Send + Sync {
    /// Must not block
    fn emit(&self, event: RecorderEvent);
}

/// Sink that drops everything
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: RecorderEvent) {}
}

/// In-process fan-out over a tokio broadcast channel
pub struct BroadcastSink {
    tx: broadcast::Sender<RecorderEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: RecorderEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            debug!("Recorder event dropped: no subscribers");
        }
    }
}

/// Forwards every event to each inner sink
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: RecorderEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
