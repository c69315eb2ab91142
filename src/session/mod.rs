//! Crash-safe session bookkeeping
//!
//! This module provides the on-disk facts the engine and supervisor share:
//! - Watchdog lock (exists while a session is recording)
//! - 16-byte state snapshot readable by other processes
//! - Naming of temporary and finalized chunk files
//! - Ledger of chunks handed over under their temporary name

mod layout;
mod lock;
mod queue;
mod snapshot;

pub use layout::{
    is_temp_chunk, temp_chunk_started_at, unique_path, StorageLayout, CHUNK_EXTENSION, TEMP_SUFFIX,
};
pub use lock::{LockStore, SessionLock};
pub use queue::QueuedChunks;
pub use snapshot::{read_snapshot, SessionSnapshot, SnapshotStore, SNAPSHOT_LEN, SNAPSHOT_MARKER};

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Lock, snapshot, queue ledger and layout for one recordings directory
pub struct SessionStore {
    layout: StorageLayout,
    lock: LockStore,
    snapshot: SnapshotStore,
    queued: QueuedChunks,
}

impl SessionStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let layout = StorageLayout::new(root.as_ref());
        Self {
            lock: LockStore::new(layout.lock_path()),
            snapshot: SnapshotStore::new(layout.snapshot_path()),
            queued: QueuedChunks::new(layout.queued_path()),
            layout,
        }
    }

    /// Create the recordings directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(root);
        store.layout.ensure_root()?;
        Ok(store)
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn lock(&self) -> &LockStore {
        &self.lock
    }

    pub fn snapshot(&self) -> &SnapshotStore {
        &self.snapshot
    }

    pub fn queued(&self) -> &QueuedChunks {
        &self.queued
    }

    /// Temp chunks nobody has handed over yet
    pub fn orphan_chunks(&self) -> Result<Vec<PathBuf>> {
        if let Err(e) = self.queued.prune() {
            warn!("Failed to prune queued chunk ledger: {:#}", e);
        }
        Ok(self
            .layout
            .temp_chunks()?
            .into_iter()
            .filter(|path| !self.queued.contains(path))
            .collect())
    }
}
