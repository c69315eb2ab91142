use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Record size on disk
pub const SNAPSHOT_LEN: usize = 16;

/// Leading marker identifying a snapshot record
pub const SNAPSHOT_MARKER: [u8; 2] = *b"LR";

/// Cross-process mirror of the engine state.
///
/// Layout (little-endian):
///
/// | offset | size | field         |
/// |--------|------|---------------|
/// | 0      | 2    | marker `LR`   |
/// | 2      | 1    | recording     |
/// | 3      | 1    | paused        |
/// | 4      | 4    | chunk counter |
/// | 8      | 8    | current size  |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub recording: bool,
    pub paused: bool,
    pub chunk_counter: u32,
    pub current_bytes: u64,
}

impl SessionSnapshot {
    /// Idle record that keeps the chunk counter
    pub fn idle(chunk_counter: u32) -> Self {
        Self {
            chunk_counter,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; SNAPSHOT_LEN] {
        let mut out = [0u8; SNAPSHOT_LEN];
        out[0..2].copy_from_slice(&SNAPSHOT_MARKER);
        out[2] = u8::from(self.recording);
        out[3] = u8::from(self.paused);
        out[4..8].copy_from_slice(&self.chunk_counter.to_le_bytes());
        out[8..16].copy_from_slice(&self.current_bytes.to_le_bytes());
        out
    }

    /// Decode a record; `None` for wrong length, marker or flag bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SNAPSHOT_LEN || bytes[0..2] != SNAPSHOT_MARKER {
            return None;
        }
        let flag = |b: u8| match b {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        };

        Some(Self {
            recording: flag(bytes[2])?,
            paused: flag(bytes[3])?,
            chunk_counter: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            current_bytes: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
        })
    }
}

/// Read a snapshot file without any engine running.
///
/// Missing, short, legacy or corrupt files read as idle.
pub fn read_snapshot(path: impl AsRef<Path>) -> SessionSnapshot {
    let path = path.as_ref();
    match fs::read(path) {
        Ok(bytes) => SessionSnapshot::from_bytes(&bytes).unwrap_or_else(|| {
            warn!(
                "Ignoring malformed state snapshot {} ({} bytes)",
                path.display(),
                bytes.len()
            );
            SessionSnapshot::default()
        }),
        Err(_) => SessionSnapshot::default(),
    }
}

/// Writes the snapshot with temp-file + fsync + atomic rename
pub struct SnapshotStore {
    path: PathBuf,
    /// Serializes writers sharing the temp path
    write_guard: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> SessionSnapshot {
        read_snapshot(&self.path)
    }

    pub fn write(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let _guard = match self.write_guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            file.write_all(&snapshot.to_bytes())
                .context("Failed to write state snapshot")?;
            file.sync_all().context("Failed to sync state snapshot")?;
        }
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "Failed to move {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        sync_parent(&self.path);

        debug!(
            "State snapshot written: recording={} paused={} chunks={} bytes={}",
            snapshot.recording, snapshot.paused, snapshot.chunk_counter, snapshot.current_bytes
        );
        Ok(())
    }
}

/// Make a rename durable by syncing the directory entry (best effort)
pub(crate) fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
