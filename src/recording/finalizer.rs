use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::audio::adts;
use crate::engine::{SessionOutcome, StatePublisher};
use crate::events::{FileReady, RecorderEvent};
use crate::session::temp_chunk_started_at;

/// Recordings shorter than this are deleted instead of finalized
pub const DISCARD_THRESHOLD: Duration = Duration::from_secs(2);

/// What happened to a closed chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeResult {
    /// Too short; temp file deleted, no event
    Discarded,
    /// Renamed to its final name
    Finalized(FileReady),
    /// Could not be renamed; handed over under its temporary name
    QueuedAsIs(FileReady),
    /// Nothing to hand over: the temp file is gone or was already queued
    Missing,
}

impl FinalizeResult {
    pub fn file(&self) -> Option<&FileReady> {
        match self {
            FinalizeResult::Finalized(file) | FinalizeResult::QueuedAsIs(file) => Some(file),
            _ => None,
        }
    }
}

/// Filesystem calls used to move a closed chunk into place
pub trait ChunkFs: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    /// Copy and force the copy to stable storage
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to)?;
        File::open(to)?.sync_all()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// The local filesystem
pub struct LocalFs;

impl ChunkFs for LocalFs {}

/// Renames closed chunks and hands them to the transfer collaborator
pub struct Finalizer {
    publisher: Arc<StatePublisher>,
    fs: Arc<dyn ChunkFs>,
}

impl Finalizer {
    pub fn new(publisher: Arc<StatePublisher>) -> Self {
        Self::with_fs(publisher, Arc::new(LocalFs))
    }

    pub fn with_fs(publisher: Arc<StatePublisher>, fs: Arc<dyn ChunkFs>) -> Self {
        Self { publisher, fs }
    }

    /// Finalize the chunk of a session that ended
    pub fn finalize(&self, outcome: &SessionOutcome) -> Result<FinalizeResult> {
        self.finalize_file(&outcome.path, outcome.started_at, outcome.duration)
    }

    /// Finalize a temp file with a known start time and duration
    pub fn finalize_file(
        &self,
        temp_path: &Path,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Result<FinalizeResult> {
        if self.already_handed_over(temp_path) {
            return Ok(FinalizeResult::Missing);
        }

        if duration < DISCARD_THRESHOLD {
            info!(
                "Discarding {} ({:?} < {:?})",
                temp_path.display(),
                duration,
                DISCARD_THRESHOLD
            );
            fs::remove_file(temp_path)
                .with_context(|| format!("Failed to delete {}", temp_path.display()))?;
            return Ok(FinalizeResult::Discarded);
        }

        let target = self
            .publisher
            .store()
            .layout()
            .finalized_path(started_at, duration);
        Ok(self.hand_over(temp_path, &target, duration, false))
    }

    /// Salvage a chunk left behind by a crash.
    ///
    /// Duration comes from the chunk's own frames; the file is never dropped.
    pub fn recover(&self, temp_path: &Path) -> Result<FinalizeResult> {
        if self.already_handed_over(temp_path) {
            return Ok(FinalizeResult::Missing);
        }

        let summary = adts::scan_file(temp_path)?;
        if summary.truncated {
            warn!(
                "Recovered chunk {} has a truncated tail ({} of {} bytes valid)",
                temp_path.display(),
                summary.valid_bytes,
                summary.file_bytes
            );
        }

        let started_at = temp_chunk_started_at(temp_path)
            .or_else(|| modified_at(temp_path))
            .unwrap_or_else(Utc::now);
        let duration = summary.duration();
        let target = self
            .publisher
            .store()
            .layout()
            .recovered_path(started_at, duration);

        info!(
            "Recovering {} ({} frames, {:?})",
            temp_path.display(),
            summary.frames,
            duration
        );
        Ok(self.hand_over(temp_path, &target, duration, true))
    }

    fn already_handed_over(&self, temp_path: &Path) -> bool {
        if !temp_path.exists() {
            info!("Chunk {} already finalized", temp_path.display());
            return true;
        }
        if self.publisher.store().queued().contains(temp_path) {
            info!("Chunk {} already queued for transfer", temp_path.display());
            return true;
        }
        false
    }

    fn hand_over(
        &self,
        temp_path: &Path,
        target: &Path,
        duration: Duration,
        recovered: bool,
    ) -> FinalizeResult {
        let result = match move_file(self.fs.as_ref(), temp_path, target) {
            Ok(()) => {
                let file = self.file_ready(target.to_path_buf(), duration, recovered);
                self.publisher.status().increment_chunk_counter();
                info!(
                    "Chunk finalized: {} ({} bytes, {:?})",
                    target.display(),
                    file.bytes,
                    duration
                );
                FinalizeResult::Finalized(file)
            }
            Err(e) => {
                warn!(
                    "Could not move {} to {}: {}; queueing as-is",
                    temp_path.display(),
                    target.display(),
                    e
                );
                // Keeps later orphan sweeps from announcing it again
                if let Err(e) = self.publisher.store().queued().add(temp_path) {
                    warn!("Failed to record queued chunk: {:#}", e);
                }
                FinalizeResult::QueuedAsIs(self.file_ready(
                    temp_path.to_path_buf(),
                    duration,
                    recovered,
                ))
            }
        };

        if let Some(file) = result.file() {
            self.publisher
                .events()
                .emit(RecorderEvent::FileReady(file.clone()));
        }
        self.publisher.publish();
        result
    }

    fn file_ready(&self, path: PathBuf, duration: Duration, recovered: bool) -> FileReady {
        let bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        FileReady {
            path,
            recovered,
            duration_ms: duration.as_millis() as u64,
            bytes,
        }
    }
}

/// Atomic rename, falling back to copy + delete across filesystems
fn move_file(fs: &dyn ChunkFs, from: &Path, to: &Path) -> io::Result<()> {
    match fs.rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            warn!("Rename failed ({}); trying copy + delete", rename_err);
            // Keep a single copy so the file is not handed over twice
            let copied = fs.copy(from, to).and_then(|()| fs.remove(from));
            if let Err(e) = copied {
                if to.exists() {
                    let _ = fs.remove(to);
                }
                return Err(e);
            }
            Ok(())
        }
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified: SystemTime = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
