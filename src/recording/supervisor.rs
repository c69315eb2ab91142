// Supervising control loop
//
// Reconciles what the engine is actually doing with what the lock and the
// snapshot claim, salvages chunks left behind by a crash, finalizes finished
// sessions and splits chunks that reach the size limit.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use super::finalizer::{ChunkFs, FinalizeResult, Finalizer, LocalFs};
use crate::engine::{CaptureSettings, Engine, SessionState};
use crate::error::StartError;
use crate::events::FileReady;

/// Default monitoring cadence
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Settings the supervisor applies at the next session start
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSettings {
    pub capture: CaptureSettings,
    /// Split once the current chunk reaches this many bytes
    pub chunk_size_limit: u64,
    /// Start recording on process start even without a stale lock
    pub auto_start: bool,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            chunk_size_limit: 10 * 1024 * 1024,
            auto_start: false,
        }
    }
}

/// What startup recovery found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// A session lock from a previous run existed
    pub was_locked: bool,
    /// Salvaged chunks, in hand-over order
    pub recovered: Vec<FileReady>,
    /// A new session was started afterwards
    pub started: bool,
}

pub struct Supervisor {
    engine: Arc<Engine>,
    finalizer: Finalizer,
    settings: RwLock<RecorderSettings>,
    /// Serializes start, stop, split and collection
    ops: Mutex<()>,
}

impl Supervisor {
    pub fn new(engine: Arc<Engine>, settings: RecorderSettings) -> Self {
        Self::with_chunk_fs(engine, settings, Arc::new(LocalFs))
    }

    /// Supervisor whose finalizer moves chunks through `fs`
    pub fn with_chunk_fs(
        engine: Arc<Engine>,
        settings: RecorderSettings,
        fs: Arc<dyn ChunkFs>,
    ) -> Self {
        let finalizer = Finalizer::with_fs(Arc::clone(engine.publisher()), fs);
        Self {
            engine,
            finalizer,
            settings: RwLock::new(settings),
            ops: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn settings(&self) -> RecorderSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// New settings take effect at the next session start
    pub fn update_settings(&self, settings: RecorderSettings) {
        match self.settings.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
        info!("Recorder settings updated; applied at next session start");
    }

    /// Startup recovery.
    ///
    /// A stale lock means the previous run died while recording: its chunk is
    /// salvaged and, when `restart` is set, recording resumes in a new
    /// session. Without a lock a session starts only if auto-start is on.
    pub async fn recover(&self, restart: bool) -> Result<RecoveryReport> {
        let _ops = self.ops.lock().await;
        let store = self.engine.publisher().store();
        let mut report = RecoveryReport::default();

        if let Some(lock) = store.lock().read()? {
            report.was_locked = true;
            warn!(
                "Found session lock (reason={}, started {}, last tick {}); previous run did not stop cleanly",
                lock.reason, lock.started_at, lock.last_tick
            );

            match &lock.chunk_path {
                Some(path) if path.exists() => {
                    if let Some(file) = self.finalizer.recover(path)?.file() {
                        report.recovered.push(file.clone());
                    }
                }
                Some(path) => warn!("Locked chunk {} no longer exists", path.display()),
                None => warn!("Session lock names no chunk file"),
            }
            store.lock().clear()?;
        }

        // Temp chunks nobody owns: crashes between lock removal and rename
        let current = self.engine.current_path().await;
        for path in store.orphan_chunks()? {
            if current.as_ref() == Some(&path) {
                continue;
            }
            info!("Sweeping orphaned chunk {}", path.display());
            if let Some(file) = self.finalizer.recover(&path)?.file() {
                report.recovered.push(file.clone());
            }
        }

        self.check_integrity();

        let auto_start = self.settings().auto_start;
        if restart && (report.was_locked || auto_start) && !self.engine.is_active() {
            let reason = if report.was_locked { "recovery" } else { "auto" };
            match self.start_locked(reason).await {
                Ok(path) => {
                    info!("Recording started after recovery: {}", path.display());
                    report.started = true;
                }
                Err(e) => error!("Failed to start recording after recovery: {}", e),
            }
        }

        info!(
            "Recovery complete: locked={} recovered={} started={}",
            report.was_locked,
            report.recovered.len(),
            report.started
        );
        Ok(report)
    }

    /// Start a session with the current settings
    pub async fn start_session(&self, reason: &str) -> Result<PathBuf, StartError> {
        let _ops = self.ops.lock().await;
        self.start_locked(reason).await
    }

    /// Stop and finalize the current session
    pub async fn stop_session(&self) -> Result<Option<FinalizeResult>> {
        let _ops = self.ops.lock().await;
        self.stop_locked().await
    }

    /// Finalize the current chunk and continue in a new one
    pub async fn split(&self) -> Result<Option<FinalizeResult>> {
        let _ops = self.ops.lock().await;
        self.split_locked().await
    }

    /// Correct a snapshot that claims recording while no task runs.
    ///
    /// Returns true when a correction was made.
    pub fn check_integrity(&self) -> bool {
        if self.engine.is_active() {
            return false;
        }

        let publisher = self.engine.publisher();
        let status = publisher.status();
        let persisted = publisher.store().snapshot().read();
        if !persisted.recording && !persisted.paused && !status.is_recording() && !status.is_paused() {
            return false;
        }

        warn!("State says recording but no capture task is running; resetting to idle");
        status.reset_session();
        if status.state() != SessionState::Error {
            status.set_state(SessionState::Idle);
        }
        publisher.publish();
        true
    }

    /// One monitoring pass
    pub async fn tick(&self) -> Result<()> {
        let _ops = self.ops.lock().await;

        if let Some(outcome) = self.engine.take_finished().await {
            info!("Session ended on its own ({:?}); finalizing", outcome.exit);
            self.finalizer.finalize(&outcome)?;
        }

        let limit = self.settings().chunk_size_limit;
        let status = self.engine.publisher().status();
        if self.engine.is_active() && status.current_bytes() >= limit {
            info!(
                "Chunk size limit reached ({} >= {} bytes)",
                status.current_bytes(),
                limit
            );
            self.split_locked().await?;
        }

        self.check_integrity();
        Ok(())
    }

    /// Monitor until `shutdown` flips to true, then stop and finalize
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Supervisor monitoring every {:?}", interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Supervisor tick failed: {:#}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Supervisor shutting down");
        self.stop_session().await?;
        Ok(())
    }

    async fn start_locked(&self, reason: &str) -> Result<PathBuf, StartError> {
        let settings = self.settings();
        let path = self
            .engine
            .publisher()
            .store()
            .layout()
            .temp_chunk_path(Utc::now());
        self.engine.start(&path, reason, &settings.capture).await?;
        Ok(path)
    }

    async fn stop_locked(&self) -> Result<Option<FinalizeResult>> {
        match self.engine.stop_and_wait().await {
            Some(outcome) => Ok(Some(self.finalizer.finalize(&outcome)?)),
            None => Ok(None),
        }
    }

    async fn split_locked(&self) -> Result<Option<FinalizeResult>> {
        info!("Splitting chunk");
        // The old session is fully drained before the new one takes the device
        let finalized = self.stop_locked().await?;
        self.start_locked("split")
            .await
            .context("Failed to start new session after split")?;
        Ok(finalized)
    }
}
