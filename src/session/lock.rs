// Session watchdog lock
//
// A small human-readable file that exists exactly while the engine believes
// it is recording. Finding it at startup means the previous process died
// without a graceful stop. This module only persists facts; deciding what a
// stale lock means is the supervisor's job.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::snapshot::sync_parent;

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLock {
    /// Engine status when written (e.g. "recording")
    pub status: String,
    /// When the session started
    pub started_at: DateTime<Utc>,
    /// Why the session was started ("user", "split", "recovery", ...)
    pub reason: String,
    /// Last watchdog tick
    pub last_tick: DateTime<Utc>,
    /// Chunk file the session was writing
    pub chunk_path: Option<PathBuf>,
}

impl SessionLock {
    pub fn new(reason: impl Into<String>, chunk_path: Option<PathBuf>, now: DateTime<Utc>) -> Self {
        Self {
            status: "recording".to_string(),
            started_at: now,
            reason: reason.into(),
            last_tick: now,
            chunk_path,
        }
    }

    /// Render as `key: value` lines
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("status: {}\n", self.status));
        text.push_str(&format!(
            "start_time: {}\n",
            self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        text.push_str(&format!("reason: {}\n", self.reason));
        text.push_str(&format!(
            "last_tick: {}\n",
            self.last_tick.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        if let Some(path) = &self.chunk_path {
            text.push_str(&format!("chunk_path: {}\n", path.display()));
        }
        text
    }

    /// Lenient parse: unknown keys are ignored, missing fields defaulted
    pub fn parse(text: &str) -> Self {
        let mut lock = SessionLock {
            status: String::new(),
            started_at: DateTime::<Utc>::default(),
            reason: String::new(),
            last_tick: DateTime::<Utc>::default(),
            chunk_path: None,
        };

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "status" => lock.status = value.to_string(),
                "start_time" => lock.started_at = parse_time(value).unwrap_or(lock.started_at),
                "reason" => lock.reason = value.to_string(),
                "last_tick" => lock.last_tick = parse_time(value).unwrap_or(lock.last_tick),
                "chunk_path" if !value.is_empty() => lock.chunk_path = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        lock
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Owns the lock file path
pub struct LockStore {
    path: PathBuf,
}

impl LockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff the lock file exists
    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Write the lock for a session that just became active
    pub fn acquire(&self, lock: &SessionLock) -> Result<()> {
        self.write(lock)?;
        info!(
            "Session lock written: reason={} chunk={}",
            lock.reason,
            lock.chunk_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Read the lock, `None` when absent
    pub fn read(&self) -> Result<Option<SessionLock>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(SessionLock::parse(&String::from_utf8_lossy(&bytes)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    /// Rewrite `last_tick`; returns false when there is no lock to tick
    pub fn tick(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut lock) = self.read()? else {
            return Ok(false);
        };
        lock.last_tick = now;
        self.write(&lock)?;
        debug!("Session lock ticked at {}", now);
        Ok(true)
    }

    /// Remove the lock; returns whether one existed
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                sync_parent(&self.path);
                info!("Session lock cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!("Failed to remove session lock: {}", e);
                Err(e).with_context(|| format!("Failed to remove {}", self.path.display()))
            }
        }
    }

    fn write(&self, lock: &SessionLock) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("lock.tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            file.write_all(lock.to_text().as_bytes())
                .context("Failed to write session lock")?;
            file.sync_all().context("Failed to sync session lock")?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to move lock into {}", self.path.display()))?;
        sync_parent(&self.path);
        Ok(())
    }
}
