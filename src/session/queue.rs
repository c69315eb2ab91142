// Chunks handed over under their temporary name
//
// A finished chunk that cannot be renamed is queued for transfer as-is. Its
// name still looks like a temp chunk, so this ledger is what tells the orphan
// sweep it was already announced. One file name per line.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::snapshot::sync_parent;

/// Owns the ledger file; entries are names inside the ledger's directory
pub struct QueuedChunks {
    path: PathBuf,
    names: Mutex<BTreeSet<String>>,
}

impl QueuedChunks {
    /// Load the ledger; an unreadable file starts empty
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let names = match fs::read_to_string(&path) {
            Ok(text) => parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                warn!("Failed to read queued chunk ledger {}: {}", path.display(), e);
                BTreeSet::new()
            }
        };
        Self {
            path,
            names: Mutex::new(names),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, chunk: &Path) -> bool {
        match file_name(chunk) {
            Some(name) => self.names().contains(&name),
            None => false,
        }
    }

    /// Queued chunk paths, oldest name first
    pub fn list(&self) -> Vec<PathBuf> {
        let dir = self.dir();
        self.names().iter().map(|name| dir.join(name)).collect()
    }

    /// Record a chunk as handed over.
    ///
    /// The entry is kept in memory even when persisting it fails.
    pub fn add(&self, chunk: &Path) -> Result<()> {
        let name = file_name(chunk)
            .with_context(|| format!("Not a chunk file name: {}", chunk.display()))?;
        let mut names = self.names();
        if names.insert(name) {
            info!("Chunk queued under its temporary name: {}", chunk.display());
            self.persist(&names)?;
        }
        Ok(())
    }

    /// Forget a chunk; returns whether it was queued
    pub fn remove(&self, chunk: &Path) -> Result<bool> {
        let Some(name) = file_name(chunk) else {
            return Ok(false);
        };
        let mut names = self.names();
        if !names.remove(&name) {
            return Ok(false);
        }
        self.persist(&names)?;
        Ok(true)
    }

    /// Drop entries whose chunk no longer exists; returns how many went
    pub fn prune(&self) -> Result<usize> {
        let dir = self.dir();
        let mut names = self.names();
        let before = names.len();
        names.retain(|name| dir.join(name).exists());
        let dropped = before - names.len();
        if dropped > 0 {
            debug!("Pruned {} delivered chunk(s) from the queue ledger", dropped);
            self.persist(&names)?;
        }
        Ok(dropped)
    }

    fn dir(&self) -> PathBuf {
        self.path.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    fn names(&self) -> MutexGuard<'_, BTreeSet<String>> {
        match self.names.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, names: &BTreeSet<String>) -> Result<()> {
        if names.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => {
                    sync_parent(&self.path);
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    Err(e).with_context(|| format!("Failed to remove {}", self.path.display()))
                }
            };
        }

        let mut text = String::new();
        for name in names {
            text.push_str(name);
            text.push('\n');
        }

        let tmp_path = self.path.with_extension("list.tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            file.write_all(text.as_bytes())
                .context("Failed to write queued chunk ledger")?;
            file.sync_all().context("Failed to sync queued chunk ledger")?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to move ledger into {}", self.path.display()))?;
        sync_parent(&self.path);
        Ok(())
    }
}

fn parse(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn file_name(chunk: &Path) -> Option<String> {
    chunk.file_name()?.to_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_survive_reload_and_prune_when_gone() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("queued.list");
        let chunk = dir.path().join("capture_20240101_120000.aac.tmp");
        fs::write(&chunk, b"x").unwrap();

        let ledger = QueuedChunks::new(&ledger_path);
        ledger.add(&chunk).unwrap();
        ledger.add(&chunk).unwrap();
        assert!(ledger.contains(&chunk));

        let reloaded = QueuedChunks::new(&ledger_path);
        assert_eq!(reloaded.list(), vec![chunk.clone()]);

        fs::remove_file(&chunk).unwrap();
        assert_eq!(reloaded.prune().unwrap(), 1);
        assert!(!reloaded.contains(&chunk));
        assert!(!ledger_path.exists());
    }
}
