use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Extension of finished chunk files
pub const CHUNK_EXTENSION: &str = "aac";

/// Suffix marking a chunk the engine may still be writing
pub const TEMP_SUFFIX: &str = ".tmp";

const LOCK_FILE: &str = "session.lock";
const SNAPSHOT_FILE: &str = "state.bin";
const QUEUED_FILE: &str = "queued.list";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// File naming inside the recordings directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create recordings directory {}", self.root.display()))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    pub fn queued_path(&self) -> PathBuf {
        self.root.join(QUEUED_FILE)
    }

    /// Fresh temporary chunk path, `capture_<ts>.aac.tmp`
    pub fn temp_chunk_path(&self, started_at: DateTime<Utc>) -> PathBuf {
        let name = format!(
            "capture_{}.{}{}",
            started_at.format(TIMESTAMP_FORMAT),
            CHUNK_EXTENSION,
            TEMP_SUFFIX
        );
        unique_path(self.root.join(name))
    }

    /// `<ts>_<secs>s.aac`, never colliding with an existing file
    pub fn finalized_path(&self, started_at: DateTime<Utc>, duration: Duration) -> PathBuf {
        self.named_path(started_at, duration, "")
    }

    /// `<ts>_<secs>s_recovered.aac`, never colliding with an existing file
    pub fn recovered_path(&self, started_at: DateTime<Utc>, duration: Duration) -> PathBuf {
        self.named_path(started_at, duration, "_recovered")
    }

    fn named_path(&self, started_at: DateTime<Utc>, duration: Duration, marker: &str) -> PathBuf {
        let name = format!(
            "{}_{}s{}.{}",
            started_at.format(TIMESTAMP_FORMAT),
            duration.as_secs(),
            marker,
            CHUNK_EXTENSION
        );
        unique_path(self.root.join(name))
    }

    /// Temporary chunk files currently in the recordings directory
    pub fn temp_chunks(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };

        let mut chunks: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_temp_chunk(path))
            .collect();
        chunks.sort();
        Ok(chunks)
    }

    /// Finished chunk files, oldest name first
    pub fn finalized_chunks(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };

        let mut chunks: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXTENSION)
            })
            .collect();
        chunks.sort();
        Ok(chunks)
    }
}

/// Whether a path names a temporary chunk
pub fn is_temp_chunk(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("capture_") && n.contains(&format!(".{}{}", CHUNK_EXTENSION, TEMP_SUFFIX)))
        .unwrap_or(false)
}

/// Start time encoded in a temporary chunk name
pub fn temp_chunk_started_at(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let stamp = name.strip_prefix("capture_")?.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// `path` if free, otherwise `stem-1.ext`, `stem-2.ext`, ...
pub fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    // Split at the first dot so `x.aac.tmp` becomes `x-1.aac.tmp`
    let (stem, rest) = match name.find('.') {
        Some(idx) => (name[..idx].to_string(), name[idx..].to_string()),
        None => (name.clone(), String::new()),
    };

    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{}-{}{}", stem, n, rest));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn temp_names_round_trip_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let path = layout.temp_chunk_path(started);
        assert!(is_temp_chunk(&path));
        assert_eq!(temp_chunk_started_at(&path), Some(started));
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "capture_20240309_140507.aac.tmp"
        );
    }

    #[test]
    fn finalized_names_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let first = layout.recovered_path(started, Duration::from_secs(42));
        assert!(first.ends_with("20240309_140507_42s_recovered.aac"));
        fs::write(&first, b"x").unwrap();

        let second = layout.recovered_path(started, Duration::from_secs(42));
        assert!(second.ends_with("20240309_140507_42s_recovered-1.aac"));
    }
}
