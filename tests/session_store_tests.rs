// Integration tests for crash-safe bookkeeping
//
// These tests verify the on-disk contract other processes rely on: the
// 16-byte snapshot record and the key: value session lock.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use loqa_recorder::session::{
    read_snapshot, LockStore, SessionLock, SessionSnapshot, SnapshotStore, SNAPSHOT_LEN,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_snapshot_layout_is_fixed() {
    let snapshot = SessionSnapshot {
        recording: true,
        paused: false,
        chunk_counter: 0x0102_0304,
        current_bytes: 0x0A0B_0C0D_0E0F_1011,
    };

    let bytes = snapshot.to_bytes();
    assert_eq!(bytes.len(), SNAPSHOT_LEN);
    assert_eq!(&bytes[0..2], b"LR");
    assert_eq!(bytes[2], 1);
    assert_eq!(bytes[3], 0);
    assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
    assert_eq!(
        &bytes[8..16],
        &[0x11, 0x10, 0x0F, 0x0E, 0x0D, 0x0C, 0x0B, 0x0A]
    );
    assert_eq!(SessionSnapshot::from_bytes(&bytes), Some(snapshot));
}

#[test]
fn test_snapshot_write_is_atomic_and_durable() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = SnapshotStore::new(temp_dir.path().join("state.bin"));

    let snapshot = SessionSnapshot {
        recording: true,
        paused: true,
        chunk_counter: 7,
        current_bytes: 12345,
    };
    store.write(&snapshot)?;

    assert_eq!(store.read(), snapshot);
    assert_eq!(fs::metadata(store.path())?.len(), SNAPSHOT_LEN as u64);

    // Only the final file remains; no temp file left behind
    let names: Vec<_> = fs::read_dir(temp_dir.path())?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .collect();
    assert_eq!(names.len(), 1);
    Ok(())
}

#[test]
fn test_malformed_snapshot_reads_as_idle() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("state.bin");

    // Missing file
    assert_eq!(read_snapshot(&path), SessionSnapshot::default());

    // Legacy short record
    fs::write(&path, [b'L', b'R', 1, 0, 5, 0, 0, 0])?;
    assert_eq!(read_snapshot(&path), SessionSnapshot::default());

    // Right size, wrong marker
    let mut bytes = SessionSnapshot {
        recording: true,
        ..Default::default()
    }
    .to_bytes();
    bytes[0] = b'X';
    fs::write(&path, bytes)?;
    assert!(!read_snapshot(&path).recording);

    // Flag byte out of range
    let mut bytes = SessionSnapshot::default().to_bytes();
    bytes[2] = 7;
    fs::write(&path, bytes)?;
    assert_eq!(read_snapshot(&path), SessionSnapshot::default());
    Ok(())
}

#[test]
fn test_lock_lifecycle() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = LockStore::new(temp_dir.path().join("session.lock"));
    assert!(!store.is_locked());
    assert!(store.read()?.is_none());

    let started = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
    let chunk = temp_dir.path().join("capture_20240501_093000.aac.tmp");
    store.acquire(&SessionLock::new("user", Some(chunk.clone()), started))?;
    assert!(store.is_locked());

    let later = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 30).unwrap();
    assert!(store.tick(later)?);

    let lock = store.read()?.unwrap();
    assert_eq!(lock.status, "recording");
    assert_eq!(lock.reason, "user");
    assert_eq!(lock.started_at, started);
    assert_eq!(lock.last_tick, later);
    assert_eq!(lock.chunk_path, Some(chunk));

    let text = fs::read_to_string(store.path())?;
    assert!(text.contains("start_time: 2024-05-01T09:30:00.000Z"));
    assert!(text.contains("reason: user"));

    assert!(store.clear()?);
    assert!(!store.is_locked());
    assert!(!store.clear()?, "clearing twice is a no-op");
    assert!(!store.tick(later)?, "no lock, nothing to tick");
    Ok(())
}

#[test]
fn test_unparseable_lock_still_counts() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = LockStore::new(temp_dir.path().join("session.lock"));
    fs::write(
        store.path(),
        "garbage without separators\nfuture_key: whatever\nchunk_path: /data/x.aac.tmp\nstart_time: not-a-date\n",
    )?;

    assert!(store.is_locked());
    let lock = store.read()?.unwrap();
    assert_eq!(lock.chunk_path, Some(PathBuf::from("/data/x.aac.tmp")));
    assert_eq!(lock.started_at, chrono::DateTime::<Utc>::default());
    assert!(lock.reason.is_empty());
    Ok(())
}
