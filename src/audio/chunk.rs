use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::adts;

/// In-memory write buffer size; bounds the data lost on an abrupt crash
pub const WRITE_BUFFER_BYTES: usize = 16 * 1024;

/// Appends ADTS-framed packets to a chunk file.
///
/// Packets are staged in a fixed buffer. When the next frame would overflow
/// it, the buffer is written and fsynced, so at most one buffer of audio is
/// ever at risk.
pub struct ChunkWriter {
    file: Option<File>,
    path: PathBuf,
    sample_rate: u32,
    buffer: Vec<u8>,
    /// Bytes accepted so far (flushed + buffered)
    bytes: u64,
    /// Bytes durably on disk
    flushed: u64,
}

impl ChunkWriter {
    /// Open `path` for append. Fails if the sample rate has no ADTS index.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        adts::frequency_index(sample_rate)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let existing = file.metadata()?.len();

        debug!("Chunk writer opened: {} ({} bytes present)", path.display(), existing);

        Ok(Self {
            file: Some(file),
            path,
            sample_rate,
            buffer: Vec::with_capacity(WRITE_BUFFER_BYTES),
            bytes: existing,
            flushed: existing,
        })
    }

    /// Frame and stage one encoded packet
    pub fn append_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        let header = adts::frame_header(packet.len(), self.sample_rate)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let frame_len = header.len() + packet.len();
        if self.buffer.len() + frame_len > WRITE_BUFFER_BYTES {
            self.flush()?;
        }

        self.buffer.extend_from_slice(&header);
        self.buffer.extend_from_slice(packet);
        self.bytes += frame_len as u64;
        Ok(())
    }

    /// Write the staged buffer and force it to stable storage
    pub fn flush(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "chunk writer closed"))?;

        file.write_all(&self.buffer)?;
        file.sync_data()?;
        self.flushed += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Final flush + full sync; closes the file
    pub fn finish(&mut self) -> io::Result<u64> {
        self.flush()?;
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(self.flushed)
    }

    /// Bytes accepted so far, including the unflushed buffer
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Bytes known to be on disk
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.finish() {
                warn!("Failed to flush chunk writer on drop: {}", e);
            }
        }
    }
}
