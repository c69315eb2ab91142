// ADTS framing for chunk files
//
// Every encoded packet is prefixed with a 7-byte ADTS header (no CRC), so a
// chunk file can be played or scanned from byte 0 without an index, even when
// it was truncated by a crash.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::error::AdtsError;

/// Header length (protection_absent = 1, so no CRC)
pub const HEADER_LEN: usize = 7;

/// Largest frame the 13-bit length field can describe
pub const MAX_FRAME_LEN: usize = 0x1FFF;

/// PCM samples carried by one packet
pub const SAMPLES_PER_FRAME: u32 = 1024;

/// MPEG-4 sampling frequency index table
const FREQUENCY_TABLE: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AAC Low Complexity
const PROFILE_LC: u8 = 2;

/// Mono
const CHANNEL_CONFIG: u8 = 1;

/// Look up the ADTS frequency index for a sample rate
pub fn frequency_index(sample_rate: u32) -> Result<u8, AdtsError> {
    FREQUENCY_TABLE
        .iter()
        .position(|&rate| rate == sample_rate)
        .map(|idx| idx as u8)
        .ok_or(AdtsError::UnsupportedSampleRate(sample_rate))
}

/// Build the header for a packet of `packet_len` payload bytes.
///
/// Pure function of its inputs.
pub fn frame_header(packet_len: usize, sample_rate: u32) -> Result<[u8; HEADER_LEN], AdtsError> {
    let freq_idx = frequency_index(sample_rate)?;
    let frame_len = packet_len + HEADER_LEN;
    if frame_len > MAX_FRAME_LEN {
        return Err(AdtsError::PacketTooLarge(packet_len));
    }

    Ok([
        0xFF,
        0xF1, // syncword, MPEG-4, layer 0, no CRC
        ((PROFILE_LC - 1) << 6) | (freq_idx << 2) | (CHANNEL_CONFIG >> 2),
        ((CHANNEL_CONFIG & 0x3) << 6) | ((frame_len >> 11) as u8 & 0x3),
        ((frame_len >> 3) & 0xFF) as u8,
        (((frame_len & 0x7) as u8) << 5) | 0x1F,
        0xFC, // buffer fullness (VBR) + one raw data block
    ])
}

/// Fields recovered from a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length including the header
    pub frame_len: usize,
    /// Sample rate from the frequency index
    pub sample_rate: u32,
    /// Channel configuration
    pub channels: u8,
}

/// Parse a header; `None` if the bytes are not a valid ADTS header
pub fn parse_header(bytes: &[u8]) -> Option<FrameHeader> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    if bytes[0] != 0xFF || bytes[1] & 0xF6 != 0xF0 {
        return None;
    }

    let freq_idx = ((bytes[2] >> 2) & 0x0F) as usize;
    let sample_rate = *FREQUENCY_TABLE.get(freq_idx)?;
    let channels = ((bytes[2] & 0x1) << 2) | (bytes[3] >> 6);
    let frame_len = (((bytes[3] & 0x3) as usize) << 11)
        | ((bytes[4] as usize) << 3)
        | ((bytes[5] >> 5) as usize);

    if frame_len < HEADER_LEN {
        return None;
    }

    Some(FrameHeader {
        frame_len,
        sample_rate,
        channels,
    })
}

/// Result of walking a chunk file frame by frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Complete frames found
    pub frames: u64,
    /// Bytes covered by complete frames
    pub valid_bytes: u64,
    /// Total file length
    pub file_bytes: u64,
    /// Sample rate of the first frame (0 if none)
    pub sample_rate: u32,
    /// Whether trailing bytes did not form a complete frame
    pub truncated: bool,
}

impl ChunkSummary {
    /// Playable duration covered by the complete frames
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let samples = self.frames * u64::from(SAMPLES_PER_FRAME);
        Duration::from_millis(samples * 1000 / u64::from(self.sample_rate))
    }
}

/// Walk an in-memory ADTS stream
pub fn scan_bytes(data: &[u8]) -> ChunkSummary {
    let mut summary = ChunkSummary {
        file_bytes: data.len() as u64,
        ..Default::default()
    };

    let mut offset = 0usize;
    while offset < data.len() {
        let header = match parse_header(&data[offset..]) {
            Some(h) => h,
            None => {
                summary.truncated = true;
                break;
            }
        };
        if offset + header.frame_len > data.len() {
            summary.truncated = true;
            break;
        }
        if summary.sample_rate == 0 {
            summary.sample_rate = header.sample_rate;
        }
        summary.frames += 1;
        offset += header.frame_len;
    }

    // offset only advances past complete frames
    summary.valid_bytes = offset as u64;
    summary
}

/// Walk a chunk file on disk
pub fn scan_file(path: impl AsRef<Path>) -> Result<ChunkSummary> {
    let path = path.as_ref();
    let mut data = Vec::new();
    File::open(path)
        .with_context(|| format!("Failed to open chunk file: {}", path.display()))?
        .read_to_end(&mut data)
        .with_context(|| format!("Failed to read chunk file: {}", path.display()))?;

    Ok(scan_bytes(&data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_index_covers_supported_rates() {
        assert_eq!(frequency_index(48000), Ok(3));
        assert_eq!(frequency_index(44100), Ok(4));
        assert_eq!(frequency_index(16000), Ok(8));
        assert_eq!(
            frequency_index(12345),
            Err(AdtsError::UnsupportedSampleRate(12345))
        );
    }

    #[test]
    fn scan_stops_at_partial_frame() {
        let mut data = frame_header(4, 16000).unwrap().to_vec();
        data.extend_from_slice(&[1, 2, 3, 4]);
        data.extend_from_slice(&frame_header(10, 16000).unwrap());
        data.push(9);

        let summary = scan_bytes(&data);
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.valid_bytes, 11);
        assert!(summary.truncated);
    }
}
