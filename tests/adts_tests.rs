// Integration tests for ADTS framing and the chunk writer
//
// Chunk files must be playable from byte 0 and scannable after a crash,
// so these tests check exact header bytes and what survives on disk.

use anyhow::Result;
use loqa_recorder::audio::adts::{frame_header, parse_header, scan_file, HEADER_LEN};
use loqa_recorder::audio::chunk::WRITE_BUFFER_BYTES;
use loqa_recorder::audio::{AacEncoder, ChunkWriter, PacketEncoder};
use loqa_recorder::AdtsError;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_header_bytes_for_known_inputs() {
    assert_eq!(
        frame_header(100, 16000).unwrap(),
        [0xFF, 0xF1, 0x60, 0x40, 0x0D, 0x7F, 0xFC]
    );
    assert_eq!(
        frame_header(2048, 48000).unwrap(),
        [0xFF, 0xF1, 0x4C, 0x41, 0x00, 0xFF, 0xFC]
    );
}

#[test]
fn test_header_is_pure_function() {
    for rate in [16000, 44100, 48000] {
        for len in [0usize, 1, 371, 2048, 8184] {
            let a = frame_header(len, rate).unwrap();
            let b = frame_header(len, rate).unwrap();
            assert_eq!(a, b);

            let parsed = parse_header(&a).unwrap();
            assert_eq!(parsed.frame_len, len + HEADER_LEN);
            assert_eq!(parsed.sample_rate, rate);
            assert_eq!(parsed.channels, 1);
        }
    }
}

#[test]
fn test_header_rejects_bad_inputs() {
    assert_eq!(
        frame_header(100, 22000),
        Err(AdtsError::UnsupportedSampleRate(22000))
    );
    assert_eq!(frame_header(8185, 16000), Err(AdtsError::PacketTooLarge(8185)));
    assert!(parse_header(&[0x00, 0xF1, 0x60, 0x40, 0x0D, 0x7F, 0xFC]).is_none());
    assert!(parse_header(&[0xFF, 0xF1]).is_none());
}

#[test]
fn test_writer_flushes_when_buffer_fills() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("capture_test.aac.tmp");
    let mut writer = ChunkWriter::create(&path, 16000)?;

    let packet = vec![0u8; 2048];
    let frame_len = (packet.len() + HEADER_LEN) as u64;
    let per_buffer = WRITE_BUFFER_BYTES as u64 / frame_len;

    for _ in 0..per_buffer {
        writer.append_packet(&packet)?;
    }
    // Everything still fits in memory
    assert_eq!(writer.flushed_bytes(), 0);
    assert_eq!(fs::metadata(&path)?.len(), 0);

    writer.append_packet(&packet)?;
    assert_eq!(writer.flushed_bytes(), per_buffer * frame_len);
    assert_eq!(fs::metadata(&path)?.len(), per_buffer * frame_len);

    let total = writer.finish()?;
    assert_eq!(total, (per_buffer + 1) * frame_len);
    assert_eq!(fs::metadata(&path)?.len(), total);
    Ok(())
}

#[test]
fn test_encoded_chunk_scans_back_to_duration() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("capture_scan.aac.tmp");

    let mut encoder = AacEncoder::new(16000, 32000)?;
    let mut writer = ChunkWriter::create(&path, 16000)?;

    // 3.2 s of audio = 50 frames of 1024 samples
    let tone: Vec<i16> = (0..16000 * 3 + 3200)
        .map(|i| if (i / 10) % 2 == 0 { 1500 } else { -1500 })
        .collect();
    encoder.push(&tone)?;
    encoder.finish()?;
    for packet in encoder.drain() {
        writer.append_packet(&packet)?;
    }
    writer.finish()?;

    // Every AAC-LC frame is announced as such, mono at 16 kHz
    let data = fs::read(&path)?;
    let first = parse_header(&data).expect("ADTS header at byte 0");
    assert_eq!(first.sample_rate, 16000);
    assert_eq!(first.channels, 1);
    assert_eq!(data[2] >> 6, 1, "profile must be AAC-LC");

    // Flushing the lookahead may add a few frames of silence, never drop audio
    let summary = scan_file(&path)?;
    assert!(summary.frames >= 50, "only {} frames", summary.frames);
    assert!(summary.frames <= 50 + 8, "{} frames", summary.frames);
    assert_eq!(summary.sample_rate, 16000);
    assert!(!summary.truncated);
    assert!(summary.duration() >= Duration::from_millis(3200));
    Ok(())
}

#[test]
fn test_truncated_chunk_keeps_complete_frames() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("capture_cut.aac.tmp");

    let mut writer = ChunkWriter::create(&path, 44100)?;
    for _ in 0..4 {
        writer.append_packet(&[7u8; 300])?;
    }
    writer.finish()?;

    // Simulate a crash mid-write
    let mut data = fs::read(&path)?;
    data.truncate(data.len() - 100);
    fs::write(&path, &data)?;

    let summary = scan_file(&path)?;
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.valid_bytes, 3 * 307);
    assert!(summary.truncated);
    Ok(())
}
