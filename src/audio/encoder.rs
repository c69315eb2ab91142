//! Streaming packet encoders.
//!
//! The capture loop pushes PCM in whatever frame size the device delivers and
//! drains whole packets, each later wrapped in an ADTS header by the chunk
//! writer. Encoding is decoupled from capture: a push may produce zero, one or
//! several packets.

use anyhow::{Context, Result};
use fdk_aac::enc::{BitRate, ChannelMode, Encoder, EncoderParams, Transport};
use std::collections::VecDeque;
use tracing::debug;

use super::adts::SAMPLES_PER_FRAME;

/// Upper bound on silent frames fed at end of stream to drain the encoder
const MAX_FLUSH_FRAMES: usize = 8;

/// Scratch space for one access unit; the ADTS length field caps frames at 8 KiB
const SCRATCH_BYTES: usize = 8192;

/// Streaming encoder interface
pub trait PacketEncoder: Send {
    /// Feed mono i16 PCM
    fn push(&mut self, pcm: &[i16]) -> Result<()>;

    /// Take every packet completed so far
    fn drain(&mut self) -> Vec<Vec<u8>>;

    /// Signal end of stream; buffered audio is flushed into final packets
    fn finish(&mut self) -> Result<()>;

    /// Encoder name for logging
    fn name(&self) -> &str;
}

/// fdk-aac handle that may move to the capture task's thread
struct AacHandle(Encoder);

// SAFETY: the handle is owned by exactly one `AacEncoder` and is only used
// through `&mut self`, so it is never touched by two threads at once. The
// library keeps no thread-local state.
unsafe impl Send for AacHandle {}

/// AAC-LC encoder backed by fdk-aac, producing raw access units.
///
/// The encoder delays its output by a few frames of lookahead. `finish` feeds
/// silence until every submitted frame has come out as a packet, so the tail
/// of a recording is never lost.
pub struct AacEncoder {
    handle: AacHandle,
    pending: Vec<i16>,
    ready: VecDeque<Vec<u8>>,
    scratch: Vec<u8>,
    /// Whole frames handed to the library
    frames_in: usize,
    /// Packets produced so far
    packets_out: usize,
    finished: bool,
}

impl AacEncoder {
    pub fn new(sample_rate: u32, bitrate: u32) -> Result<Self> {
        let encoder = Encoder::new(EncoderParams {
            bit_rate: BitRate::Cbr(bitrate),
            sample_rate,
            transport: Transport::Raw,
            channels: ChannelMode::Mono,
        })
        .map_err(|e| anyhow::anyhow!("Failed to create AAC encoder: {:?}", e))
        .with_context(|| format!("AAC-LC at {}Hz, {} bit/s", sample_rate, bitrate))?;

        Ok(Self {
            handle: AacHandle(encoder),
            pending: Vec::with_capacity(SAMPLES_PER_FRAME as usize),
            ready: VecDeque::new(),
            scratch: vec![0u8; SCRATCH_BYTES],
            frames_in: 0,
            packets_out: 0,
            finished: false,
        })
    }

    /// Encode one frame taken from the front of `pending`
    fn encode_frame(&mut self) -> Result<()> {
        let frame = SAMPLES_PER_FRAME as usize;
        let info = self
            .handle
            .0
            .encode(&self.pending[..frame], &mut self.scratch)
            .map_err(|e| anyhow::anyhow!("AAC encode failed: {:?}", e))?;
        if info.input_consumed == 0 {
            anyhow::bail!("AAC encoder consumed no input");
        }

        self.pending.drain(..info.input_consumed.min(frame));
        self.frames_in += 1;
        if info.output_size > 0 {
            self.ready
                .push_back(self.scratch[..info.output_size].to_vec());
            self.packets_out += 1;
        }
        Ok(())
    }

    fn encode_pending(&mut self) -> Result<()> {
        while self.pending.len() >= SAMPLES_PER_FRAME as usize {
            self.encode_frame()?;
        }
        Ok(())
    }
}

impl PacketEncoder for AacEncoder {
    fn push(&mut self, pcm: &[i16]) -> Result<()> {
        if self.finished {
            anyhow::bail!("encoder already finished");
        }
        self.pending.extend_from_slice(pcm);
        self.encode_pending()
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.ready.drain(..).collect()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let frame = SAMPLES_PER_FRAME as usize;
        if !self.pending.is_empty() {
            self.pending.resize(frame, 0);
            self.encode_pending()?;
        }

        // Push silence through the lookahead until the real frames are out
        let target = self.frames_in;
        let mut fed = 0;
        while self.packets_out < target && fed < MAX_FLUSH_FRAMES {
            self.pending.resize(frame, 0);
            self.encode_frame()?;
            fed += 1;
        }
        self.pending.clear();
        debug!(
            "AAC encoder flushed with {} silent frame(s): {} frames in, {} packets out",
            fed, target, self.packets_out
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "aac-lc"
    }
}

/// Create the encoder for a session
pub fn create_encoder(sample_rate: u32, bitrate: u32) -> Result<Box<dyn PacketEncoder>> {
    Ok(Box::new(AacEncoder::new(sample_rate, bitrate)?))
}
