// Real-time capture loop
//
// One task per session: read a frame, classify it, feed the encoder, write
// framed packets. The task is the single writer of the device, encoder and
// chunk file. Every exit path goes through `cleanup`.

use chrono::{DateTime, Utc};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::backoff::ExponentialBackoff;
use super::focus::{AudioFocus, WakeToken};
use super::state::{DurationClock, SessionControl, SessionState, StatePublisher};
use super::{CaptureSettings, SilenceStrategy};
use crate::audio::backend::{acquire, acquire_once, ACQUIRE_TIMEOUT};
use crate::audio::{CaptureDevice, ChunkWriter, DeviceProvider, PacketEncoder, PreRollBuffer};
use crate::audio::VoiceActivityDetector;
use crate::error::CaptureError;

/// Silent audio still recorded after the last voiced frame
pub const SILENCE_HOLD: Duration = Duration::from_secs(1);

/// Continuous silence before the aggressive strategy powers down
pub const DEEP_SILENCE: Duration = Duration::from_secs(12);

/// Watchdog lock tick cadence
pub const LOCK_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Poll interval while paused
pub const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Retry delay after a read returned no data
pub const SOFT_READ_RETRY: Duration = Duration::from_millis(10);

/// Lower bound on the frame read per iteration
pub const MIN_FRAME: Duration = Duration::from_millis(90);

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Stop requested
    Stopped,
    /// Storage quota reached (clean stop)
    StorageLimit,
    /// Device permanently lost or could not be reacquired
    DeviceLost(String),
    /// Chunk file could not be written
    WriteFailed(String),
    /// Encoder rejected input
    EncoderFailed(String),
}

impl ExitReason {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ExitReason::DeviceLost(_) | ExitReason::WriteFailed(_) | ExitReason::EncoderFailed(_)
        )
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ExitReason::DeviceLost(msg)
            | ExitReason::WriteFailed(msg)
            | ExitReason::EncoderFailed(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Result of a finished session, handed to the finalizer
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Temporary chunk path
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Pause-adjusted wall-clock duration
    pub duration: Duration,
    /// Bytes durably written
    pub bytes: u64,
    pub sample_rate: u32,
    pub reason: String,
    pub exit: ExitReason,
}

/// Cleared when the task ends, even by panic
pub(crate) struct LiveGuard(pub(crate) Arc<AtomicBool>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything a running session owns
pub(crate) struct CaptureTask {
    pub(crate) provider: Arc<dyn DeviceProvider>,
    pub(crate) control: Arc<SessionControl>,
    pub(crate) publisher: Arc<StatePublisher>,
    pub(crate) wake: Arc<dyn WakeToken>,
    pub(crate) focus: Arc<dyn AudioFocus>,
    pub(crate) settings: CaptureSettings,
    pub(crate) reason: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) device: Option<Box<dyn CaptureDevice>>,
    pub(crate) encoder: Box<dyn PacketEncoder>,
    pub(crate) writer: ChunkWriter,
    pub(crate) frame: Vec<i16>,
    pub(crate) preroll: PreRollBuffer,
    pub(crate) vad: VoiceActivityDetector,
    pub(crate) clock: DurationClock,
    pub(crate) silence_backoff: ExponentialBackoff,
    /// Samples since the last voiced frame
    pub(crate) silent_samples: u64,
    pub(crate) last_tick: Instant,
    pub(crate) _live: LiveGuard,
}

impl CaptureTask {
    pub(crate) async fn run(mut self) -> SessionOutcome {
        info!(
            "Capture loop started: {} at {}Hz ({} samples/frame, {:?} strategy)",
            self.writer.path().display(),
            self.writer.sample_rate(),
            self.frame.len(),
            self.settings.silence_strategy
        );

        let exit = self.capture().await;
        self.cleanup(exit)
    }

    async fn capture(&mut self) -> ExitReason {
        let sample_rate = self.writer.sample_rate();

        loop {
            if !self.control.should_continue() {
                return ExitReason::Stopped;
            }
            self.maybe_tick();

            if self.writer.bytes() >= self.settings.storage_quota {
                info!(
                    "Storage quota reached ({} >= {} bytes); stopping",
                    self.writer.bytes(),
                    self.settings.storage_quota
                );
                return ExitReason::StorageLimit;
            }

            if self.publisher.status().is_paused() {
                if self.publisher.status().state() != SessionState::Paused {
                    self.enter_pause();
                }
                self.control.wait(PAUSE_POLL).await;
                continue;
            }

            if self.device.is_none() {
                if let Err(e) = self.resume_capture().await {
                    error!("Failed to reacquire microphone: {}", e);
                    return ExitReason::DeviceLost(e.to_string());
                }
            }

            let Some(device) = self.device.as_mut() else {
                continue;
            };
            let read_started = Instant::now();
            let read = device.read(&mut self.frame).await;
            let n = match read {
                Ok(0) => {
                    sleep(SOFT_READ_RETRY).await;
                    continue;
                }
                Ok(n) => n.min(self.frame.len()),
                Err(e) if e.is_fatal() => {
                    error!("Capture device lost: {}", e);
                    return ExitReason::DeviceLost(e.to_string());
                }
                Err(e) => match self.recover_hardware(e).await {
                    Ok(()) => continue,
                    Err(exit) => return exit,
                },
            };

            if let Err(exit) = self.process_frame(n, read_started).await {
                return exit;
            }
            if let Err(exit) = self.drain_encoder() {
                return exit;
            }

            let status = self.publisher.status();
            status.set_current_bytes(self.writer.bytes());
            status.set_elapsed(self.clock.elapsed());
            debug!(
                "Frame {} samples at {}Hz, chunk {} bytes",
                n,
                sample_rate,
                self.writer.bytes()
            );
        }
    }

    /// VAD gate, pre-roll and power management for one frame
    async fn process_frame(&mut self, n: usize, read_started: Instant) -> Result<(), ExitReason> {
        let sample_rate = self.writer.sample_rate();
        let frame = &self.frame[..n];

        if self.vad.process(frame, sample_rate) {
            self.silent_samples = 0;
            self.silence_backoff.reset();

            if !self.preroll.is_empty() {
                let preroll = self.preroll.take();
                debug!("Speech onset; flushing {} pre-roll samples", preroll.len());
                self.encoder
                    .push(&preroll)
                    .map_err(|e| ExitReason::EncoderFailed(e.to_string()))?;
            }
            return self
                .encoder
                .push(frame)
                .map_err(|e| ExitReason::EncoderFailed(e.to_string()));
        }

        self.silent_samples += n as u64;
        let silence = samples_to_duration(self.silent_samples, sample_rate);

        if silence <= SILENCE_HOLD {
            return self
                .encoder
                .push(frame)
                .map_err(|e| ExitReason::EncoderFailed(e.to_string()));
        }

        self.preroll.extend(frame);

        match self.settings.silence_strategy {
            SilenceStrategy::Aggressive if silence >= DEEP_SILENCE => self.power_save().await,
            SilenceStrategy::Aggressive | SilenceStrategy::Standard => {
                // Device stays powered; keep reads at real-time pace
                let frame_duration = samples_to_duration(n as u64, sample_rate);
                let remaining = frame_duration.saturating_sub(read_started.elapsed());
                if !remaining.is_zero() {
                    sleep(remaining).await;
                }
                Ok(())
            }
        }
    }

    /// Power the device down and wait out the backoff delay.
    ///
    /// The loop reacquires the device on its next iteration.
    async fn power_save(&mut self) -> Result<(), ExitReason> {
        let delay = self.silence_backoff.next_delay();
        self.release_device();
        self.preroll.clear();
        self.vad.reset();

        let status = self.publisher.status();
        status.set_state(SessionState::SilenceBackoff);
        status.set_backoff(delay);
        status.set_elapsed(self.clock.elapsed());
        self.publisher.publish();

        info!(
            "Silence for {:?}; microphone powered down for {:?}",
            samples_to_duration(self.silent_samples, self.writer.sample_rate()),
            delay
        );

        if self.control.wait(delay).await {
            debug!("Silence backoff interrupted by wakeup");
        }
        if !self.control.should_continue() {
            return Err(ExitReason::Stopped);
        }
        Ok(())
    }

    /// Reacquire the device after a pause or a power-save backoff
    async fn resume_capture(&mut self) -> Result<(), CaptureError> {
        // The chunk's frame headers fix the rate for the whole file
        let rate = self.writer.sample_rate();
        let device = acquire(self.provider.as_ref(), &[rate], ACQUIRE_TIMEOUT).await?;
        self.device = Some(device);
        self.clock.resume();

        let status = self.publisher.status();
        status.set_state(SessionState::Capturing);
        status.set_backoff(Duration::ZERO);
        self.publisher.publish();
        info!("Microphone reacquired at {}Hz", rate);
        Ok(())
    }

    /// Unbounded retry after a hard read error
    async fn recover_hardware(&mut self, cause: CaptureError) -> Result<(), ExitReason> {
        warn!("Capture read failed: {}; starting hardware recovery", cause);
        self.release_device();

        let rate = self.writer.sample_rate();
        let mut backoff = ExponentialBackoff::recovery();
        let mut attempt = 0u32;

        loop {
            let delay = backoff.next_delay();
            self.control.wait(delay).await;
            if !self.control.should_continue() {
                return Err(ExitReason::Stopped);
            }
            self.maybe_tick();

            attempt += 1;
            match acquire_once(self.provider.as_ref(), &[rate]).await {
                Ok(device) => {
                    info!("Hardware recovery succeeded after {} attempt(s)", attempt);
                    self.device = Some(device);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!("Hardware recovery failed permanently: {}", e);
                    return Err(ExitReason::DeviceLost(e.to_string()));
                }
                Err(e) => {
                    debug!(
                        "Hardware recovery attempt {} failed: {} (next in {:?})",
                        attempt,
                        e,
                        backoff.peek()
                    );
                }
            }
        }
    }

    fn enter_pause(&mut self) {
        self.release_device();
        self.clock.pause();
        self.preroll.clear();
        self.vad.reset();

        let status = self.publisher.status();
        status.set_state(SessionState::Paused);
        status.set_elapsed(self.clock.elapsed());
        self.publisher.publish();
        info!(
            "Capture paused ({:?}) at {:?}",
            status.pause_reason(),
            self.clock.elapsed()
        );
    }

    fn drain_encoder(&mut self) -> Result<(), ExitReason> {
        for packet in self.encoder.drain() {
            self.writer.append_packet(&packet).map_err(write_exit)?;
        }
        Ok(())
    }

    /// Watchdog tick plus snapshot refresh, on the lock cadence
    fn maybe_tick(&mut self) {
        if self.last_tick.elapsed() < LOCK_TICK_INTERVAL {
            return;
        }
        self.last_tick = Instant::now();

        if let Err(e) = self.publisher.store().lock().tick(Utc::now()) {
            warn!("Failed to tick session lock: {:#}", e);
        }
        let status = self.publisher.status();
        status.set_current_bytes(self.writer.bytes());
        status.set_elapsed(self.clock.elapsed());
        self.publisher.publish();
    }

    fn release_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
        }
    }

    /// End of stream, final flush and release of every resource
    fn cleanup(mut self, exit: ExitReason) -> SessionOutcome {
        let status = Arc::clone(self.publisher.status());
        status.set_state(SessionState::Stopping);
        self.clock.pause();

        if let Err(e) = self.encoder.finish() {
            warn!("Encoder {} failed to finish: {}", self.encoder.name(), e);
        }
        for packet in self.encoder.drain() {
            if let Err(e) = self.writer.append_packet(&packet) {
                warn!("Failed to write final packet: {}", e);
                break;
            }
        }
        let bytes = match self.writer.finish() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Final flush of {} failed: {}", self.writer.path().display(), e);
                self.writer.flushed_bytes()
            }
        };

        self.release_device();
        self.wake.release();
        self.focus.abandon();

        let duration = self.clock.elapsed();
        status.reset_session();
        status.set_elapsed(duration);
        match exit.error_message() {
            Some(message) => {
                status.set_error(Some(message.to_string()));
                status.set_state(SessionState::Error);
            }
            None => status.set_state(SessionState::Idle),
        }

        if let Err(e) = self.publisher.store().lock().clear() {
            warn!("Failed to clear session lock: {:#}", e);
        }
        self.publisher.publish();

        info!(
            "Recording session ended ({:?}): {} bytes, {:?}",
            exit, bytes, duration
        );

        SessionOutcome {
            path: self.writer.path().to_path_buf(),
            started_at: self.started_at,
            duration,
            bytes,
            sample_rate: self.writer.sample_rate(),
            reason: self.reason.clone(),
            exit,
        }
    }
}

fn write_exit(e: io::Error) -> ExitReason {
    if e.kind() == io::ErrorKind::StorageFull {
        warn!("Storage full while writing chunk; stopping");
        ExitReason::StorageLimit
    } else {
        error!("Chunk write failed: {}", e);
        ExitReason::WriteFailed(e.to_string())
    }
}

pub(crate) fn samples_to_duration(samples: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate))
}

/// Samples read per iteration: the device buffer, at least `MIN_FRAME`
pub(crate) fn frame_len(buffer_size: usize, sample_rate: u32) -> usize {
    let min = (u64::from(sample_rate) * MIN_FRAME.as_millis() as u64 / 1000) as usize;
    buffer_size.max(min).max(1)
}
