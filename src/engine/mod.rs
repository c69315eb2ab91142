//! Capture/encode engine
//!
//! `Engine` owns at most one recording session at a time:
//! - Device acquisition with a prioritized sample-rate list
//! - Real-time capture loop (VAD, pre-roll, power-saving backoff)
//! - Pause/resume (user or audio focus) and forced wakeup
//! - Cleanup that always releases device, wake token and focus

mod backoff;
mod capture_loop;
mod focus;
mod state;

pub use backoff::{
    ExponentialBackoff, RECOVERY_BACKOFF_BASE, RECOVERY_BACKOFF_CAP, SILENCE_BACKOFF_BASE,
    SILENCE_BACKOFF_CAP,
};
pub use capture_loop::{
    ExitReason, SessionOutcome, DEEP_SILENCE, LOCK_TICK_INTERVAL, MIN_FRAME, SILENCE_HOLD,
};
pub use focus::{AudioFocus, ExclusiveFocus, FocusListener, ProcessWakeToken, WakeToken};
pub use state::{
    DurationClock, PauseReason, SessionControl, SessionState, SharedStatus, StatePublisher,
    StatusReport,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::audio::backend::{acquire, candidate_rates, ACQUIRE_TIMEOUT};
use crate::audio::{create_encoder, ChunkWriter, DeviceProvider, PreRollBuffer, VoiceActivityDetector};
use crate::error::StartError;
use crate::events::EventSink;
use crate::session::{SessionLock, SessionStore};
use capture_loop::{frame_len, CaptureTask, LiveGuard};

/// What the engine does once silence outlasts the hold window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceStrategy {
    /// Keep the microphone powered, record nothing
    #[default]
    Standard,
    /// Power the microphone down with exponential backoff
    Aggressive,
}

/// Parameters read at session start
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    /// Preferred sample rate (Hz)
    pub sample_rate: u32,
    /// Encoder bitrate (bits/s)
    pub bitrate: u32,
    /// Stop cleanly once the chunk reaches this size
    pub storage_quota: u64,
    /// Voice onset level in i16 amplitude units
    pub silence_threshold: u16,
    pub silence_strategy: SilenceStrategy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            bitrate: 32000,
            storage_quota: 512 * 1024 * 1024,
            silence_threshold: 500,
            silence_strategy: SilenceStrategy::Standard,
        }
    }
}

struct ActiveSession {
    handle: JoinHandle<SessionOutcome>,
    path: PathBuf,
    /// Kept alive so the focus arbiter can reach the session
    _focus_relay: Arc<dyn FocusListener>,
}

/// Turns focus changes into pause/resume requests
struct FocusRelay {
    status: Arc<SharedStatus>,
    control: Arc<SessionControl>,
}

impl FocusListener for FocusRelay {
    fn on_focus_lost(&self) {
        if !self.status.is_paused() {
            self.status.set_paused(Some(PauseReason::Focus));
            self.control.wake();
        }
    }

    fn on_focus_gained(&self) {
        // A user pause outranks focus
        if self.status.pause_reason() == Some(PauseReason::Focus) {
            self.status.set_paused(None);
            self.control.wake();
        }
    }
}

/// The capture/encode engine
pub struct Engine {
    provider: Arc<dyn DeviceProvider>,
    focus: Arc<dyn AudioFocus>,
    wake: Arc<dyn WakeToken>,
    status: Arc<SharedStatus>,
    publisher: Arc<StatePublisher>,
    /// Task is running (cleared by the task itself)
    live: Arc<AtomicBool>,
    /// Control of the current session, for sync stop/wakeup
    control: StdMutex<Option<Arc<SessionControl>>>,
    session: Mutex<Option<ActiveSession>>,
    completed: StdMutex<VecDeque<SessionOutcome>>,
}

impl Engine {
    /// Engine with in-process focus and wake token
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        store: Arc<SessionStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        // The chunk counter survives restarts through the snapshot
        let chunk_counter = store.snapshot().read().chunk_counter;
        let status = Arc::new(SharedStatus::new(chunk_counter));
        let publisher = Arc::new(StatePublisher::new(Arc::clone(&status), store, events));

        Self {
            provider,
            focus: Arc::new(ExclusiveFocus::new()),
            wake: Arc::new(ProcessWakeToken::new()),
            status,
            publisher,
            live: Arc::new(AtomicBool::new(false)),
            control: StdMutex::new(None),
            session: Mutex::new(None),
            completed: StdMutex::new(VecDeque::new()),
        }
    }

    pub fn with_focus(mut self, focus: Arc<dyn AudioFocus>) -> Self {
        self.focus = focus;
        self
    }

    pub fn with_wake_token(mut self, wake: Arc<dyn WakeToken>) -> Self {
        self.wake = wake;
        self
    }

    /// Start a session writing to `file`.
    ///
    /// Returns once the device is acquired and the capture task is running.
    pub async fn start(
        &self,
        file: impl AsRef<Path>,
        reason: &str,
        settings: &CaptureSettings,
    ) -> Result<(), StartError> {
        let file = file.as_ref().to_path_buf();
        let mut session = self.session.lock().await;

        if let Some(active) = session.take() {
            if !active.handle.is_finished() {
                *session = Some(active);
                warn!("Start rejected: a recording session is already active");
                return Err(StartError::AlreadyActive);
            }
            self.collect(active).await;
        }

        info!("Starting recording session ({}): {}", reason, file.display());

        self.provider.check_permission().map_err(StartError::from)?;

        if !self.wake.acquire() {
            return Err(StartError::WakeTokenUnavailable);
        }

        let control = Arc::new(SessionControl::new());
        let relay: Arc<dyn FocusListener> = Arc::new(FocusRelay {
            status: Arc::clone(&self.status),
            control: Arc::clone(&control),
        });
        if !self.focus.request(Arc::downgrade(&relay)) {
            self.wake.release();
            return Err(StartError::FocusDenied);
        }

        self.status.set_state(SessionState::Initializing);
        self.status.set_paused(None);
        self.status.set_error(None);

        let task = match self.prepare(&file, reason, settings, &control).await {
            Ok(task) => task,
            Err(e) => {
                self.wake.release();
                self.focus.abandon();
                let message = match std::error::Error::source(&e) {
                    Some(source) => format!("{}: {}", e, source),
                    None => e.to_string(),
                };
                self.status.set_state(SessionState::Error);
                self.status.set_error(Some(message));
                self.publisher.publish();
                error!("Failed to start recording session: {}", e);
                return Err(e);
            }
        };

        let lock = SessionLock::new(reason, Some(file.clone()), Utc::now());
        if let Err(e) = self.publisher.store().lock().acquire(&lock) {
            // Recording goes on, but a crash would not be detected
            warn!("Failed to write session lock: {:#}", e);
            self.status
                .set_error(Some(format!("session lock not written: {:#}", e)));
        }

        self.status.set_recording(true);
        self.status.set_current_bytes(task.writer.bytes());
        self.status.set_elapsed(std::time::Duration::ZERO);
        self.status.set_backoff(std::time::Duration::ZERO);
        self.status.set_state(SessionState::Capturing);
        self.publisher.publish();

        let handle = tokio::spawn(task.run());
        *self.current_control() = Some(control);
        *session = Some(ActiveSession {
            handle,
            path: file,
            _focus_relay: relay,
        });

        info!("Recording session started");
        Ok(())
    }

    /// Acquire device, open the chunk file and build the encoder
    async fn prepare(
        &self,
        file: &Path,
        reason: &str,
        settings: &CaptureSettings,
        control: &Arc<SessionControl>,
    ) -> Result<CaptureTask, StartError> {
        let rates = candidate_rates(settings.sample_rate);
        let mut device = acquire(self.provider.as_ref(), &rates, ACQUIRE_TIMEOUT)
            .await
            .map_err(StartError::from)?;
        let sample_rate = device.sample_rate();

        let samples = frame_len(device.buffer_size(), sample_rate);
        let mut frame = Vec::new();
        if frame.try_reserve_exact(samples).is_err() {
            device.release();
            return Err(StartError::OutOfMemory);
        }
        frame.resize(samples, 0i16);

        let preroll = match PreRollBuffer::for_rate(sample_rate) {
            Ok(preroll) => preroll,
            Err(_) => {
                device.release();
                return Err(StartError::OutOfMemory);
            }
        };

        let existed = file.exists();
        let writer = match ChunkWriter::create(file, sample_rate) {
            Ok(writer) => writer,
            Err(e) => {
                device.release();
                return Err(StartError::Io(e));
            }
        };

        let encoder = match create_encoder(sample_rate, settings.bitrate) {
            Ok(encoder) => encoder,
            Err(e) => {
                device.release();
                drop(writer);
                if !existed {
                    remove_empty(file);
                }
                return Err(StartError::Encoder(e.to_string()));
            }
        };

        self.status.set_sample_rate(sample_rate);
        self.live.store(true, Ordering::SeqCst);

        Ok(CaptureTask {
            provider: Arc::clone(&self.provider),
            control: Arc::clone(control),
            publisher: Arc::clone(&self.publisher),
            wake: Arc::clone(&self.wake),
            focus: Arc::clone(&self.focus),
            settings: settings.clone(),
            reason: reason.to_string(),
            started_at: Utc::now(),
            device: Some(device),
            encoder,
            writer,
            frame,
            preroll,
            vad: VoiceActivityDetector::new(f32::from(settings.silence_threshold)),
            clock: DurationClock::started(),
            silence_backoff: ExponentialBackoff::silence(),
            silent_samples: 0,
            last_tick: Instant::now(),
            _live: LiveGuard(Arc::clone(&self.live)),
        })
    }

    /// Ask the current session to stop; returns immediately
    pub fn stop(&self) {
        if let Some(control) = self.current_control().as_ref() {
            info!("Stop requested");
            control.request_stop();
        }
    }

    /// Stop and wait for cleanup. `None` when there was nothing to stop.
    pub async fn stop_and_wait(&self) -> Option<SessionOutcome> {
        self.stop();
        let active = self.session.lock().await.take();
        // A start may have completed while we waited for the lock
        self.stop();
        let outcome = match active {
            Some(active) => self.join(active).await,
            None => None,
        };
        *self.current_control() = None;
        outcome.or_else(|| self.pop_completed())
    }

    /// Outcome of a session that ended on its own (quota, device loss)
    pub async fn take_finished(&self) -> Option<SessionOutcome> {
        if let Some(outcome) = self.pop_completed() {
            return Some(outcome);
        }

        let mut session = self.session.lock().await;
        let finished = session
            .as_ref()
            .map(|active| active.handle.is_finished())
            .unwrap_or(false);
        if !finished {
            return None;
        }
        let active = session.take()?;
        drop(session);
        *self.current_control() = None;
        self.join(active).await
    }

    pub fn pause(&self) -> bool {
        self.request_pause(PauseReason::User)
    }

    pub fn resume(&self) -> bool {
        if !self.is_active() || !self.status.is_paused() {
            return false;
        }
        info!("Resume requested");
        self.status.set_paused(None);
        self.nudge();
        true
    }

    /// Cut a power-saving backoff short. No-op without a session.
    pub fn force_wakeup(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        info!("Forced wakeup");
        self.nudge();
        true
    }

    /// Whether a capture task is running
    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StatusReport {
        self.status.report()
    }

    pub fn shared_status(&self) -> &Arc<SharedStatus> {
        &self.status
    }

    pub fn publisher(&self) -> &Arc<StatePublisher> {
        &self.publisher
    }

    /// Chunk path of the running session
    pub async fn current_path(&self) -> Option<PathBuf> {
        self.session.lock().await.as_ref().map(|s| s.path.clone())
    }

    fn request_pause(&self, reason: PauseReason) -> bool {
        if !self.is_active() || self.status.is_paused() {
            return false;
        }
        info!("Pause requested ({:?})", reason);
        self.status.set_paused(Some(reason));
        self.nudge();
        true
    }

    fn nudge(&self) {
        if let Some(control) = self.current_control().as_ref() {
            control.wake();
        }
    }

    async fn collect(&self, active: ActiveSession) {
        if let Some(outcome) = self.join(active).await {
            let mut completed = match self.completed.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            completed.push_back(outcome);
        }
    }

    async fn join(&self, active: ActiveSession) -> Option<SessionOutcome> {
        match active.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(
                    "Capture task for {} did not finish cleanly: {}",
                    active.path.display(),
                    e
                );
                None
            }
        }
    }

    fn pop_completed(&self) -> Option<SessionOutcome> {
        let mut completed = match self.completed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        completed.pop_front()
    }

    fn current_control(&self) -> std::sync::MutexGuard<'_, Option<Arc<SessionControl>>> {
        match self.control.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn remove_empty(path: &Path) {
    let empty = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false);
    if empty {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove empty chunk {}: {}", path.display(), e);
        }
    }
}
