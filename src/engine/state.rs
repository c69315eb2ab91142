use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::events::{EventSink, RecorderEvent};
use crate::session::{SessionSnapshot, SessionStore};

/// Lifecycle of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Capturing,
    Paused,
    SilenceBackoff,
    Stopping,
    Error,
}

impl SessionState {
    const ALL: [SessionState; 7] = [
        SessionState::Idle,
        SessionState::Initializing,
        SessionState::Capturing,
        SessionState::Paused,
        SessionState::SilenceBackoff,
        SessionState::Stopping,
        SessionState::Error,
    ];

    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(SessionState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Capturing => "capturing",
            SessionState::Paused => "paused",
            SessionState::SilenceBackoff => "silence_backoff",
            SessionState::Stopping => "stopping",
            SessionState::Error => "error",
        }
    }

    /// States in which a session owns the device slot
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Capturing | SessionState::Paused | SessionState::SilenceBackoff
        )
    }
}

/// Why capture is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Explicit pause request
    User,
    /// Another component took audio focus
    Focus,
}

impl PauseReason {
    fn encode(reason: Option<PauseReason>) -> u8 {
        match reason {
            None => 0,
            Some(PauseReason::User) => 1,
            Some(PauseReason::Focus) => 2,
        }
    }

    fn decode(value: u8) -> Option<PauseReason> {
        match value {
            1 => Some(PauseReason::User),
            2 => Some(PauseReason::Focus),
            _ => None,
        }
    }
}

/// Point-in-time copy of the shared status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: SessionState,
    pub recording: bool,
    pub paused: bool,
    pub pause_reason: Option<PauseReason>,
    pub chunk_counter: u32,
    pub current_bytes: u64,
    pub elapsed_ms: u64,
    pub sample_rate: u32,
    pub backoff_ms: u64,
    pub last_error: Option<String>,
}

/// Status shared between the capture task and everyone observing it.
///
/// The capture task is the only writer of the per-session fields; the
/// chunk counter is owned by the finalizer.
#[derive(Debug, Default)]
pub struct SharedStatus {
    state: AtomicU8,
    is_recording: AtomicBool,
    is_paused: AtomicBool,
    pause_reason: AtomicU8,
    current_bytes: AtomicU64,
    chunk_counter: AtomicU32,
    elapsed_ms: AtomicU64,
    sample_rate: AtomicU32,
    backoff_ms: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl SharedStatus {
    pub fn new(chunk_counter: u32) -> Self {
        let status = Self::default();
        status.chunk_counter.store(chunk_counter, Ordering::SeqCst);
        status
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::SeqCst)
    }

    pub fn set_recording(&self, recording: bool) {
        self.is_recording.store(recording, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused.load(Ordering::SeqCst)
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        PauseReason::decode(self.pause_reason.load(Ordering::SeqCst))
    }

    /// `None` clears the paused flag
    pub fn set_paused(&self, reason: Option<PauseReason>) {
        self.pause_reason
            .store(PauseReason::encode(reason), Ordering::SeqCst);
        self.is_paused.store(reason.is_some(), Ordering::SeqCst);
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::SeqCst)
    }

    pub fn set_current_bytes(&self, bytes: u64) {
        self.current_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn chunk_counter(&self) -> u32 {
        self.chunk_counter.load(Ordering::SeqCst)
    }

    /// Returns the new value
    pub fn increment_chunk_counter(&self) -> u32 {
        self.chunk_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }

    pub fn set_elapsed(&self, elapsed: Duration) {
        self.elapsed_ms
            .store(elapsed.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::SeqCst)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::SeqCst);
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.load(Ordering::SeqCst))
    }

    pub fn set_backoff(&self, delay: Duration) {
        self.backoff_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<String> {
        match self.last_error.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_error(&self, error: Option<String>) {
        match self.last_error.write() {
            Ok(mut guard) => *guard = error,
            Err(poisoned) => *poisoned.into_inner() = error,
        }
    }

    /// Reset per-session fields when a session ends
    pub fn reset_session(&self) {
        self.set_recording(false);
        self.set_paused(None);
        self.set_current_bytes(0);
        self.set_backoff(Duration::ZERO);
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            state: self.state(),
            recording: self.is_recording(),
            paused: self.is_paused(),
            pause_reason: self.pause_reason(),
            chunk_counter: self.chunk_counter(),
            current_bytes: self.current_bytes(),
            elapsed_ms: self.elapsed().as_millis() as u64,
            sample_rate: self.sample_rate(),
            backoff_ms: self.backoff().as_millis() as u64,
            last_error: self.last_error(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            recording: self.is_recording(),
            paused: self.is_paused(),
            chunk_counter: self.chunk_counter(),
            current_bytes: self.current_bytes(),
        }
    }
}

/// Mirrors the shared status to the snapshot file and the event sink
pub struct StatePublisher {
    status: Arc<SharedStatus>,
    store: Arc<SessionStore>,
    events: Arc<dyn EventSink>,
}

impl StatePublisher {
    pub fn new(
        status: Arc<SharedStatus>,
        store: Arc<SessionStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            status,
            store,
            events,
        }
    }

    pub fn status(&self) -> &Arc<SharedStatus> {
        &self.status
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Persist the snapshot and emit `state-changed`.
    ///
    /// A failed snapshot write is logged; the event is still emitted.
    pub fn publish(&self) {
        let snapshot = self.status.snapshot();
        if let Err(e) = self.store.snapshot().write(&snapshot) {
            warn!("Failed to persist state snapshot: {:#}", e);
        }
        self.events.emit(RecorderEvent::StateChanged {
            status: self.status.report(),
            snapshot,
        });
    }
}

/// Cooperative control flags for the capture task
#[derive(Debug)]
pub struct SessionControl {
    should_continue: AtomicBool,
    wakeup: Notify,
}

impl SessionControl {
    pub fn new() -> Self {
        Self {
            should_continue: AtomicBool::new(true),
            wakeup: Notify::new(),
        }
    }

    pub fn should_continue(&self) -> bool {
        self.should_continue.load(Ordering::SeqCst)
    }

    /// Clear the continue flag and nudge any wait
    pub fn request_stop(&self) {
        self.should_continue.store(false, Ordering::SeqCst);
        self.wake();
    }

    /// Single stored permit: repeated wakeups before a wait collapse to one
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Sleep for `delay` unless woken first; returns true when woken
    pub async fn wait(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.wakeup.notified() => true,
        }
    }
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Pause-adjusted recording duration
#[derive(Debug, Clone)]
pub struct DurationClock {
    accumulated: Duration,
    anchor: Option<Instant>,
}

impl DurationClock {
    pub fn started() -> Self {
        Self {
            accumulated: Duration::ZERO,
            anchor: Some(Instant::now()),
        }
    }

    /// Fold the running stretch into the total
    pub fn pause(&mut self) {
        if let Some(anchor) = self.anchor.take() {
            self.accumulated += anchor.elapsed();
        }
    }

    pub fn resume(&mut self) {
        if self.anchor.is_none() {
            self.anchor = Some(Instant::now());
        }
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.accumulated + self.anchor.map(|a| a.elapsed()).unwrap_or_default()
    }
}
