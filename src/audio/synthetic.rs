// Simulated microphone
//
// Plays back a scripted loudness envelope in real time (tokio time), so the
// whole pipeline can run without audio hardware: dry runs from the CLI,
// CI machines, and tests that need to inject device faults.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::backend::{CaptureDevice, DeviceProvider};
use crate::error::CaptureError;

/// One stretch of the scripted signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub duration: Duration,
    /// Square-wave amplitude (equals the RMS); 0 is silence
    pub amplitude: i16,
}

impl Segment {
    pub fn voice(duration: Duration, amplitude: i16) -> Self {
        Self {
            duration,
            amplitude,
        }
    }

    pub fn silence(duration: Duration) -> Self {
        Self {
            duration,
            amplitude: 0,
        }
    }
}

/// A recorded `open` call
#[derive(Debug, Clone, Copy)]
pub struct OpenRecord {
    pub sample_rate: u32,
    pub at: Instant,
    pub succeeded: bool,
}

struct SyntheticState {
    origin: Instant,
    script: Vec<Segment>,
    tail_amplitude: i16,
    permission: AtomicBool,
    gone: AtomicBool,
    denied_opens: AtomicUsize,
    failing_opens: AtomicUsize,
    read_faults: AtomicUsize,
    live_devices: AtomicUsize,
    opens: Mutex<Vec<OpenRecord>>,
}

impl SyntheticState {
    fn amplitude_at(&self, at: Duration) -> i16 {
        let mut start = Duration::ZERO;
        for segment in &self.script {
            let end = start + segment.duration;
            if at < end {
                return segment.amplitude;
            }
            start = end;
        }
        self.tail_amplitude
    }

    fn record_open(&self, sample_rate: u32, succeeded: bool) {
        let record = OpenRecord {
            sample_rate,
            at: Instant::now(),
            succeeded,
        };
        match self.opens.lock() {
            Ok(mut opens) => opens.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    /// Atomically consume one unit of an injected fault counter
    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Device provider producing a scripted signal.
///
/// Time zero is provider creation; devices opened later start at the current
/// script position, like a real microphone that was powered down for a while.
pub struct SyntheticProvider {
    state: Arc<SyntheticState>,
    supported_rates: Vec<u32>,
    buffer_ms: u32,
}

impl SyntheticProvider {
    /// Script followed by silence
    pub fn new(script: Vec<Segment>) -> Self {
        Self {
            state: Arc::new(SyntheticState {
                origin: Instant::now(),
                script,
                tail_amplitude: 0,
                permission: AtomicBool::new(true),
                gone: AtomicBool::new(false),
                denied_opens: AtomicUsize::new(0),
                failing_opens: AtomicUsize::new(0),
                read_faults: AtomicUsize::new(0),
                live_devices: AtomicUsize::new(0),
                opens: Mutex::new(Vec::new()),
            }),
            supported_rates: vec![16000, 44100, 48000],
            buffer_ms: 20,
        }
    }

    /// Continuous tone of the given amplitude
    pub fn constant(amplitude: i16) -> Self {
        Self::new(Vec::new()).with_tail(amplitude)
    }

    /// Amplitude used after the script runs out
    pub fn with_tail(mut self, amplitude: i16) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.tail_amplitude = amplitude;
        }
        self
    }

    /// Restrict the rates the simulated hardware supports
    pub fn with_rates(mut self, rates: Vec<u32>) -> Self {
        self.supported_rates = rates;
        self
    }

    pub fn set_permission(&self, granted: bool) {
        self.state.permission.store(granted, Ordering::SeqCst);
    }

    /// Mark the device as permanently gone (or back)
    pub fn set_gone(&self, gone: bool) {
        self.state.gone.store(gone, Ordering::SeqCst);
    }

    /// Make the next `n` opens fail with a permission error while the
    /// permission check still passes, as when access is revoked mid-start
    pub fn deny_next_opens(&self, n: usize) {
        self.state.denied_opens.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` opens fail with a busy error
    pub fn fail_next_opens(&self, n: usize) {
        self.state.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail as if the device was invalidated
    pub fn inject_read_faults(&self, n: usize) {
        self.state.read_faults.store(n, Ordering::SeqCst);
    }

    /// Every open attempt so far
    pub fn opens(&self) -> Vec<OpenRecord> {
        match self.state.opens.lock() {
            Ok(opens) => opens.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Successful opens so far
    pub fn successful_opens(&self) -> usize {
        self.opens().iter().filter(|o| o.succeeded).count()
    }

    /// Devices opened and not yet released
    pub fn live_devices(&self) -> usize {
        self.state.live_devices.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceProvider for SyntheticProvider {
    fn check_permission(&self) -> Result<(), CaptureError> {
        if self.state.permission.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CaptureError::PermissionDenied)
        }
    }

    fn min_buffer_size(&self, sample_rate: u32) -> Option<usize> {
        if !self.supported_rates.contains(&sample_rate) {
            return None;
        }
        Some((sample_rate * self.buffer_ms / 1000) as usize)
    }

    async fn open(
        &self,
        sample_rate: u32,
        buffer_size: usize,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let state = &self.state;

        if !state.permission.load(Ordering::SeqCst) || SyntheticState::take_one(&state.denied_opens)
        {
            state.record_open(sample_rate, false);
            return Err(CaptureError::PermissionDenied);
        }
        if state.gone.load(Ordering::SeqCst) {
            state.record_open(sample_rate, false);
            return Err(CaptureError::Gone("synthetic device removed".to_string()));
        }
        if SyntheticState::take_one(&state.failing_opens) {
            state.record_open(sample_rate, false);
            return Err(CaptureError::Busy("synthetic device busy".to_string()));
        }

        state.record_open(sample_rate, true);
        state.live_devices.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SyntheticDevice {
            state: Arc::clone(state),
            sample_rate,
            buffer_size,
            released: false,
        }))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

struct SyntheticDevice {
    state: Arc<SyntheticState>,
    sample_rate: u32,
    buffer_size: usize,
    released: bool,
}

#[async_trait]
impl CaptureDevice for SyntheticDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn is_started(&self) -> bool {
        !self.released
    }

    async fn read(&mut self, buf: &mut [i16]) -> Result<usize, CaptureError> {
        if self.released {
            return Err(CaptureError::Invalidated("device released".to_string()));
        }

        // Deliver in real time
        let micros = buf.len() as u64 * 1_000_000 / u64::from(self.sample_rate);
        sleep(Duration::from_micros(micros)).await;

        if self.state.gone.load(Ordering::SeqCst) {
            return Err(CaptureError::Gone("synthetic device removed".to_string()));
        }
        if SyntheticState::take_one(&self.state.read_faults) {
            return Err(CaptureError::Invalidated("injected read fault".to_string()));
        }

        let amplitude = self.state.amplitude_at(self.state.origin.elapsed());
        for (i, sample) in buf.iter_mut().enumerate() {
            *sample = if i % 2 == 0 { amplitude } else { amplitude.saturating_neg() };
        }
        Ok(buf.len())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.state.live_devices.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.release();
    }
}
