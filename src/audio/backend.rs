use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::CaptureError;

/// Sample rates tried after the configured one, in order
pub const FALLBACK_SAMPLE_RATES: [u32; 3] = [16000, 44100, 48000];

/// Upper bound on a full acquisition attempt (start, resume, wake from backoff)
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between acquisition passes
pub const ACQUIRE_RETRY_PAUSE: Duration = Duration::from_millis(200);

/// An opened microphone delivering mono i16 PCM
#[async_trait]
pub trait CaptureDevice: Send {
    /// Sample rate the device was opened at
    fn sample_rate(&self) -> u32;

    /// Minimum buffer size (samples) the device was opened with
    fn buffer_size(&self) -> usize;

    /// Whether the device reached the initialized + started state
    fn is_started(&self) -> bool;

    /// Read up to `buf.len()` samples.
    ///
    /// `Ok(0)` is a soft read (no data yet); an error is a hard failure.
    async fn read(&mut self, buf: &mut [i16]) -> Result<usize, CaptureError>;

    /// Stop and power down the device. Idempotent.
    fn release(&mut self);
}

/// Opens capture devices
///
/// Implementations:
/// - cpal: the default input device
/// - synthetic: scripted signal for dry runs and tests
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Whether the process may use the microphone
    fn check_permission(&self) -> Result<(), CaptureError>;

    /// Minimum viable buffer size for a rate, `None` if the rate is unsupported
    fn min_buffer_size(&self, sample_rate: u32) -> Option<usize>;

    /// Open and start a device at the given rate
    async fn open(
        &self,
        sample_rate: u32,
        buffer_size: usize,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError>;

    /// Provider name for logging
    fn name(&self) -> &str;
}

/// Configured rate first, then the fallback list, without duplicates
pub fn candidate_rates(preferred: u32) -> Vec<u32> {
    let mut rates = vec![preferred];
    for rate in FALLBACK_SAMPLE_RATES {
        if !rates.contains(&rate) {
            rates.push(rate);
        }
    }
    rates
}

/// One pass over the candidate list; first device that delivers data wins.
pub async fn acquire_once(
    provider: &dyn DeviceProvider,
    rates: &[u32],
) -> Result<Box<dyn CaptureDevice>, CaptureError> {
    let mut last_error = CaptureError::Busy("no candidate sample rate available".to_string());

    for &rate in rates {
        let buffer_size = match provider.min_buffer_size(rate) {
            Some(size) if size > 0 => size,
            _ => {
                debug!("{}: {}Hz not supported", provider.name(), rate);
                continue;
            }
        };

        let mut device = match provider.open(rate, buffer_size).await {
            Ok(device) => device,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!("{}: open at {}Hz failed: {}", provider.name(), rate, e);
                last_error = e;
                continue;
            }
        };

        if !device.is_started() {
            debug!("{}: device at {}Hz never started", provider.name(), rate);
            device.release();
            last_error = CaptureError::Busy(format!("device at {}Hz did not start", rate));
            continue;
        }

        // A device can report started and still deliver nothing
        let mut probe = vec![0i16; buffer_size];
        match device.read(&mut probe).await {
            Ok(n) if n > 0 => {
                info!(
                    "{}: capture device acquired at {}Hz (buffer {} samples)",
                    provider.name(),
                    rate,
                    buffer_size
                );
                return Ok(device);
            }
            Ok(_) => {
                device.release();
                last_error = CaptureError::Busy(format!("no data from device at {}Hz", rate));
            }
            Err(e) => {
                device.release();
                if e.is_fatal() {
                    return Err(e);
                }
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Retry `acquire_once` with short pauses until `timeout` elapses.
///
/// Permission denial and a gone device end the loop immediately.
pub async fn acquire(
    provider: &dyn DeviceProvider,
    rates: &[u32],
    timeout: Duration,
) -> Result<Box<dyn CaptureDevice>, CaptureError> {
    let started = Instant::now();

    loop {
        match acquire_once(provider, rates).await {
            Ok(device) => return Ok(device),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let waited = started.elapsed();
                if waited >= timeout {
                    warn!("{}: giving up on capture device: {}", provider.name(), e);
                    return Err(CaptureError::AcquisitionTimedOut {
                        waited,
                        last: e.to_string(),
                    });
                }
                debug!("{}: acquisition retry after: {}", provider.name(), e);
            }
        }
        sleep(ACQUIRE_RETRY_PAUSE).await;
    }
}
