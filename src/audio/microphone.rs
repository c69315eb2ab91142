// Microphone capture through cpal
//
// cpal streams are not Send on every platform, so each opened device owns a
// dedicated thread that builds, plays and finally drops the stream. Samples
// cross over to the capture loop through a bounded channel; the audio
// callback never blocks and drops buffers when the loop falls behind.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, SampleRate, StreamConfig, SupportedBufferSize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::backend::{CaptureDevice, DeviceProvider};
use crate::error::CaptureError;

/// How long a read waits for the callback before reporting a soft (empty) read
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// How long `open` waits for the stream thread to report
const OPEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback buffers queued between the audio thread and the loop
const CHANNEL_DEPTH: usize = 64;

/// Default input device via the platform host
pub struct CpalProvider {
    host_id: cpal::HostId,
}

impl CpalProvider {
    pub fn new() -> Self {
        Self {
            host_id: cpal::default_host().id(),
        }
    }

    fn input_device(&self) -> Result<cpal::Device, CaptureError> {
        let host = cpal::host_from_id(self.host_id)
            .map_err(|e| CaptureError::Gone(format!("audio host unavailable: {}", e)))?;
        host.default_input_device()
            .ok_or_else(|| CaptureError::Gone("no input device".to_string()))
    }
}

impl Default for CpalProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Find a supported input config that can run at `sample_rate`
fn config_for_rate(
    device: &cpal::Device,
    sample_rate: u32,
) -> Option<(StreamConfig, SampleFormat, Option<u32>)> {
    let ranges = device.supported_input_configs().ok()?;
    let mut best: Option<cpal::SupportedStreamConfigRange> = None;

    for range in ranges {
        if range.min_sample_rate().0 > sample_rate || range.max_sample_rate().0 < sample_rate {
            continue;
        }
        // Prefer mono, then i16, then whatever comes first
        let better = match &best {
            None => true,
            Some(current) => {
                (range.channels() == 1 && current.channels() != 1)
                    || (range.channels() == current.channels()
                        && range.sample_format() == SampleFormat::I16
                        && current.sample_format() != SampleFormat::I16)
            }
        };
        if better {
            best = Some(range);
        }
    }

    let range = best?;
    let min_buffer = match range.buffer_size() {
        SupportedBufferSize::Range { min, .. } => Some(*min),
        SupportedBufferSize::Unknown => None,
    };
    let format = range.sample_format();
    let supported = range.with_sample_rate(SampleRate(sample_rate));
    Some((supported.config(), format, min_buffer))
}

#[async_trait]
impl DeviceProvider for CpalProvider {
    fn check_permission(&self) -> Result<(), CaptureError> {
        // Desktop hosts have no permission gate; a missing device is reported at open
        Ok(())
    }

    fn min_buffer_size(&self, sample_rate: u32) -> Option<usize> {
        let device = self.input_device().ok()?;
        let (_, _, min_buffer) = config_for_rate(&device, sample_rate)?;
        let fallback = sample_rate / 50; // 20 ms
        Some(min_buffer.filter(|&m| m > 0).unwrap_or(fallback).max(fallback) as usize)
    }

    async fn open(
        &self,
        sample_rate: u32,
        buffer_size: usize,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let device = self.input_device()?;
        let (config, format, _) = config_for_rate(&device, sample_rate)
            .ok_or_else(|| CaptureError::Busy(format!("{}Hz not supported", sample_rate)))?;

        let (sample_tx, sample_rx) = mpsc::channel::<Vec<i16>>(CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let failed = Arc::new(AtomicBool::new(false));
        let failed_flag = Arc::clone(&failed);

        let thread = std::thread::Builder::new()
            .name("cpal-capture".to_string())
            .spawn(move || {
                let stream = match build_stream(&device, &config, format, sample_tx, failed_flag)
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CaptureError::Busy(format!(
                        "failed to start stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until released
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::Busy(format!("failed to spawn capture thread: {}", e)))?;

        match timeout(OPEN_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                let _ = thread.join();
                return Err(e);
            }
            Ok(Err(_)) => {
                let _ = thread.join();
                return Err(CaptureError::Busy("capture thread exited".to_string()));
            }
            Err(_) => {
                let _ = stop_tx.send(());
                return Err(CaptureError::Busy("stream start timed out".to_string()));
            }
        }

        info!("cpal input stream running at {}Hz", sample_rate);

        Ok(Box::new(CpalDevice {
            sample_rate,
            buffer_size,
            samples: sample_rx,
            pending: VecDeque::new(),
            failed,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    tx: mpsc::Sender<Vec<i16>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, CaptureError> {
    match format {
        SampleFormat::I16 => build_typed::<i16>(device, config, tx, failed),
        SampleFormat::U16 => build_typed::<u16>(device, config, tx, failed),
        SampleFormat::F32 => build_typed::<f32>(device, config, tx, failed),
        other => Err(CaptureError::Busy(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: mpsc::Sender<Vec<i16>>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels.max(1) as usize;

    let err_fn = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => {
            error!("Capture device disappeared");
            failed.store(true, Ordering::SeqCst);
        }
        other => warn!("Audio stream error: {}", other),
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<i16> = data
                    .chunks(channels)
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| s.to_sample::<f32>())
                            .sum();
                        let avg = (sum / frame.len() as f32).clamp(-1.0, 1.0);
                        (avg * i16::MAX as f32) as i16
                    })
                    .collect();

                // Never block the audio thread
                let _ = tx.try_send(mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::Gone("input device not available".to_string())
            }
            other => CaptureError::Busy(format!("failed to build input stream: {}", other)),
        })
}

struct CpalDevice {
    sample_rate: u32,
    buffer_size: usize,
    samples: mpsc::Receiver<Vec<i16>>,
    pending: VecDeque<i16>,
    failed: Arc<AtomicBool>,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

#[async_trait]
impl CaptureDevice for CpalDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn is_started(&self) -> bool {
        self.stop_tx.is_some() && !self.failed.load(Ordering::SeqCst)
    }

    async fn read(&mut self, buf: &mut [i16]) -> Result<usize, CaptureError> {
        if self.stop_tx.is_none() {
            return Err(CaptureError::Invalidated("device released".to_string()));
        }

        while self.pending.len() < buf.len() {
            if self.failed.load(Ordering::SeqCst) {
                return Err(CaptureError::Invalidated("stream reported device loss".to_string()));
            }
            match timeout(READ_TIMEOUT, self.samples.recv()).await {
                Ok(Some(chunk)) => self.pending.extend(chunk),
                Ok(None) => {
                    return Err(CaptureError::Invalidated("capture stream closed".to_string()))
                }
                Err(_) => break,
            }
        }

        let n = self.pending.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn release(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked during release");
            }
            debug!("cpal capture device released");
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.release();
    }
}
