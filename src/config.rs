use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::engine::{CaptureSettings, SilenceStrategy};
use crate::recording::RecorderSettings;

/// Sample rates the encoder and frame headers accept
pub const SUPPORTED_SAMPLE_RATES: [u32; 3] = [16000, 44100, 48000];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Identifies this recorder in NATS messages (generated when empty)
    pub device_id: Option<String>,
    pub http: HttpConfig,
    /// Events are published to NATS when set
    pub nats_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "loqa-recorder".to_string(),
            device_id: None,
            http: HttpConfig::default(),
            nats_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 3400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub recordings_path: String,
    /// Per-chunk storage quota in bytes; reaching it stops recording
    pub quota_bytes: u64,
    /// Start recording on process start
    pub auto_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recordings_path: "~/.loqa/recordings".to_string(),
            quota_bytes: 512 * 1024 * 1024,
            auto_start: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub bitrate: u32,
    /// Split into a new chunk at this size (bytes)
    pub chunk_size_limit: u64,
    /// Voice onset level, i16 amplitude units
    pub silence_threshold: i32,
    pub silence_strategy: SilenceStrategy,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            bitrate: 32000,
            chunk_size_limit: 10 * 1024 * 1024,
            silence_threshold: 500,
            silence_strategy: SilenceStrategy::Standard,
        }
    }
}

impl Config {
    /// Load from an optional file, overlaid by `LOQA_RECORDER__*` variables
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("LOQA_RECORDER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        let cfg: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            bail!(
                "Unsupported sample rate {} (expected one of {:?})",
                self.audio.sample_rate,
                SUPPORTED_SAMPLE_RATES
            );
        }
        if self.audio.bitrate == 0 {
            bail!("Bitrate must be positive");
        }
        if self.audio.chunk_size_limit == 0 {
            bail!("Chunk size limit must be positive");
        }
        if self.storage.quota_bytes == 0 {
            bail!("Storage quota must be positive");
        }
        if !(0..=i32::from(i16::MAX)).contains(&self.audio.silence_threshold) {
            bail!(
                "Silence threshold {} outside 0..={}",
                self.audio.silence_threshold,
                i16::MAX
            );
        }
        Ok(())
    }

    /// Recordings directory with `~` expanded
    pub fn recordings_dir(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.storage.recordings_path)
            .with_context(|| format!("Failed to expand {}", self.storage.recordings_path))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            capture: CaptureSettings {
                sample_rate: self.audio.sample_rate,
                bitrate: self.audio.bitrate,
                storage_quota: self.storage.quota_bytes,
                silence_threshold: self.audio.silence_threshold.clamp(0, i32::from(i16::MAX)) as u16,
                silence_strategy: self.audio.silence_strategy,
            },
            chunk_size_limit: self.audio.chunk_size_limit,
            auto_start: self.storage.auto_start,
        }
    }
}
