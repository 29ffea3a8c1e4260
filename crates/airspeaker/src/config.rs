//! Configuration loading and resolution.
//!
//! The TOML file is optional; every field has a default. CLI flags are applied on
//! top of the file by [`SpeakerConfig::apply_overrides`] before resolving.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::broadcast::{BroadcastConfig, DEFAULT_MIN_FLUSH_BYTES};

pub const DEFAULT_PORT: u16 = 18573;
pub const DEFAULT_STREAM_PATH: &str = "/stream";
pub const DEFAULT_STREAM_NAME: &str = "AirSpeaker";
pub const DEFAULT_AUDIO_DEVICE: &str = "BlackHole 2ch";

/// Output codec; selects the encoder flags and the HTTP content type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// AAC in ADTS framing (lower latency on Cast receivers).
    #[default]
    Aac,
    /// MPEG-1 Layer III.
    Mp3,
}

impl Codec {
    /// MIME type announced over HTTP and in the Cast load request.
    pub fn content_type(self) -> &'static str {
        match self {
            Codec::Aac => "audio/aac",
            Codec::Mp3 => "audio/mpeg",
        }
    }

    /// Encoder name passed to `-acodec`.
    pub(crate) fn encoder_name(self) -> &'static str {
        match self {
            Codec::Aac => "aac",
            Codec::Mp3 => "libmp3lame",
        }
    }

    /// Container passed to `-f`.
    pub(crate) fn container(self) -> &'static str {
        match self {
            Codec::Aac => "adts",
            Codec::Mp3 => "mp3",
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpeakerConfig {
    /// HTTP streaming settings.
    pub stream: Option<StreamSection>,
    /// Capture/encoder process settings.
    pub encoder: Option<EncoderSection>,
    /// Cast discovery and watchdog settings.
    pub cast: Option<CastSection>,
}

/// `[stream]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamSection {
    /// Listening port (all interfaces).
    pub port: Option<u16>,
    /// Fixed request path, e.g. `/stream`.
    pub path: Option<String>,
    /// Active codec.
    pub codec: Option<Codec>,
    /// Value of the `icy-name` response header.
    pub name: Option<String>,
    /// Host used in the public stream URL (defaults to the LAN address).
    pub public_host: Option<String>,
    /// Minimum buffered bytes before a pull flushes early.
    pub min_flush_bytes: Option<usize>,
    /// Per-connection pull timeout in milliseconds.
    pub pull_timeout_ms: Option<u64>,
    /// Optional per-consumer buffer cap in bytes (unbounded when absent).
    pub max_consumer_bytes: Option<usize>,
    /// HTTP worker threads.
    pub workers: Option<usize>,
}

/// `[encoder]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncoderSection {
    /// Encoder executable.
    pub program: Option<String>,
    /// Capture input format (`-f`), e.g. `avfoundation` or `pulse`.
    pub input_format: Option<String>,
    /// Capture device name.
    pub audio_device: Option<String>,
    /// Target bitrate, e.g. `192k`.
    pub bitrate: Option<String>,
    /// Sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Channel count.
    pub channels: Option<u16>,
}

/// `[cast]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CastSection {
    /// Discovery window in seconds.
    pub discovery_timeout_secs: Option<u64>,
    /// Watchdog poll interval in seconds.
    pub poll_interval_secs: Option<u64>,
    /// Consecutive idle polls that count as a stall.
    pub idle_threshold: Option<u32>,
    /// Seconds after (re)connect or replay during which idle is ignored.
    pub grace_period_secs: Option<u64>,
    /// Seconds to wait for the receiver during connect/play.
    pub connect_timeout_secs: Option<u64>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub port: Option<u16>,
    pub codec: Option<Codec>,
    pub audio_device: Option<String>,
    pub public_host: Option<String>,
}

/// Resolved HTTP streaming settings.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub port: u16,
    pub path: String,
    pub codec: Codec,
    pub name: String,
    pub public_host: Option<String>,
    pub pull_timeout: Duration,
    pub workers: usize,
    pub broadcast: BroadcastConfig,
}

/// Resolved encoder settings.
#[derive(Clone, Debug)]
pub struct EncoderSettings {
    pub program: String,
    pub input_format: String,
    pub audio_device: String,
    pub bitrate: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Resolved discovery/watchdog settings.
#[derive(Clone, Debug)]
pub struct CastSettings {
    pub discovery_timeout: Duration,
    pub connect_timeout: Duration,
    pub watchdog: WatchdogSettings,
}

/// Watchdog tuning. Both the idle threshold and the grace window depend on how a
/// given receiver family buffers, so neither is hardcoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub poll_interval: Duration,
    pub idle_threshold: u32,
    pub grace_period: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            idle_threshold: 2,
            grace_period: Duration::from_secs(15),
        }
    }
}

/// Everything the runtime needs.
#[derive(Clone, Debug)]
pub struct Settings {
    pub stream: StreamSettings,
    pub encoder: EncoderSettings,
    pub cast: CastSettings,
}

impl SpeakerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse configuration from TOML text.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<SpeakerConfig>(raw)?)
    }

    /// Apply command-line overrides.
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        let stream = self.stream.get_or_insert_with(StreamSection::default);
        if let Some(port) = overrides.port {
            stream.port = Some(port);
        }
        if let Some(codec) = overrides.codec {
            stream.codec = Some(codec);
        }
        if let Some(host) = overrides.public_host.as_ref() {
            stream.public_host = Some(host.clone());
        }
        if let Some(device) = overrides.audio_device.as_ref() {
            self.encoder
                .get_or_insert_with(EncoderSection::default)
                .audio_device = Some(device.clone());
        }
    }

    /// Resolve defaults and validate.
    pub fn resolve(&self) -> Result<Settings> {
        Ok(Settings {
            stream: stream_settings_from_config(self)?,
            encoder: encoder_settings_from_config(self)?,
            cast: cast_settings_from_config(self)?,
        })
    }
}

/// Resolve the `[stream]` table.
pub fn stream_settings_from_config(cfg: &SpeakerConfig) -> Result<StreamSettings> {
    let empty = StreamSection::default();
    let s = cfg.stream.as_ref().unwrap_or(&empty);

    let path = s
        .path
        .as_deref()
        .map(str::trim)
        .unwrap_or(DEFAULT_STREAM_PATH)
        .to_string();
    if !path.starts_with('/') {
        return Err(anyhow::anyhow!("stream.path must start with '/': {path:?}"));
    }

    let min_flush_bytes = s.min_flush_bytes.unwrap_or(DEFAULT_MIN_FLUSH_BYTES);
    if min_flush_bytes == 0 {
        return Err(anyhow::anyhow!("stream.min_flush_bytes must be positive"));
    }
    if let Some(cap) = s.max_consumer_bytes {
        if cap < min_flush_bytes {
            return Err(anyhow::anyhow!(
                "stream.max_consumer_bytes ({cap}) must be at least min_flush_bytes ({min_flush_bytes})"
            ));
        }
    }

    let pull_timeout_ms = s.pull_timeout_ms.unwrap_or(2000);
    if pull_timeout_ms == 0 {
        return Err(anyhow::anyhow!("stream.pull_timeout_ms must be positive"));
    }

    Ok(StreamSettings {
        port: s.port.unwrap_or(DEFAULT_PORT),
        path,
        codec: s.codec.unwrap_or_default(),
        name: non_empty(s.name.as_deref()).unwrap_or_else(|| DEFAULT_STREAM_NAME.to_string()),
        public_host: non_empty(s.public_host.as_deref()),
        pull_timeout: Duration::from_millis(pull_timeout_ms),
        workers: s.workers.unwrap_or(2).max(1),
        broadcast: BroadcastConfig {
            min_flush_bytes,
            max_consumer_bytes: s.max_consumer_bytes,
        },
    })
}

/// Resolve the `[encoder]` table.
pub fn encoder_settings_from_config(cfg: &SpeakerConfig) -> Result<EncoderSettings> {
    let empty = EncoderSection::default();
    let e = cfg.encoder.as_ref().unwrap_or(&empty);
    let channels = e.channels.unwrap_or(2);
    if channels == 0 {
        return Err(anyhow::anyhow!("encoder.channels must be positive"));
    }
    Ok(EncoderSettings {
        program: non_empty(e.program.as_deref()).unwrap_or_else(|| "ffmpeg".to_string()),
        input_format: non_empty(e.input_format.as_deref())
            .unwrap_or_else(|| "avfoundation".to_string()),
        audio_device: non_empty(e.audio_device.as_deref())
            .unwrap_or_else(|| DEFAULT_AUDIO_DEVICE.to_string()),
        bitrate: non_empty(e.bitrate.as_deref()).unwrap_or_else(|| "192k".to_string()),
        sample_rate: e.sample_rate.unwrap_or(44_100),
        channels,
    })
}

/// Resolve the `[cast]` table.
pub fn cast_settings_from_config(cfg: &SpeakerConfig) -> Result<CastSettings> {
    let empty = CastSection::default();
    let c = cfg.cast.as_ref().unwrap_or(&empty);
    let defaults = WatchdogSettings::default();

    let poll_interval = c
        .poll_interval_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.poll_interval);
    if poll_interval.is_zero() {
        return Err(anyhow::anyhow!("cast.poll_interval_secs must be positive"));
    }
    let idle_threshold = c.idle_threshold.unwrap_or(defaults.idle_threshold);
    if idle_threshold == 0 {
        return Err(anyhow::anyhow!("cast.idle_threshold must be at least 1"));
    }

    Ok(CastSettings {
        discovery_timeout: Duration::from_secs(c.discovery_timeout_secs.unwrap_or(10)),
        connect_timeout: Duration::from_secs(c.connect_timeout_secs.unwrap_or(10)),
        watchdog: WatchdogSettings {
            poll_interval,
            idle_threshold,
            grace_period: c
                .grace_period_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.grace_period),
        },
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
