//! Google Cast receivers: discovery, the V2 wire channel, and media control.
//!
//! The supervisor only talks to receivers through [`ReceiverConnector`] /
//! [`ReceiverControl`] and finds them through [`DeviceDiscovery`], so tests can swap
//! in scripted fakes.

pub mod channel;
pub mod discovery;
pub mod proto;
pub mod receiver;

use std::time::Duration;

use anyhow::Result;

pub use discovery::MdnsDiscovery;
pub use receiver::{CastConnector, CastReceiver};

/// Snapshot of a receiver found on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Stable unique id (the receiver's TXT `id`).
    pub id: String,
    /// User-facing name, e.g. "Living Room".
    pub friendly_name: String,
    /// Hardware model, possibly empty.
    pub model_name: String,
    /// IP address or hostname.
    pub host: String,
    /// Cast control port (8009 on stock receivers).
    pub port: u16,
}

impl DeviceDescriptor {
    /// `"Name (Model)"`, or just the name when the model is unknown.
    pub fn label(&self) -> String {
        if self.model_name.is_empty() {
            self.friendly_name.clone()
        } else {
            format!("{} ({})", self.friendly_name, self.model_name)
        }
    }
}

/// Cast `streamType` hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Unbounded stream; no seeking, no duration.
    Live,
    /// Finite media.
    Buffered,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Live => "LIVE",
            StreamType::Buffered => "BUFFERED",
        }
    }
}

/// What the receiver should load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub url: String,
    pub content_type: String,
    pub stream_type: StreamType,
    /// Title shown on the receiver.
    pub title: Option<String>,
}

impl MediaRequest {
    /// A live stream request, the only kind this relay issues.
    pub fn live(url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content_type: content_type.into(),
            stream_type: StreamType::Live,
            title: None,
        }
    }
}

/// Receiver-reported `playerState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Playing,
    Buffering,
    Paused,
    Idle,
    Unknown,
}

impl PlayerState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PLAYING" => PlayerState::Playing,
            "BUFFERING" => PlayerState::Buffering,
            "PAUSED" => PlayerState::Paused,
            "IDLE" => PlayerState::Idle,
            _ => PlayerState::Unknown,
        }
    }

    /// States the watchdog counts towards a stall.
    pub fn is_idle(self) -> bool {
        matches!(self, PlayerState::Idle | PlayerState::Unknown)
    }

    /// States that mean a load request was accepted.
    pub fn is_active(self) -> bool {
        matches!(self, PlayerState::Playing | PlayerState::Buffering)
    }
}

/// An established control session with one receiver.
pub trait ReceiverControl: Send {
    /// Load and start `media`, waiting briefly for the receiver to report activity.
    fn play(&mut self, media: &MediaRequest) -> Result<()>;
    /// Query the current player state.
    fn status(&mut self) -> Result<PlayerState>;
    /// Service the channel between calls: answer receiver pings, send our own, and
    /// consume unsolicited status. Must return promptly.
    fn keepalive(&mut self) -> Result<()>;
    /// Stop playback and close the receiver app.
    fn stop(&mut self) -> Result<()>;
    /// Release the control session. Best effort; never fails.
    fn disconnect(&mut self);
}

/// Opens [`ReceiverControl`] sessions.
pub trait ReceiverConnector: Send + Sync {
    fn connect(&self, device: &DeviceDescriptor) -> Result<Box<dyn ReceiverControl>>;
}

/// Finds receivers on the local network.
pub trait DeviceDiscovery: Send + Sync {
    fn discover(&self, timeout: Duration) -> Result<Vec<DeviceDescriptor>>;
}
