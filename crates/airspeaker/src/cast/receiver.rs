//! Default Media Receiver control over a Cast V2 channel.
//!
//! A [`CastReceiver`] owns one TLS channel to one device. It launches the Default
//! Media Receiver app, loads the relay URL as a LIVE stream, and answers status
//! queries for the watchdog. Between calls the owner drives `keepalive` so receiver
//! pings are answered. A dropped channel is re-dialed on the next `play`.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use super::channel::{
    CastConnection, Incoming, NAMESPACE_CONNECTION, NAMESPACE_HEARTBEAT, NAMESPACE_MEDIA,
    NAMESPACE_RECEIVER, RECEIVER_ID,
};
use super::{DeviceDescriptor, MediaRequest, PlayerState, ReceiverConnector, ReceiverControl};

const DMR_APP_ID: &str = "CC1AD845";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on messages consumed by one `keepalive` call.
const MAX_DRAIN_MESSAGES: usize = 32;

/// Opens [`CastReceiver`] sessions with a fixed protocol timeout.
#[derive(Debug, Clone)]
pub struct CastConnector {
    timeout: Duration,
}

impl CastConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ReceiverConnector for CastConnector {
    fn connect(&self, device: &DeviceDescriptor) -> Result<Box<dyn ReceiverControl>> {
        Ok(Box::new(CastReceiver::connect(device.clone(), self.timeout)?))
    }
}

struct AppSession {
    transport_id: String,
    session_id: String,
    media_session_id: Option<i64>,
}

/// Control session with one Cast device.
pub struct CastReceiver {
    device: DeviceDescriptor,
    timeout: Duration,
    conn: Option<CastConnection>,
    session: Option<AppSession>,
    request_id: i64,
    last_ping: Instant,
}

impl CastReceiver {
    /// Dial the device and launch the Default Media Receiver.
    pub fn connect(device: DeviceDescriptor, timeout: Duration) -> Result<Self> {
        let mut receiver = Self {
            device,
            timeout,
            conn: None,
            session: None,
            request_id: 1,
            last_ping: Instant::now(),
        };
        receiver.dial()?;
        receiver.ensure_session()?;
        Ok(receiver)
    }

    fn dial(&mut self) -> Result<()> {
        let device = &self.device;
        let mut conn = CastConnection::connect(&device.host, device.port, self.timeout)
            .with_context(|| {
                format!("cast: connect {} at {}:{}", device.friendly_name, device.host, device.port)
            })?;
        conn.send_json(RECEIVER_ID, NAMESPACE_CONNECTION, &json!({ "type": "CONNECT" }))
            .context("cast: virtual connection")?;
        tracing::info!(cast_id = %device.id, host = %device.host, "cast: channel open");
        self.conn = Some(conn);
        self.session = None;
        self.last_ping = Instant::now();
        Ok(())
    }

    fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.shutdown();
        }
        self.session = None;
    }

    fn send(&mut self, destination: &str, namespace: &str, payload: Value) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(anyhow::anyhow!("cast: channel closed"));
        };
        if let Err(e) = conn.send_json(destination, namespace, &payload) {
            self.drop_connection();
            return Err(anyhow::Error::new(e).context("cast: send failed"));
        }
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        if self.last_ping.elapsed() >= HEARTBEAT_INTERVAL {
            self.send(RECEIVER_ID, NAMESPACE_HEARTBEAT, json!({ "type": "PING" }))?;
            self.last_ping = Instant::now();
        }
        Ok(())
    }

    /// Read messages until `accept` yields a result. `Ok(None)` means the protocol
    /// timeout elapsed first.
    fn wait_for<T>(
        &mut self,
        mut accept: impl FnMut(&Incoming) -> Option<Result<T>>,
    ) -> Result<Option<T>> {
        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            self.heartbeat()?;
            let Some(conn) = self.conn.as_mut() else {
                return Err(anyhow::anyhow!("cast: channel closed"));
            };
            match conn.read_message() {
                Ok(Some(msg)) => {
                    self.observe(&msg)?;
                    if let Some(result) = accept(&msg) {
                        return result.map(Some);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.drop_connection();
                    return Err(anyhow::Error::new(e).context("cast: connection lost"));
                }
            }
        }
        Ok(None)
    }

    /// Bookkeeping shared by every read: heartbeats, app session, media session id.
    fn observe(&mut self, msg: &Incoming) -> Result<()> {
        match (msg.namespace.as_str(), msg.message_type()) {
            (NAMESPACE_HEARTBEAT, "PING") => {
                let source = msg.source_id.clone();
                self.send(&source, NAMESPACE_HEARTBEAT, json!({ "type": "PONG" }))?;
            }
            (NAMESPACE_CONNECTION, "CLOSE") => {
                let ours = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.transport_id == msg.source_id);
                if ours {
                    tracing::info!(cast_id = %self.device.id, "cast: receiver app closed");
                    self.session = None;
                }
            }
            (NAMESPACE_RECEIVER, "RECEIVER_STATUS") => match parse_receiver_status(&msg.payload) {
                Some((transport_id, session_id)) => {
                    let known = self
                        .session
                        .as_ref()
                        .is_some_and(|s| s.transport_id == transport_id);
                    if !known {
                        self.send(&transport_id, NAMESPACE_CONNECTION, json!({ "type": "CONNECT" }))?;
                        tracing::info!(cast_id = %self.device.id, "cast: DMR ready");
                        self.session = Some(AppSession {
                            transport_id,
                            session_id,
                            media_session_id: None,
                        });
                    }
                }
                None => {
                    if self.session.take().is_some() {
                        tracing::info!(cast_id = %self.device.id, "cast: DMR no longer running");
                    }
                }
            },
            (NAMESPACE_MEDIA, "MEDIA_STATUS") => {
                if let (Some(session), Some(status)) =
                    (self.session.as_mut(), parse_media_status(&msg.payload))
                {
                    session.media_session_id = status.media_session_id.or(session.media_session_id);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let request_id = next_request_id(&mut self.request_id);
        self.send(
            RECEIVER_ID,
            NAMESPACE_RECEIVER,
            json!({ "type": "LAUNCH", "requestId": request_id, "appId": DMR_APP_ID }),
        )?;
        tracing::info!(cast_id = %self.device.id, "cast: launching DMR");
        let launched = self.wait_for(|msg| {
            if msg.namespace != NAMESPACE_RECEIVER {
                return None;
            }
            match msg.message_type() {
                "RECEIVER_STATUS" if parse_receiver_status(&msg.payload).is_some() => Some(Ok(())),
                "LAUNCH_ERROR" => {
                    let reason = msg
                        .payload
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    Some(Err(anyhow::anyhow!("cast: launch failed ({reason})")))
                }
                _ => None,
            }
        })?;
        if launched.is_none() || self.session.is_none() {
            return Err(anyhow::anyhow!("cast: receiver app did not start"));
        }
        Ok(())
    }
}

impl ReceiverControl for CastReceiver {
    fn play(&mut self, media: &MediaRequest) -> Result<()> {
        if self.conn.is_none() {
            self.dial()?;
        }
        self.ensure_session()?;
        let Some(session) = self.session.as_ref() else {
            return Err(anyhow::anyhow!("cast: no receiver app session"));
        };
        let transport_id = session.transport_id.clone();
        let request_id = next_request_id(&mut self.request_id);
        let payload = load_payload(media, &session.session_id, request_id);
        self.send(&transport_id, NAMESPACE_MEDIA, payload)?;

        let started = self.wait_for(|msg| {
            if msg.namespace != NAMESPACE_MEDIA {
                return None;
            }
            match msg.message_type() {
                "MEDIA_STATUS" => {
                    let status = parse_media_status(&msg.payload)?;
                    if status.player_state.is_active() {
                        Some(Ok(()))
                    } else if status.idle_reason.as_deref() == Some("ERROR") {
                        Some(Err(anyhow::anyhow!("cast: receiver failed to load stream")))
                    } else {
                        None
                    }
                }
                kind @ ("LOAD_FAILED" | "LOAD_CANCELLED" | "INVALID_REQUEST") => {
                    Some(Err(anyhow::anyhow!("cast: load rejected ({kind})")))
                }
                _ => None,
            }
        })?;
        match started {
            Some(()) => tracing::info!(cast_id = %self.device.id, url = %media.url, "cast: streaming"),
            None => tracing::warn!(
                cast_id = %self.device.id,
                url = %media.url,
                "cast: load sent but receiver not active yet"
            ),
        }
        Ok(())
    }

    fn keepalive(&mut self) -> Result<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        self.heartbeat()?;
        for _ in 0..MAX_DRAIN_MESSAGES {
            let Some(conn) = self.conn.as_mut() else {
                return Ok(());
            };
            match conn.read_message() {
                Ok(Some(msg)) => self.observe(&msg)?,
                Ok(None) => break,
                Err(e) => {
                    self.drop_connection();
                    return Err(anyhow::Error::new(e).context("cast: connection lost"));
                }
            }
        }
        Ok(())
    }

    fn status(&mut self) -> Result<PlayerState> {
        // A dead channel reads as unknown so the watchdog's replay re-dials it.
        if self.conn.is_none() {
            return Ok(PlayerState::Unknown);
        }
        let Some(session) = self.session.as_ref() else {
            return Ok(PlayerState::Idle);
        };
        let transport_id = session.transport_id.clone();
        let request_id = next_request_id(&mut self.request_id);
        self.send(
            &transport_id,
            NAMESPACE_MEDIA,
            json!({ "type": "GET_STATUS", "requestId": request_id }),
        )?;
        let state = self.wait_for(|msg| match (msg.namespace.as_str(), msg.message_type()) {
            (NAMESPACE_MEDIA, "MEDIA_STATUS") => {
                parse_media_status(&msg.payload).map(|s| Ok(s.player_state))
            }
            (NAMESPACE_RECEIVER, "RECEIVER_STATUS")
                if parse_receiver_status(&msg.payload).is_none() =>
            {
                Some(Ok(PlayerState::Idle))
            }
            (NAMESPACE_CONNECTION, "CLOSE") if msg.source_id == transport_id => {
                Some(Ok(PlayerState::Idle))
            }
            _ => None,
        })?;
        state.ok_or_else(|| anyhow::anyhow!("cast: no media status within {:?}", self.timeout))
    }

    fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        if let Some(media_session_id) = session.media_session_id {
            let request_id = next_request_id(&mut self.request_id);
            self.send(
                &session.transport_id,
                NAMESPACE_MEDIA,
                json!({
                    "type": "STOP",
                    "requestId": request_id,
                    "mediaSessionId": media_session_id,
                }),
            )?;
        }
        let request_id = next_request_id(&mut self.request_id);
        self.send(
            RECEIVER_ID,
            NAMESPACE_RECEIVER,
            json!({ "type": "STOP", "requestId": request_id, "sessionId": session.session_id }),
        )?;
        tracing::info!(cast_id = %self.device.id, "cast: playback stopped");
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if let Some(transport_id) = self.session.as_ref().map(|s| s.transport_id.clone()) {
            let _ = self.send(&transport_id, NAMESPACE_CONNECTION, json!({ "type": "CLOSE" }));
        }
        let _ = self.send(RECEIVER_ID, NAMESPACE_CONNECTION, json!({ "type": "CLOSE" }));
        self.drop_connection();
        tracing::info!(cast_id = %self.device.id, "cast: channel closed");
    }
}

impl Drop for CastReceiver {
    fn drop(&mut self) {
        self.drop_connection();
    }
}

fn parse_receiver_status(payload: &Value) -> Option<(String, String)> {
    let apps = payload.get("status")?.get("applications")?.as_array()?;
    for app in apps {
        let app_id = app.get("appId").and_then(|v| v.as_str()).unwrap_or("");
        if app_id != DMR_APP_ID {
            continue;
        }
        let transport_id = app.get("transportId")?.as_str()?.to_string();
        let session_id = app.get("sessionId")?.as_str()?.to_string();
        return Some((transport_id, session_id));
    }
    None
}

#[derive(Debug)]
struct MediaStatus {
    media_session_id: Option<i64>,
    player_state: PlayerState,
    idle_reason: Option<String>,
}

/// An empty `status` array means no media session exists, which is idle.
fn parse_media_status(payload: &Value) -> Option<MediaStatus> {
    let statuses = payload.get("status")?.as_array()?;
    let Some(status) = statuses.first() else {
        return Some(MediaStatus {
            media_session_id: None,
            player_state: PlayerState::Idle,
            idle_reason: None,
        });
    };
    Some(MediaStatus {
        media_session_id: status.get("mediaSessionId").and_then(|v| v.as_i64()),
        player_state: status
            .get("playerState")
            .and_then(|v| v.as_str())
            .map(PlayerState::parse)
            .unwrap_or(PlayerState::Unknown),
        idle_reason: status
            .get("idleReason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

fn load_payload(media: &MediaRequest, session_id: &str, request_id: i64) -> Value {
    let mut metadata = json!({ "metadataType": 3 });
    if let Some(title) = media.title.as_ref() {
        metadata["title"] = title.clone().into();
    }
    json!({
        "type": "LOAD",
        "requestId": request_id,
        "sessionId": session_id,
        "media": {
            "contentId": media.url,
            "contentType": media.content_type,
            "streamType": media.stream_type.as_str(),
            "metadata": metadata,
        },
        "autoplay": true,
    })
}

fn next_request_id(value: &mut i64) -> i64 {
    let current = *value;
    *value = value.saturating_add(1);
    current
}
