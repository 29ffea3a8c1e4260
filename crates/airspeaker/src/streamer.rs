//! Encoder + broadcaster + HTTP server, started and stopped as one unit.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;

use crate::broadcast::Broadcaster;
use crate::config::{EncoderSettings, StreamSettings};
use crate::encoder::{EncoderCommand, EncoderProducer};
use crate::stream_server::{StreamEndpoint, StreamServer, local_ip, public_stream_url};

pub struct Streamer {
    settings: StreamSettings,
    command: EncoderCommand,
    broadcaster: Arc<Broadcaster>,
    server: Option<StreamServer>,
    encoder: Option<EncoderProducer>,
    stream_url: Option<String>,
}

impl Streamer {
    pub fn new(settings: StreamSettings, encoder: &EncoderSettings) -> Self {
        let command = EncoderCommand::for_codec(encoder, settings.codec);
        Self::with_encoder_command(settings, command)
    }

    /// Use an arbitrary producer command instead of the codec profile.
    pub fn with_encoder_command(settings: StreamSettings, command: EncoderCommand) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(settings.broadcast.clone()));
        Self {
            settings,
            command,
            broadcaster,
            server: None,
            encoder: None,
            stream_url: None,
        }
    }

    /// Bind the HTTP endpoint, launch the encoder and return the public stream URL.
    /// Calling `start` on a running streamer returns the existing URL.
    pub fn start(&mut self) -> Result<String> {
        if let Some(url) = self.stream_url.as_ref() {
            return Ok(url.clone());
        }
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.settings.port);
        let endpoint = StreamEndpoint {
            path: self.settings.path.clone(),
            content_type: self.settings.codec.content_type().to_string(),
            stream_name: self.settings.name.clone(),
            pull_timeout: self.settings.pull_timeout,
        };
        let mut server = StreamServer::start(
            bind,
            self.settings.workers,
            endpoint,
            Arc::clone(&self.broadcaster),
        )?;

        let encoder = match EncoderProducer::spawn(&self.command, Arc::clone(&self.broadcaster)) {
            Ok(encoder) => encoder,
            Err(e) => {
                server.stop();
                return Err(e);
            }
        };

        let host = self
            .settings
            .public_host
            .clone()
            .unwrap_or_else(|| local_ip().to_string());
        let url = public_stream_url(&host, server.local_addr().port(), &self.settings.path);
        tracing::info!(url = %url, codec = ?self.settings.codec, "streamer: started");

        self.server = Some(server);
        self.encoder = Some(encoder);
        self.stream_url = Some(url.clone());
        Ok(url)
    }

    /// Stop the encoder, end every open stream and shut the server down.
    pub fn stop(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.stop();
        }
        self.broadcaster.disconnect_all();
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        if self.stream_url.take().is_some() {
            tracing::info!("streamer: stopped");
        }
    }

    pub fn stream_url(&self) -> Option<&str> {
        self.stream_url.as_deref()
    }

    pub fn content_type(&self) -> &'static str {
        self.settings.codec.content_type()
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(StreamServer::local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    /// False once the encoder process has exited, even if the server is still up.
    pub fn encoder_alive(&self) -> bool {
        self.encoder.as_ref().is_some_and(EncoderProducer::is_running)
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Overrides, SpeakerConfig};

    fn stream_settings() -> StreamSettings {
        let mut cfg = SpeakerConfig::default();
        cfg.apply_overrides(&Overrides {
            port: Some(0),
            public_host: Some("127.0.0.1".to_string()),
            ..Overrides::default()
        });
        let mut settings = cfg.resolve().unwrap().stream;
        settings.broadcast.min_flush_bytes = 16;
        settings.pull_timeout = std::time::Duration::from_millis(200);
        settings
    }

    #[test]
    fn content_type_follows_codec() {
        let settings = stream_settings();
        let encoder = SpeakerConfig::default().resolve().unwrap().encoder;
        let streamer = Streamer::new(settings, &encoder);
        assert_eq!(streamer.content_type(), "audio/aac");
        assert!(!streamer.is_running());
        assert!(streamer.stream_url().is_none());
    }

    #[test]
    fn missing_encoder_program_fails_cleanly() {
        let command = EncoderCommand {
            program: "/nonexistent/airspeaker-encoder".to_string(),
            args: Vec::new(),
        };
        let mut streamer = Streamer::with_encoder_command(stream_settings(), command);
        assert!(streamer.start().is_err());
        assert!(!streamer.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn serves_encoder_output_over_http() {
        use std::io::Read;

        let command = EncoderCommand {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "while true; do printf 'abcdefgh'; sleep 0.01; done".to_string(),
            ],
        };
        let mut streamer = Streamer::with_encoder_command(stream_settings(), command);
        let url = streamer.start().unwrap();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(url.ends_with("/stream"));
        assert_eq!(streamer.start().unwrap(), url);
        assert!(streamer.encoder_alive());

        let resp = ureq::get(&url).call().expect("stream request");
        let (_, body) = resp.into_parts();
        let mut buf = [0u8; 64];
        body.into_reader().read_exact(&mut buf).expect("read stream");
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("abcdefgh"));

        streamer.stop();
        assert!(!streamer.is_running());
        assert!(!streamer.encoder_alive());
        assert_eq!(streamer.broadcaster().consumer_count(), 0);
    }
}
