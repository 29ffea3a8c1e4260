//! Cast V2 transport: TLS socket carrying length-prefixed protobuf frames with JSON
//! payloads.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, SignatureScheme, StreamOwned};
use serde_json::Value;

use super::proto;

pub(crate) const NAMESPACE_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub(crate) const NAMESPACE_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub(crate) const NAMESPACE_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub(crate) const NAMESPACE_MEDIA: &str = "urn:x-cast:com.google.cast.media";
pub(crate) const SENDER_ID: &str = "sender-0";
pub(crate) const RECEIVER_ID: &str = "receiver-0";

/// Receivers reject frames above 64 KiB.
const MAX_FRAME_BYTES: usize = 64 * 1024;

/// How long a single read blocks before reporting "nothing yet".
const READ_POLL: Duration = Duration::from_millis(200);

/// A decoded string-payload message.
#[derive(Debug, Clone)]
pub(crate) struct Incoming {
    pub(crate) source_id: String,
    pub(crate) namespace: String,
    pub(crate) payload: Value,
}

impl Incoming {
    pub(crate) fn message_type(&self) -> &str {
        self.payload.get("type").and_then(|v| v.as_str()).unwrap_or("")
    }
}

pub(crate) struct CastConnection {
    stream: StreamOwned<ClientConnection, TcpStream>,
    frames: FrameReader,
}

/// Reassembles length-prefixed frames from a source whose reads may time out
/// partway through a header or body. Bytes read before a timeout are kept for
/// the next call.
#[derive(Debug, Default)]
pub(crate) struct FrameReader {
    pending: Vec<u8>,
}

impl FrameReader {
    /// Read until one complete frame body is buffered. `Ok(None)` means the source
    /// timed out first; the partial frame stays buffered.
    pub(crate) fn read_frame<R: Read>(&mut self, src: &mut R) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let wanted = match self.body_len()? {
                Some(len) if self.pending.len() == 4 + len => {
                    let body = self.pending.split_off(4);
                    self.pending.clear();
                    return Ok(Some(body));
                }
                Some(len) => 4 + len,
                None => 4,
            };
            let start = self.pending.len();
            self.pending.resize(wanted, 0);
            match src.read(&mut self.pending[start..]) {
                Ok(0) => {
                    self.pending.truncate(start);
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "cast connection closed",
                    ));
                }
                Ok(n) => self.pending.truncate(start + n),
                Err(err) => {
                    self.pending.truncate(start);
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    if is_timeout(&err) {
                        return Ok(None);
                    }
                    return Err(err);
                }
            }
        }
    }

    fn body_len(&self) -> std::io::Result<Option<usize>> {
        match self.pending.get(..4) {
            Some(header) => {
                let header = [header[0], header[1], header[2], header[3]];
                frame_len(header).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl CastConnection {
    /// Open a TLS session to a receiver. Certificates are not verified: receivers
    /// present device certificates that do not chain to a public root.
    pub(crate) fn connect(host: &str, port: u16, timeout: Duration) -> std::io::Result<Self> {
        let addr = resolve_device_addr(host, port)?;
        let server_name = server_name_for(host)?;
        let root_store = rustls::RootCertStore::empty();
        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
        let conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        stream.set_write_timeout(Some(Duration::from_secs(2)))?;
        Ok(Self {
            stream: StreamOwned::new(conn, stream),
            frames: FrameReader::default(),
        })
    }

    pub(crate) fn send_json(
        &mut self,
        destination_id: &str,
        namespace: &str,
        payload: &Value,
    ) -> std::io::Result<()> {
        let frame = encode_frame(destination_id, namespace, payload)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read one message. `Ok(None)` means nothing arrived within the poll window or
    /// the frame carried a binary payload.
    pub(crate) fn read_message(&mut self) -> std::io::Result<Option<Incoming>> {
        let Some(buf) = self.frames.read_frame(&mut self.stream)? else {
            return Ok(None);
        };
        let msg = proto::CastMessage::decode(&buf[..])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(incoming_from(msg))
    }

    pub(crate) fn shutdown(&mut self) {
        self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        let _ = self.stream.sock.shutdown(std::net::Shutdown::Both);
    }
}

/// Serialize a JSON payload into a length-prefixed frame.
pub(crate) fn encode_frame(
    destination_id: &str,
    namespace: &str,
    payload: &Value,
) -> std::io::Result<Vec<u8>> {
    let payload = serde_json::to_string(payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let msg = proto::CastMessage {
        protocol_version: proto::cast_message::ProtocolVersion::Castv210 as i32,
        source_id: SENDER_ID.to_string(),
        destination_id: destination_id.to_string(),
        namespace: namespace.to_string(),
        payload_type: proto::cast_message::PayloadType::String as i32,
        payload_utf8: Some(payload),
        payload_binary: None,
    };
    let body_len = msg.encoded_len();
    if body_len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cast frame too large: {body_len} bytes"),
        ));
    }
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    msg.encode(&mut buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(buf)
}

fn frame_len(header: [u8; 4]) -> std::io::Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("cast frame too large: {len} bytes"),
        ));
    }
    Ok(len)
}

fn incoming_from(msg: proto::CastMessage) -> Option<Incoming> {
    if msg.payload_type != proto::cast_message::PayloadType::String as i32 {
        return None;
    }
    let payload = serde_json::from_str::<Value>(msg.payload_utf8.as_deref()?).ok()?;
    Some(Incoming {
        source_id: msg.source_id,
        namespace: msg.namespace,
        payload,
    })
}

fn resolve_device_addr(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))
}

fn server_name_for(host: &str) -> std::io::Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

pub(crate) fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
