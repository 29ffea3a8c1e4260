//! HTTP endpoint exposing the [`Broadcaster`] as an indefinite audio stream.
//!
//! Exactly one route is served: `GET <path>`. Each request registers a consumer and
//! streams whatever [`Broadcaster::pull`] returns until the consumer is gone or the
//! peer disconnects. Anything else is a 404.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::{App, Error, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use futures_util::stream::unfold;

use crate::broadcast::{Broadcaster, ConsumerId, PullResult};

/// Per-server values shared with every request handler.
#[derive(Clone, Debug)]
pub struct StreamEndpoint {
    /// Fixed request path.
    pub path: String,
    /// `Content-Type` of the encoded stream.
    pub content_type: String,
    /// `icy-name` header value.
    pub stream_name: String,
    /// How long each pull waits before yielding control back to the loop.
    pub pull_timeout: Duration,
}

struct StreamState {
    broadcaster: Arc<Broadcaster>,
    endpoint: StreamEndpoint,
}

/// Unregisters its consumer when the response body is dropped, whether the stream
/// ended normally or the peer went away mid-write.
struct ConsumerGuard {
    broadcaster: Arc<Broadcaster>,
    id: ConsumerId,
    peer: String,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.broadcaster.unregister(self.id);
        tracing::info!(consumer_id = self.id, peer = %self.peer, "stream: client disconnected");
    }
}

/// Handle for a running stream server.
pub struct StreamServer {
    handle: ServerHandle,
    local_addr: SocketAddr,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StreamServer {
    /// Bind `bind` and serve on a dedicated thread.
    ///
    /// Returns once the listener is bound, so [`StreamServer::local_addr`] is usable
    /// immediately (including when binding port 0).
    pub fn start(
        bind: SocketAddr,
        workers: usize,
        endpoint: StreamEndpoint,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("stream-server".to_string())
            .spawn(move || {
                let system = actix_web::rt::System::new();
                let result = system.block_on(async move {
                    let state = web::Data::new(StreamState {
                        broadcaster,
                        endpoint,
                    });
                    let server = HttpServer::new(move || {
                        let path = state.endpoint.path.clone();
                        App::new()
                            .app_data(state.clone())
                            .service(
                                web::resource(path)
                                    .route(web::get().to(stream_audio))
                                    .default_service(web::to(not_found)),
                            )
                            .default_service(web::to(not_found))
                    })
                    .workers(workers)
                    .shutdown_timeout(1)
                    .disable_signals()
                    .bind(bind);
                    let server = match server {
                        Ok(server) => server,
                        Err(e) => {
                            let _ = ready_tx.send(Err(anyhow::anyhow!("bind {bind}: {e}")));
                            return Ok(());
                        }
                    };
                    let local_addr = server.addrs().first().copied().unwrap_or(bind);
                    let running = server.run();
                    let _ = ready_tx.send(Ok((running.handle(), local_addr)));
                    running.await
                });
                if let Err(e) = result {
                    tracing::warn!(error = %e, "stream server exited with error");
                }
            })
            .context("spawn stream server thread")?;

        let (handle, local_addr) = ready_rx
            .recv()
            .context("stream server thread exited before binding")??;
        tracing::info!(addr = %local_addr, "stream server listening");
        Ok(Self {
            handle,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and drop the open ones.
    ///
    /// Callers should end active consumers first (see [`Broadcaster::disconnect_all`]).
    pub fn stop(&mut self) {
        // The stop command is sent when `stop` is called; the returned future only
        // reports completion, which the join below covers.
        drop(self.handle.stop(false));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::info!(addr = %self.local_addr, "stream server stopped");
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

async fn stream_audio(req: HttpRequest, state: web::Data<StreamState>) -> HttpResponse {
    let peer = req
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let id = state.broadcaster.register();
    tracing::info!(consumer_id = id, peer = %peer, "stream: client connected");

    let guard = ConsumerGuard {
        broadcaster: state.broadcaster.clone(),
        id,
        peer,
    };
    let timeout = state.endpoint.pull_timeout;
    let body = unfold(guard, move |guard| async move {
        loop {
            let broadcaster = guard.broadcaster.clone();
            let id = guard.id;
            match web::block(move || broadcaster.pull(id, timeout)).await {
                Ok(PullResult::Data(data)) => return Some((Ok::<Bytes, Error>(data), guard)),
                Ok(PullResult::Empty) => continue,
                Ok(PullResult::Gone) => return None,
                Err(e) => {
                    tracing::warn!(consumer_id = id, error = %e, "stream: pull task failed");
                    return None;
                }
            }
        }
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, state.endpoint.content_type.as_str()))
        .insert_header((header::CACHE_CONTROL, "no-cache, no-store"))
        .insert_header(("icy-name", state.endpoint.stream_name.as_str()))
        .streaming(body)
}

async fn not_found(req: HttpRequest) -> HttpResponse {
    tracing::debug!(method = %req.method(), path = %req.path(), "stream: rejected request");
    HttpResponse::NotFound().finish()
}

/// Best-effort LAN address of this machine (the address a UDP socket would use to
/// reach the internet). Falls back to loopback.
pub fn local_ip() -> std::net::IpAddr {
    let probe = || -> Option<std::net::IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        if socket.connect("8.8.8.8:80").is_err() && socket.connect("1.1.1.1:80").is_err() {
            return None;
        }
        socket.local_addr().ok().map(|addr| addr.ip())
    };
    probe().unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

/// URL a receiver should pull, e.g. `http://192.168.1.20:18573/stream`.
pub fn public_stream_url(host: &str, port: u16, path: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{host}]:{port}{path}")
    } else {
        format!("http://{host}:{port}{path}")
    }
}
