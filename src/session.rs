//! Connection state machine.
//!
//! Each accepted socket walks: gate (origin + per-IP rate) →
//! awaiting-handshake (first frame must be `HELLO` within the timeout) →
//! admitted (motion / subscribe / edit dispatch) → closed (leave broadcast,
//! subscription teardown, presence update, empty-world flush).
//!
//! ## Per-connection policies while admitted
//!
//! | Policy                       | Outcome                               |
//! |------------------------------|---------------------------------------|
//! | payload > 64 KiB             | close 1002 (protocol error)           |
//! | frame fails to parse         | non-fatal `ERROR{invalid_request}`    |
//! | second `HELLO`               | non-fatal `ERROR{invalid_request}`    |
//! | fatal `ERROR` sent           | close 1000                            |
//! | server shutdown              | close 1001 (going away)               |
//!
//! Inbound frames for one connection are handled strictly in order; the
//! read loop awaits each handler before polling the socket again.

use crate::protocol::{
    ClientFrame, ErrorCode, Redirect, ServerFrame, CLOSE_GOING_AWAY, CLOSE_INVALID_ORIGIN,
    CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, CLOSE_RATE_LIMITED, PROTOCOL_VERSION,
};
use crate::types::RateWindow;
use crate::world::{AdmitError, Outbound, WorldRegistry};
use crate::{edit, streamer};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Per-IP connection gate
// ---------------------------------------------------------------------------

/// Sliding-window connection limiter keyed by source IP.
#[derive(Default)]
pub struct ConnectionLimiter {
    windows: Mutex<HashMap<IpAddr, RateWindow>>,
}

impl ConnectionLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, ip: IpAddr, per_minute: u32) -> bool {
        let mut windows = self.windows.lock();
        if windows.len() > 1024 {
            windows.retain(|_, w| !w.is_idle());
        }
        windows
            .entry(ip)
            .or_insert_with(|| RateWindow::new(Duration::from_secs(60)))
            .try_acquire(per_minute)
    }
}

// ---------------------------------------------------------------------------
// Origin validation
// ---------------------------------------------------------------------------

/// Exact pattern, `*.domain` wildcard, or localhost. A missing header is
/// admitted (non-browser clients do not send one).
pub fn origin_allowed(origin: Option<&str>, patterns: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let host = origin_host(origin);
    if host == "localhost" || host == "127.0.0.1" || host == "[::1]" {
        return true;
    }
    patterns.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix("*.") {
            host.ends_with(&format!(".{suffix}")) || host == suffix
        } else {
            origin == pattern || host == pattern.as_str()
        }
    })
}

fn origin_host(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, r)| r);
    let rest = rest.split('/').next().unwrap_or(rest);
    // Keep bracketed IPv6 intact; otherwise strip the port.
    if let Some(end) = rest.find(']') {
        &rest[..=end]
    } else {
        rest.split(':').next().unwrap_or(rest)
    }
}

// ---------------------------------------------------------------------------
// Connection actor
// ---------------------------------------------------------------------------

pub async fn serve_connection(
    registry: Arc<WorldRegistry>,
    limiter: Arc<ConnectionLimiter>,
    mut shutdown: watch::Receiver<bool>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let config = registry.config().clone();

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_frame_bytes),
        max_frame_size: Some(config.max_frame_bytes),
        ..Default::default()
    };

    let origin: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let origin_slot = origin.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *origin_slot.lock() = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(resp)
    };

    let ws = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, "WebSocket handshake failed: {e}");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let origin = origin.lock().take();
    if !origin_allowed(origin.as_deref(), &config.allowed_origins) {
        debug!(%peer, ?origin, "Rejected origin");
        close_now(&mut sink, CLOSE_INVALID_ORIGIN, "origin not allowed").await;
        return;
    }
    if !limiter.allow(peer.ip(), config.connections_per_minute) {
        debug!(%peer, "Connection rate exceeded");
        close_now(&mut sink, CLOSE_RATE_LIMITED, "connection rate exceeded").await;
        return;
    }

    // Writer task: the only owner of the sink. Every outbound frame and
    // the final close travel through this channel.
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(write_loop(sink, rx));

    // Awaiting-handshake: the first frame must be HELLO within the timeout.
    let hello = match tokio::time::timeout(config.handshake_timeout, first_frame(&mut source)).await
    {
        Ok(Some(ClientFrame::Hello(hello))) => hello,
        Ok(_) | Err(_) => {
            let _ = tx.send(Outbound::Frame(ServerFrame::error(
                ErrorCode::AuthFailed,
                "expected HELLO",
                true,
            )));
            let _ = tx.send(Outbound::Close(CLOSE_NORMAL, String::new()));
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let admission = match registry.admit(&hello, tx.clone()).await {
        Ok(admission) => admission,
        Err(AdmitError::Redirect(url)) => {
            let _ = tx.send(Outbound::Frame(ServerFrame::Redirect(Redirect {
                protocol_version: PROTOCOL_VERSION,
                url,
            })));
            let _ = tx.send(Outbound::Close(CLOSE_NORMAL, "world hosted elsewhere".into()));
            drop(tx);
            let _ = writer.await;
            return;
        }
        Err(e) => {
            let _ = tx.send(Outbound::Frame(ServerFrame::error(
                e.error_code(),
                e.to_string(),
                true,
            )));
            let _ = tx.send(Outbound::Close(CLOSE_NORMAL, String::new()));
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let world = admission.world.clone();
    let user = admission.user_id.clone();
    let _ = tx.send(Outbound::Frame(ServerFrame::Welcome(admission.welcome)));

    // Admitted: dispatch frames in arrival order until the peer leaves,
    // errors out, or the server shuts down.
    let store = registry.store().clone();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = tx.send(Outbound::Close(CLOSE_GOING_AWAY, "server shutting down".into()));
                    break;
                }
            }
            message = source.next() => match message {
                None => break,
                Some(Err(WsError::Capacity(_))) => {
                    let _ = tx.send(Outbound::Close(CLOSE_PROTOCOL_ERROR, "frame too large".into()));
                    break;
                }
                Some(Err(e)) => {
                    debug!(%peer, "Read error: {e}");
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Input(input)) => world.apply_input(&user, &input),
                        Ok(ClientFrame::Subscribe(sub)) => {
                            streamer::handle_subscribe(&world, &store, &config, &user, &sub).await;
                        }
                        Ok(ClientFrame::BlockEditRequest(req)) => {
                            edit::handle_edit(&world, &store, &config, &user, &req).await;
                        }
                        Ok(ClientFrame::Hello(_)) => {
                            let _ = tx.send(Outbound::Frame(ServerFrame::error(
                                ErrorCode::InvalidRequest,
                                "already admitted",
                                false,
                            )));
                        }
                        Err(e) => {
                            let _ = tx.send(Outbound::Frame(ServerFrame::error(
                                ErrorCode::InvalidRequest,
                                format!("malformed frame: {e}"),
                                false,
                            )));
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let _ = tx.send(Outbound::Frame(ServerFrame::error(
                        ErrorCode::InvalidRequest,
                        "binary frames are not part of protocol version 1",
                        false,
                    )));
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {} // ping/pong
            }
        }
    }

    info!("Connection closed for {user} in world {}", world.id);
    registry.handle_disconnect(&world, &user).await;
    drop(tx);
    let _ = writer.await;
}

// ---------------------------------------------------------------------------
// Socket halves
// ---------------------------------------------------------------------------

/// Read until the first parseable client frame; `None` on disconnect or a
/// malformed first frame.
async fn first_frame(source: &mut WsSource) -> Option<ClientFrame> {
    loop {
        match source.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping unserializable frame: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close(code, reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn close_now(sink: &mut WsSink, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        })))
        .await;
    let _ = sink.close().await;
}
