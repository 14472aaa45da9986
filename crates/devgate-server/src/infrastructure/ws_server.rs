//! WebSocket server: accept loop and per-session task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Running the access checks during the WebSocket upgrade, so a rejected
//!    client gets a plain HTTP `401`/`403` and never becomes a session.
//! 3. Admitting each accepted client into the gateway's session pool.
//! 4. Pumping frames for the session:
//!    - **Client → Gateway**: JSON text frames decoded as [`ClientRequest`]s
//!      and handed to [`Gateway::handle`].
//!    - **Gateway → Client**: [`ServerEvent`]s from the session's outbound
//!      queue, encoded as JSON text frames.
//! 5. Sending WebSocket pings and dropping clients that stay silent past the
//!    pong timeout.
//! 6. Terminating the session in the gateway when the socket goes away.
//!
//! # Tokens
//!
//! The access token is read from the `token` query parameter
//! (`ws://host:8000/?token=...`) or, failing that, from an
//! `Authorization: Bearer ...` header.
//!
//! # Shutdown
//!
//! The accept loop polls a shared `AtomicBool` every 200 ms.  Open sessions
//! end when the gateway shuts down and drops their outbound queues.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use devgate_core::{ClientRequest, GatewayError, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};

use crate::application::access_gate::Identity;
use crate::application::gateway::Gateway;
use crate::infrastructure::storage::config::GatewayConfig;

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Per-session transport settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub outbound_queue: usize,
}

impl SessionSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            pong_timeout: config.pong_timeout(),
            outbound_queue: config.server.outbound_queue.max(1),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `addr` and serves sessions until `running` is set to `false`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot be bound (e.g., the port is
/// already in use or the process lacks permission to bind).
pub async fn run_server(
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    settings: SessionSettings,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
    info!("gateway listening on {addr}");
    serve(listener, gateway, settings, running).await
}

/// Serves sessions on an already bound listener.
///
/// Each accepted connection is handed to its own Tokio task so that one slow
/// client never blocks the others.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    settings: SessionSettings,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the flag is checked even when nobody connects.
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("new connection from {peer_addr}");
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move {
                    handle_connection(stream, peer_addr, gateway, settings).await;
                });
            }
            Ok(Err(e)) => {
                // Transient (e.g. too many open file descriptors); keep serving.
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }

    Ok(())
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gateway: Arc<Gateway>,
    settings: SessionSettings,
) {
    match run_session(stream, peer_addr, gateway, settings).await {
        Ok(()) => debug!("connection {peer_addr} closed"),
        Err(e) => warn!("connection {peer_addr} closed with error: {e:#}"),
    }
}

/// Runs the complete lifecycle of one client connection.
async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gateway: Arc<Gateway>,
    settings: SessionSettings,
) -> anyhow::Result<()> {
    // ── Step 1: Handshake with access checks ──────────────────────────────────
    let mut admitted: Option<Identity> = None;
    let check = |request: &Request, response: Response| {
        let token = extract_token(request);
        match gateway.authorize(token.as_deref(), peer_addr.ip()) {
            Ok(identity) => {
                admitted = Some(identity);
                Ok(response)
            }
            Err(err) => Err(rejection(&err)),
        }
    };
    let ws_stream = match accept_hdr_async(stream, check).await {
        Ok(ws_stream) => ws_stream,
        Err(WsError::Http(response)) => {
            info!(
                "connection {peer_addr} rejected with {}",
                response.status()
            );
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("WebSocket handshake failed with {peer_addr}"))
        }
    };
    let identity = admitted.context("handshake completed without an access decision")?;

    // ── Step 2: Admit ─────────────────────────────────────────────────────────
    let (outbound_tx, mut outbound) = mpsc::channel::<ServerEvent>(settings.outbound_queue);
    let session = gateway.admit(outbound_tx, identity.clone(), peer_addr.ip());
    info!(%session, %identity, origin = %peer_addr, "session admitted");

    // ── Step 3: Pump frames until either side goes away ───────────────────────
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let mut ticker = interval(settings.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_heard = Instant::now();

    let outcome: anyhow::Result<()> = loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else {
                    debug!(%session, "outbound queue closed");
                    break Ok(());
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(%session, event = event.kind(), "event serialization error: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(text)).await {
                    break Err(e).context("sending event");
                }
            }

            frame = ws_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => {
                        debug!(%session, "client stream ended");
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e).context("reading frame"),
                };
                last_heard = Instant::now();
                match frame {
                    WsMessage::Text(text) => match decode_request(&text) {
                        Ok(request) => gateway.handle(session, request).await,
                        Err(e) => {
                            // One bad frame does not end the session.
                            warn!(%session, "malformed request ignored: {e}");
                        }
                    },
                    WsMessage::Binary(_) => {
                        warn!(%session, "unexpected binary frame (ignored)");
                    }
                    WsMessage::Close(_) => {
                        debug!(%session, "close frame received");
                        break Ok(());
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                }
            }

            _ = ticker.tick() => {
                if last_heard.elapsed() > settings.pong_timeout {
                    warn!(%session, "no traffic for {:?}; dropping session", settings.pong_timeout);
                    break Ok(());
                }
                if let Err(e) = ws_tx.send(WsMessage::Ping(Vec::new())).await {
                    break Err(e).context("sending ping");
                }
            }
        }
    };

    // ── Step 4: Cleanup ───────────────────────────────────────────────────────
    gateway.terminate(session);
    let _ = ws_tx.close().await;
    info!(%session, %identity, origin = %peer_addr, "session ended");
    outcome
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Reads the access token from the `token` query parameter or a bearer
/// `Authorization` header.
fn extract_token(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == "token")
            .map(|(_, value)| value.to_string())
    });
    from_query
        .filter(|token| !token.is_empty())
        .or_else(|| {
            request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(|token| token.trim().to_string())
        })
        .filter(|token| !token.is_empty())
}

/// Builds the HTTP response sent instead of the upgrade.
fn rejection(err: &GatewayError) -> ErrorResponse {
    let status = match err {
        GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::UNAUTHORIZED,
    };
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}

fn decode_request(text: &str) -> Result<ClientRequest, serde_json::Error> {
    serde_json::from_str(text)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use devgate_core::ConnectionKey;

    fn request(uri: &str, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_from_query_parameter() {
        let req = request("/?client=ui&token=abc.def.ghi", None);
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_token_from_bearer_header() {
        let req = request("/", Some("Bearer abc.def.ghi"));
        assert_eq!(extract_token(&req).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_query_token_wins_over_header() {
        let req = request("/?token=from-query", Some("Bearer from-header"));
        assert_eq!(extract_token(&req).as_deref(), Some("from-query"));
    }

    #[test]
    fn test_no_token_present() {
        assert_eq!(extract_token(&request("/", None)), None);
        assert_eq!(extract_token(&request("/?token=", Some("Basic eA=="))), None);
    }

    #[test]
    fn test_forbidden_maps_to_403() {
        let response = rejection(&GatewayError::Forbidden("203.0.113.5".to_string()));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_unauthenticated_maps_to_401() {
        let response = rejection(&GatewayError::Unauthenticated("missing token".to_string()));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.body().as_deref().unwrap_or_default().contains("missing token"));
    }

    #[test]
    fn test_decode_request_accepts_protocol_json() {
        let request = decode_request(r#"{"type":"close","port":"/dev/ttyACM0","data_source":"main"}"#)
            .unwrap();
        assert_eq!(
            request,
            ClientRequest::Close {
                key: ConnectionKey::new("/dev/ttyACM0", "main")
            }
        );
    }

    #[test]
    fn test_decode_request_rejects_unknown_type() {
        assert!(decode_request(r#"{"type":"format-disk"}"#).is_err());
    }
}
