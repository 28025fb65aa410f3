//! Bidirectional WebSocket relay between a local browser client and the
//! upstream console endpoint.
//!
//! Each attached browser gets one upstream dial. The two relay directions
//! run as independent futures joined by `tokio::select!`; each direction
//! owns one read half and the opposite write half, keeps a receive deadline
//! that data frames and pongs refresh, and pings the sink it owns on the
//! heartbeat cadence.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as ClientMsg, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::{Bytes, Message as UpstreamMsg};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::services::session::VncSession;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported to the browser when the upstream dial fails.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Why one relay direction stopped.
enum RelayEnd {
    /// The peer closed the connection (close frame or EOF).
    PeerClosed,
    /// Nothing arrived within the receive deadline.
    Deadline,
    ReadError(String),
    WriteError(String),
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::PeerClosed => write!(f, "peer closed"),
            RelayEnd::Deadline => write!(f, "receive deadline elapsed"),
            RelayEnd::ReadError(e) => write!(f, "read failed: {e}"),
            RelayEnd::WriteError(e) => write!(f, "write failed: {e}"),
        }
    }
}

/// `GET /vnc-proxy`: upgrade the browser connection and start relaying.
///
/// Browsers always send `Origin`; anything not resolving to loopback is
/// refused before the upgrade. Absent origin is allowed so non-browser
/// clients (smoke tests, scripts) can attach.
pub async fn handle(
    State(session): State<Arc<VncSession>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        if !origin_is_loopback(origin.to_str().unwrap_or("")) {
            warn!(
                "session {}: refusing websocket from origin {:?}",
                session.id(),
                origin
            );
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    ws.protocols(["binary"])
        .on_upgrade(move |socket| proxy(socket, session))
}

fn origin_is_loopback(origin: &str) -> bool {
    Url::parse(origin)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .is_some_and(|host| host == "localhost" || host == "127.0.0.1")
}

async fn proxy(mut client: WebSocket, session: Arc<VncSession>) {
    if !session.on_client_connected() {
        let _ = client
            .send(ClientMsg::Close(Some(CloseFrame {
                code: CLOSE_INTERNAL_ERROR,
                reason: "session is closed".into(),
            })))
            .await;
        return;
    }

    let config = session.proxy_config().clone();
    let upstream = match dial_upstream(&session).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(
                "session {}: upstream dial to {} failed: {e:#}",
                session.id(),
                config.upstream_host
            );
            let _ = client
                .send(ClientMsg::Close(Some(CloseFrame {
                    code: CLOSE_INTERNAL_ERROR,
                    reason: format!("upstream connection failed: {e}").into(),
                })))
                .await;
            session.on_client_disconnected();
            // A failed dial spends the one-shot ticket; the session cannot
            // be re-attached. Cancelling the token hands it to the watcher
            // for immediate removal.
            session.cancel_token().cancel();
            return;
        }
    };

    info!(
        "session {}: relaying console traffic to {}",
        session.id(),
        config.upstream_host
    );

    let heartbeat = session.config().heartbeat_interval;
    let read_deadline = session.config().read_deadline;
    let (up_sink, up_stream) = upstream.split();
    let (cl_sink, cl_stream) = client.split();

    let client_to_upstream =
        relay_client_to_upstream(cl_stream, up_sink, &session, heartbeat, read_deadline);
    let upstream_to_client =
        relay_upstream_to_client(up_stream, cl_sink, &session, heartbeat, read_deadline);

    tokio::select! {
        _ = session.cancel_token().cancelled() => {
            debug!("session {}: relay cancelled", session.id());
        }
        _ = tokio::time::sleep(config.session_timeout) => {
            info!("session {}: session cap reached, ending relay", session.id());
        }
        end = client_to_upstream => {
            debug!("session {}: client side ended: {end}", session.id());
        }
        end = upstream_to_client => {
            debug!("session {}: upstream side ended: {end}", session.id());
        }
    }

    session.on_client_disconnected();
}

/// Dial the upstream TLS WebSocket with the ticket URL and auth header.
/// Certificate verification is off: the loopback-only local server is what
/// keeps this acceptable for self-signed PVE deployments.
async fn dial_upstream(session: &VncSession) -> anyhow::Result<UpstreamSocket> {
    let config = session.proxy_config();
    let mut request = config.upstream_url().into_client_request()?;

    let (name, value) = config.auth_header();
    request
        .headers_mut()
        .insert(name, HeaderValue::from_str(&value)?);
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));

    let connector = if config.tls {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        Connector::NativeTls(tls)
    } else {
        Connector::Plain
    };

    let (upstream, _response) = tokio::time::timeout(
        session.config().handshake_timeout,
        connect_async_tls_with_config(request, None, true, Some(connector)),
    )
    .await
    .map_err(|_| anyhow::anyhow!("handshake timed out"))??;

    Ok(upstream)
}

async fn relay_client_to_upstream(
    mut client: SplitStream<WebSocket>,
    mut upstream: SplitSink<UpstreamSocket, UpstreamMsg>,
    session: &VncSession,
    heartbeat: Duration,
    read_deadline: Duration,
) -> RelayEnd {
    let mut ping = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    let mut deadline = Instant::now() + read_deadline;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = upstream.send(UpstreamMsg::Ping(Bytes::new())).await {
                    return RelayEnd::WriteError(e.to_string());
                }
                session.touch();
            }
            _ = tokio::time::sleep_until(deadline) => return RelayEnd::Deadline,
            msg = client.next() => {
                deadline = Instant::now() + read_deadline;
                match msg {
                    None => return RelayEnd::PeerClosed,
                    Some(Err(e)) => return RelayEnd::ReadError(e.to_string()),
                    Some(Ok(ClientMsg::Binary(data))) => {
                        if let Err(e) = upstream.send(UpstreamMsg::Binary(data.into())).await {
                            return RelayEnd::WriteError(e.to_string());
                        }
                    }
                    Some(Ok(ClientMsg::Text(text))) => {
                        if let Err(e) = upstream.send(UpstreamMsg::Text(text.into())).await {
                            return RelayEnd::WriteError(e.to_string());
                        }
                    }
                    Some(Ok(ClientMsg::Close(frame))) => {
                        let _ = upstream
                            .send(UpstreamMsg::Close(frame.map(|f| UpstreamCloseFrame {
                                code: CloseCode::from(f.code),
                                reason: f.reason.to_string().into(),
                            })))
                            .await;
                        return RelayEnd::PeerClosed;
                    }
                    // The ws layers answer pings themselves; ping/pong only
                    // refresh the deadline here.
                    Some(Ok(ClientMsg::Ping(_) | ClientMsg::Pong(_))) => {}
                }
            }
        }
    }
}

async fn relay_upstream_to_client(
    mut upstream: SplitStream<UpstreamSocket>,
    mut client: SplitSink<WebSocket, ClientMsg>,
    session: &VncSession,
    heartbeat: Duration,
    read_deadline: Duration,
) -> RelayEnd {
    let mut ping = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    let mut deadline = Instant::now() + read_deadline;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = client.send(ClientMsg::Ping(Vec::new())).await {
                    return RelayEnd::WriteError(e.to_string());
                }
                session.touch();
            }
            _ = tokio::time::sleep_until(deadline) => return RelayEnd::Deadline,
            msg = upstream.next() => {
                deadline = Instant::now() + read_deadline;
                match msg {
                    None => return RelayEnd::PeerClosed,
                    Some(Err(e)) => return RelayEnd::ReadError(e.to_string()),
                    Some(Ok(UpstreamMsg::Binary(data))) => {
                        if let Err(e) = client.send(ClientMsg::Binary(data.to_vec())).await {
                            return RelayEnd::WriteError(e.to_string());
                        }
                    }
                    Some(Ok(UpstreamMsg::Text(text))) => {
                        if let Err(e) = client.send(ClientMsg::Text(text.as_str().to_owned())).await {
                            return RelayEnd::WriteError(e.to_string());
                        }
                    }
                    Some(Ok(UpstreamMsg::Close(frame))) => {
                        let _ = client
                            .send(ClientMsg::Close(frame.map(|f| CloseFrame {
                                code: f.code.into(),
                                reason: f.reason.as_str().to_owned().into(),
                            })))
                            .await;
                        return RelayEnd::PeerClosed;
                    }
                    Some(Ok(UpstreamMsg::Ping(_) | UpstreamMsg::Pong(_) | UpstreamMsg::Frame(_))) => {}
                }
            }
        }
    }
}
