//! Per-session loopback HTTP server: serves the embedded browser VNC client
//! at `/` and hands `/vnc-proxy` upgrades to the WebSocket proxy.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use log::{debug, error, warn};
use rust_embed::RustEmbed;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::services::session::VncSession;
use crate::services::ws_proxy;

/// Path the browser client opens its WebSocket on.
pub const PROXY_PATH: &str = "vnc-proxy";
/// Short alias that 302s to the full client URL.
pub const FORWARD_PATH: &str = "vnc-forward";

/// Browser VNC client bundle, compiled into the binary.
#[derive(RustEmbed)]
#[folder = "assets/novnc/"]
struct NovncAssets;

/// A running per-session server. Owned exclusively by its session.
#[derive(Debug)]
pub struct ServerHandle {
    port: u16,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Cooperative shutdown with a grace window, then abort. Safe to call
    /// on an already-stopped server.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let abort = self.task.abort_handle();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!("console server on port {} did not stop in time, aborting", self.port);
            abort.abort();
        }
    }
}

/// Bind a loopback listener (preferring `preferred` when given, falling back
/// to an OS-assigned ephemeral port) and serve the session's routes on it.
pub async fn start(
    session: Arc<VncSession>,
    preferred: Option<u16>,
) -> Result<ServerHandle, GatewayError> {
    let listener = bind_loopback(preferred).await?;
    let port = listener
        .local_addr()
        .map_err(GatewayError::PortUnavailable)?
        .port();

    let router = Router::new()
        .route(&format!("/{PROXY_PATH}"), get(ws_proxy::handle))
        .route(&format!("/{FORWARD_PATH}"), get(forward))
        .fallback(serve_asset)
        .with_state(session);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone().cancelled_owned();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("console server on port {port} failed: {e}");
        }
    });

    debug!("console server listening on 127.0.0.1:{port}");
    Ok(ServerHandle { port, cancel, task })
}

async fn bind_loopback(preferred: Option<u16>) -> Result<TcpListener, GatewayError> {
    if let Some(port) = preferred {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
            return Ok(listener);
        }
    }
    TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(GatewayError::PortUnavailable)
}

/// The URL the operator's browser opens, query parameters preloaded for the
/// embedded client: loopback host/port, escaped password, and the proxy path.
pub fn console_url(port: u16, password: &str) -> String {
    format!(
        "http://localhost:{port}/vnc_lite.html?host=localhost&port={port}&password={}&path={PROXY_PATH}",
        urlencoding::encode(password)
    )
}

/// Compact alias for display and copy-paste. Anything that does not look
/// like a local console URL passes through unchanged.
pub fn shorten_console_url(url: &str) -> String {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    let port = rest
        .and_then(|r| r.strip_prefix("localhost:"))
        .and_then(|r| r.split_once('/'))
        .and_then(|(port, _)| port.parse::<u16>().ok());

    match port {
        Some(port) => format!("http://localhost:{port}/{FORWARD_PATH}"),
        None => url.to_string(),
    }
}

async fn forward(State(session): State<Arc<VncSession>>) -> Redirect {
    Redirect::temporary(&session.url())
}

async fn serve_asset(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "vnc_lite.html" } else { path };

    match NovncAssets::get(path) {
        Some(file) => (
            [(header::CONTENT_TYPE, content_type(path))],
            file.data.into_owned(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

fn content_type(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_url_carries_escaped_password() {
        let url = console_url(8080, "p@ss w");
        assert_eq!(
            url,
            "http://localhost:8080/vnc_lite.html?host=localhost&port=8080&password=p%40ss%20w&path=vnc-proxy"
        );
    }

    #[test]
    fn shortener_rewrites_local_console_urls() {
        let long = console_url(8123, "x");
        assert_eq!(shorten_console_url(&long), "http://localhost:8123/vnc-forward");
    }

    #[test]
    fn shortener_passes_foreign_urls_through() {
        for url in [
            "https://example.com/vnc_lite.html",
            "http://localhost/nopo",
            "http://localhost:notaport/x",
            "ftp://localhost:8080/x",
            "http://localhost:8080",
        ] {
            assert_eq!(shorten_console_url(url), url);
        }
    }

    #[test]
    fn client_bundle_is_embedded() {
        assert!(NovncAssets::get("vnc_lite.html").is_some());
        assert!(NovncAssets::get("vnc.html").is_some());
        assert!(NovncAssets::get("missing.html").is_none());
    }

    #[test]
    fn content_types_cover_bundle_files() {
        assert_eq!(content_type("vnc_lite.html"), "text/html; charset=utf-8");
        assert_eq!(content_type("app.css"), "text/css");
        assert_eq!(content_type("rfb.js"), "text/javascript");
        assert_eq!(content_type("noext"), "application/octet-stream");
    }
}
