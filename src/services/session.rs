//! One operator-facing console attachment: identity, lifecycle state,
//! connection accounting, and ownership of the loopback server.

use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::{ConsoleTarget, GatewayConfig};
use crate::services::proxy_config::ProxyConfig;
use crate::services::session_server::ServerHandle;

/// Lifecycle of a session.
///
/// `Active → Connected → Disconnected → (Active | Closed)`; `Closed` is
/// terminal. A `Disconnected` session is still reusable until the grace
/// watcher or the expiry sweep removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    active_connections: u32,
    last_used: Instant,
    port: u16,
    url: String,
    server: Option<ServerHandle>,
}

/// A live console session. Created by the session manager, mutated by the
/// WebSocket proxy's connect/disconnect callbacks, destroyed by the manager.
#[derive(Debug)]
pub struct VncSession {
    id: String,
    target: ConsoleTarget,
    created_at: SystemTime,
    proxy_config: ProxyConfig,
    config: GatewayConfig,
    cancel: CancellationToken,
    disconnected: Notify,
    inner: RwLock<Inner>,
}

impl VncSession {
    pub(crate) fn new(
        id: String,
        target: ConsoleTarget,
        proxy_config: ProxyConfig,
        config: GatewayConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            id,
            target,
            created_at: SystemTime::now(),
            proxy_config,
            config,
            cancel: parent.child_token(),
            disconnected: Notify::new(),
            inner: RwLock::new(Inner {
                state: SessionState::Active,
                active_connections: 0,
                last_used: Instant::now(),
                port: 0,
                url: String::new(),
                server: None,
            }),
        }
    }

    /// Hand the session its server once the listener is up. Called exactly
    /// once, before the session is published to the manager's map.
    pub(crate) fn attach_server(&self, server: ServerHandle, url: String) {
        let mut inner = self.inner.write().unwrap();
        inner.port = server.port();
        inner.url = url;
        inner.server = Some(server);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &ConsoleTarget {
        &self.target
    }

    pub fn key(&self) -> String {
        self.target.key()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn proxy_config(&self) -> &ProxyConfig {
        &self.proxy_config
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fires (single slot) when the last client disconnects.
    pub fn disconnect_signal(&self) -> &Notify {
        &self.disconnected
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().unwrap().state
    }

    pub fn active_connections(&self) -> u32 {
        self.inner.read().unwrap().active_connections
    }

    pub fn last_used(&self) -> Instant {
        self.inner.read().unwrap().last_used
    }

    pub fn port(&self) -> u16 {
        self.inner.read().unwrap().port
    }

    pub fn url(&self) -> String {
        self.inner.read().unwrap().url.clone()
    }

    /// Stamp activity. Never moves backwards.
    pub fn touch(&self) {
        let mut inner = self.inner.write().unwrap();
        let now = Instant::now();
        if now > inner.last_used {
            inner.last_used = now;
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.read().unwrap().last_used.elapsed()
    }

    /// A browser client attached. Returns false when the session is already
    /// closed and the connection must be refused.
    pub fn on_client_connected(&self) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.state == SessionState::Closed {
            return false;
        }
        inner.state = SessionState::Connected;
        inner.active_connections += 1;
        inner.last_used = Instant::now();
        debug!(
            "session {}: client connected ({} active)",
            self.id, inner.active_connections
        );
        true
    }

    /// A browser client detached. When the last one goes, the session turns
    /// `Disconnected` and the grace watcher is signalled.
    pub fn on_client_disconnected(&self) {
        let notify = {
            let mut inner = self.inner.write().unwrap();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.active_connections = inner.active_connections.saturating_sub(1);
            inner.last_used = Instant::now();
            debug!(
                "session {}: client disconnected ({} active)",
                self.id, inner.active_connections
            );
            if inner.active_connections == 0 && inner.state == SessionState::Connected {
                inner.state = SessionState::Disconnected;
                true
            } else {
                false
            }
        };
        if notify {
            self.disconnected.notify_one();
        }
    }

    /// The manager found this session reusable; bring it back to `Active`.
    pub(crate) fn mark_reused(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.state == SessionState::Disconnected {
            inner.state = SessionState::Active;
        }
        let now = Instant::now();
        if now > inner.last_used {
            inner.last_used = now;
        }
    }

    /// True when the session can satisfy a new request for the same target.
    pub(crate) fn is_reusable(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return false;
        }
        let inner = self.inner.read().unwrap();
        matches!(
            inner.state,
            SessionState::Active | SessionState::Disconnected
        ) && inner.last_used.elapsed() <= timeout
    }

    pub(crate) fn is_expired(&self, timeout: Duration) -> bool {
        !timeout.is_zero() && self.idle_for() > timeout
    }

    /// Tear the session down: cancel the relays, stop the server. Idempotent;
    /// after the first call the session is `Closed` and owns nothing.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        let server = {
            let mut inner = self.inner.write().unwrap();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.active_connections = 0;
            inner.server.take()
        };

        self.cancel.cancel();
        if let Some(server) = server {
            server.shutdown(grace).await;
        }
        debug!("session {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetKind;

    fn test_session() -> VncSession {
        let target = ConsoleTarget::guest(TargetKind::Qemu, "pve1", 100, "web1");
        let cfg = ProxyConfig {
            upstream_host: "pve1:8006".into(),
            endpoint_path: "/api2/json/nodes/pve1/qemu/100/vncwebsocket".into(),
            ticket: "t".into(),
            port: "5900".into(),
            password: String::new(),
            auth_token: "PVEAuthCookie=X".into(),
            kind: TargetKind::Qemu,
            node: "pve1".into(),
            vmid: 100,
            session_timeout: Duration::from_secs(60),
            tls: true,
        };
        VncSession::new(
            "vnc_1_qemu:pve1:100".into(),
            target,
            cfg,
            GatewayConfig::default(),
            &CancellationToken::new(),
        )
    }

    #[test]
    fn connect_disconnect_counts_balance() {
        let s = test_session();
        assert_eq!(s.state(), SessionState::Active);

        assert!(s.on_client_connected());
        assert!(s.on_client_connected());
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.active_connections(), 2);

        s.on_client_disconnected();
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.active_connections(), 1);

        s.on_client_disconnected();
        assert_eq!(s.state(), SessionState::Disconnected);
        assert_eq!(s.active_connections(), 0);
    }

    #[tokio::test]
    async fn last_disconnect_signals_exactly_once() {
        let s = test_session();
        assert!(s.on_client_connected());
        s.on_client_disconnected();

        // One permit is stored; a second wait would block.
        tokio::time::timeout(Duration::from_millis(50), s.disconnect_signal().notified())
            .await
            .expect("signal fired");
        assert!(tokio::time::timeout(
            Duration::from_millis(50),
            s.disconnect_signal().notified()
        )
        .await
        .is_err());
    }

    #[test]
    fn disconnected_session_is_reusable_until_expiry() {
        let s = test_session();
        assert!(s.on_client_connected());
        s.on_client_disconnected();
        assert!(s.is_reusable(Duration::from_secs(60)));

        s.mark_reused();
        assert_eq!(s.state(), SessionState::Active);
    }

    #[test]
    fn zero_timeout_disables_reuse() {
        let s = test_session();
        assert!(!s.is_reusable(Duration::ZERO));
        assert!(!s.is_expired(Duration::ZERO));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_terminal() {
        let s = test_session();
        s.shutdown(Duration::from_millis(100)).await;
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.cancel_token().is_cancelled());

        // No-op the second time, and further callbacks are refused.
        s.shutdown(Duration::from_millis(100)).await;
        assert!(!s.on_client_connected());
        assert_eq!(s.active_connections(), 0);
    }

    #[test]
    fn touch_is_monotonic() {
        let s = test_session();
        let before = s.last_used();
        s.touch();
        assert!(s.last_used() >= before);
    }
}
