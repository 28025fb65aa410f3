use std::time::Duration;

/// Tunables for the session subsystem.
///
/// The defaults match a homelab deployment: sessions are reusable for a day,
/// each attached proxy is capped at 30 minutes, and the advisory port window
/// sits just above the common dev-server range. Tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long an idle session stays eligible for reuse before the expiry
    /// sweep tears it down. Zero disables reuse entirely: every request
    /// builds a fresh session.
    pub session_timeout: Duration,
    /// Hard deadline on one proxied attachment (browser connect to teardown).
    pub proxy_session_cap: Duration,
    /// Ping cadence on both legs of an active relay.
    pub heartbeat_interval: Duration,
    /// Per-direction receive deadline; refreshed by data frames and pongs.
    pub read_deadline: Duration,
    /// How long a session with zero connections lingers before removal.
    pub disconnect_grace: Duration,
    /// Grace given to the local HTTP server on shutdown before aborting it.
    pub http_shutdown_grace: Duration,
    /// Time allowed for the upstream TLS + WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Cadence of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Preferred local port window. Advisory only: the OS decides via an
    /// ephemeral bind when the window is exhausted or contended.
    pub port_range: (u16, u16),
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(24 * 60 * 60),
            proxy_session_cap: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(5 * 60),
            disconnect_grace: Duration::from_secs(5),
            http_shutdown_grace: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30 * 60),
            port_range: (8080, 8180),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.session_timeout, Duration::from_secs(86_400));
        assert_eq!(cfg.proxy_session_cap, Duration::from_secs(1_800));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.disconnect_grace, Duration::from_secs(5));
        assert!(cfg.port_range.0 < cfg.port_range.1);
    }
}
