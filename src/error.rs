use thiserror::Error;

/// Errors surfaced by the gateway to its caller (the terminal UI).
///
/// Mid-session transport failures are not represented here; they end the
/// affected session and are reported to the peers as WebSocket close codes.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Node shells authenticate with the ticket cookie; the PVE API rejects
    /// bearer tokens for the vncshell endpoint.
    #[error("node shell requires cookie authentication (API token auth is active)")]
    AuthIncapable,

    #[error("unsupported target kind '{0}' for a VNC console")]
    UnsupportedTargetKind(String),

    #[error("guest {vmid} not found on node {node}")]
    TargetNotFound { node: String, vmid: u32 },

    #[error("guest '{0}' is not running")]
    TargetNotRunning(String),

    #[error("upstream API request failed for {target}")]
    UpstreamApi {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no loopback port available for the console server")]
    PortUnavailable(#[source] std::io::Error),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("failed to open browser: {0}")]
    BrowserLaunch(String),
}

impl GatewayError {
    pub(crate) fn upstream(target: impl Into<String>, source: anyhow::Error) -> Self {
        GatewayError::UpstreamApi {
            target: target.into(),
            source,
        }
    }
}
