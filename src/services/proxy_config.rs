//! Resolves an abstract console target into concrete upstream connection
//! parameters: endpoint path, one-shot ticket, VNC port, password, and the
//! auth header the upstream WebSocket dial must carry.

use std::time::Duration;

use crate::api::{upstream_host, PveApi};
use crate::error::GatewayError;
use crate::models::{ConsoleTarget, TargetKind};

/// Connection parameters for one upstream console WebSocket.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// `host:port` of the management API endpoint.
    pub upstream_host: String,
    /// API path of the vncwebsocket endpoint for this target.
    pub endpoint_path: String,
    /// One-shot console ticket; URL-escaped when put on the wire.
    pub ticket: String,
    /// Upstream VNC port, kept as the string the API returned.
    pub port: String,
    /// Password the browser client presents during the RFB handshake.
    /// May be empty for qemu guests.
    pub password: String,
    /// Raw auth header value (`PVEAPIToken=...` or `PVEAuthCookie=...`).
    pub auth_token: String,
    pub kind: TargetKind,
    pub node: String,
    pub vmid: u32,
    /// Hard cap on one attached proxy session.
    pub session_timeout: Duration,
    /// Dial `wss://` rather than `ws://`. Follows the API base URL scheme,
    /// so an `http://` endpoint (test upstreams) gets a plain dial.
    pub tls: bool,
}

impl ProxyConfig {
    /// Full upstream dial URL, ticket escaped.
    pub fn upstream_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!(
            "{}://{}{}?port={}&vncticket={}",
            scheme,
            self.upstream_host,
            self.endpoint_path,
            self.port,
            urlencoding::encode(&self.ticket)
        )
    }

    /// Header the upstream handshake authenticates with. Token values ride
    /// in `Authorization`; ticket cookies ride in `Cookie`. Anything else is
    /// assumed to be bearer-style and sent as `Authorization`.
    pub fn auth_header(&self) -> (&'static str, String) {
        if self.auth_token.starts_with("PVEAuthCookie=") {
            ("Cookie", self.auth_token.clone())
        } else {
            ("Authorization", self.auth_token.clone())
        }
    }
}

fn endpoint_path(kind: TargetKind, node: &str, vmid: u32) -> String {
    match kind {
        TargetKind::Qemu => format!("/api2/json/nodes/{node}/qemu/{vmid}/vncwebsocket"),
        TargetKind::Lxc => format!("/api2/json/nodes/{node}/lxc/{vmid}/vncwebsocket"),
        TargetKind::Node => format!("/api2/json/nodes/{node}/vncwebsocket"),
    }
}

/// Fetch a ticket for `target` and assemble the proxy parameters.
///
/// Node shells are refused outright under token auth: the vncshell endpoint
/// only accepts cookie-authenticated callers.
pub async fn build(
    client: &dyn PveApi,
    target: &ConsoleTarget,
    session_timeout: Duration,
) -> Result<ProxyConfig, GatewayError> {
    let ticket = match target.kind {
        TargetKind::Qemu => client
            .qemu_vnc_websocket(&target.node, target.vmid)
            .await
            .map_err(|e| GatewayError::upstream(target.key(), e))?,
        TargetKind::Lxc => client
            .lxc_vnc_websocket(&target.node, target.vmid)
            .await
            .map_err(|e| GatewayError::upstream(target.key(), e))?,
        TargetKind::Node => {
            if client.is_token_auth() {
                return Err(GatewayError::AuthIncapable);
            }
            client
                .node_shell_websocket(&target.node)
                .await
                .map_err(|e| GatewayError::upstream(target.key(), e))?
        }
    };

    // Containers and node shells authenticate the RFB handshake with the
    // ticket when the API returns no dedicated password. Qemu keeps whatever
    // the API said, empty included.
    let api_password = ticket.password.clone().unwrap_or_default();
    let password = match target.kind {
        TargetKind::Qemu => api_password,
        TargetKind::Lxc | TargetKind::Node => {
            if api_password.is_empty() {
                ticket.ticket.clone()
            } else {
                api_password
            }
        }
    };

    let base_url = client.base_url();
    Ok(ProxyConfig {
        upstream_host: upstream_host(&base_url),
        endpoint_path: endpoint_path(target.kind, &target.node, target.vmid),
        ticket: ticket.ticket,
        port: ticket.port,
        password,
        auth_token: client.auth_token(),
        kind: target.kind,
        node: target.node.clone(),
        vmid: target.vmid,
        session_timeout,
        tls: base_url.scheme() == "https",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockPveApi, VncTicket};
    use url::Url;

    fn ticket(password: Option<&str>) -> VncTicket {
        VncTicket {
            ticket: "PVEVNC:AAAA::BBBB".to_string(),
            port: "5900".to_string(),
            password: password.map(str::to_string),
            upid: None,
        }
    }

    fn mock(token: &str) -> MockPveApi {
        let mut api = MockPveApi::new();
        api.expect_base_url()
            .return_const(Url::parse("https://pve1.lab:8006").unwrap());
        let token = token.to_string();
        api.expect_auth_token().returning(move || token.clone());
        api
    }

    #[tokio::test]
    async fn qemu_keeps_empty_password() {
        let mut api = mock("PVEAuthCookie=PVE:root@pam:X");
        api.expect_is_token_auth().return_const(false);
        api.expect_qemu_vnc_websocket()
            .returning(|_, _| Ok(ticket(None)));

        let target = ConsoleTarget::guest(TargetKind::Qemu, "pve1", 100, "web1");
        let cfg = build(&api, &target, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cfg.password, "");
        assert_eq!(
            cfg.endpoint_path,
            "/api2/json/nodes/pve1/qemu/100/vncwebsocket"
        );
        assert_eq!(cfg.upstream_host, "pve1.lab:8006");
        assert!(cfg.tls, "https endpoint dials wss");
    }

    #[tokio::test]
    async fn lxc_falls_back_to_ticket_password() {
        let mut api = mock("PVEAuthCookie=PVE:root@pam:X");
        api.expect_is_token_auth().return_const(false);
        api.expect_lxc_vnc_websocket()
            .returning(|_, _| Ok(ticket(None)));

        let target = ConsoleTarget::guest(TargetKind::Lxc, "pve1", 120, "ct1");
        let cfg = build(&api, &target, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cfg.password, "PVEVNC:AAAA::BBBB");
        assert_eq!(
            cfg.endpoint_path,
            "/api2/json/nodes/pve1/lxc/120/vncwebsocket"
        );
    }

    #[tokio::test]
    async fn node_shell_rejected_under_token_auth() {
        let mut api = MockPveApi::new();
        api.expect_is_token_auth().return_const(true);

        let target = ConsoleTarget::node_shell("pve1");
        let err = build(&api, &target, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthIncapable));
    }

    #[tokio::test]
    async fn node_shell_path_has_no_vmid() {
        let mut api = mock("PVEAuthCookie=PVE:root@pam:X");
        api.expect_is_token_auth().return_const(false);
        api.expect_node_shell_websocket()
            .returning(|_| Ok(ticket(Some("sekret"))));

        let target = ConsoleTarget::node_shell("pve1");
        let cfg = build(&api, &target, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cfg.endpoint_path, "/api2/json/nodes/pve1/vncwebsocket");
        assert_eq!(cfg.password, "sekret");
    }

    #[test]
    fn upstream_url_escapes_ticket() {
        let cfg = ProxyConfig {
            upstream_host: "pve1.lab:8006".into(),
            endpoint_path: "/api2/json/nodes/pve1/qemu/100/vncwebsocket".into(),
            ticket: "PVEVNC:AAAA::BB+B".into(),
            port: "5900".into(),
            password: String::new(),
            auth_token: "PVEAPIToken=a@pam!t=u".into(),
            kind: TargetKind::Qemu,
            node: "pve1".into(),
            vmid: 100,
            session_timeout: Duration::from_secs(60),
            tls: true,
        };

        let url = cfg.upstream_url();
        assert!(url.starts_with("wss://pve1.lab:8006/api2/json/nodes/pve1/qemu/100/vncwebsocket?"));
        assert!(url.contains("port=5900"));
        assert!(url.contains("vncticket=PVEVNC%3AAAAA%3A%3ABB%2BB"));
    }

    #[test]
    fn auth_header_discriminates_on_prefix() {
        let mut cfg = ProxyConfig {
            upstream_host: "h:8006".into(),
            endpoint_path: "/p".into(),
            ticket: String::new(),
            port: "5900".into(),
            password: String::new(),
            auth_token: "PVEAPIToken=a@pam!t=u".into(),
            kind: TargetKind::Qemu,
            node: "n".into(),
            vmid: 1,
            session_timeout: Duration::from_secs(1),
            tls: true,
        };
        assert_eq!(cfg.auth_header().0, "Authorization");

        cfg.auth_token = "PVEAuthCookie=PVE:root@pam:X".into();
        assert_eq!(cfg.auth_header().0, "Cookie");

        cfg.auth_token = "Bearer something".into();
        assert_eq!(cfg.auth_header().0, "Authorization");
    }
}
