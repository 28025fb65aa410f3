//! Upstream management API surface consumed by the gateway.
//!
//! The gateway never parses credentials or config itself; it receives a
//! ready client. [`PveApi`] is the seam the session subsystem talks
//! through, so tests can substitute a stub.

mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

pub use client::PveClient;

#[cfg(test)]
use mockall::automock;

/// One-shot console credentials issued by the vncproxy/vncshell endpoints.
///
/// `port` stays a string because that is how the API returns it; it is only
/// ever forwarded back as a query parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct VncTicket {
    pub ticket: String,
    pub port: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub upid: Option<String>,
}

/// A guest as seen in the cluster resource snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterVm {
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    /// "qemu" or "lxc" as reported by the API.
    #[serde(rename = "type")]
    pub kind: String,
    pub node: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node: String,
    pub vms: Vec<ClusterVm>,
}

/// Cached view of the cluster used for lookups and status gates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub nodes: Vec<ClusterNode>,
}

impl ClusterSnapshot {
    pub fn find_vm(&self, node: &str, vmid: u32) -> Option<&ClusterVm> {
        self.nodes
            .iter()
            .filter(|n| n.node == node)
            .flat_map(|n| n.vms.iter())
            .find(|vm| vm.vmid == vmid)
    }
}

/// The operations the session subsystem needs from the PVE API client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PveApi: Send + Sync {
    /// Base URL of the management API (scheme, host, port).
    fn base_url(&self) -> Url;

    /// The raw auth header value: `PVEAPIToken=...` for token auth or
    /// `PVEAuthCookie=...` for ticket auth.
    fn auth_token(&self) -> String;

    /// True when the client authenticates with an API token rather than a
    /// ticket cookie.
    fn is_token_auth(&self) -> bool;

    async fn qemu_vnc_websocket(&self, node: &str, vmid: u32) -> anyhow::Result<VncTicket>;

    async fn lxc_vnc_websocket(&self, node: &str, vmid: u32) -> anyhow::Result<VncTicket>;

    async fn node_shell_websocket(&self, node: &str) -> anyhow::Result<VncTicket>;

    async fn cluster_snapshot(&self) -> anyhow::Result<ClusterSnapshot>;
}

/// `host:port` of the API endpoint, for the upstream WebSocket dial.
pub fn upstream_host(base: &Url) -> String {
    let host = base.host_str().unwrap_or("localhost");
    let port = base.port().unwrap_or(8006);
    format!("{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lookup_scopes_by_node() {
        let snap = ClusterSnapshot {
            nodes: vec![
                ClusterNode {
                    node: "pve1".into(),
                    vms: vec![ClusterVm {
                        vmid: 100,
                        name: "web1".into(),
                        kind: "qemu".into(),
                        node: "pve1".into(),
                        status: "running".into(),
                    }],
                },
                ClusterNode {
                    node: "pve2".into(),
                    vms: vec![],
                },
            ],
        };

        assert!(snap.find_vm("pve1", 100).is_some());
        assert!(snap.find_vm("pve2", 100).is_none());
        assert!(snap.find_vm("pve1", 101).is_none());
    }

    #[test]
    fn upstream_host_defaults_to_8006() {
        let url = Url::parse("https://pve.example.com").unwrap();
        assert_eq!(upstream_host(&url), "pve.example.com:8006");

        let url = Url::parse("https://10.0.0.5:8007").unwrap();
        assert_eq!(upstream_host(&url), "10.0.0.5:8007");
    }
}
