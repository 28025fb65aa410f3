use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use super::{ClusterNode, ClusterSnapshot, ClusterVm, PveApi, VncTicket};

const TOKEN_PREFIX: &str = "PVEAPIToken";

/// Proxmox VE API client over HTTPS.
///
/// Certificate verification is disabled: PVE nodes ship self-signed certs
/// and the gateway only ever runs on an operator workstation the node owner
/// controls. This mirrors the trust posture of the loopback-only console
/// server.
pub struct PveClient {
    base_url: Url,
    auth_token: String,
    /// Required by the API on state-changing requests under cookie auth.
    csrf_token: Option<String>,
    http: reqwest::Client,
}

/// Every PVE API response wraps its payload in a `data` member.
#[derive(Deserialize)]
struct ApiResponse<T> {
    data: T,
}

impl PveClient {
    pub fn new(base_url: Url, auth_token: String, csrf_token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            base_url,
            auth_token,
            csrf_token,
            http,
        })
    }

    fn api_url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/api2/json{path}")
    }

    fn authorize(&self, req: RequestBuilder, mutating: bool) -> RequestBuilder {
        if self.is_token_auth() {
            req.header("Authorization", &self.auth_token)
        } else {
            let req = req.header("Cookie", &self.auth_token);
            match (&self.csrf_token, mutating) {
                (Some(csrf), true) => req.header("CSRFPreventionToken", csrf),
                _ => req,
            }
        }
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &BTreeMap<&str, &str>,
    ) -> anyhow::Result<T> {
        let url = self.api_url(path);
        let resp = self
            .authorize(self.http.post(&url), true)
            .form(form)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("POST {url} returned {status}: {body}"));
        }

        let body: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("decoding response of POST {url}"))?;
        Ok(body.data)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = self.api_url(path);
        let resp = self
            .authorize(self.http.get(&url), false)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {url} returned {status}: {body}"));
        }

        let body: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("decoding response of GET {url}"))?;
        Ok(body.data)
    }

    async fn guest_vnc_websocket(
        &self,
        kind: &str,
        node: &str,
        vmid: u32,
    ) -> anyhow::Result<VncTicket> {
        let path = format!("/nodes/{node}/{kind}/{vmid}/vncproxy");
        let mut form = BTreeMap::new();
        form.insert("websocket", "1");
        form.insert("generate-password", "1");
        self.post_form(&path, &form).await
    }
}

/// One row of `GET /cluster/resources?type=vm`.
#[derive(Deserialize)]
struct ResourceEntry {
    vmid: u32,
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: String,
    node: String,
    #[serde(default)]
    status: String,
}

#[async_trait]
impl PveApi for PveClient {
    fn base_url(&self) -> Url {
        self.base_url.clone()
    }

    fn auth_token(&self) -> String {
        self.auth_token.clone()
    }

    fn is_token_auth(&self) -> bool {
        self.auth_token.starts_with(TOKEN_PREFIX)
    }

    async fn qemu_vnc_websocket(&self, node: &str, vmid: u32) -> anyhow::Result<VncTicket> {
        self.guest_vnc_websocket("qemu", node, vmid).await
    }

    async fn lxc_vnc_websocket(&self, node: &str, vmid: u32) -> anyhow::Result<VncTicket> {
        self.guest_vnc_websocket("lxc", node, vmid).await
    }

    async fn node_shell_websocket(&self, node: &str) -> anyhow::Result<VncTicket> {
        let path = format!("/nodes/{node}/vncshell");
        let mut form = BTreeMap::new();
        form.insert("websocket", "1");
        self.post_form(&path, &form).await
    }

    async fn cluster_snapshot(&self) -> anyhow::Result<ClusterSnapshot> {
        let entries: Vec<ResourceEntry> = self.get_json("/cluster/resources?type=vm").await?;

        let mut nodes: BTreeMap<String, Vec<ClusterVm>> = BTreeMap::new();
        for entry in entries {
            nodes.entry(entry.node.clone()).or_default().push(ClusterVm {
                vmid: entry.vmid,
                name: entry.name,
                kind: entry.kind,
                node: entry.node,
                status: entry.status,
            });
        }

        Ok(ClusterSnapshot {
            nodes: nodes
                .into_iter()
                .map(|(node, vms)| ClusterNode { node, vms })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(token: &str) -> PveClient {
        PveClient::new(
            Url::parse("https://pve.example.com:8006").unwrap(),
            token.to_string(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn token_auth_is_detected_by_prefix() {
        assert!(client("PVEAPIToken=root@pam!tui=aaaa-bbbb").is_token_auth());
        assert!(!client("PVEAuthCookie=PVE:root@pam:AAAA").is_token_auth());
    }

    #[test]
    fn api_url_joins_without_double_slash() {
        let c = client("PVEAPIToken=x");
        assert_eq!(
            c.api_url("/nodes/pve1/vncshell"),
            "https://pve.example.com:8006/api2/json/nodes/pve1/vncshell"
        );
    }
}
