//! Public face of the console subsystem: the operations the terminal UI
//! invokes, plus the "open it in the browser" side effect.

use std::sync::Arc;

use log::info;

use crate::api::{ClusterVm, PveApi};
use crate::error::GatewayError;
use crate::models::{ConsoleTarget, GatewayConfig, TargetKind};
use crate::services::browser;
use crate::services::session::VncSession;
use crate::services::session_manager::{CountChanged, SessionInfo, VncSessionManager};
use crate::services::session_server;

pub struct ConsoleGateway {
    manager: Arc<VncSessionManager>,
}

impl ConsoleGateway {
    pub fn new(client: Arc<dyn PveApi>, config: GatewayConfig) -> Self {
        Self {
            manager: VncSessionManager::new(client, config),
        }
    }

    pub fn manager(&self) -> &Arc<VncSessionManager> {
        &self.manager
    }

    pub fn set_count_changed(&self, callback: CountChanged) {
        self.manager.set_count_changed(callback);
    }

    /// Whether the UI should offer a console action for this guest.
    pub fn can_open_vm_console(vm: &ClusterVm) -> bool {
        matches!(vm.kind.as_str(), "qemu" | "lxc") && vm.status == "running"
    }

    /// Whether the UI should offer node shells under the current credentials.
    pub async fn can_open_node_shell(&self) -> bool {
        !self.manager.client().await.is_token_auth()
    }

    /// Open (or reuse) a console session for a guest and return it. The
    /// session's URL is ready for the browser.
    pub async fn open_vm_console(&self, vm: &ClusterVm) -> Result<Arc<VncSession>, GatewayError> {
        let kind = match vm.kind.as_str() {
            "qemu" => TargetKind::Qemu,
            "lxc" => TargetKind::Lxc,
            other => return Err(GatewayError::UnsupportedTargetKind(other.to_string())),
        };
        if vm.status != "running" {
            return Err(GatewayError::TargetNotRunning(display_name(vm)));
        }

        let target = ConsoleTarget::guest(kind, vm.node.clone(), vm.vmid, display_name(vm));
        self.manager.create_or_reuse(&target).await
    }

    /// Open (or reuse) a login shell session on a node.
    pub async fn open_node_shell(&self, node: &str) -> Result<Arc<VncSession>, GatewayError> {
        if self.manager.client().await.is_token_auth() {
            return Err(GatewayError::AuthIncapable);
        }
        let target = ConsoleTarget::node_shell(node);
        self.manager.create_or_reuse(&target).await
    }

    /// `open_vm_console` plus launching the operator's browser at the URL.
    pub async fn open_vm_console_in_browser(
        &self,
        vm: &ClusterVm,
    ) -> Result<Arc<VncSession>, GatewayError> {
        let session = self.open_vm_console(vm).await?;
        browser::open_url(&session.url())?;
        Ok(session)
    }

    pub async fn open_node_shell_in_browser(
        &self,
        node: &str,
    ) -> Result<Arc<VncSession>, GatewayError> {
        let session = self.open_node_shell(node).await?;
        browser::open_url(&session.url())?;
        Ok(session)
    }

    /// Compact URL for display next to a session row.
    pub fn display_url(session: &VncSession) -> String {
        session_server::shorten_console_url(&session.url())
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.manager.list().await
    }

    pub async fn session_count(&self) -> usize {
        self.manager.count().await
    }

    pub async fn close_session(&self, id: &str) -> Result<(), GatewayError> {
        self.manager.close(id).await
    }

    pub async fn close_all_sessions(&self) {
        self.manager.close_all().await
    }

    /// Profile switch: drop every session, then talk to the new endpoint.
    pub async fn update_client(&self, client: Arc<dyn PveApi>) {
        info!("switching upstream client, closing existing console sessions");
        self.manager.update_client(client).await;
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}

fn display_name(vm: &ClusterVm) -> String {
    if vm.name.is_empty() {
        vm.vmid.to_string()
    } else {
        vm.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockPveApi;

    fn vm(kind: &str, status: &str) -> ClusterVm {
        ClusterVm {
            vmid: 100,
            name: "web1".into(),
            kind: kind.into(),
            node: "pve1".into(),
            status: status.into(),
        }
    }

    #[test]
    fn console_gate_requires_guest_kind_and_running() {
        assert!(ConsoleGateway::can_open_vm_console(&vm("qemu", "running")));
        assert!(ConsoleGateway::can_open_vm_console(&vm("lxc", "running")));
        assert!(!ConsoleGateway::can_open_vm_console(&vm("qemu", "stopped")));
        assert!(!ConsoleGateway::can_open_vm_console(&vm("node", "running")));
    }

    #[tokio::test]
    async fn stopped_vm_is_refused_before_any_api_call() {
        let gateway = ConsoleGateway::new(Arc::new(MockPveApi::new()), GatewayConfig::default());
        let err = gateway.open_vm_console(&vm("qemu", "stopped")).await.unwrap_err();
        assert!(matches!(err, GatewayError::TargetNotRunning(name) if name == "web1"));
    }

    #[tokio::test]
    async fn unknown_kind_is_refused() {
        let gateway = ConsoleGateway::new(Arc::new(MockPveApi::new()), GatewayConfig::default());
        let err = gateway.open_vm_console(&vm("openvz", "running")).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedTargetKind(k) if k == "openvz"));
    }

    #[tokio::test]
    async fn node_shell_gate_follows_auth_mode() {
        let mut api = MockPveApi::new();
        api.expect_is_token_auth().return_const(true);
        let gateway = ConsoleGateway::new(Arc::new(api), GatewayConfig::default());

        assert!(!gateway.can_open_node_shell().await);
        let err = gateway.open_node_shell("pve1").await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthIncapable));
    }
}
