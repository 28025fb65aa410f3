//! Process-wide session registry: find-or-create by target, disconnect
//! grace, periodic expiry, orderly shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::PveApi;
use crate::error::GatewayError;
use crate::models::{ConsoleTarget, GatewayConfig, TargetKind};
use crate::services::proxy_config;
use crate::services::session::{SessionState, VncSession};
use crate::services::session_server;

/// Invoked with the current session count after every add/remove, outside
/// the manager lock. Counts may arrive slightly out of order under
/// concurrency; treat the value as "current count", never as a delta.
pub type CountChanged = Arc<dyn Fn(usize) + Send + Sync>;

/// Snapshot of one session for UI listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub kind: TargetKind,
    pub node: String,
    pub vmid: u32,
    pub name: String,
    pub port: u16,
    pub url: String,
    pub state: SessionState,
    pub active_connections: u32,
    pub created_at_unix: u64,
    pub idle_secs: u64,
}

struct ManagerState {
    sessions: HashMap<String, Arc<VncSession>>,
    /// Advisory only; the kernel is the authority via the actual bind.
    used_ports: HashSet<u16>,
    client: Arc<dyn PveApi>,
    /// Disambiguates IDs minted within the same second for one target.
    id_counter: u64,
}

pub struct VncSessionManager {
    config: GatewayConfig,
    cancel: CancellationToken,
    state: Mutex<ManagerState>,
    count_changed: std::sync::Mutex<Option<CountChanged>>,
}

impl VncSessionManager {
    pub fn new(client: Arc<dyn PveApi>, config: GatewayConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            cancel: CancellationToken::new(),
            state: Mutex::new(ManagerState {
                sessions: HashMap::new(),
                used_ports: HashSet::new(),
                client,
                id_counter: 0,
            }),
            count_changed: std::sync::Mutex::new(None),
        });
        manager.spawn_sweeper();
        manager
    }

    /// Register the count observer. At most one; later calls replace it.
    pub fn set_count_changed(&self, callback: CountChanged) {
        *self.count_changed.lock().unwrap() = Some(callback);
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Return an existing session for the target or build a new one.
    ///
    /// A match is reused when it is `Active` or `Disconnected` and not past
    /// the session timeout; a `Disconnected` match is revived to `Active`.
    /// The manager lock is held across creation, so concurrent requests for
    /// the same target converge on one session.
    pub async fn create_or_reuse(
        self: &Arc<Self>,
        target: &ConsoleTarget,
    ) -> Result<Arc<VncSession>, GatewayError> {
        let key = target.key();
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .sessions
            .values()
            .find(|s| s.key() == key && s.is_reusable(self.config.session_timeout))
        {
            debug!("reusing session {} for {key}", existing.id());
            existing.mark_reused();
            return Ok(Arc::clone(existing));
        }

        let client = Arc::clone(&state.client);

        // Defensive gates; the UI checks these before calling, but a stale
        // snapshot or a misbehaving caller must not get a half-built session.
        match target.kind {
            TargetKind::Qemu | TargetKind::Lxc => {
                let snapshot = client
                    .cluster_snapshot()
                    .await
                    .map_err(|e| GatewayError::upstream(key.clone(), e))?;
                let vm = snapshot
                    .find_vm(&target.node, target.vmid)
                    .ok_or_else(|| GatewayError::TargetNotFound {
                        node: target.node.clone(),
                        vmid: target.vmid,
                    })?;
                if vm.status != "running" {
                    return Err(GatewayError::TargetNotRunning(target.name.clone()));
                }
            }
            TargetKind::Node => {
                if client.is_token_auth() {
                    return Err(GatewayError::AuthIncapable);
                }
            }
        }

        let proxy_cfg =
            proxy_config::build(client.as_ref(), target, self.config.proxy_session_cap).await?;

        let id = {
            let unix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let base = format!("vnc_{unix}_{key}");
            if state.sessions.contains_key(&base) {
                state.id_counter += 1;
                format!("{base}_{}", state.id_counter)
            } else {
                base
            }
        };

        let preferred = preferred_port(&self.config.port_range, &state.used_ports);
        let password = proxy_cfg.password.clone();
        let session = Arc::new(VncSession::new(
            id.clone(),
            target.clone(),
            proxy_cfg,
            self.config.clone(),
            &self.cancel,
        ));

        let server = session_server::start(Arc::clone(&session), preferred).await?;
        let port = server.port();
        session.attach_server(server, session_server::console_url(port, &password));

        state.used_ports.insert(port);
        state.sessions.insert(id.clone(), Arc::clone(&session));
        let count = state.sessions.len();
        drop(state);

        info!("created session {id} on 127.0.0.1:{port} for {key}");
        self.spawn_grace_watcher(Arc::clone(&session));
        self.emit_count(count);
        Ok(session)
    }

    /// Close one session. The second close of the same ID reports
    /// `SessionNotFound` rather than panicking.
    pub async fn close(&self, id: &str) -> Result<(), GatewayError> {
        let (session, count) = {
            let mut state = self.state.lock().await;
            let session = state
                .sessions
                .remove(id)
                .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
            state.used_ports.remove(&session.port());
            (session, state.sessions.len())
        };

        session.shutdown(self.config.http_shutdown_grace).await;
        self.emit_count(count);
        Ok(())
    }

    /// Close every session. Safe to call when there are none.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<VncSession>> = {
            let mut state = self.state.lock().await;
            state.used_ports.clear();
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }

        info!("closing {} console session(s)", sessions.len());
        for session in sessions {
            session.shutdown(self.config.http_shutdown_grace).await;
        }
        self.emit_count(0);
    }

    /// Shut down sessions older than `max_age` since their last activity.
    /// Returns how many were removed.
    pub async fn cleanup_inactive(&self, max_age: Duration) -> usize {
        let (expired, count) = {
            let mut state = self.state.lock().await;
            let ids: Vec<String> = state
                .sessions
                .values()
                .filter(|s| s.is_expired(max_age))
                .map(|s| s.id().to_string())
                .collect();
            let expired: Vec<Arc<VncSession>> = ids
                .iter()
                .filter_map(|id| state.sessions.remove(id))
                .collect();
            for session in &expired {
                state.used_ports.remove(&session.port());
            }
            (expired, state.sessions.len())
        };

        if expired.is_empty() {
            return 0;
        }

        let removed = expired.len();
        for session in expired {
            info!("session {} expired, removing", session.id());
            session.shutdown(self.config.http_shutdown_grace).await;
        }
        self.emit_count(count);
        removed
    }

    pub async fn get(&self, id: &str) -> Option<Arc<VncSession>> {
        self.state.lock().await.sessions.get(id).map(Arc::clone)
    }

    /// Resolve a UI row (kind + display name) to its session, if any.
    pub async fn get_by_target(&self, kind: TargetKind, name: &str) -> Option<Arc<VncSession>> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .find(|s| s.target().kind == kind && s.target().name == name)
            .map(Arc::clone)
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .map(|s| session_info(s))
            .collect()
    }

    pub async fn client(&self) -> Arc<dyn PveApi> {
        Arc::clone(&self.state.lock().await.client)
    }

    /// Swap the upstream client, e.g. after a profile switch. All existing
    /// sessions hold tickets from the old endpoint and are closed first.
    pub async fn update_client(&self, client: Arc<dyn PveApi>) {
        self.close_all().await;
        self.state.lock().await.client = client;
    }

    /// Cancel background tasks and drain all sessions. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.close_all().await;
    }

    /// Drop a specific session from the registry (if it is still the one
    /// registered under its ID) and finish its teardown.
    async fn reap(&self, session: &Arc<VncSession>) {
        let removed = {
            let mut state = self.state.lock().await;
            let present = state
                .sessions
                .get(session.id())
                .is_some_and(|s| Arc::ptr_eq(s, session));
            if present {
                state.sessions.remove(session.id());
                state.used_ports.remove(&session.port());
                Some(state.sessions.len())
            } else {
                None
            }
        };

        if let Some(count) = removed {
            info!("session {} ended, removing", session.id());
            session.shutdown(self.config.http_shutdown_grace).await;
            self.emit_count(count);
        }
    }

    fn emit_count(&self, count: usize) {
        let callback = self.count_changed.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(count);
        }
    }

    /// Watches one session for its last-client-gone signal, then removes it
    /// once the grace window passes without a reconnect or reuse. A session
    /// whose own token is cancelled (failed upstream dial, external close)
    /// is reaped right away.
    fn spawn_grace_watcher(self: &Arc<Self>, session: Arc<VncSession>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = session.cancel_token().cancelled() => {
                        if !manager.cancel.is_cancelled() {
                            manager.reap(&session).await;
                        }
                        return;
                    }
                    _ = session.disconnect_signal().notified() => {}
                }

                tokio::time::sleep(manager.config.disconnect_grace).await;

                let removed = {
                    let mut state = manager.state.lock().await;
                    let still_idle = state
                        .sessions
                        .get(session.id())
                        .is_some_and(|s| {
                            Arc::ptr_eq(s, &session)
                                && s.active_connections() == 0
                                && s.state() == SessionState::Disconnected
                        });
                    if still_idle {
                        state.sessions.remove(session.id());
                        state.used_ports.remove(&session.port());
                        Some(state.sessions.len())
                    } else {
                        None
                    }
                };

                match removed {
                    Some(count) => {
                        info!(
                            "session {} idle past disconnect grace, removing",
                            session.id()
                        );
                        session.shutdown(manager.config.http_shutdown_grace).await;
                        manager.emit_count(count);
                        return;
                    }
                    // Reconnected or reused within the grace window.
                    None => debug!("session {} survived disconnect grace", session.id()),
                }
            }
        });
    }

    /// Periodic expiry sweep against the configured session timeout. With
    /// the default 24 h timeout this is mostly a no-op; `cleanup_inactive`
    /// exists for callers that want a shorter age.
    fn spawn_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let period = manager.config.sweep_interval;
            let mut tick =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let removed = manager
                            .cleanup_inactive(manager.config.session_timeout)
                            .await;
                        if removed > 0 {
                            warn!("expiry sweep removed {removed} stale session(s)");
                        }
                    }
                }
            }
        });
    }
}

fn session_info(session: &Arc<VncSession>) -> SessionInfo {
    let target = session.target();
    SessionInfo {
        id: session.id().to_string(),
        kind: target.kind,
        node: target.node.clone(),
        vmid: target.vmid,
        name: target.name.clone(),
        port: session.port(),
        url: session.url(),
        state: session.state(),
        active_connections: session.active_connections(),
        created_at_unix: session
            .created_at()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        idle_secs: session.idle_for().as_secs(),
    }
}

fn preferred_port(range: &(u16, u16), used: &HashSet<u16>) -> Option<u16> {
    (range.0..=range.1).find(|p| !used.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_port_skips_used_entries() {
        let mut used = HashSet::new();
        assert_eq!(preferred_port(&(8080, 8082), &used), Some(8080));

        used.insert(8080);
        used.insert(8081);
        assert_eq!(preferred_port(&(8080, 8082), &used), Some(8082));

        used.insert(8082);
        assert_eq!(preferred_port(&(8080, 8082), &used), None);
    }
}
