use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_client::{RemoteHost, RemoteHostConfig};
use fleet_proto::FleetError;
use fleet_registry::{ActiveSession, HostEntry, Registry};
use tokio::sync::Mutex;
use tracing::{info, warn};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A host as presented by [`FleetManager::list_hosts`].
#[derive(Debug, Clone)]
pub struct HostSummary {
    pub name: String,
    pub ssh_host: String,
    pub connected: bool,
    pub workspace: Option<String>,
}

struct ManagerState {
    registry: Registry,
    hosts: HashMap<String, RemoteHost>,
}

/// Keyed by host name; owns the registry document and every live
/// connection. See [`crate`] docs for the locking discipline.
pub struct FleetManager {
    state: Mutex<ManagerState>,
    remote_binary: PathBuf,
}

impl FleetManager {
    pub fn new(registry: Registry, remote_binary: PathBuf) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                registry,
                hosts: HashMap::new(),
            }),
            remote_binary,
        }
    }

    pub async fn add(&self, name: &str, mut entry: HostEntry) -> Result<(), FleetError> {
        let mut state = self.state.lock().await;
        entry.active_session = None;
        state.registry.add(name, entry);
        state.registry.save()?;
        info!(host = name, "added host");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<bool, FleetError> {
        let mut state = self.state.lock().await;
        if let Some(mut host) = state.hosts.remove(name) {
            host.teardown().await;
        }
        let removed = state.registry.remove(name).is_some();
        if removed {
            state.registry.save()?;
        }
        Ok(removed)
    }

    /// Explicit, user-initiated connect: a live handle is verified with a
    /// ping; on failure it is fully torn down and replaced via
    /// resume-or-deploy. Never silently reuses a dead handle the way
    /// [`Self::get_or_connect`] does.
    pub async fn connect(&self, name: &str) -> Result<String, FleetError> {
        let mut state = self.state.lock().await;

        if let Some(host) = state.hosts.get_mut(name) {
            if host.is_connected() && with_timeout(host.ping()).await {
                return Ok(host.session_id().unwrap_or_default().to_string());
            }
            let mut host = state.hosts.remove(name).expect("just checked present");
            host.teardown().await;
        }

        resume_or_deploy(&mut state, &self.remote_binary, name).await
    }

    /// Implicit path: reuse an existing handle even if its transport is
    /// currently down, trusting the client's own auto-recovery on the next
    /// RPC. Only deploys/resumes when no handle exists at all.
    pub async fn get_or_connect(&self, name: &str) -> Result<String, FleetError> {
        let mut state = self.state.lock().await;
        if let Some(host) = state.hosts.get(name) {
            return Ok(host.session_id().unwrap_or_default().to_string());
        }
        resume_or_deploy(&mut state, &self.remote_binary, name).await
    }

    pub async fn disconnect(&self, name: &str) -> Result<bool, FleetError> {
        let mut state = self.state.lock().await;
        let Some(mut host) = state.hosts.remove(name) else {
            return Ok(false);
        };
        host.teardown().await;
        if let Some(entry) = state.registry.get_mut(name) {
            entry.active_session = None;
        }
        state.registry.save()?;
        Ok(true)
    }

    pub async fn disconnect_all(&self) -> Result<(), FleetError> {
        let mut state = self.state.lock().await;
        let names: Vec<String> = state.hosts.keys().cloned().collect();
        for name in names {
            if let Some(mut host) = state.hosts.remove(&name) {
                host.teardown().await;
            }
            if let Some(entry) = state.registry.get_mut(&name) {
                entry.active_session = None;
            }
        }
        state.registry.save()?;
        Ok(())
    }

    pub async fn list_hosts(&self) -> Vec<HostSummary> {
        let state = self.state.lock().await;
        state
            .registry
            .list()
            .map(|(name, entry)| HostSummary {
                name: name.clone(),
                ssh_host: entry.ssh_host.clone(),
                connected: state.hosts.get(name).map(|h| h.is_connected()).unwrap_or(false),
                workspace: entry.workspace.clone(),
            })
            .collect()
    }

    /// Runs a shell command on `name`, connecting implicitly first.
    pub async fn exec(&self, name: &str, command: &str, timeout: Duration) -> Result<fleet_client::ExecResult, FleetError> {
        self.get_or_connect(name).await?;
        let mut state = self.state.lock().await;
        let host = state
            .hosts
            .get_mut(name)
            .ok_or_else(|| FleetError::configuration(format!("host not found after connect: {name}")))?;
        Ok(host.exec(command, timeout).await)
    }
}

async fn with_timeout(fut: impl std::future::Future<Output = bool>) -> bool {
    tokio::time::timeout(PING_TIMEOUT, fut).await.unwrap_or(false)
}

/// Resumes a persisted session if one exists, falling back to a fresh
/// deploy. On a failed resume the persisted `active_session` is left
/// intact — only a successful fresh deploy overwrites it.
async fn resume_or_deploy(
    state: &mut ManagerState,
    remote_binary: &Path,
    name: &str,
) -> Result<String, FleetError> {
    let entry = state
        .registry
        .get(name)
        .cloned()
        .ok_or_else(|| FleetError::configuration(format!("host not found: {name}")))?;

    if let Some(active) = &entry.active_session {
        let mut host = build_host(name, &entry, remote_binary, Some(active.local_port));
        host.resume(active.session_id.clone(), active.local_port);
        match host.connect().await {
            Ok(session_id) => {
                info!(host = name, %session_id, "resumed persisted session");
                state.hosts.insert(name.to_string(), host);
                return Ok(session_id);
            }
            Err(e) => {
                warn!(host = name, "failed to resume persisted session, falling back to fresh deploy: {e}");
            }
        }
    }

    let mut host = build_host(name, &entry, remote_binary, entry.local_port);
    let session_id = host.setup().await?;
    let local_port = host
        .local_port()
        .ok_or_else(|| FleetError::fatal("setup succeeded without assigning a local port"))?;

    if let Some(stored) = state.registry.get_mut(name) {
        stored.active_session = Some(ActiveSession {
            session_id: session_id.clone(),
            local_port,
            remote_port: entry.remote_port,
            auth_token: entry.auth_token.clone(),
        });
    }
    state.registry.save()?;
    state.hosts.insert(name.to_string(), host);
    Ok(session_id)
}

fn build_host(name: &str, entry: &HostEntry, remote_binary: &Path, local_port: Option<u16>) -> RemoteHost {
    RemoteHost::new(RemoteHostConfig {
        name: name.to_string(),
        ssh_host: entry.ssh_host.clone(),
        ssh_port: entry.ssh_port,
        ssh_key_path: entry.ssh_key_path.clone(),
        remote_port: entry.remote_port,
        local_port,
        auth_token: entry.auth_token.clone(),
        remote_binary: remote_binary.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> (FleetManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::load(&dir.path().join("hosts.json")).unwrap();
        let manager = FleetManager::new(registry, dir.path().join("fleet-remote"));
        (manager, dir)
    }

    #[tokio::test]
    async fn add_then_list_reports_host() {
        let (manager, _dir) = test_manager();
        manager.add("h1", HostEntry::new("user@h1.example.com")).await.unwrap();

        let hosts = manager.list_hosts().await;
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "h1");
        assert!(!hosts[0].connected);
    }

    #[tokio::test]
    async fn remove_clears_registry_entry() {
        let (manager, _dir) = test_manager();
        manager.add("h1", HostEntry::new("user@h1")).await.unwrap();
        assert!(manager.remove("h1").await.unwrap());
        assert!(manager.list_hosts().await.is_empty());
    }

    #[tokio::test]
    async fn remove_missing_host_returns_false() {
        let (manager, _dir) = test_manager();
        assert!(!manager.remove("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn connect_to_unknown_host_errors() {
        let (manager, _dir) = test_manager();
        let err = manager.connect("ghost").await.unwrap_err();
        assert_eq!(err.kind, fleet_proto::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn disconnect_all_is_a_noop_with_no_live_hosts() {
        let (manager, _dir) = test_manager();
        manager.add("h1", HostEntry::new("user@h1")).await.unwrap();
        manager.disconnect_all().await.unwrap();
        assert!(!manager.list_hosts().await[0].connected);
    }
}
