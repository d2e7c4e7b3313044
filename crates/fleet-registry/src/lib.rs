#![doc = r#"
fleet-registry: the on-disk host configuration document.

A single JSON file maps host name to [`HostEntry`]. Saves are atomic at
document granularity — the whole file is rewritten via a temp file in the
same directory followed by an atomic rename, so a crash mid-write cannot
truncate the registry. Callers (the fleet manager) are responsible for
serializing concurrent saves; this crate does no locking of its own.
"#]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fleet_proto::FleetError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A snapshot of a remote session written when a deploy succeeds and
/// cleared on disconnect/remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: String,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Configuration for a single remote host, keyed by name in [`Registry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEntry {
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub active_session: Option<ActiveSession>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_port() -> u16 {
    8765
}

impl HostEntry {
    pub fn new(ssh_host: impl Into<String>) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port: default_ssh_port(),
            ssh_key_path: None,
            remote_port: default_remote_port(),
            local_port: None,
            auth_token: None,
            workspace: None,
            active_session: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    hosts: BTreeMap<String, HostEntry>,
}

/// The loaded, mutable registry document plus the path it was loaded from.
#[derive(Debug, Clone)]
pub struct Registry {
    document: RegistryDocument,
    path: PathBuf,
}

impl Registry {
    /// Default registry location: `$NANOBOT_CONFIG_DIR/hosts.json`, falling
    /// back to `$HOME/.nanobot/hosts.json`. The env var keeps its original
    /// name since it is on-disk/wire-compatible behavior, not a reference
    /// to any particular project.
    pub fn default_path() -> Result<PathBuf, FleetError> {
        if let Ok(dir) = std::env::var("NANOBOT_CONFIG_DIR") {
            return Ok(PathBuf::from(dir).join("hosts.json"));
        }
        let home = dirs_next::home_dir()
            .ok_or_else(|| FleetError::configuration("could not determine home directory"))?;
        Ok(home.join(".nanobot").join("hosts.json"))
    }

    /// Loads the registry from `path`. A missing or empty file yields an
    /// empty registry, which is immediately persisted back to disk so the
    /// file exists after the first load (matching the reference config
    /// loader's behavior).
    pub fn load(path: &Path) -> Result<Self, FleetError> {
        if !path.exists() {
            let registry = Self {
                document: RegistryDocument::default(),
                path: path.to_path_buf(),
            };
            registry.save()?;
            return Ok(registry);
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::configuration(format!("failed to read {path:?}: {e}")))?;

        if content.trim().is_empty() {
            let registry = Self {
                document: RegistryDocument::default(),
                path: path.to_path_buf(),
            };
            registry.save()?;
            return Ok(registry);
        }

        let document: RegistryDocument = serde_json::from_str(&content)
            .map_err(|e| FleetError::configuration(format!("invalid registry document: {e}")))?;

        Ok(Self {
            document,
            path: path.to_path_buf(),
        })
    }

    /// Atomically rewrites the whole document: temp file in the same
    /// directory, synced, then renamed over the target path.
    pub fn save(&self) -> Result<(), FleetError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| FleetError::configuration("registry path has no parent directory"))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| FleetError::configuration(format!("failed to create {parent:?}: {e}")))?;

        let json = serde_json::to_string_pretty(&self.document)
            .map_err(|e| FleetError::configuration(format!("failed to serialize registry: {e}")))?;

        let temp_file = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| FleetError::configuration(format!("failed to create temp file: {e}")))?;
        std::fs::write(temp_file.path(), &json)
            .map_err(|e| FleetError::configuration(format!("failed to write temp file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(temp_file.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| {
                    FleetError::configuration(format!("failed to set registry permissions: {e}"))
                })?;
        }

        let persisted = temp_file
            .persist(&self.path)
            .map_err(|e| FleetError::configuration(format!("failed to persist registry: {e}")))?;
        persisted
            .sync_all()
            .map_err(|e| FleetError::configuration(format!("failed to sync registry: {e}")))?;

        debug!(path = ?self.path, hosts = self.document.hosts.len(), "saved registry");
        Ok(())
    }

    pub fn add(&mut self, name: impl Into<String>, entry: HostEntry) {
        self.document.hosts.insert(name.into(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<HostEntry> {
        self.document.hosts.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&HostEntry> {
        self.document.hosts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut HostEntry> {
        self.document.hosts.get_mut(name)
    }

    pub fn list(&self) -> impl Iterator<Item = (&String, &HostEntry)> {
        self.document.hosts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_yields_empty_registry_and_persists_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        assert!(!path.exists());

        let registry = Registry::load(&path).unwrap();
        assert_eq!(registry.list().count(), 0);
        assert!(path.exists());
    }

    #[test]
    fn load_empty_file_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, "").unwrap();

        let registry = Registry::load(&path).unwrap();
        assert_eq!(registry.list().count(), 0);
    }

    #[test]
    fn save_then_load_round_trips_host_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");

        let mut registry = Registry::load(&path).unwrap();
        let mut entry = HostEntry::new("user@h1.example.com");
        entry.active_session = Some(ActiveSession {
            session_id: "fleet-deadbeef".to_string(),
            local_port: 39812,
            remote_port: 8765,
            auth_token: Some("secret".to_string()),
        });
        registry.add("h1", entry.clone());
        registry.save().unwrap();

        let reloaded = Registry::load(&path).unwrap();
        assert_eq!(reloaded.get("h1"), Some(&entry));
    }

    #[test]
    fn remove_clears_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        let mut registry = Registry::load(&path).unwrap();
        registry.add("h1", HostEntry::new("user@h1"));
        assert!(registry.remove("h1").is_some());
        assert!(registry.get("h1").is_none());
    }

    #[test]
    fn defaults_match_reference_config() {
        let entry = HostEntry::new("user@h1");
        assert_eq!(entry.ssh_port, 22);
        assert_eq!(entry.remote_port, 8765);
        assert!(entry.local_port.is_none());
        assert!(entry.active_session.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn saved_registry_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        let registry = Registry::load(&path).unwrap();
        registry.save().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
