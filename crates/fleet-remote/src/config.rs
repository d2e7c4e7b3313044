use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

const DEFAULT_PORT: u16 = 8765;

/// nanobot remote host
#[derive(Debug, Parser)]
#[command(name = "fleet-remote", about = "Remote execution server")]
pub struct Args {
    /// Path to JSON config file (overrides other args)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// WebSocket port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Authentication token (optional)
    #[arg(long, default_value = "")]
    pub token: String,

    /// Don't use tmux for session management
    #[arg(long)]
    pub no_tmux: bool,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    token: Option<String>,
    tmux: Option<bool>,
}

/// Fully resolved server configuration, after applying `--config` overrides.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub token: String,
    pub use_tmux: bool,
    /// Directory containing config.json / server.pid / tmux.sock, used to
    /// scope the tmux socket and scratch files. `None` when running
    /// standalone (outside a deployed session).
    pub session_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn resolve(args: Args) -> anyhow::Result<Self> {
        if let Some(config_path) = &args.config {
            let content = std::fs::read_to_string(config_path).map_err(|e| {
                anyhow::anyhow!("config file not found: {config_path:?}: {e}")
            })?;
            let file_config: FileConfig = serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("failed to parse config file: {e}"))?;

            let session_dir = config_path
                .parent()
                .map(|p| p.to_path_buf())
                .filter(|p| !p.as_os_str().is_empty());

            return Ok(Self {
                port: file_config.port.unwrap_or(args.port),
                token: file_config.token.unwrap_or(args.token),
                use_tmux: file_config.tmux.unwrap_or(!args.no_tmux),
                session_dir,
            });
        }

        let cwd = std::env::current_dir()?;
        let session_dir = cwd
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("fleet-"))
            .unwrap_or(false)
            .then_some(cwd);

        Ok(Self {
            port: args.port,
            token: args.token,
            use_tmux: !args.no_tmux,
            session_dir,
        })
    }

    pub fn tmux_socket_path(&self) -> PathBuf {
        match &self.session_dir {
            Some(dir) => dir.join("tmux.sock"),
            None => PathBuf::from("/tmp/fleet-remote-tmux.sock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_overrides_cli_args() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"port": 9999, "token": "secret", "tmux": false}"#)
            .unwrap();

        let args = Args {
            config: Some(config_path),
            port: 8765,
            token: String::new(),
            no_tmux: false,
        };
        let resolved = ServerConfig::resolve(args).unwrap();
        assert_eq!(resolved.port, 9999);
        assert_eq!(resolved.token, "secret");
        assert!(!resolved.use_tmux);
        assert!(resolved.session_dir.is_some());
    }

    #[test]
    fn missing_config_file_fields_fall_back_to_cli_args() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"port": 9001}"#).unwrap();

        let args = Args {
            config: Some(config_path),
            port: 8765,
            token: "fallback".to_string(),
            no_tmux: true,
        };
        let resolved = ServerConfig::resolve(args).unwrap();
        assert_eq!(resolved.port, 9001);
        assert_eq!(resolved.token, "fallback");
        assert!(!resolved.use_tmux);
    }

    #[test]
    fn without_config_file_cli_args_are_used_directly() {
        let args = Args {
            config: None,
            port: 1234,
            token: "t".to_string(),
            no_tmux: true,
        };
        let resolved = ServerConfig::resolve(args).unwrap();
        assert_eq!(resolved.port, 1234);
        assert_eq!(resolved.token, "t");
        assert!(!resolved.use_tmux);
    }
}
