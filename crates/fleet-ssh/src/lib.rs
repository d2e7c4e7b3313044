#![doc = r#"
fleet-ssh: the SSH transport primitives used by the bootstrap/deploy and
client-connection layers.

This crate shells out to the system `ssh`/`scp` binaries rather than linking
a pure-Rust SSH implementation, so it inherits the user's ambient SSH config
(keys, agent, `ProxyJump`, etc.) the same way a human typing `ssh host` would.

Three primitives are provided:
- [`open_tunnel`]: a long-lived local port forward, returned as a [`Tunnel`]
  the caller must hold for the life of the session.
- [`exec_one_shot`]: a single command over `ssh`, with a hard timeout.
- [`copy_dir`]: recursive upload of a local directory's contents.

None of these retry; retry policy belongs to the caller (`fleet-deploy`,
`fleet-client`).
"#]

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use fleet_proto::FleetError;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Connection parameters shared by every primitive in this crate.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub key_path: Option<String>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, key_path: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            key_path,
        }
    }

    fn common_opts(&self, cmd: &mut Command) {
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("BatchMode=yes");
        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }
    }
}

/// A live SSH tunnel child process holding a local port forward open.
///
/// Dropping this without calling [`Tunnel::close`] best-effort kills the
/// child so a forgotten handle can't leak an SSH process, but `close` should
/// be preferred since it waits for exit.
pub struct Tunnel {
    child: Child,
    pub local_port: u16,
    pub remote_port: u16,
}

impl Tunnel {
    /// True while the child process has not exited.
    pub async fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the tunnel, waiting up to 5s before a hard kill.
    pub async fn close(mut self) -> Result<(), FleetError> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
        let waited = tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await;
        if waited.is_err() {
            let _ = self.child.kill().await;
            let _ = self.child.wait().await;
        }
        Ok(())
    }
}

/// Opens `-L local_port:127.0.0.1:remote_port` against `target`, waits
/// briefly for the tunnel to establish, and confirms the child is still
/// alive before returning.
pub async fn open_tunnel(
    target: &SshTarget,
    local_port: u16,
    remote_port: u16,
) -> Result<Tunnel, FleetError> {
    let mut cmd = Command::new("ssh");
    cmd.arg("-N")
        .arg("-L")
        .arg(format!("{local_port}:127.0.0.1:{remote_port}"));
    target.common_opts(&mut cmd);
    cmd.arg(&target.host);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    debug!(host = %target.host, local_port, remote_port, "opening ssh tunnel");
    let mut child = cmd
        .spawn()
        .map_err(|e| FleetError::transport(format!("failed to spawn ssh tunnel: {e}")))?;

    tokio::time::sleep(Duration::from_secs(2)).await;

    match child.try_wait() {
        Ok(None) => Ok(Tunnel {
            child,
            local_port,
            remote_port,
        }),
        Ok(Some(status)) => {
            let mut stderr_buf = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_buf).await;
            }
            Err(FleetError::transport(format!(
                "SSH tunnel failed: {} (exit {})",
                stderr_buf.trim(),
                status
            )))
        }
        Err(e) => Err(FleetError::transport(format!(
            "failed to poll tunnel process: {e}"
        ))),
    }
}

/// Runs `command` via `ssh target -- command`, capturing stdout/stderr and
/// enforcing `timeout` with a forced kill on expiry. Stdout is returned
/// trimmed; warnings matching "Permanently added" are demoted to debug.
pub async fn exec_one_shot(
    target: &SshTarget,
    command: &str,
    timeout: Duration,
) -> Result<String, FleetError> {
    let mut cmd = Command::new("ssh");
    target.common_opts(&mut cmd);
    cmd.arg(&target.host).arg(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(host = %target.host, command, "ssh one-shot exec");
    let mut child = cmd
        .spawn()
        .map_err(|e| FleetError::transport(format!("failed to spawn ssh: {e}")))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| FleetError::transport(format!("ssh exec failed: {e}")))?,
        Err(_) => {
            return Err(FleetError::transport(format!(
                "SSH command timed out after {:?}: {}",
                timeout,
                truncate(command, 80)
            )));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        if stderr.contains("Warning: Permanently added") {
            debug!(host = %target.host, "ssh host-key warning (ignored): {stderr}");
        } else {
            warn!(host = %target.host, status = %output.status, "ssh command exited non-zero: {stderr}");
        }
    }

    Ok(stdout)
}

/// Uploads every top-level entry of `local_dir` into `remote_dir` via a
/// single `scp -r` invocation. `remote_dir` must already exist.
pub async fn copy_dir(
    target: &SshTarget,
    local_dir: &Path,
    remote_dir: &str,
) -> Result<(), FleetError> {
    let mut entries = tokio::fs::read_dir(local_dir)
        .await
        .map_err(|e| FleetError::transport(format!("failed to list {local_dir:?}: {e}")))?;
    let mut local_files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FleetError::transport(format!("failed to read dir entry: {e}")))?
    {
        local_files.push(entry.path());
    }
    if local_files.is_empty() {
        return Err(FleetError::transport(format!(
            "nothing to upload from {local_dir:?}"
        )));
    }

    let mut cmd = Command::new("scp");
    cmd.arg("-r")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-P")
        .arg(target.port.to_string());
    if let Some(key) = &target.key_path {
        cmd.arg("-i").arg(key);
    }
    for file in &local_files {
        cmd.arg(file);
    }
    cmd.arg(format!("{}:{}/", target.host, remote_dir));
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(host = %target.host, remote_dir, count = local_files.len(), "scp upload");
    let output = cmd
        .output()
        .await
        .map_err(|e| FleetError::transport(format!("failed to spawn scp: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FleetError::transport(format!(
            "scp upload failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_opts_includes_key_when_present() {
        let target = SshTarget::new("user@host", 2222, Some("/home/u/.ssh/id".to_string()));
        let mut cmd = Command::new("ssh");
        target.common_opts(&mut cmd);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"-i".to_string()));
        assert!(args.contains(&"/home/u/.ssh/id".to_string()));
    }

    #[test]
    fn common_opts_omits_key_when_absent() {
        let target = SshTarget::new("user@host", 22, None);
        let mut cmd = Command::new("ssh");
        target.common_opts(&mut cmd);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn truncate_respects_char_boundary_count() {
        assert_eq!(truncate("hello world", 5), "hello");
        assert_eq!(truncate("hi", 80), "hi");
    }
}
