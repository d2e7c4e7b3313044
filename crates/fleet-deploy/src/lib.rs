#![doc = r#"
fleet-deploy: stages the remote agent and launches it on a fresh host.

The remote agent (`fleet-remote`) is a precompiled binary, not an
interpreted script, so there is nothing to detect about the remote's
runtime beyond a POSIX shell and (optionally) `tmux` — both assumed
present per the core's scope. `deploy.sh` is the only moving part: it
chmod's the uploaded binary, idempotently kills whatever is already bound
to the target port, and launches the server detached via `setsid`.
"#]

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_proto::FleetError;
use fleet_ssh::SshTarget;
use tracing::{debug, info};

const DEPLOY_SCRIPT: &str = include_str!("../assets/deploy.sh");
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(90);

/// Outcome of a successful bootstrap.
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub session_id: String,
    pub remote_dir: String,
}

/// Stages `remote_binary` and `deploy.sh` into a fresh local temp directory
/// so they can be uploaded in a single recursive copy.
async fn stage(remote_binary: &Path) -> Result<tempfile::TempDir, FleetError> {
    let staging = tempfile::tempdir()
        .map_err(|e| FleetError::resource(format!("failed to create staging dir: {e}")))?;

    let script_path = staging.path().join("deploy.sh");
    tokio::fs::write(&script_path, DEPLOY_SCRIPT)
        .await
        .map_err(|e| FleetError::resource(format!("failed to write deploy.sh: {e}")))?;

    let dest_binary = staging.path().join("fleet-remote");
    tokio::fs::copy(remote_binary, &dest_binary)
        .await
        .map_err(|e| {
            FleetError::resource(format!(
                "failed to stage remote binary from {remote_binary:?}: {e}"
            ))
        })?;

    Ok(staging)
}

/// Runs the full bootstrap sequence: create `/tmp/<session_id>` on the
/// remote, upload the staged files, and execute `deploy.sh --port
/// <remote_port> [--token <auth_token>]`.
pub async fn deploy(
    target: &SshTarget,
    remote_binary: &Path,
    session_id: &str,
    remote_port: u16,
    auth_token: Option<&str>,
) -> Result<DeployResult, FleetError> {
    let remote_dir = format!("/tmp/{session_id}");

    info!(host = %target.host, %remote_dir, remote_port, "bootstrapping remote session");

    fleet_ssh::exec_one_shot(target, &format!("mkdir -p {remote_dir}"), Duration::from_secs(30))
        .await
        .map_err(|e| FleetError::resource(format!("failed to create {remote_dir}: {e}")))?;

    let staging = stage(remote_binary).await?;
    fleet_ssh::copy_dir(target, staging.path(), &remote_dir).await?;
    drop(staging);

    let mut deploy_args = format!("--port {remote_port}");
    if let Some(token) = auth_token {
        deploy_args.push_str(&format!(" --token '{token}'"));
    }

    debug!(%remote_dir, "running deploy.sh");
    let output = fleet_ssh::exec_one_shot(
        target,
        &format!("sh {remote_dir}/deploy.sh {deploy_args}"),
        DEPLOY_TIMEOUT,
    )
    .await
    .map_err(|e| FleetError::transport(format!("deploy.sh failed: {e}")))?;
    if !output.is_empty() {
        debug!("deploy.sh output: {output}");
    }

    Ok(DeployResult {
        session_id: session_id.to_string(),
        remote_dir,
    })
}

/// Generates a fresh `session_id` in the `fleet-<8 hex>` shape used as both
/// the remote directory name and the logical session identifier.
pub fn generate_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("fleet-{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn remote_dir_for(session_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{session_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_expected_shape() {
        let id = generate_session_id();
        assert!(id.starts_with("fleet-"));
        assert_eq!(id.len(), "fleet-".len() + 8);
    }

    #[test]
    fn session_ids_are_not_constant() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn deploy_script_is_embedded_and_idempotent_looking() {
        assert!(DEPLOY_SCRIPT.contains("fuser -k"));
        assert!(DEPLOY_SCRIPT.contains("setsid"));
        assert!(DEPLOY_SCRIPT.contains("server.pid"));
    }

    #[tokio::test]
    async fn stage_copies_binary_and_script() {
        let tmp = tempfile::tempdir().unwrap();
        let fake_binary = tmp.path().join("fleet-remote-fake");
        tokio::fs::write(&fake_binary, b"not a real binary")
            .await
            .unwrap();

        let staged = stage(&fake_binary).await.unwrap();
        assert!(staged.path().join("fleet-remote").exists());
        assert!(staged.path().join("deploy.sh").exists());
    }
}
