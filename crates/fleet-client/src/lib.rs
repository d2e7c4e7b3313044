#![doc = r#"
fleet-client: owns one [`RemoteHost`] connection — SSH tunnel, WebSocket
RPC link, and the transport recovery state machine that lets a session
survive a dropped tunnel or restarted remote process without redeploying.

Recovery is deliberately narrow: once `session_id` is set, a lost
transport is repaired in place (new tunnel, new WebSocket, re-auth) but
never turns into a fresh deploy. Only a host that has never connected
gets the full `setup()` path.
"#]

use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fleet_proto::{ErrorKind, FleetError, Request};
use fleet_ssh::{SshTarget, Tunnel};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Static parameters for a host; mirrors a registry entry but this crate
/// has no dependency on `fleet-registry` so it can be driven standalone.
#[derive(Debug, Clone)]
pub struct RemoteHostConfig {
    pub name: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_key_path: Option<String>,
    pub remote_port: u16,
    pub local_port: Option<u16>,
    pub auth_token: Option<String>,
    /// Path to the locally built `fleet-remote` binary to stage and run.
    pub remote_binary: PathBuf,
}

pub struct RemoteHost {
    config: RemoteHostConfig,
    target: SshTarget,
    local_port: Option<u16>,
    session_id: Option<String>,
    tunnel: Option<Tunnel>,
    ws: Option<Ws>,
    running: bool,
    authenticated: bool,
    last_recovery_error: String,
}

impl RemoteHost {
    pub fn new(config: RemoteHostConfig) -> Self {
        let target = SshTarget::new(config.ssh_host.clone(), config.ssh_port, config.ssh_key_path.clone());
        let local_port = config.local_port;
        Self {
            config,
            target,
            local_port,
            session_id: None,
            tunnel: None,
            ws: None,
            running: false,
            authenticated: false,
            last_recovery_error: String::new(),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn is_connected(&self) -> bool {
        self.running && self.authenticated
    }

    pub fn last_recovery_error(&self) -> &str {
        &self.last_recovery_error
    }

    /// Full bootstrap: SSH tunnel, deploy + start remote agent, WebSocket
    /// connect, authenticate. No-op (returns the existing id) if already
    /// running.
    pub async fn setup(&mut self) -> Result<String, FleetError> {
        if self.running {
            return Ok(self.session_id.clone().unwrap_or_default());
        }

        let session_id = fleet_deploy::generate_session_id();
        self.session_id = Some(session_id.clone());

        let result = async {
            self.create_ssh_tunnel().await?;
            self.deploy_and_start_host(&session_id).await?;
            self.connect_websocket().await?;
            self.authenticate().await?;
            Ok::<(), FleetError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.running = true;
                info!(host = %self.config.name, %session_id, "remote host connected");
                Ok(session_id)
            }
            Err(e) => {
                warn!(host = %self.config.name, "setup failed: {e}");
                if let Ok(log) = self.get_remote_log(50).await {
                    warn!(host = %self.config.name, "remote log:\n{log}");
                }
                self.teardown().await;
                Err(FleetError::transport(format!(
                    "failed to connect to {}: {e}",
                    self.config.name
                )))
            }
        }
    }

    /// Resumes a previously deployed session (e.g. restored from the host
    /// registry) without redeploying. Subsequent [`Self::connect`] calls
    /// will only attempt transport recovery, never a fresh `setup()`.
    pub fn resume(&mut self, session_id: String, local_port: u16) {
        self.session_id = Some(session_id);
        self.local_port = Some(local_port);
    }

    /// Connects or reconnects to this host: a session that is already
    /// authenticated is verified with a ping before being reused: a dead
    /// link is repaired via [`Self::recover_transport`], never by
    /// redeploying. A host with no prior session goes through full
    /// [`Self::setup`].
    pub async fn connect(&mut self) -> Result<String, FleetError> {
        if self.session_id.is_none() {
            return self.setup().await;
        }

        if self.is_connected() && self.ping().await {
            return Ok(self.session_id.clone().unwrap_or_default());
        }

        if self.recover_transport().await {
            return Ok(self.session_id.clone().unwrap_or_default());
        }

        Err(FleetError::transport(self.last_recovery_error.clone()))
    }

    /// Tear down everything in the order the remote side expects: request
    /// graceful shutdown first, force-stop over SSH only if that failed,
    /// clean the remote session directory, and close the tunnel last since
    /// the previous two steps still need it.
    pub async fn teardown(&mut self) {
        self.running = false;
        self.authenticated = false;

        let server_stopped = self.request_shutdown().await;

        if !server_stopped {
            if let Err(e) = self.force_stop_host().await {
                warn!(host = %self.config.name, "failed to force-stop remote host: {e}");
            }
        }

        if let Some(session_id) = self.session_id.clone() {
            let remote_dir = fleet_deploy::remote_dir_for(&session_id);
            let cmd = format!("rm -rf {}", remote_dir.display());
            if let Err(e) = fleet_ssh::exec_one_shot(&self.target, &cmd, Duration::from_secs(30)).await {
                warn!(host = %self.config.name, "failed to clean remote directory: {e}");
            }
        }

        if let Some(tunnel) = self.tunnel.take() {
            if let Err(e) = tunnel.close().await {
                warn!(host = %self.config.name, "failed to close SSH tunnel: {e}");
            }
        }

        info!(host = %self.config.name, "remote host disconnected");
    }

    /// Ensures a ready, authenticated transport without ever triggering a
    /// fresh deploy for a session that already exists.
    async fn ensure_transport_ready(&mut self) -> Result<bool, FleetError> {
        if self.running && self.authenticated && self.ws.is_some() {
            return Ok(true);
        }
        if self.session_id.is_none() {
            self.setup().await?;
            return Ok(true);
        }
        Ok(self.recover_transport().await)
    }

    fn is_transport_error(e: &FleetError) -> bool {
        if e.kind == ErrorKind::Transport {
            return true;
        }
        let msg = e.message.to_lowercase();
        ["connection closed", "broken pipe", "connection reset", "not connected", "eof"]
            .iter()
            .any(|k| msg.contains(k))
    }

    async fn mark_transport_down(&mut self) {
        self.running = false;
        self.authenticated = false;
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
        if let Some(tunnel) = self.tunnel.take() {
            let _ = tunnel.close().await;
        }
    }

    /// Recovers SSH tunnel + WebSocket + auth for the *existing* session.
    /// Never assigns a new `session_id` and never redeploys.
    async fn recover_transport(&mut self) -> bool {
        self.last_recovery_error.clear();
        self.mark_transport_down().await;

        if let Err(e) = self.create_ssh_tunnel().await {
            self.last_recovery_error = format!("Network unreachable: SSH tunnel failed ({e})");
            self.mark_transport_down().await;
            return false;
        }
        if let Err(e) = self.connect_websocket().await {
            self.last_recovery_error = format!("Remote server not responding: WebSocket failed ({e})");
            self.mark_transport_down().await;
            return false;
        }
        if let Err(e) = self.authenticate().await {
            if self.last_recovery_error.is_empty() {
                self.last_recovery_error = format!("Transport recovery failed: {e}");
            }
            self.mark_transport_down().await;
            return false;
        }

        self.running = true;
        info!(host = %self.config.name, session_id = ?self.session_id, "transport recovered");
        true
    }

    /// Sends one RPC message, injecting a fresh `request_id` when absent,
    /// and performs a single silent retry after transport recovery. Returns
    /// a normalized `{success, ...}` JSON value — never propagates `Err` to
    /// the public typed methods, mirroring the wire-facing contract.
    async fn rpc(&mut self, mut request: Request, timeout: Duration) -> Value {
        let request_id = request
            .request_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        request.set_request_id(request_id.clone());

        match self.ensure_transport_ready().await {
            Ok(true) => {}
            Ok(false) => {
                let error = if self.last_recovery_error.is_empty() {
                    "Cannot connect to remote host".to_string()
                } else {
                    self.last_recovery_error.clone()
                };
                return json!({"success": false, "error": error});
            }
            Err(e) => return json!({"success": false, "error": format!("Cannot connect to remote host: {e}")}),
        }

        for attempt in 0..2 {
            match self.send_and_recv(&request, timeout).await {
                Ok(data) => {
                    if let Some(resp_id) = data.get("request_id").and_then(|v| v.as_str()) {
                        if resp_id != request_id {
                            return json!({"success": false, "error": "Mismatched request_id in response"});
                        }
                    }
                    return match data.get("type").and_then(|v| v.as_str()) {
                        Some("result") => data,
                        Some("error") | Some("shutdown_ack") => {
                            let msg = data.get("message").and_then(|v| v.as_str()).unwrap_or("Unknown error");
                            json!({"success": false, "error": msg})
                        }
                        Some("pong") => json!({"success": true, "type": "pong"}),
                        other => json!({"success": false, "error": format!("Unexpected response type: {other:?}")}),
                    };
                }
                Err(e) => {
                    if attempt == 0 && Self::is_transport_error(&e) {
                        warn!(host = %self.config.name, "RPC transport issue, attempting auto-recover: {e}");
                        if self.recover_transport().await {
                            continue;
                        }
                        let error = if self.last_recovery_error.is_empty() {
                            "Connection lost and auto-reconnect failed".to_string()
                        } else {
                            self.last_recovery_error.clone()
                        };
                        return json!({"success": false, "error": error});
                    }
                    return json!({"success": false, "error": e.message});
                }
            }
        }
        json!({"success": false, "error": "RPC retry exhausted"})
    }

    async fn send_and_recv(&mut self, request: &Request, timeout: Duration) -> Result<Value, FleetError> {
        let ws = self
            .ws
            .as_mut()
            .ok_or_else(|| FleetError::transport("not connected"))?;

        let text = serde_json::to_string(request)?;
        ws.send(Message::Text(text))
            .await
            .map_err(|e| FleetError::transport(format!("send failed: {e}")))?;

        let response = tokio::time::timeout(timeout, ws.next())
            .await
            .map_err(|_| FleetError::transport(format!("command timed out after {:?}", timeout)))?
            .ok_or_else(|| FleetError::transport("connection closed"))?
            .map_err(|e| FleetError::transport(format!("recv failed: {e}")))?;

        match response {
            Message::Text(text) => serde_json::from_str(&text).map_err(FleetError::from),
            Message::Close(_) => Err(FleetError::transport("connection closed")),
            _ => Err(FleetError::protocol("unexpected non-text frame")),
        }
    }

    pub async fn ping(&mut self) -> bool {
        let result = self.rpc(Request::Ping { request_id: None }, Duration::from_secs(5)).await;
        result.get("type").and_then(|v| v.as_str()) == Some("pong")
            || result.get("success").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub async fn exec(&mut self, command: &str, timeout: Duration) -> ExecResult {
        let result = self
            .rpc(
                Request::Exec { request_id: None, command: command.to_string() },
                timeout,
            )
            .await;
        ExecResult {
            success: as_bool(&result, "success"),
            output: as_string(&result, "output"),
            error: as_string(&result, "error"),
            exit_code: result.get("exit_code").and_then(|v| v.as_i64()).map(|v| v as i32),
        }
    }

    pub async fn exec_default_timeout(&mut self, command: &str) -> ExecResult {
        self.exec(command, DEFAULT_RPC_TIMEOUT).await
    }

    pub async fn read_file(&mut self, path: &str, timeout: Duration) -> ReadFileResult {
        let result = self
            .rpc(Request::ReadFile { request_id: None, path: path.to_string() }, timeout)
            .await;
        ReadFileResult {
            success: as_bool(&result, "success"),
            content: as_string(&result, "content"),
            error: as_string(&result, "error"),
        }
    }

    pub async fn write_file(&mut self, path: &str, content: &str, timeout: Duration) -> WriteFileResult {
        let result = self
            .rpc(
                Request::WriteFile {
                    request_id: None,
                    path: path.to_string(),
                    content: content.to_string(),
                },
                timeout,
            )
            .await;
        WriteFileResult {
            success: as_bool(&result, "success"),
            bytes: result.get("bytes").and_then(|v| v.as_u64()).map(|v| v as usize),
            error: as_string(&result, "error"),
        }
    }

    pub async fn read_bytes(&mut self, path: &str, timeout: Duration) -> ReadBytesResult {
        let result = self
            .rpc(Request::ReadBytes { request_id: None, path: path.to_string() }, timeout)
            .await;

        if !as_bool(&result, "success") {
            return ReadBytesResult {
                success: false,
                content: None,
                size: result.get("size").and_then(|v| v.as_u64()).map(|v| v as usize),
                error: Some(as_string(&result, "error").unwrap_or_else(|| "Failed to read bytes".to_string())),
            };
        }

        let content = match result.get("content_b64").and_then(|v| v.as_str()) {
            Some(b64) if !b64.is_empty() => match BASE64.decode(b64) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    return ReadBytesResult {
                        success: false,
                        content: None,
                        size: None,
                        error: Some(format!("Invalid base64 payload from remote read_bytes: {e}")),
                    }
                }
            },
            _ => None,
        };

        ReadBytesResult {
            success: true,
            content,
            size: result.get("size").and_then(|v| v.as_u64()).map(|v| v as usize),
            error: as_string(&result, "error"),
        }
    }

    pub async fn edit_file(&mut self, path: &str, old_text: &str, new_text: &str, timeout: Duration) -> EditFileResult {
        let result = self
            .rpc(
                Request::EditFile {
                    request_id: None,
                    path: path.to_string(),
                    old_text: old_text.to_string(),
                    new_text: new_text.to_string(),
                },
                timeout,
            )
            .await;
        EditFileResult {
            success: as_bool(&result, "success"),
            path: as_string(&result, "path"),
            error: as_string(&result, "error"),
        }
    }

    pub async fn list_dir(&mut self, path: &str, timeout: Duration) -> ListDirResult {
        let result = self
            .rpc(Request::ListDir { request_id: None, path: path.to_string() }, timeout)
            .await;
        let entries = result.get("entries").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok())
                .collect()
        });
        ListDirResult {
            success: as_bool(&result, "success"),
            entries,
            error: as_string(&result, "error"),
        }
    }

    async fn create_ssh_tunnel(&mut self) -> Result<(), FleetError> {
        let local_port = match self.local_port {
            Some(p) => p,
            None => {
                let assigned = assign_ephemeral_port().await?;
                self.local_port = Some(assigned);
                assigned
            }
        };
        info!(host = %self.config.name, local_port, remote_port = self.config.remote_port, "creating ssh tunnel");
        let tunnel = fleet_ssh::open_tunnel(&self.target, local_port, self.config.remote_port).await?;
        self.tunnel = Some(tunnel);
        Ok(())
    }

    async fn deploy_and_start_host(&self, session_id: &str) -> Result<(), FleetError> {
        fleet_deploy::deploy(
            &self.target,
            &self.config.remote_binary,
            session_id,
            self.config.remote_port,
            self.config.auth_token.as_deref(),
        )
        .await?;
        Ok(())
    }

    async fn connect_websocket(&mut self) -> Result<(), FleetError> {
        let local_port = self
            .local_port
            .ok_or_else(|| FleetError::transport("no local port assigned"))?;
        let url = format!("ws://127.0.0.1:{local_port}");
        info!(host = %self.config.name, %url, "connecting websocket");

        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| FleetError::transport(format!("WebSocket connection timeout: {url}")))?
            .map_err(|e| FleetError::transport(format!("WebSocket connection failed: {e}")))?;
        self.ws = Some(ws);
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<(), FleetError> {
        let token = self.config.auth_token.clone().unwrap_or_default();
        let ws = self.ws.as_mut().ok_or_else(|| FleetError::transport("not connected"))?;

        ws.send(Message::Text(json!({"token": token}).to_string()))
            .await
            .map_err(|e| FleetError::transport(format!("failed to send auth frame: {e}")))?;

        let response = tokio::time::timeout(AUTH_TIMEOUT, ws.next())
            .await
            .map_err(|_| FleetError::authentication("authentication response timed out"))?
            .ok_or_else(|| FleetError::transport("connection closed during authentication"))?
            .map_err(|e| FleetError::transport(format!("recv failed: {e}")))?;

        let Message::Text(text) = response else {
            return Err(FleetError::protocol("unexpected non-text auth response"));
        };
        let data: Value = serde_json::from_str(&text)?;

        match data.get("type").and_then(|v| v.as_str()) {
            Some("authenticated") => {
                self.authenticated = true;
                Ok(())
            }
            Some("error") => {
                let message = data.get("message").and_then(|v| v.as_str()).unwrap_or("unknown reason");
                Err(FleetError::authentication(format!("Authentication failed: {message}")))
            }
            _ => Err(FleetError::protocol(format!("unexpected authentication response: {data}"))),
        }
    }

    async fn request_shutdown(&mut self) -> bool {
        let Some(ws) = self.ws.as_mut() else { return false };

        let sent = ws
            .send(Message::Text(json!({"type": "shutdown"}).to_string()))
            .await;
        if sent.is_err() {
            self.ws = None;
            return false;
        }

        let acked = match tokio::time::timeout(SHUTDOWN_ACK_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|s| s == "shutdown_ack"))
                    .unwrap_or(false)
            }
            _ => false,
        };

        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }

        if acked {
            info!(host = %self.config.name, "server acknowledged shutdown, waiting for process to exit");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        acked
    }

    async fn force_stop_host(&self) -> Result<(), FleetError> {
        let Some(session_id) = &self.session_id else { return Ok(()) };
        let remote_dir = fleet_deploy::remote_dir_for(session_id);
        let pid_file = remote_dir.join("server.pid");
        let tmux_sock = remote_dir.join("tmux.sock");

        info!(host = %self.config.name, %session_id, "force-stopping remote host");

        let kill_cmd = format!(
            "if [ -f {pf} ]; then pid=$(cat {pf}); kill $pid 2>/dev/null && sleep 1; kill -0 $pid 2>/dev/null && kill -9 $pid 2>/dev/null; fi || true",
            pf = pid_file.display()
        );
        fleet_ssh::exec_one_shot(&self.target, &kill_cmd, Duration::from_secs(30)).await?;

        let port_cmd = format!("fuser -k {}/tcp 2>/dev/null || true", self.config.remote_port);
        fleet_ssh::exec_one_shot(&self.target, &port_cmd, Duration::from_secs(30)).await?;

        let tmux_cmd = format!("tmux -S '{}' kill-session -t fleet 2>/dev/null || true", tmux_sock.display());
        fleet_ssh::exec_one_shot(&self.target, &tmux_cmd, Duration::from_secs(30)).await?;

        Ok(())
    }

    async fn get_remote_log(&self, tail_lines: u32) -> Result<String, FleetError> {
        let Some(session_id) = &self.session_id else {
            return Ok("No session ID".to_string());
        };
        let log_file = fleet_deploy::remote_dir_for(session_id).join("fleet-remote.log");
        let cmd = format!(
            "tail -{tail_lines} {log} 2>/dev/null || echo 'Log file not found'",
            log = log_file.display()
        );
        fleet_ssh::exec_one_shot(&self.target, &cmd, Duration::from_secs(30)).await
    }
}

async fn assign_ephemeral_port() -> Result<u16, FleetError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| FleetError::resource(format!("failed to reserve a local port: {e}")))?;
    listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| FleetError::resource(format!("failed to read reserved port: {e}")))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn as_string(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ReadFileResult {
    pub success: bool,
    pub content: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WriteFileResult {
    pub success: bool,
    pub bytes: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadBytesResult {
    pub success: bool,
    pub content: Option<Vec<u8>>,
    pub size: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EditFileResult {
    pub success: bool,
    pub path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListDirResult {
    pub success: bool,
    pub entries: Option<Vec<fleet_proto::DirEntry>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RemoteHostConfig {
        RemoteHostConfig {
            name: "test-host".to_string(),
            ssh_host: "user@example.com".to_string(),
            ssh_port: 22,
            ssh_key_path: None,
            remote_port: 8765,
            local_port: Some(39812),
            auth_token: None,
            remote_binary: PathBuf::from("/tmp/fleet-remote"),
        }
    }

    #[test]
    fn new_host_starts_disconnected_with_no_session() {
        let host = RemoteHost::new(test_config());
        assert!(!host.is_connected());
        assert!(host.session_id().is_none());
        assert_eq!(host.local_port(), Some(39812));
    }

    #[test]
    fn is_transport_error_matches_transport_kind() {
        assert!(RemoteHost::is_transport_error(&FleetError::transport("tunnel died")));
        assert!(!RemoteHost::is_transport_error(&FleetError::operation("file not found")));
    }

    #[test]
    fn is_transport_error_matches_keyword_in_message() {
        let err = FleetError::operation("connection reset by peer");
        assert!(RemoteHost::is_transport_error(&err));
    }

    #[tokio::test]
    async fn assign_ephemeral_port_returns_a_usable_port() {
        let port = assign_ephemeral_port().await.unwrap();
        assert!(port > 0);
    }

    #[test]
    fn as_bool_and_as_string_read_expected_fields() {
        let value = json!({"success": true, "output": "hi"});
        assert!(as_bool(&value, "success"));
        assert_eq!(as_string(&value, "output").as_deref(), Some("hi"));
        assert_eq!(as_string(&value, "missing"), None);
    }
}
