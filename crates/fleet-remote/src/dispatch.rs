//! Per-connection WebSocket handling: auth handshake, request dispatch,
//! idempotency cache integration.

use std::sync::Arc;
use std::time::Duration;

use fleet_proto::{AuthFrame, Request};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::fs_ops;
use crate::idempotency::{payload_hash, IdempotencyCache, Lookup};
use crate::simple_executor;
use crate::tmux_session::TmuxSession;

/// Upper bound on how long an in-flight waiter sleeps before re-checking
/// the cache, so a missed `notify_waiters` wakeup can't hang the request.
const IN_FLIGHT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The single shell an agent commands run in, or a stateless fallback.
pub enum Executor {
    Tmux(TmuxSession),
    Simple,
}

impl Executor {
    async fn exec(&self, command: &str) -> (String, i32) {
        match self {
            Executor::Tmux(session) => match session.send_and_capture(command).await {
                Ok(result) => (result.output, result.exit_code),
                Err(e) => (e.message, -1),
            },
            Executor::Simple => {
                let result = simple_executor::run(command).await;
                (result.output, result.exit_code)
            }
        }
    }
}

pub struct ServerState {
    pub config: ServerConfig,
    pub cache: IdempotencyCache,
    pub executor: Executor,
    /// Commands execute one at a time: the pane/subshell is a single shared
    /// resource, and interleaved marker-wrapped commands would corrupt each
    /// other's output.
    pub exec_lock: Mutex<()>,
    pub shutdown: watch::Sender<bool>,
}

pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake failed with {peer}: {e}");
            return;
        }
    };

    if !authenticate(&mut ws, &state.config.token).await {
        info!("authentication failed for {peer}");
        return;
    }
    info!("{peer} authenticated");

    loop {
        let msg = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("websocket error from {peer}: {e}");
                break;
            }
        };

        let request: Request = match serde_json::from_str(&msg) {
            Ok(r) => r,
            Err(e) => {
                let _ = send(&mut ws, &error_envelope(&format!("malformed request: {e}"))).await;
                continue;
            }
        };

        let should_close = matches!(request, Request::Close { .. });
        let should_shutdown = matches!(request, Request::Shutdown { .. });

        let response = dispatch_one(&state, &request).await;
        if send(&mut ws, &response).await.is_err() {
            break;
        }

        if should_shutdown {
            info!("shutdown requested by {peer}");
            let _ = state.shutdown.send(true);
            break;
        }
        if should_close {
            break;
        }
    }

    info!("{peer} disconnected");
}

async fn authenticate(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    expected_token: &str,
) -> bool {
    let first = match ws.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return false,
    };

    let frame: AuthFrame = match serde_json::from_str(&first) {
        Ok(f) => f,
        Err(_) => AuthFrame { token: String::new() },
    };

    let ok = expected_token.is_empty() || frame.token == expected_token;
    let reply = if ok {
        json!({"type": "authenticated", "message": "Connection established"})
    } else {
        json!({"type": "error", "message": "Authentication failed"})
    };
    let _ = send(ws, &reply).await;
    ok
}

async fn send(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    value: &Value,
) -> Result<(), ()> {
    let text = value.to_string();
    ws.send(Message::Text(text)).await.map_err(|e| {
        warn!("failed to send response: {e}");
    })
}

fn error_envelope(message: &str) -> Value {
    json!({"type": "error", "message": message})
}

/// Runs a single request through the idempotency cache and the matching
/// operation handler, returning the response envelope (always a value
/// the caller can send, never an `Err`).
async fn dispatch_one(state: &ServerState, request: &Request) -> Value {
    let request_id = request.request_id().map(|s| s.to_string());
    let mut payload = serde_json::to_value(request).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = payload {
        map.remove("request_id");
    }
    let hash = payload_hash(&payload);

    let Some(request_id) = request_id else {
        return execute(state, request).await;
    };

    loop {
        match state.cache.begin(&request_id, &hash).await {
            Lookup::Fresh => {
                let mut response = execute(state, request).await;
                if let Value::Object(ref mut map) = response {
                    map.insert("request_id".to_string(), Value::String(request_id.clone()));
                }
                state.cache.complete(&request_id, hash, response.clone()).await;
                return response;
            }
            Lookup::Cached(response) => return response,
            Lookup::Conflict => {
                let mut envelope = error_envelope("request_id reuse with different payload");
                if let Value::Object(ref mut map) = envelope {
                    map.insert("request_id".to_string(), Value::String(request_id.clone()));
                }
                return envelope;
            }
            Lookup::InFlight(notify) => {
                // `notify_waiters` stores no permit: if `complete()` runs between
                // `begin()` returning this notifier and the `.await` below, the
                // wakeup is missed and this future would never resolve. Bound the
                // wait so we always loop back to `begin()` and re-check under the
                // lock even after a missed notification.
                let _ = tokio::time::timeout(IN_FLIGHT_POLL_INTERVAL, notify.notified()).await;
            }
        }
    }
}

async fn execute(state: &ServerState, request: &Request) -> Value {
    debug!("dispatching {}", request.describe());
    match request {
        Request::Ping { .. } => json!({"type": "pong"}),
        Request::Exec { command, .. } => {
            let _guard = state.exec_lock.lock().await;
            let (output, exit_code) = state.executor.exec(command).await;
            let mut value = json!({
                "type": "result",
                "success": exit_code == 0,
                "command": command,
                "output": output,
                "exit_code": exit_code,
            });
            if exit_code != 0 {
                if let Value::Object(ref mut map) = value {
                    map.insert("error".to_string(), Value::String(format!("exit code {exit_code}")));
                }
            }
            value
        }
        Request::ReadFile { path, .. } => to_result(fs_ops::read_file(path).await),
        Request::ReadBytes { path, .. } => to_result(fs_ops::read_bytes(path).await),
        Request::WriteFile { path, content, .. } => to_result(fs_ops::write_file(path, content).await),
        Request::EditFile { path, old_text, new_text, .. } => {
            to_result(fs_ops::edit_file(path, old_text, new_text).await)
        }
        Request::ListDir { path, .. } => to_result(fs_ops::list_dir(path).await),
        Request::Close { .. } => json!({"type": "result", "success": true, "message": "connection closing"}),
        Request::Shutdown { .. } => json!({"type": "shutdown_ack"}),
    }
}

fn to_result<T: serde::Serialize>(outcome: T) -> Value {
    let mut value = serde_json::to_value(outcome).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = value {
        map.insert("type".to_string(), Value::String("result".to_string()));
    }
    value
}
