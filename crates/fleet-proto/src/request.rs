use serde::{Deserialize, Serialize};

/// A single entry in a `list_dir` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// The authentication frame sent as the first message on a fresh connection.
///
/// An empty token accepts any (or no) token — see `Request` handshake rules
/// in the remote server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFrame {
    #[serde(default)]
    pub token: String,
}

/// Client-to-server RPC request, tagged by `type` on the wire.
///
/// `request_id` is an opaque, client-chosen idempotency key. When absent, no
/// idempotency guarantees apply and the remote dispatches directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    #[serde(alias = "execute")]
    Exec {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        command: String,
    },
    ReadFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        path: String,
    },
    ReadBytes {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        path: String,
    },
    WriteFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        path: String,
        content: String,
    },
    EditFile {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        path: String,
        old_text: String,
        new_text: String,
    },
    ListDir {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        path: String,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Close {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Shutdown {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl Request {
    /// The idempotency key this request was sent with, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Request::Exec { request_id, .. }
            | Request::ReadFile { request_id, .. }
            | Request::ReadBytes { request_id, .. }
            | Request::WriteFile { request_id, .. }
            | Request::EditFile { request_id, .. }
            | Request::ListDir { request_id, .. }
            | Request::Ping { request_id }
            | Request::Close { request_id }
            | Request::Shutdown { request_id } => request_id.as_deref(),
        }
    }

    /// Sets the idempotency key, overwriting any existing one.
    pub fn set_request_id(&mut self, id: String) {
        let slot = match self {
            Request::Exec { request_id, .. }
            | Request::ReadFile { request_id, .. }
            | Request::ReadBytes { request_id, .. }
            | Request::WriteFile { request_id, .. }
            | Request::EditFile { request_id, .. }
            | Request::ListDir { request_id, .. }
            | Request::Ping { request_id }
            | Request::Close { request_id }
            | Request::Shutdown { request_id } => request_id,
        };
        *slot = Some(id);
    }

    /// Short, human-readable label for log lines (command text truncated).
    pub fn describe(&self) -> String {
        match self {
            Request::Exec { command, .. } => {
                let head: String = command.chars().take(100).collect();
                format!("exec({head})")
            }
            Request::ReadFile { path, .. } => format!("read_file({path})"),
            Request::ReadBytes { path, .. } => format!("read_bytes({path})"),
            Request::WriteFile { path, .. } => format!("write_file({path})"),
            Request::EditFile { path, .. } => format!("edit_file({path})"),
            Request::ListDir { path, .. } => format!("list_dir({path})"),
            Request::Ping { .. } => "ping".to_string(),
            Request::Close { .. } => "close".to_string(),
            Request::Shutdown { .. } => "shutdown".to_string(),
        }
    }
}

/// Canonical JSON encoding used to hash a request payload for idempotency
/// validation: keys sorted, no insignificant whitespace.
pub fn canonical_payload_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sorted(v));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sorted(value)).expect("json values always serialize")
}
