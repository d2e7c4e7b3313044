use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::request::DirEntry;

/// The outer `type` discriminant of every response frame. Unlike requests,
/// these are NOT one-per-operation: every successful operation comes back
/// as `result` with operation-specific fields, and errors raised by the
/// dispatch loop itself (bad JSON, unknown message type, auth failure) come
/// back as `error`. Operation-level failures (file not found, ambiguous
/// edit anchor, non-zero exit) are still `result` with `success: false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Result,
    Error,
    Pong,
    Authenticated,
    ShutdownAck,
}

/// A loosely-typed response envelope as it comes off the wire.
///
/// `result` responses are shaped differently per operation (duck typing on
/// the Python side); rather than model that with an untagged enum — which
/// would silently pick the first variant whose optional fields all happen
/// to match — every field besides `type`/`request_id` is captured in
/// `fields` and converted into a concrete `*Outcome` struct by the caller,
/// which always knows which operation it issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl RawResponse {
    pub fn dispatch_error_message(&self) -> Option<&str> {
        self.fields.get("message").and_then(|v| v.as_str())
    }

    /// Converts `fields` into a concrete outcome type.
    ///
    /// Returns `Err` only for envelope-level errors (`type: "error"`, e.g. an
    /// unknown message type or malformed request) — operation-level failures
    /// such as "file not found" still deserialize successfully with
    /// `success: false` set on the outcome, since that is how the wire
    /// format distinguishes a dispatch-loop error from a handler result.
    pub fn into_outcome<T>(self) -> Result<T, FleetError>
    where
        T: for<'de> Deserialize<'de>,
    {
        if self.kind == ResponseType::Error {
            let message = self
                .fields
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("remote returned an error with no message")
                .to_string();
            return Err(FleetError::protocol(message));
        }
        let value = serde_json::Value::Object(self.fields);
        serde_json::from_value(value).map_err(|e| {
            FleetError::protocol(format!("response did not match expected shape: {e}"))
        })
    }
}

/// Common shape every operation outcome shares: a success flag and an
/// optional error string set when `success` is false.
pub trait Outcome {
    fn success(&self) -> bool;
    fn error(&self) -> Option<&str>;
}

macro_rules! impl_outcome {
    ($ty:ty) => {
        impl Outcome for $ty {
            fn success(&self) -> bool {
                self.success
            }
            fn error(&self) -> Option<&str> {
                self.error.as_deref()
            }
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}
impl_outcome!(ExecOutcome);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileOutcome {
    pub success: bool,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
impl_outcome!(ReadFileOutcome);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBytesOutcome {
    pub success: bool,
    /// base64-encoded file content.
    #[serde(default)]
    pub content_b64: Option<String>,
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
impl_outcome!(ReadBytesOutcome);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileOutcome {
    pub success: bool,
    #[serde(default)]
    pub bytes: Option<usize>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
impl_outcome!(WriteFileOutcome);

/// `edit_file` folds the "not found" / "ambiguous" / "fuzzy suggestion"
/// cases into the `error` string itself rather than a separate field — this
/// mirrors the shape actually produced by the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditFileOutcome {
    pub success: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
impl_outcome!(EditFileOutcome);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDirOutcome {
    pub success: bool,
    #[serde(default)]
    pub entries: Option<Vec<DirEntry>>,
    #[serde(default)]
    pub error: Option<String>,
}
impl_outcome!(ListDirOutcome);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
