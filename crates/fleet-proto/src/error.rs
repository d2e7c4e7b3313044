use std::fmt;

/// Coarse error taxonomy shared by every component of the fleet core.
///
/// This is a classification, not a type hierarchy: every component maps its
/// own failure modes onto one of these kinds so callers can disambiguate,
/// for example, "unknown host" from "host unreachable" without parsing
/// error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown host name, invalid registry document.
    Configuration,
    /// SSH tunnel failed, WebSocket connect/send/recv failure, timeouts.
    Transport,
    /// Remote rejected the auth token.
    Authentication,
    /// Unknown message type, malformed JSON, request_id mismatch/reuse.
    Protocol,
    /// Filesystem not-found/not-a-file/not-a-directory, ambiguous edit_file
    /// anchor, non-zero shell exit surfaced as a caller-visible failure.
    Operation,
    /// Remote session directory could not be created, port already in use.
    Resource,
    /// Remote server died unrecoverably, or recovery failed twice in a row.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transport => "transport",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Operation => "operation",
            ErrorKind::Resource => "resource",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A classified error carrying enough context to name the failing side
/// (local/remote), the operation, and the underlying cause.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FleetError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FleetError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Operation, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::protocol(format!("malformed JSON: {e}"))
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
