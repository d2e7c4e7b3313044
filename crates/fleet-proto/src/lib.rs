//! Wire protocol and shared error types for the remote execution fleet core.
//!
//! This crate has no I/O of its own: it defines the JSON shapes exchanged
//! between `fleet-client` and `fleet-remote`, and the `FleetError` taxonomy
//! every other crate in the workspace converts its own errors into at its
//! public boundary.

pub mod error;
pub mod request;
pub mod response;

pub use error::{ErrorKind, FleetError, FleetResult};
pub use request::{canonical_payload_json, AuthFrame, DirEntry, Request};
pub use response::{
    CloseOutcome, EditFileOutcome, ExecOutcome, ListDirOutcome, Outcome, RawResponse,
    ReadBytesOutcome, ReadFileOutcome, ResponseType, WriteFileOutcome,
};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exec_request_round_trips() {
        let req = Request::Exec {
            request_id: Some("abc123".to_string()),
            command: "echo hi".to_string(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], json!("exec"));
        assert_eq!(value["command"], json!("echo hi"));

        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back.request_id(), Some("abc123"));
    }

    #[test]
    fn execute_alias_deserializes_as_exec() {
        let raw = json!({"type": "execute", "command": "ls", "request_id": "r1"});
        let req: Request = serde_json::from_value(raw).unwrap();
        match req {
            Request::Exec { command, .. } => assert_eq!(command, "ls"),
            other => panic!("expected Exec, got {other:?}"),
        }
    }

    #[test]
    fn request_without_id_has_none() {
        let req = Request::Ping { request_id: None };
        assert_eq!(req.request_id(), None);
    }

    #[test]
    fn set_request_id_overwrites() {
        let mut req = Request::ListDir {
            request_id: None,
            path: "/tmp".to_string(),
        };
        req.set_request_id("gen-1".to_string());
        assert_eq!(req.request_id(), Some("gen-1"));
    }

    #[test]
    fn raw_response_parses_exec_outcome() {
        let raw = RawResponse {
            kind: ResponseType::Result,
            request_id: Some("abc".to_string()),
            fields: json!({"command": "echo hi", "success": true, "output": "hi\n", "exit_code": 0, "error": null})
                .as_object()
                .unwrap()
                .clone(),
        };
        let outcome: ExecOutcome = raw.into_outcome().unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output.as_deref(), Some("hi\n"));
        assert!(outcome.success());
    }

    #[test]
    fn raw_response_dispatch_error_maps_to_fleet_error() {
        let raw = RawResponse {
            kind: ResponseType::Error,
            request_id: None,
            fields: json!({"message": "Unknown message type: bogus"})
                .as_object()
                .unwrap()
                .clone(),
        };
        let outcome: Result<ExecOutcome, FleetError> = raw.into_outcome();
        let err = outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(err.message.contains("Unknown message type"));
    }

    #[test]
    fn operation_failure_still_parses_as_result_with_success_false() {
        let raw = RawResponse {
            kind: ResponseType::Result,
            request_id: Some("r1".to_string()),
            fields: json!({"success": false, "error": "File not found: /nope"})
                .as_object()
                .unwrap()
                .clone(),
        };
        let outcome: ReadFileOutcome = raw.into_outcome().unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.error(), Some("File not found: /nope"));
    }

    #[test]
    fn canonical_payload_json_is_key_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_payload_json(&a), canonical_payload_json(&b));
    }
}
