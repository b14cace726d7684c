//! Wire frames for the WebSocket RPC protocol.
//!
//! Clients speak first with `hello`; everything after authentication is
//! `request` → `response` pairs plus server-pushed `event` frames. Frames
//! are JSON objects discriminated by a `type` field.

use courier_core::CourierError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent back in `helloOk`. Bumped on breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Handshake. Must be the first frame on the connection.
    #[serde(rename_all = "camelCase")]
    Hello {
        /// Protocol revision the client speaks. Absent means "latest".
        #[serde(default)]
        protocol_version: Option<u32>,
        /// Free-form device identification for logs.
        #[serde(default)]
        device_id: Option<String>,
        /// Bearer token checked by the device auth guard.
        #[serde(default)]
        auth: Option<String>,
    },
    /// Method invocation. `id` correlates the response.
    #[serde(rename_all = "camelCase")]
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Option<Value>,
        /// Replay-protection key; a repeat within the connection's replay
        /// window returns the cached response instead of re-executing.
        #[serde(default)]
        idempotency_key: Option<String>,
    },
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    HelloOk {
        protocol: u32,
        server_version: String,
        /// Method names this server dispatches.
        capabilities: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    HelloError { error: ErrorShape },
    #[serde(rename_all = "camelCase")]
    Response {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },
    #[serde(rename_all = "camelCase")]
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        /// Per-run ordering stamp; consumers drop regressions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        payload: Value,
    },
}

impl ServerFrame {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        ServerFrame::Response {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        ServerFrame::Response {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    NotFound,
    Conflict,
    Timeout,
    Unavailable,
}

/// The single error shape every failed response carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorShape {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }
}

impl From<&CourierError> for ErrorShape {
    fn from(err: &CourierError) -> Self {
        let code = match err {
            CourierError::InvalidRequest(_) | CourierError::Serialization(_) => {
                ErrorCode::InvalidRequest
            }
            CourierError::Unauthorized(_) => ErrorCode::Unauthorized,
            CourierError::NotFound(_) => ErrorCode::NotFound,
            CourierError::Conflict(_) | CourierError::AmbiguousLabel(_) => ErrorCode::Conflict,
            CourierError::Timeout(_) => ErrorCode::Timeout,
            CourierError::Agent(_)
            | CourierError::Channel(_)
            | CourierError::Config(_)
            | CourierError::Store(_)
            | CourierError::Cancelled(_)
            | CourierError::Io(_) => ErrorCode::Unavailable,
        };
        Self::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_frame_parses() {
        let frame: ClientFrame = serde_json::from_value(
            json!({"type": "hello", "auth": "t", "deviceId": "cli", "protocolVersion": 1}),
        )
        .unwrap();
        match frame {
            ClientFrame::Hello {
                protocol_version,
                device_id,
                auth,
            } => {
                assert_eq!(protocol_version, Some(1));
                assert_eq!(device_id.as_deref(), Some("cli"));
                assert_eq!(auth.as_deref(), Some("t"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn request_frame_parses_without_optionals() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "request", "id": "1", "method": "status"}))
                .unwrap();
        match frame {
            ClientFrame::Request {
                id,
                method,
                params,
                idempotency_key,
            } => {
                assert_eq!(id, "1");
                assert_eq!(method, "status");
                assert!(params.is_none());
                assert!(idempotency_key.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_fails_to_parse() {
        assert!(serde_json::from_value::<ClientFrame>(json!({"type": "ping"})).is_err());
    }

    #[test]
    fn response_serializes_without_null_fields() {
        let ok = serde_json::to_value(ServerFrame::ok("1", json!({"x": 1}))).unwrap();
        assert_eq!(ok["type"], "response");
        assert_eq!(ok["ok"], true);
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(ServerFrame::err(
            "2",
            ErrorShape::new(ErrorCode::NotFound, "missing"),
        ))
        .unwrap();
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"]["code"], "NOT_FOUND");
        assert!(err.get("result").is_none());
    }

    #[test]
    fn error_codes_map_from_domain_errors() {
        let cases = [
            (CourierError::InvalidRequest("x".into()), ErrorCode::InvalidRequest),
            (CourierError::Unauthorized("x".into()), ErrorCode::Unauthorized),
            (CourierError::NotFound("x".into()), ErrorCode::NotFound),
            (CourierError::Conflict("x".into()), ErrorCode::Conflict),
            (CourierError::AmbiguousLabel("x".into()), ErrorCode::Conflict),
            (CourierError::Timeout("x".into()), ErrorCode::Timeout),
            (CourierError::Agent("x".into()), ErrorCode::Unavailable),
        ];
        for (err, code) in cases {
            assert_eq!(ErrorShape::from(&err).code, code, "for {err}");
        }
    }

    #[test]
    fn event_frame_round_trips() {
        let frame = ServerFrame::Event {
            event: "agent.delta".into(),
            run_id: Some("r1".into()),
            seq: Some(3),
            payload: json!({"text": "hi"}),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["runId"], "r1");
        assert_eq!(value["seq"], 3);
    }
}
