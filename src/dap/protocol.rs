// src/dap/protocol.rs

//! Debug Adapter Protocol envelopes.
//!
//! Only the envelope is typed; argument and body payloads stay as
//! `serde_json::Value` because orchestration only needs `seq`,
//! `request_seq`, `command`, `success` and `event` to correlate traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{RelayError, Result};

/// Outgoing request.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

impl Request {
    pub fn new(seq: i64, command: impl Into<String>, arguments: Value) -> Self {
        Self {
            seq,
            r#type: "request",
            command: command.into(),
            arguments,
        }
    }
}

/// Response envelope.
///
/// The DAP allows responses with no `body` field at all; those deserialize
/// to `Value::Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: i64,
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

impl Event {
    pub fn new(event: impl Into<String>, body: Value) -> Self {
        Self {
            seq: 0,
            event: event.into(),
            body,
        }
    }

    /// `threadId` carried by `stopped`/`continued`/`thread` events.
    pub fn thread_id(&self) -> Option<i64> {
        self.body.get("threadId").and_then(Value::as_i64)
    }
}

/// Any message read from the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Response(Response),
    Event(Event),
    /// Reverse requests (e.g. `runInTerminal`) are not supported and only logged.
    Request { seq: i64, command: String },
}

impl ProtocolMessage {
    pub fn parse(value: Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "response" => Ok(ProtocolMessage::Response(serde_json::from_value(value)?)),
            "event" => Ok(ProtocolMessage::Event(serde_json::from_value(value)?)),
            "request" => Ok(ProtocolMessage::Request {
                seq: value.get("seq").and_then(Value::as_i64).unwrap_or_default(),
                command: value
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            other => Err(RelayError::Other(anyhow::anyhow!(
                "unknown protocol message type {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_response_without_body() {
        let msg = ProtocolMessage::parse(json!({
            "seq": 3, "type": "response", "request_seq": 1,
            "success": true, "command": "configurationDone"
        }))
        .unwrap();
        match msg {
            ProtocolMessage::Response(r) => {
                assert_eq!(r.request_seq, 1);
                assert!(r.body.is_null());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_stopped_event_thread() {
        let msg = ProtocolMessage::parse(json!({
            "seq": 9, "type": "event", "event": "stopped",
            "body": {"reason": "step", "threadId": 7}
        }))
        .unwrap();
        let ProtocolMessage::Event(e) = msg else {
            panic!("expected event");
        };
        assert_eq!(e.thread_id(), Some(7));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(ProtocolMessage::parse(json!({"type": "bogus"})).is_err());
    }

    #[test]
    fn request_omits_null_arguments() {
        let raw = serde_json::to_value(Request::new(1, "threads", Value::Null)).unwrap();
        assert_eq!(raw, json!({"seq": 1, "type": "request", "command": "threads"}));
    }
}
