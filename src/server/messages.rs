// src/server/messages.rs

//! Client-facing message envelopes: `{"event": <name>, "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::{RelayError, Result};
use crate::transport::Chunk;
use crate::types::{Language, SessionStatus};

/// Raw envelope as framed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub code: String,
    pub language: Language,
    pub user_id: String,
    #[serde(default)]
    pub code_hash: Option<String>,
}

impl StartRequest {
    /// Caller-supplied hash, or the BLAKE3 hex digest of the code.
    pub fn code_hash(&self) -> String {
        self.code_hash
            .clone()
            .unwrap_or_else(|| blake3::hash(self.code.as_bytes()).to_hex().to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Start(StartRequest),
    Next,
    StepIn,
    StepOut,
    Continue,
    StackTrace { thread_id: Option<i64> },
    Scopes { frame_id: i64 },
    Variables { variables_reference: i64 },
    ChunkRequest { chunk_id: usize },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTraceArgs {
    #[serde(default)]
    thread_id: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopesArgs {
    frame_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesArgs {
    variables_reference: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRequestArgs {
    chunk_id: usize,
}

impl ClientMessage {
    pub fn from_value(value: Value) -> Result<Self> {
        let Envelope { event, data } = serde_json::from_value(value)?;
        // Bodiless commands may send `{}` or omit `data`.
        let data = if data.is_null() { json!({}) } else { data };
        let msg = match event.as_str() {
            "debug:start" => ClientMessage::Start(serde_json::from_value(data)?),
            "debug:next" => ClientMessage::Next,
            "debug:stepIn" => ClientMessage::StepIn,
            "debug:stepOut" => ClientMessage::StepOut,
            "debug:continue" => ClientMessage::Continue,
            "debug:stackTrace" => {
                let args: StackTraceArgs = serde_json::from_value(data)?;
                ClientMessage::StackTrace {
                    thread_id: args.thread_id,
                }
            }
            "debug:scopes" => {
                let args: ScopesArgs = serde_json::from_value(data)?;
                ClientMessage::Scopes {
                    frame_id: args.frame_id,
                }
            }
            "debug:variables" => {
                let args: VariablesArgs = serde_json::from_value(data)?;
                ClientMessage::Variables {
                    variables_reference: args.variables_reference,
                }
            }
            "chunk:request" => {
                let args: ChunkRequestArgs = serde_json::from_value(data)?;
                ClientMessage::ChunkRequest {
                    chunk_id: args.chunk_id,
                }
            }
            other => {
                return Err(RelayError::Other(anyhow::anyhow!(
                    "unknown client event {other:?}"
                )));
            }
        };
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SessionCreated {
        session_id: String,
        worker_id: Option<String>,
        status: SessionStatus,
    },
    SessionError {
        error: String,
        kind: String,
    },
    /// Adapter event relayed under its own name.
    AdapterEvent { event: String, body: Value },
    ChunkReady(Chunk),
    ChunkComplete { total_chunks: usize },
    DebugResponse { command: String, body: Value },
}

impl ServerMessage {
    pub fn error(err: &RelayError) -> Self {
        ServerMessage::SessionError {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }
    }

    pub fn event_name(&self) -> &str {
        match self {
            ServerMessage::SessionCreated { .. } => "session:created",
            ServerMessage::SessionError { .. } => "session:error",
            ServerMessage::AdapterEvent { event, .. } => event,
            ServerMessage::ChunkReady(_) => "chunk:ready",
            ServerMessage::ChunkComplete { .. } => "chunk:complete",
            ServerMessage::DebugResponse { .. } => "debug:response",
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope> {
        let data = match self {
            ServerMessage::SessionCreated {
                session_id,
                worker_id,
                status,
            } => json!({ "sessionId": session_id, "workerId": worker_id, "status": status }),
            ServerMessage::SessionError { error, kind } => json!({ "error": error, "kind": kind }),
            ServerMessage::AdapterEvent { body, .. } => body.clone(),
            ServerMessage::ChunkReady(chunk) => serde_json::to_value(chunk)?,
            ServerMessage::ChunkComplete { total_chunks } => {
                json!({ "totalChunks": total_chunks })
            }
            ServerMessage::DebugResponse { command, body } => {
                json!({ "command": command, "body": body })
            }
        };
        Ok(Envelope {
            event: self.event_name().to_string(),
            data,
        })
    }
}
