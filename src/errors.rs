// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! Resource-lifecycle failures (pool, worker) and protocol failures share one
//! enum so the server can map any of them onto a `session:error` message via
//! [`RelayError::kind`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no worker available within {timeout_ms}ms")]
    PoolExhausted { timeout_ms: u64 },

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("failed to spawn debug adapter: {0}")]
    AdapterSpawnFailure(String),

    #[error("debug adapter exited")]
    AdapterExited,

    #[error("debug adapter stopped answering '{0}'")]
    AdapterUnresponsive(String),

    #[error("request '{command}' (seq {seq}) timed out")]
    ProtocolTimeout { command: String, seq: i64 },

    #[error("debug adapter controller is terminated")]
    ControllerTerminated,

    #[error("no active thread; wait for a stopped event first")]
    NoActiveThread,

    #[error("request '{command}' failed: {message}")]
    RequestFailed { command: String, message: String },

    #[error("chunk decryption failed")]
    DecryptionError,

    #[error("malformed chunk {chunk_id}: {reason}")]
    MalformedChunk { chunk_id: usize, reason: String },

    #[error("malformed trace: {0}")]
    MalformedTrace(String),

    #[error("trace payload carries both legacy and compacted steps")]
    AmbiguousTraceFormat,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid session state: {0}")]
    InvalidSessionState(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable short identifier sent to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::ConfigError(_) => "ConfigError",
            RelayError::IoError(_) => "IoError",
            RelayError::TomlError(_) => "TomlError",
            RelayError::Json(_) => "Json",
            RelayError::PoolExhausted { .. } => "PoolExhausted",
            RelayError::UnknownWorker(_) => "UnknownWorker",
            RelayError::AdapterSpawnFailure(_) => "AdapterSpawnFailure",
            RelayError::AdapterExited => "AdapterExited",
            RelayError::AdapterUnresponsive(_) => "AdapterUnresponsive",
            RelayError::ProtocolTimeout { .. } => "ProtocolTimeout",
            RelayError::ControllerTerminated => "ControllerTerminated",
            RelayError::NoActiveThread => "NoActiveThread",
            RelayError::RequestFailed { .. } => "RequestFailed",
            RelayError::DecryptionError => "DecryptionError",
            RelayError::MalformedChunk { .. } => "MalformedChunk",
            RelayError::MalformedTrace(_) => "MalformedTrace",
            RelayError::AmbiguousTraceFormat => "AmbiguousTraceFormat",
            RelayError::SessionNotFound(_) => "SessionNotFound",
            RelayError::InvalidSessionState(_) => "InvalidSessionState",
            RelayError::Store(_) => "Store",
            RelayError::Other(_) => "Other",
        }
    }

    /// Failures that mean the worker behind a session is gone and the session
    /// should go through recovery.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            RelayError::AdapterSpawnFailure(_)
                | RelayError::AdapterExited
                | RelayError::AdapterUnresponsive(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, RelayError>;
