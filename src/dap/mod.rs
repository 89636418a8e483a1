// src/dap/mod.rs

//! Debug Adapter Protocol client.
//!
//! - `framing`: `Content-Length` codec shared with the client-facing server
//! - `protocol`: request/response/event envelopes
//! - `state`: pure lifecycle and `seq` correlation state
//! - `backend`: how adapter subprocesses are spawned
//! - `controller`: async client driving one adapter

pub mod backend;
pub mod controller;
pub mod framing;
pub mod protocol;
pub mod state;

pub use backend::{AdapterBackend, AdapterProcess, RealAdapterBackend};
pub use controller::{ControllerOptions, DapController};
pub use protocol::{Event, ProtocolMessage, Request, Response};
pub use state::{ControllerCore, ControllerState, PendingTable, RequestOutcome};
