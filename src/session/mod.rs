// src/session/mod.rs

//! Session records and their worker bindings.

pub mod manager;
pub mod model;

pub use manager::{SessionManager, session_key, worker_index_key};
pub use model::{Session, SessionPatch};
