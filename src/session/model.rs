// src/session/model.rs

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::{Language, SessionStatus};

/// Persisted session record (`session:<id>` in the store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub code_hash: String,
    pub language: Language,
    pub worker_id: Option<String>,
    pub status: SessionStatus,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    pub updated_at: u64,
}

impl Session {
    /// `workerId` is set exactly when the session is active.
    pub fn is_consistent(&self) -> bool {
        (self.status == SessionStatus::Active) == self.worker_id.is_some()
    }
}

/// Partial update merged by `SessionManager::update_session`.
///
/// `worker_id` is doubly optional: `None` leaves the binding alone,
/// `Some(None)` clears it, `Some(Some(id))` binds a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub worker_id: Option<Option<String>>,
}

impl SessionPatch {
    /// Bind `worker_id` and mark the session active.
    pub fn bind(worker_id: impl Into<String>) -> Self {
        Self {
            status: Some(SessionStatus::Active),
            worker_id: Some(Some(worker_id.into())),
        }
    }

    /// Drop the worker binding and move to `status`.
    pub fn detach(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            worker_id: Some(None),
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            worker_id: None,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
