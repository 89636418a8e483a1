// src/session/manager.rs

//! Authoritative session records.
//!
//! The session record and the `worker-session-index:<workerId>` entry are one
//! logical fact and this type is their only writer. All read-merge-write
//! sequences run under `write_lock` so concurrent callers in this process
//! cannot interleave halves of an update.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{RelayError, Result};
use crate::session::model::{Session, SessionPatch, now_ms};
use crate::store::KvStore;
use crate::types::{Language, SessionStatus};

pub const SESSION_KEY_PREFIX: &str = "session:";
pub const WORKER_INDEX_KEY_PREFIX: &str = "worker-session-index:";

pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

pub fn worker_index_key(worker_id: &str) -> String {
    format!("{WORKER_INDEX_KEY_PREFIX}{worker_id}")
}

#[derive(Debug)]
pub struct SessionManager {
    store: Arc<dyn KvStore>,
    ttl: Option<Duration>,
    write_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KvStore>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            ttl,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| RelayError::Store("session write lock poisoned".to_string()))
    }

    pub fn create_session(
        &self,
        user_id: &str,
        code_hash: &str,
        language: Language,
    ) -> Result<Session> {
        let now = now_ms();
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            code_hash: code_hash.to_string(),
            language,
            worker_id: None,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.lock()?;
        self.write_record(&session)?;
        info!(session_id = %session.session_id, user_id, %language, "session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.read_record(session_id)
    }

    /// Read-merge-write. Maintains the worker index alongside the record and
    /// refuses merges that would break the active ⇔ worker invariant.
    pub fn update_session(&self, session_id: &str, patch: SessionPatch) -> Result<Session> {
        let _guard = self.lock()?;
        self.update_locked(session_id, patch)
    }

    fn update_locked(&self, session_id: &str, patch: SessionPatch) -> Result<Session> {
        let current = self
            .read_record(session_id)?
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;

        let mut merged = current.clone();
        if let Some(status) = patch.status {
            merged.status = status;
        }
        if let Some(worker_id) = patch.worker_id.clone() {
            merged.worker_id = worker_id;
        }
        if !merged.is_consistent() {
            return Err(RelayError::InvalidSessionState(format!(
                "session {session_id}: status {} with worker {:?}",
                merged.status, merged.worker_id
            )));
        }
        merged.updated_at = now_ms().max(current.updated_at);

        // Index first, then record: a crash in between leaves at most a
        // stale index entry, which `handle_worker_failure` tolerates.
        if let Some(new_worker) = &merged.worker_id {
            if current.worker_id.as_deref() != Some(new_worker.as_str()) {
                self.store
                    .set(&worker_index_key(new_worker), session_id, self.ttl)?;
            }
        }
        self.write_record(&merged)?;
        if let Some(old_worker) = &current.worker_id {
            if merged.worker_id.as_deref() != Some(old_worker.as_str()) {
                self.store.delete(&worker_index_key(old_worker))?;
            }
        }

        debug!(
            session_id,
            status = %merged.status,
            worker_id = ?merged.worker_id,
            "session updated"
        );
        Ok(merged)
    }

    /// Move the session bound to `worker_id` into `recovery`.
    ///
    /// Returns the updated session, or `None` when no session is bound to the
    /// worker (which makes repeated calls a no-op).
    pub fn handle_worker_failure(&self, worker_id: &str) -> Result<Option<Session>> {
        let _guard = self.lock()?;
        let index_key = worker_index_key(worker_id);

        let Some(session_id) = self.store.get(&index_key)? else {
            debug!(worker_id, "worker failure with no bound session; nothing to do");
            return Ok(None);
        };

        let bound = match self.read_record(&session_id)? {
            Some(s) if s.worker_id.as_deref() == Some(worker_id) => s,
            _ => {
                warn!(worker_id, %session_id, "stale worker index entry; removing");
                self.store.delete(&index_key)?;
                return Ok(None);
            }
        };

        let updated = self.update_locked(
            &bound.session_id,
            SessionPatch::detach(SessionStatus::Recovery),
        )?;
        info!(worker_id, session_id = %updated.session_id, "session moved to recovery after worker failure");
        Ok(Some(updated))
    }

    /// Remove the record and its index entry. Returns whether it existed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(session) = self.read_record(session_id)? else {
            return Ok(false);
        };
        if let Some(worker_id) = &session.worker_id {
            self.store.delete(&worker_index_key(worker_id))?;
        }
        self.store.delete(&session_key(session_id))?;
        info!(session_id, "session deleted");
        Ok(true)
    }

    /// Reverse lookup through the worker index.
    pub fn session_for_worker(&self, worker_id: &str) -> Result<Option<String>> {
        self.store.get(&worker_index_key(worker_id))
    }

    fn read_record(&self, session_id: &str) -> Result<Option<Session>> {
        match self.store.get(&session_key(session_id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_record(&self, session: &Session) -> Result<()> {
        let raw = serde_json::to_string(session)?;
        self.store
            .set(&session_key(&session.session_id), &raw, self.ttl)
    }
}
