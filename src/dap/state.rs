// src/dap/state.rs

//! Pure protocol-client state.
//!
//! Holds the controller lifecycle, the active thread id and the table of
//! outstanding requests keyed by `seq`. No IO happens here; the async
//! controller owns one `ControllerCore` behind a mutex and feeds it the
//! messages it reads from the adapter.

use std::collections::HashMap;
use std::fmt;

use crate::dap::protocol::{Event, Response};
use crate::errors::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Initializing,
    Initialized,
    Launching,
    Running,
    Stopped,
    Terminated,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Uninitialized => "uninitialized",
            ControllerState::Initializing => "initializing",
            ControllerState::Initialized => "initialized",
            ControllerState::Launching => "launching",
            ControllerState::Running => "running",
            ControllerState::Stopped => "stopped",
            ControllerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// How a single request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Response(Response),
    Timeout,
    AdapterExited,
}

/// One outstanding request.
#[derive(Debug)]
pub struct PendingEntry<S> {
    pub command: String,
    pub slot: S,
}

/// `seq → pending slot` table.
///
/// `S` is whatever the shell uses to complete a waiting caller (a oneshot
/// sender in production, a plain value in tests).
#[derive(Debug)]
pub struct PendingTable<S> {
    next_seq: i64,
    entries: HashMap<i64, PendingEntry<S>>,
}

impl<S> Default for PendingTable<S> {
    fn default() -> Self {
        Self {
            next_seq: 1,
            entries: HashMap::new(),
        }
    }
}

impl<S> PendingTable<S> {
    /// Allocate the next sequence number without registering a slot.
    pub fn next_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Allocate a sequence number and register `slot` under it.
    pub fn register(&mut self, command: &str, slot: S) -> i64 {
        let seq = self.next_seq();
        self.entries.insert(
            seq,
            PendingEntry {
                command: command.to_string(),
                slot,
            },
        );
        seq
    }

    /// Remove the entry a response with `request_seq` belongs to.
    pub fn resolve(&mut self, request_seq: i64) -> Option<PendingEntry<S>> {
        self.entries.remove(&request_seq)
    }

    /// Drop everything, returning the slots so callers can be rejected.
    pub fn drain(&mut self) -> Vec<(i64, PendingEntry<S>)> {
        let mut all: Vec<_> = self.entries.drain().collect();
        all.sort_by_key(|(seq, _)| *seq);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lifecycle + correlation state of one adapter session.
#[derive(Debug)]
pub struct ControllerCore<S> {
    state: ControllerState,
    thread_id: Option<i64>,
    pending: PendingTable<S>,
}

impl<S> Default for ControllerCore<S> {
    fn default() -> Self {
        Self {
            state: ControllerState::Uninitialized,
            thread_id: None,
            pending: PendingTable::default(),
        }
    }
}

impl<S> ControllerCore<S> {
    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn thread_id(&self) -> Option<i64> {
        self.thread_id
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ControllerState::Terminated
    }

    pub fn pending(&mut self) -> &mut PendingTable<S> {
        &mut self.pending
    }

    /// Register a request, refusing once the adapter is gone.
    pub fn register(&mut self, command: &str, slot: S) -> Result<i64> {
        if self.is_terminated() {
            return Err(RelayError::ControllerTerminated);
        }
        Ok(self.pending.register(command, slot))
    }

    /// Thread id for step/continue requests.
    pub fn require_thread(&self) -> Result<i64> {
        if self.is_terminated() {
            return Err(RelayError::ControllerTerminated);
        }
        self.thread_id.ok_or(RelayError::NoActiveThread)
    }

    pub fn begin_initialize(&mut self) -> Result<()> {
        self.transition(ControllerState::Uninitialized, ControllerState::Initializing)
    }

    /// Only a successful `initialize` response moves to `Initialized`.
    pub fn on_initialize_response(&mut self, response: &Response) -> Result<()> {
        if response.command == "initialize" && response.success {
            self.transition(ControllerState::Initializing, ControllerState::Initialized)
        } else {
            Err(RelayError::RequestFailed {
                command: "initialize".to_string(),
                message: response
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("unexpected {} response", response.command)),
            })
        }
    }

    pub fn begin_launch(&mut self) -> Result<()> {
        self.transition(ControllerState::Initialized, ControllerState::Launching)
    }

    /// `launch` and `configurationDone` both answered.
    pub fn launched(&mut self) {
        // A `stopped` event may already have arrived (stop on entry).
        if self.state == ControllerState::Launching {
            self.state = ControllerState::Running;
        }
    }

    /// A step or continue was accepted; the program runs until the next stop.
    pub fn resumed(&mut self) {
        if self.state == ControllerState::Stopped {
            self.state = ControllerState::Running;
        }
    }

    /// Update state from an adapter event. Events never touch the pending table.
    pub fn on_event(&mut self, event: &Event) {
        if self.is_terminated() {
            return;
        }
        match event.event.as_str() {
            "stopped" => {
                if let Some(tid) = event.thread_id() {
                    self.thread_id = Some(tid);
                }
                self.state = ControllerState::Stopped;
            }
            "continued" => {
                if let Some(tid) = event.thread_id() {
                    self.thread_id = Some(tid);
                }
                self.state = ControllerState::Running;
            }
            "terminated" => {
                self.state = ControllerState::Terminated;
            }
            _ => {}
        }
    }

    /// The adapter process is gone. Returns every pending slot for rejection.
    pub fn on_exit(&mut self) -> Vec<(i64, PendingEntry<S>)> {
        self.state = ControllerState::Terminated;
        self.thread_id = None;
        self.pending.drain()
    }

    fn transition(&mut self, from: ControllerState, to: ControllerState) -> Result<()> {
        if self.is_terminated() {
            return Err(RelayError::ControllerTerminated);
        }
        if self.state != from {
            return Err(RelayError::Other(anyhow::anyhow!(
                "invalid controller transition {} -> {} (expected {})",
                self.state,
                to,
                from
            )));
        }
        self.state = to;
        Ok(())
    }
}
