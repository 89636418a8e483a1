// src/pipeline/mod.rs

//! Per-session orchestration.
//!
//! A [`SessionContext`] is created by [`Pipeline::start`] and owned by the
//! connection that started it. It is passed around explicitly; nothing here
//! is global. Lifecycle:
//! - start: session record (`pending`) → worker → `active` → adapter → launch
//! - run: every adapter event is relayed; stops are captured as raw steps
//! - finish: compact, chunk, encrypt, push; release the worker; `terminated`
//! - disconnect: tear the adapter down, release the worker; `paused`
//!
//! Worker failures (spawn failure, adapter exit) move the session to
//! `recovery` and are retried once on a fresh worker.

pub mod recorder;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::crypto::{CryptoHelper, SessionKey};
use crate::dap::{AdapterBackend, ControllerOptions, DapController, Event};
use crate::errors::{RelayError, Result};
use crate::pool::{WorkerHandle, WorkerPool};
use crate::server::messages::{ClientMessage, ServerMessage, StartRequest};
use crate::session::{SessionManager, SessionPatch};
use crate::trace::{TraceCompactor, TracePayload};
use crate::transport::ChunkSet;
use crate::types::{Language, SessionStatus};

pub use recorder::{FrameInfo, StopSnapshot, TraceRecorder};

/// Messages for the client that owns a session.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub acquire_timeout: Duration,
    pub controller: ControllerOptions,
    pub max_steps: usize,
    pub auto_step: bool,
    pub chunk_size: usize,
    pub encrypt: bool,
}

impl PipelineSettings {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self {
            acquire_timeout: cfg.pool.acquire_timeout(),
            controller: ControllerOptions::from_config(&cfg.adapter),
            max_steps: cfg.trace.max_steps,
            auto_step: cfg.trace.auto_step,
            chunk_size: cfg.transport.chunk_size,
            encrypt: cfg.transport.encrypt,
        }
    }
}

/// Whether the session still expects adapter events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

/// Shared collaborators; cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    pool: WorkerPool,
    sessions: Arc<SessionManager>,
    adapter: Arc<dyn AdapterBackend>,
    crypto: Option<CryptoHelper>,
    settings: PipelineSettings,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        pool: WorkerPool,
        sessions: Arc<SessionManager>,
        adapter: Arc<dyn AdapterBackend>,
        crypto: Option<CryptoHelper>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        if settings.encrypt && crypto.is_none() {
            return Err(RelayError::ConfigError(
                "chunk encryption is enabled but no secret is configured".to_string(),
            ));
        }
        Ok(Self {
            pool,
            sessions,
            adapter,
            crypto,
            settings,
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Create a session, bind a worker and launch the program.
    ///
    /// On `PoolExhausted` the session record stays `pending`.
    pub async fn start(&self, request: StartRequest, out: &Outbox) -> Result<SessionContext> {
        let mut ctx = self.open(request).await?;
        ctx.launch(out).await?;
        Ok(ctx)
    }

    /// Create the `pending` session record and its context, with nothing
    /// bound yet. [`SessionContext::launch`] brings it up.
    pub async fn open(&self, request: StartRequest) -> Result<SessionContext> {
        let session = self.sessions.create_session(
            &request.user_id,
            &request.code_hash(),
            request.language,
        )?;
        let key = match (&self.crypto, self.settings.encrypt) {
            (Some(crypto), true) => {
                // 100k PBKDF2 rounds; must not run on an async worker.
                let crypto = crypto.clone();
                let session_id = session.session_id.clone();
                let key = tokio::task::spawn_blocking(move || crypto.derive_key(&session_id))
                    .await
                    .map_err(|e| RelayError::Other(anyhow::anyhow!("key derivation task failed: {e}")))?;
                Some(key)
            }
            _ => None,
        };

        Ok(SessionContext {
            pipeline: self.clone(),
            session_id: session.session_id,
            source: request.code,
            language: request.language,
            worker: None,
            controller: None,
            events: None,
            recorder: TraceRecorder::new(self.settings.max_steps),
            chunks: None,
            key,
            recovered: false,
        })
    }
}

/// Everything one running session owns.
pub struct SessionContext {
    pipeline: Pipeline,
    session_id: String,
    source: String,
    language: Language,
    worker: Option<WorkerHandle>,
    controller: Option<DapController>,
    events: Option<mpsc::UnboundedReceiver<Event>>,
    recorder: TraceRecorder,
    chunks: Option<ChunkSet>,
    key: Option<SessionKey>,
    recovered: bool,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("worker", &self.worker.as_ref().map(|w| &w.id))
            .field("steps", &self.recorder.len())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker.as_ref().map(|w| w.id.as_str())
    }

    pub fn recorder(&self) -> &TraceRecorder {
        &self.recorder
    }

    pub fn chunks(&self) -> Option<&ChunkSet> {
        self.chunks.as_ref()
    }

    pub fn session_key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Bind a worker, start the adapter and launch the program, then tell
    /// the client the session is live.
    pub async fn launch(&mut self, out: &Outbox) -> Result<()> {
        self.bring_up().await?;
        self.announce(out);
        Ok(())
    }

    /// The trace has been delivered.
    pub fn is_finished(&self) -> bool {
        self.chunks.is_some()
    }

    /// Next adapter event. `None` means the adapter stream closed.
    ///
    /// Never resolves while no adapter is attached.
    pub async fn next_event(&mut self) -> Option<Event> {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Relay `event` to the client and advance recording.
    pub async fn handle_event(&mut self, event: Event, out: &Outbox) -> Result<Flow> {
        if event.event == "trace" {
            let steps = TracePayload::parse(event.body)?.into_raw()?;
            info!(session_id = %self.session_id, steps = steps.len(), "adapter delivered a whole trace");
            self.recorder.replace(steps);
            return Ok(Flow::Continue);
        }

        let _ = out.send(ServerMessage::AdapterEvent {
            event: event.event.clone(),
            body: event.body.clone(),
        });

        match event.event.as_str() {
            "stopped" => {
                let controller = self
                    .controller
                    .as_ref()
                    .ok_or(RelayError::ControllerTerminated)?;
                if !self.recorder.is_finished() {
                    self.recorder.capture(controller).await?;
                }
                if self.recorder.is_full() || self.recorder.is_finished() {
                    debug!(session_id = %self.session_id, "step limit reached");
                    self.finish(out).await?;
                    return Ok(Flow::Finished);
                }
                if self.pipeline.settings.auto_step {
                    // Nothing else would resume the program, so an unanswered
                    // step means the worker is stuck.
                    if let Err(e) = self.controller()?.next().await {
                        return Err(match e {
                            RelayError::ProtocolTimeout { command, .. } => {
                                warn!(session_id = %self.session_id, %command, "adapter stopped answering while auto-stepping");
                                RelayError::AdapterUnresponsive(command)
                            }
                            other => other,
                        });
                    }
                }
                Ok(Flow::Continue)
            }
            "terminated" | "exited" => {
                self.finish(out).await?;
                Ok(Flow::Finished)
            }
            _ => Ok(Flow::Continue),
        }
    }

    /// The adapter stream closed. Unless the trace was already delivered
    /// this is a worker failure.
    pub async fn adapter_closed(&mut self, out: &Outbox) -> Result<()> {
        self.events = None;
        if self.is_finished() {
            return Ok(());
        }
        warn!(session_id = %self.session_id, worker_id = ?self.worker_id(), "adapter exited unexpectedly");
        self.recover(RelayError::AdapterExited, out).await
    }

    /// Route a worker failure through recovery; any other error is returned
    /// untouched.
    pub async fn on_error(&mut self, err: RelayError, out: &Outbox) -> Result<()> {
        if err.is_worker_failure() && !self.is_finished() {
            self.recover(err, out).await
        } else {
            Err(err)
        }
    }

    /// Execute one client command.
    pub async fn handle_client(&mut self, msg: ClientMessage, out: &Outbox) -> Result<()> {
        let (command, body) = match msg {
            ClientMessage::Start(_) => {
                return Err(RelayError::InvalidSessionState(format!(
                    "session {} already started on this connection",
                    self.session_id
                )));
            }
            ClientMessage::Next => ("next", self.controller()?.next().await?),
            ClientMessage::StepIn => ("stepIn", self.controller()?.step_in().await?),
            ClientMessage::StepOut => ("stepOut", self.controller()?.step_out().await?),
            ClientMessage::Continue => ("continue", self.controller()?.continue_().await?),
            ClientMessage::StackTrace { thread_id } => (
                "stackTrace",
                self.controller()?.stack_trace(thread_id).await?,
            ),
            ClientMessage::Scopes { frame_id } => {
                ("scopes", self.controller()?.scopes(frame_id).await?)
            }
            ClientMessage::Variables {
                variables_reference,
            } => (
                "variables",
                self.controller()?.variables(variables_reference).await?,
            ),
            ClientMessage::ChunkRequest { chunk_id } => {
                let chunks = self.chunks.as_ref().ok_or_else(|| {
                    RelayError::InvalidSessionState("trace not delivered yet".to_string())
                })?;
                let chunk = chunks.get(chunk_id)?.clone();
                let _ = out.send(ServerMessage::ChunkReady(chunk));
                return Ok(());
            }
        };
        let _ = out.send(ServerMessage::DebugResponse {
            command: command.to_string(),
            body,
        });
        Ok(())
    }

    /// Compact, chunk and push the trace; release the worker.
    pub async fn finish(&mut self, out: &Outbox) -> Result<()> {
        if self.is_finished() {
            return Ok(());
        }
        self.recorder.finish();
        self.events = None;
        if let Some(controller) = self.controller.take() {
            controller.disconnect();
        }

        let chunk_size = self.pipeline.settings.chunk_size;
        let mut compactor = TraceCompactor::with_keyframe_interval(chunk_size);
        let compacted = compactor.compact_all(self.recorder.steps())?;
        let stats = compactor.stats();
        let chunks = ChunkSet::build(
            compacted,
            chunk_size,
            self.recorder.metadata(),
            self.key.as_ref(),
        )?;

        for chunk in chunks.iter() {
            let _ = out.send(ServerMessage::ChunkReady(chunk.clone()));
        }
        let _ = out.send(ServerMessage::ChunkComplete {
            total_chunks: chunks.total_chunks(),
        });
        info!(
            session_id = %self.session_id,
            steps = self.recorder.len(),
            total_chunks = chunks.total_chunks(),
            ratio = stats.ratio(),
            "trace delivered"
        );
        self.chunks = Some(chunks);

        self.detach_worker(SessionStatus::Terminated).await
    }

    /// Client went away: tear down without waiting, keep the record.
    pub async fn disconnect(mut self) -> Result<()> {
        self.events = None;
        if let Some(controller) = self.controller.take() {
            controller.disconnect();
        }
        if self.is_finished() {
            return Ok(());
        }
        info!(session_id = %self.session_id, "client disconnected; pausing session");
        self.detach_worker(SessionStatus::Paused).await
    }

    fn controller(&self) -> Result<&DapController> {
        self.controller
            .as_ref()
            .ok_or(RelayError::ControllerTerminated)
    }

    fn announce(&self, out: &Outbox) {
        let _ = out.send(ServerMessage::SessionCreated {
            session_id: self.session_id.clone(),
            worker_id: self.worker_id().map(str::to_string),
            status: SessionStatus::Active,
        });
    }

    async fn bring_up(&mut self) -> Result<()> {
        match self.attach().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_worker_failure() => self.reattach(e).await,
            Err(e) => {
                self.abandon().await;
                Err(e)
            }
        }
    }

    /// Acquire a worker, bind it, start the adapter and launch the program.
    async fn attach(&mut self) -> Result<()> {
        let pipeline = self.pipeline.clone();
        let worker = pipeline.pool.acquire(pipeline.settings.acquire_timeout).await?;
        if let Err(e) = pipeline
            .sessions
            .update_session(&self.session_id, SessionPatch::bind(worker.id.clone()))
        {
            let _ = pipeline.pool.release(&worker.id).await;
            return Err(e);
        }
        info!(session_id = %self.session_id, worker_id = %worker.id, "worker bound");
        let workdir = worker.workdir.clone();
        self.worker = Some(worker);

        let (controller, events) = DapController::start(
            pipeline.adapter.as_ref(),
            &workdir,
            pipeline.settings.controller.clone(),
        )
        .await?;
        let launched = controller.launch(&self.source, self.language).await;
        self.controller = Some(controller);
        self.events = Some(events);
        launched.map(|_| ())
    }

    async fn recover(&mut self, cause: RelayError, out: &Outbox) -> Result<()> {
        self.reattach(cause).await?;
        self.announce(out);
        Ok(())
    }

    /// Fail the current worker and try once more on a fresh one.
    async fn reattach(&mut self, cause: RelayError) -> Result<()> {
        self.fail_worker().await?;
        if self.recovered {
            warn!(session_id = %self.session_id, error = %cause, "second worker failure; giving up");
            return Err(cause);
        }
        self.recovered = true;
        self.recorder.reset();
        info!(session_id = %self.session_id, error = %cause, "reattaching session to a fresh worker");

        match self.attach().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_worker_failure() => {
                self.fail_worker().await?;
                Err(e)
            }
            Err(e) => {
                self.abandon().await;
                Err(e)
            }
        }
    }

    /// Session to `recovery`, worker out of service.
    async fn fail_worker(&mut self) -> Result<()> {
        self.events = None;
        if let Some(controller) = self.controller.take() {
            controller.disconnect();
        }
        if let Some(worker) = self.worker.take() {
            // Record first, then pool: the slot must not be re-bound while
            // the old index entry still exists.
            self.pipeline.sessions.handle_worker_failure(&worker.id)?;
            self.pipeline.pool.mark_unhealthy(&worker.id).await;
        }
        Ok(())
    }

    /// Non-worker failure while bringing the session up: give the worker
    /// back and end the session.
    async fn abandon(&mut self) {
        self.events = None;
        if let Some(controller) = self.controller.take() {
            controller.disconnect();
        }
        if self.worker.is_some() {
            if let Err(e) = self.detach_worker(SessionStatus::Terminated).await {
                warn!(session_id = %self.session_id, error = %e, "failed to end session");
            }
        }
    }

    async fn detach_worker(&mut self, status: SessionStatus) -> Result<()> {
        self.pipeline
            .sessions
            .update_session(&self.session_id, SessionPatch::detach(status))?;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = self.pipeline.pool.release(&worker.id).await {
                warn!(session_id = %self.session_id, worker_id = %worker.id, error = %e, "worker release failed");
            }
        }
        Ok(())
    }
}
