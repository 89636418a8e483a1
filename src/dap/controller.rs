// src/dap/controller.rs

//! Async protocol client for one debugger-adapter subprocess.
//!
//! `DapController` is the IO shell around [`ControllerCore`]:
//! - requests are written through a shared writer and parked in the
//!   `seq → slot` table until the reader task resolves them
//! - a single reader task owns the adapter's output stream; responses go to
//!   their slot, events go to the event channel
//! - when the stream ends every pending request is rejected with
//!   `AdapterExited` and the controller becomes terminated

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::AdapterSection;
use crate::dap::backend::AdapterBackend;
use crate::dap::framing;
use crate::dap::protocol::{Event, ProtocolMessage, Request, Response};
use crate::dap::state::{ControllerCore, ControllerState, RequestOutcome};
use crate::errors::{RelayError, Result};
use crate::types::Language;

type Slot = oneshot::Sender<RequestOutcome>;
type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Knobs taken from `[adapter]`.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub adapter_id: String,
    pub request_timeout: Duration,
}

impl ControllerOptions {
    pub fn from_config(cfg: &AdapterSection) -> Self {
        Self {
            adapter_id: cfg.adapter_id.clone(),
            request_timeout: cfg.request_timeout(),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            adapter_id: "lldb".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct DapController {
    core: Arc<Mutex<ControllerCore<Slot>>>,
    writer: SharedWriter,
    teardown: Mutex<Option<oneshot::Sender<()>>>,
    disconnecting: AtomicBool,
    options: ControllerOptions,
    workdir: PathBuf,
}

impl std::fmt::Debug for DapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DapController")
            .field("state", &self.state())
            .field("workdir", &self.workdir)
            .finish_non_exhaustive()
    }
}

impl DapController {
    /// Spawn an adapter in `workdir` and complete the `initialize` handshake.
    ///
    /// Returns the controller and the receiving end of its event channel.
    pub async fn start(
        backend: &dyn AdapterBackend,
        workdir: &Path,
        options: ControllerOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let process = backend.spawn(workdir).await?;
        let (controller, events) = Self::attach(
            process.reader,
            process.writer,
            process.teardown,
            workdir.to_path_buf(),
            options,
        );

        controller.lock_core().begin_initialize()?;
        let arguments = json!({
            "clientID": "tracerelay",
            "clientName": "tracerelay",
            "adapterID": controller.options.adapter_id,
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "pathFormat": "path",
        });
        let response = match controller.request("initialize", arguments).await {
            Ok(response) => response,
            Err(RelayError::AdapterExited) => {
                return Err(RelayError::AdapterSpawnFailure(
                    "adapter exited during initialize".to_string(),
                ));
            }
            Err(e) => {
                controller.disconnect();
                return Err(e);
            }
        };
        controller.lock_core().on_initialize_response(&response)?;
        info!(workdir = ?controller.workdir, "adapter initialized");
        Ok((controller, events))
    }

    fn attach(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        teardown: Option<oneshot::Sender<()>>,
        workdir: PathBuf,
        options: ControllerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let core = Arc::new(Mutex::new(ControllerCore::default()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(core.clone(), reader, events_tx));

        let controller = Self {
            core,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            teardown: Mutex::new(teardown),
            disconnecting: AtomicBool::new(false),
            options,
            workdir,
        };
        (controller, events_rx)
    }

    pub fn state(&self) -> ControllerState {
        self.lock_core().state()
    }

    pub fn thread_id(&self) -> Option<i64> {
        self.lock_core().thread_id()
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Write the program into the scratch directory, then `launch` followed
    /// by `configurationDone`. Resolves after both responses, in order.
    pub async fn launch(&self, source: &str, language: Language) -> Result<PathBuf> {
        self.lock_core().begin_launch()?;

        let program = self
            .workdir
            .join(format!("program.{}", language.extension()));
        tokio::fs::write(&program, source).await?;

        let arguments = json!({
            "program": program,
            "language": language,
            "cwd": self.workdir,
            "stopOnEntry": true,
        });
        self.request("launch", arguments).await?;
        self.request("configurationDone", json!({})).await?;
        self.lock_core().launched();

        info!(program = ?program, %language, "program launched");
        Ok(program)
    }

    pub async fn set_breakpoints(&self, path: &Path, lines: &[u32]) -> Result<Value> {
        let breakpoints: Vec<Value> = lines.iter().map(|l| json!({ "line": l })).collect();
        let arguments = json!({
            "source": { "path": path },
            "breakpoints": breakpoints,
        });
        Ok(self.request("setBreakpoints", arguments).await?.body)
    }

    pub async fn next(&self) -> Result<Value> {
        self.resume("next").await
    }

    pub async fn step_in(&self) -> Result<Value> {
        self.resume("stepIn").await
    }

    pub async fn step_out(&self) -> Result<Value> {
        self.resume("stepOut").await
    }

    pub async fn continue_(&self) -> Result<Value> {
        self.resume("continue").await
    }

    /// Frames of `thread_id`, or of the thread from the last stop.
    pub async fn stack_trace(&self, thread_id: Option<i64>) -> Result<Value> {
        let thread_id = match thread_id {
            Some(t) => t,
            None => self.lock_core().require_thread()?,
        };
        self.query(
            "stackTrace",
            json!({ "threadId": thread_id, "startFrame": 0, "levels": 64 }),
        )
        .await
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Value> {
        self.query("scopes", json!({ "frameId": frame_id })).await
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Value> {
        self.query(
            "variables",
            json!({ "variablesReference": variables_reference }),
        )
        .await
    }

    /// Ask the adapter to go away without waiting for anything.
    ///
    /// The `disconnect` request is fire-and-forget (no pending slot); the
    /// reader task does the final cleanup once the stream closes.
    pub fn disconnect(&self) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let seq = {
            let mut core = self.lock_core();
            if core.is_terminated() {
                None
            } else {
                Some(core.pending().next_seq())
            }
        };
        let writer = self.writer.clone();
        tokio::spawn(async move {
            if let Some(seq) = seq {
                let request = Request::new(seq, "disconnect", json!({ "terminateDebuggee": true }));
                if let Ok(raw) = serde_json::to_value(&request) {
                    let mut w = writer.lock().await;
                    if let Err(e) = framing::write_message(&mut *w, &raw).await {
                        debug!(error = %e, "disconnect request not delivered");
                    }
                }
            }
            if let Some(teardown) = teardown {
                let _ = teardown.send(());
            }
        });
        debug!("adapter disconnect requested");
    }

    async fn resume(&self, command: &str) -> Result<Value> {
        let thread_id = {
            let mut core = self.lock_core();
            let thread_id = core.require_thread()?;
            // Before sending: the next `stopped` event may beat the response.
            core.resumed();
            thread_id
        };
        Ok(self
            .request(command, json!({ "threadId": thread_id }))
            .await?
            .body)
    }

    /// Read-only request; retried once on timeout.
    async fn query(&self, command: &str, arguments: Value) -> Result<Value> {
        match self.request(command, arguments.clone()).await {
            Err(RelayError::ProtocolTimeout { seq, .. }) => {
                warn!(command, seq, "read-only request timed out; retrying once");
                Ok(self.request(command, arguments).await?.body)
            }
            other => Ok(other?.body),
        }
    }

    async fn request(&self, command: &str, arguments: Value) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        let seq = self.lock_core().register(command, tx)?;
        let raw = serde_json::to_value(Request::new(seq, command, arguments))?;

        debug!(seq, command, "sending request");
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = framing::write_message(&mut *writer, &raw).await {
                self.lock_core().pending().resolve(seq);
                debug!(seq, command, error = %e, "request write failed");
                return Err(RelayError::AdapterExited);
            }
        }

        let outcome = match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Slot dropped without an answer: the reader is gone.
            Ok(Err(_)) => RequestOutcome::AdapterExited,
            Err(_) => {
                self.lock_core().pending().resolve(seq);
                RequestOutcome::Timeout
            }
        };

        match outcome {
            RequestOutcome::Response(response) if response.success => Ok(response),
            RequestOutcome::Response(response) => Err(RelayError::RequestFailed {
                command: command.to_string(),
                message: response
                    .message
                    .unwrap_or_else(|| "adapter reported failure".to_string()),
            }),
            RequestOutcome::Timeout => Err(RelayError::ProtocolTimeout {
                command: command.to_string(),
                seq,
            }),
            RequestOutcome::AdapterExited => Err(RelayError::AdapterExited),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, ControllerCore<Slot>> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn read_loop(
    core: Arc<Mutex<ControllerCore<Slot>>>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut reader = BufReader::new(reader);
    let lock = || core.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    loop {
        let raw = match framing::read_message(&mut reader).await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "adapter stream unreadable; treating as exit");
                break;
            }
        };

        match ProtocolMessage::parse(raw) {
            Ok(ProtocolMessage::Response(response)) => {
                let entry = lock().pending().resolve(response.request_seq);
                match entry {
                    Some(entry) => {
                        if entry.command != response.command {
                            warn!(
                                seq = response.request_seq,
                                expected = %entry.command,
                                got = %response.command,
                                "response command mismatch"
                            );
                        }
                        let _ = entry.slot.send(RequestOutcome::Response(response));
                    }
                    None => {
                        warn!(
                            request_seq = response.request_seq,
                            command = %response.command,
                            "response with no pending request; discarding"
                        );
                    }
                }
            }
            Ok(ProtocolMessage::Event(event)) => {
                lock().on_event(&event);
                debug!(event = %event.event, "adapter event");
                if events.send(event).is_err() {
                    debug!("event receiver dropped");
                }
            }
            Ok(ProtocolMessage::Request { seq, command }) => {
                warn!(seq, command = %command, "reverse request from adapter not supported");
            }
            Err(e) => warn!(error = %e, "malformed adapter message"),
        }
    }

    let drained = lock().on_exit();
    if !drained.is_empty() {
        warn!(pending = drained.len(), "adapter exited with requests outstanding");
    }
    for (seq, entry) in drained {
        debug!(seq, command = %entry.command, "rejecting pending request");
        let _ = entry.slot.send(RequestOutcome::AdapterExited);
    }
    info!("adapter stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader as TokioBufReader};

    type Wired = (
        DapController,
        mpsc::UnboundedReceiver<Event>,
        TokioBufReader<tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
    );

    fn wired(timeout_ms: u64) -> Wired {
        wired_in(PathBuf::from("."), timeout_ms)
    }

    /// Controller wired to the far ends of two in-memory pipes.
    fn wired_in(workdir: PathBuf, timeout_ms: u64) -> Wired {
        let (adapter_out, controller_in) = tokio::io::duplex(64 * 1024);
        let (controller_out, adapter_in) = tokio::io::duplex(64 * 1024);
        let options = ControllerOptions {
            adapter_id: "test".to_string(),
            request_timeout: Duration::from_millis(timeout_ms),
        };
        let (controller, events) = DapController::attach(
            Box::new(controller_in),
            Box::new(controller_out),
            None,
            workdir,
            options,
        );
        (controller, events, TokioBufReader::new(adapter_in), adapter_out)
    }

    /// Skip the `initialize` exchange.
    fn mark_initialized(controller: &DapController) {
        let mut core = controller.lock_core();
        core.begin_initialize().unwrap();
        let response: Response = serde_json::from_value(json!({
            "request_seq": 0, "success": true, "command": "initialize"
        }))
        .unwrap();
        core.on_initialize_response(&response).unwrap();
    }

    async fn answer(adapter_out: &mut tokio::io::DuplexStream, request: &Value) {
        framing::write_message(
            adapter_out,
            &json!({"type": "response", "request_seq": request["seq"], "success": true,
                    "command": request["command"], "body": {}}),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn launch_resolves_once_after_configuration_done() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, mut events, mut adapter_in, mut adapter_out) =
            wired_in(dir.path().to_path_buf(), 2_000);
        mark_initialized(&controller);
        let controller = Arc::new(controller);

        let launching = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.launch("int main() {}", Language::C).await })
        };

        let launch = framing::read_message(&mut adapter_in).await.unwrap().unwrap();
        assert_eq!(launch["command"], "launch");
        answer(&mut adapter_out, &launch).await;
        framing::write_message(
            &mut adapter_out,
            &json!({"type": "event", "event": "stopped",
                    "body": {"reason": "entry", "threadId": 7}}),
        )
        .await
        .unwrap();

        let done = framing::read_message(&mut adapter_in).await.unwrap().unwrap();
        assert_eq!(done["command"], "configurationDone");
        let stopped = events.recv().await.unwrap();
        assert_eq!(stopped.event, "stopped");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!launching.is_finished(), "launch resolved before configurationDone");

        answer(&mut adapter_out, &done).await;
        let program = launching.await.unwrap().unwrap();
        assert_eq!(program, dir.path().join("program.c"));
        assert_eq!(std::fs::read_to_string(&program).unwrap(), "int main() {}");
        // The stop that arrived mid-handshake is kept.
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert_eq!(controller.thread_id(), Some(7));

        let extra = tokio::time::timeout(
            Duration::from_millis(50),
            framing::read_message(&mut adapter_in),
        )
        .await;
        assert!(extra.is_err(), "unexpected request after launch: {extra:?}");
        assert!(matches!(
            controller.launch("int main() {}", Language::C).await,
            Err(RelayError::Other(_))
        ));
    }

    #[tokio::test]
    async fn unmatched_response_is_discarded_and_late_answer_resolves() {
        let (controller, _events, mut adapter_in, mut adapter_out) = wired(2_000);

        let reply = tokio::spawn(async move {
            let req = framing::read_message(&mut adapter_in).await.unwrap().unwrap();
            let seq = req["seq"].as_i64().unwrap();
            framing::write_message(
                &mut adapter_out,
                &json!({"type": "response", "request_seq": 999, "success": true, "command": "scopes"}),
            )
            .await
            .unwrap();
            framing::write_message(
                &mut adapter_out,
                &json!({"type": "response", "request_seq": seq, "success": true,
                        "command": "scopes", "body": {"scopes": []}}),
            )
            .await
            .unwrap();
            (adapter_in, adapter_out)
        });

        let body = controller.scopes(1).await.unwrap();
        assert_eq!(body, json!({"scopes": []}));
        let _ = reply.await.unwrap();
    }

    #[tokio::test]
    async fn stream_close_rejects_pending_with_adapter_exited() {
        let (controller, _events, mut adapter_in, adapter_out) = wired(5_000);

        let closer = tokio::spawn(async move {
            let _ = framing::read_message(&mut adapter_in).await.unwrap();
            drop(adapter_out);
            adapter_in
        });

        let res = controller.variables(3).await;
        assert!(matches!(res, Err(RelayError::AdapterExited)));
        let _ = closer.await.unwrap();
        assert_eq!(controller.state(), ControllerState::Terminated);
        assert!(matches!(
            controller.variables(3).await,
            Err(RelayError::ControllerTerminated)
        ));
    }

    #[tokio::test]
    async fn read_only_query_is_retried_once_after_timeout() {
        let (controller, _events, mut adapter_in, mut adapter_out) = wired(100);

        let adapter = tokio::spawn(async move {
            // Ignore the first request, answer the retry.
            let _first = framing::read_message(&mut adapter_in).await.unwrap().unwrap();
            let second = framing::read_message(&mut adapter_in).await.unwrap().unwrap();
            framing::write_message(
                &mut adapter_out,
                &json!({"type": "response", "request_seq": second["seq"], "success": true,
                        "command": "variables", "body": {"variables": [{"name": "x"}]}}),
            )
            .await
            .unwrap();
            adapter_out.flush().await.unwrap();
            (adapter_in, adapter_out)
        });

        let body = controller.variables(5).await.unwrap();
        assert_eq!(body["variables"][0]["name"], "x");
        let _ = adapter.await.unwrap();
    }

    #[tokio::test]
    async fn step_without_stop_fails_locally() {
        let (controller, _events, _adapter_in, _adapter_out) = wired(100);
        assert!(matches!(controller.next().await, Err(RelayError::NoActiveThread)));
    }
}
