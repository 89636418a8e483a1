use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncWrite, BufReader};
use tokio::sync::oneshot;
use tracerelay::dap::{framing, AdapterBackend, AdapterProcess};
use tracerelay::errors::{RelayError, Result};
use tracerelay::types::BoxFuture;

/// Variable as the adapter reports it.
#[derive(Debug, Clone)]
pub struct FakeVar {
    pub name: String,
    pub type_name: String,
    pub value: String,
}

pub fn var(name: &str, type_name: &str, value: &str) -> FakeVar {
    FakeVar {
        name: name.to_string(),
        type_name: type_name.to_string(),
        value: value.to_string(),
    }
}

/// One place the scripted program stops at.
#[derive(Debug, Clone)]
pub struct FakeStop {
    pub function: String,
    pub line: u32,
    pub locals: Vec<FakeVar>,
}

pub fn stop(function: &str, line: u32, locals: Vec<FakeVar>) -> FakeStop {
    FakeStop {
        function: function.to_string(),
        line,
        locals,
    }
}

/// What one adapter instance does.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    /// Stops in program order; the first one is the entry stop.
    pub stops: Vec<FakeStop>,
    pub globals: Vec<FakeVar>,
    /// Sent as a custom `trace` event after `configurationDone`, followed by
    /// `terminated`, instead of walking `stops`.
    pub trace_event: Option<Value>,
    /// Commands that are read but never answered.
    pub silent: HashSet<String>,
    /// Close the stream instead of answering the n-th (0-based) resume
    /// request (`next`, `stepIn`, `stepOut`, `continue`).
    pub crash_on_resume: Option<usize>,
}

impl FakeScript {
    pub fn with_stops(stops: Vec<FakeStop>) -> Self {
        Self {
            stops,
            ..Self::default()
        }
    }

    /// `main` declares `x`, assigns it, then returns.
    pub fn simple_program() -> Self {
        Self::with_stops(vec![
            stop("main", 3, vec![]),
            stop("main", 4, vec![var("x", "int", "5")]),
            stop("main", 5, vec![var("x", "int", "6")]),
            stop("main", 6, vec![var("x", "int", "6")]),
        ])
    }

    /// `main` with a single counter assigned on every line.
    pub fn counting_program(len: usize) -> Self {
        Self::with_stops(
            (0..len)
                .map(|i| stop("main", 2 + i as u32, vec![var("i", "int", &i.to_string())]))
                .collect(),
        )
    }

    pub fn silent_on(mut self, command: &str) -> Self {
        self.silent.insert(command.to_string());
        self
    }

    pub fn crash_on_resume(mut self, n: usize) -> Self {
        self.crash_on_resume = Some(n);
        self
    }
}

/// How the next spawn behaves.
#[derive(Debug, Clone)]
pub enum SpawnPlan {
    /// `spawn` itself fails with `AdapterSpawnFailure`.
    FailSpawn,
    Run(FakeScript),
}

/// A scripted in-memory debug adapter.
///
/// Each `spawn` pops the next queued [`SpawnPlan`]; with the queue empty it
/// runs the default script. Every request command received by any instance
/// is appended to a shared log.
#[derive(Clone)]
pub struct FakeAdapter {
    default: FakeScript,
    plans: Arc<Mutex<VecDeque<SpawnPlan>>>,
    spawns: Arc<AtomicUsize>,
    workdirs: Arc<Mutex<Vec<PathBuf>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeAdapter {
    pub fn new(default: FakeScript) -> Self {
        Self {
            default,
            plans: Arc::new(Mutex::new(VecDeque::new())),
            spawns: Arc::new(AtomicUsize::new(0)),
            workdirs: Arc::new(Mutex::new(Vec::new())),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn then(&self, plan: SpawnPlan) -> &Self {
        self.plans.lock().unwrap().push_back(plan);
        self
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn workdirs(&self) -> Vec<PathBuf> {
        self.workdirs.lock().unwrap().clone()
    }

    /// Commands received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| *c == command).count()
    }
}

impl AdapterBackend for FakeAdapter {
    fn spawn<'a>(&'a self, workdir: &'a Path) -> BoxFuture<'a, Result<AdapterProcess>> {
        Box::pin(async move {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            self.workdirs.lock().unwrap().push(workdir.to_path_buf());

            let plan = self.plans.lock().unwrap().pop_front();
            let script = match plan {
                Some(SpawnPlan::FailSpawn) => {
                    return Err(RelayError::AdapterSpawnFailure(
                        "injected spawn failure".to_string(),
                    ));
                }
                Some(SpawnPlan::Run(script)) => script,
                None => self.default.clone(),
            };

            let (controller_end, adapter_end) = tokio::io::duplex(256 * 1024);
            let (reader, writer) = tokio::io::split(controller_end);
            let (teardown_tx, teardown_rx) = oneshot::channel();
            tokio::spawn(run_script(script, adapter_end, teardown_rx, self.log.clone()));

            Ok(AdapterProcess {
                reader: Box::new(reader),
                writer: Box::new(writer),
                teardown: Some(teardown_tx),
            })
        })
    }
}

const LOCALS_REF: i64 = 100;
const GLOBALS_REF: i64 = 200;
const THREAD_ID: i64 = 1;

async fn run_script(
    script: FakeScript,
    stream: tokio::io::DuplexStream,
    mut teardown: oneshot::Receiver<()>,
    log: Arc<Mutex<Vec<String>>>,
) {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut seq = 1_000_i64;
    let mut cursor = 0usize;
    let mut resumes = 0usize;

    loop {
        let msg = tokio::select! {
            _ = &mut teardown => break,
            msg = framing::read_message(&mut reader) => msg,
        };
        let Ok(Some(request)) = msg else {
            break;
        };
        let command = request["command"].as_str().unwrap_or_default().to_string();
        let request_seq = request["seq"].as_i64().unwrap_or(0);
        log.lock().unwrap().push(command.clone());
        if script.silent.contains(&command) {
            tracing::debug!(%command, request_seq, "fake adapter ignoring request");
            continue;
        }

        let mut events = Vec::new();
        let mut done = false;
        let body = match command.as_str() {
            "initialize" => json!({ "supportsConfigurationDoneRequest": true }),
            "launch" | "setBreakpoints" => json!({}),
            "configurationDone" => {
                match &script.trace_event {
                    Some(trace) => {
                        events.push(("trace", trace.clone()));
                        events.push(("terminated", json!({})));
                    }
                    None => events.extend(position_events(&script, cursor)),
                }
                json!({})
            }
            "stackTrace" => match script.stops.get(cursor) {
                Some(s) => json!({
                    "stackFrames": [{
                        "id": 1,
                        "name": s.function,
                        "line": s.line,
                        "source": { "name": "program.c" },
                    }],
                    "totalFrames": 1,
                }),
                None => json!({ "stackFrames": [] }),
            },
            "scopes" => {
                let mut scopes = vec![json!({ "name": "Locals", "variablesReference": LOCALS_REF })];
                if !script.globals.is_empty() {
                    scopes.push(json!({ "name": "Globals", "variablesReference": GLOBALS_REF }));
                }
                json!({ "scopes": scopes })
            }
            "variables" => {
                let vars = match request["arguments"]["variablesReference"].as_i64() {
                    Some(LOCALS_REF) => script
                        .stops
                        .get(cursor)
                        .map(|s| s.locals.clone())
                        .unwrap_or_default(),
                    Some(GLOBALS_REF) => script.globals.clone(),
                    _ => Vec::new(),
                };
                json!({ "variables": vars.iter().map(var_json).collect::<Vec<_>>() })
            }
            "next" | "stepIn" | "stepOut" | "continue" => {
                if script.crash_on_resume == Some(resumes) {
                    break;
                }
                resumes += 1;
                cursor += 1;
                events.extend(position_events(&script, cursor));
                json!({ "allThreadsContinued": true })
            }
            "disconnect" => {
                done = true;
                json!({})
            }
            _ => {
                seq += 1;
                let failure = json!({
                    "seq": seq, "type": "response", "request_seq": request_seq,
                    "success": false, "command": command,
                    "message": format!("unsupported command {command}"),
                });
                if write(&mut writer, &failure).await.is_err() {
                    break;
                }
                continue;
            }
        };

        seq += 1;
        let response = json!({
            "seq": seq, "type": "response", "request_seq": request_seq,
            "success": true, "command": command, "body": body,
        });
        if write(&mut writer, &response).await.is_err() {
            break;
        }
        for (event, body) in events {
            seq += 1;
            let message = json!({ "seq": seq, "type": "event", "event": event, "body": body });
            if write(&mut writer, &message).await.is_err() {
                return;
            }
        }
        if done {
            break;
        }
    }
}

/// Events announcing where the program is after reaching stop `cursor`.
fn position_events(script: &FakeScript, cursor: usize) -> Vec<(&'static str, Value)> {
    if cursor < script.stops.len() {
        let reason = if cursor == 0 { "entry" } else { "step" };
        vec![(
            "stopped",
            json!({ "reason": reason, "threadId": THREAD_ID, "allThreadsStopped": true }),
        )]
    } else {
        vec![
            ("exited", json!({ "exitCode": 0 })),
            ("terminated", json!({})),
        ]
    }
}

fn var_json(v: &FakeVar) -> Value {
    json!({
        "name": v.name,
        "type": v.type_name,
        "value": v.value,
        "variablesReference": 0,
        "memoryReference": format!("0x{:x}", 0x1000 + v.name.len() * 8),
    })
}

async fn write<W: AsyncWrite + Unpin>(writer: &mut W, message: &Value) -> Result<()> {
    framing::write_message(writer, message).await
}
