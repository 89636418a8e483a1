// src/pipeline/recorder.rs

//! Raw step capture.
//!
//! On every stop the recorder asks the adapter for the stack, the scopes of
//! each frame and their variables, then turns that snapshot into one
//! [`RawStep`]. Building the step from a snapshot is pure; only
//! [`take_snapshot`] talks to the adapter.

use serde_json::{Map, Value, json};
use tracing::{debug, trace};

use crate::dap::DapController;
use crate::errors::Result;
use crate::trace::{MemoryState, RawStep, TraceMetadata};

/// Frames inspected per stop.
const MAX_FRAMES: usize = 16;
/// Members fetched for one aggregate variable.
const MAX_MEMBERS: usize = 64;

/// One stack frame as seen at a stop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInfo {
    pub function: String,
    pub line: u32,
    pub file: String,
    /// Variable name → variable info object.
    pub locals: Map<String, Value>,
}

/// Everything the adapter told us at one stop. Frame 0 is the innermost.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopSnapshot {
    pub frames: Vec<FrameInfo>,
    pub globals: Map<String, Value>,
    pub heap: Map<String, Value>,
}

/// Query stack, scopes and variables for the current stop.
pub async fn take_snapshot(controller: &DapController) -> Result<StopSnapshot> {
    let stack = controller.stack_trace(None).await?;
    let frames = stack
        .get("stackFrames")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut snapshot = StopSnapshot::default();
    for (depth, frame) in frames.iter().take(MAX_FRAMES).enumerate() {
        let mut info = FrameInfo {
            function: frame
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            line: frame.get("line").and_then(Value::as_u64).unwrap_or(0) as u32,
            file: frame
                .pointer("/source/name")
                .or_else(|| frame.pointer("/source/path"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            locals: Map::new(),
        };

        let Some(frame_id) = frame.get("id").and_then(Value::as_i64) else {
            snapshot.frames.push(info);
            continue;
        };
        let scopes = controller.scopes(frame_id).await?;
        for scope in scopes
            .get("scopes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let name = scope.get("name").and_then(Value::as_str).unwrap_or_default();
            let reference = scope
                .get("variablesReference")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if reference <= 0 {
                continue;
            }
            let target = match ScopeKind::of(name) {
                ScopeKind::Registers => continue,
                // Globals and heap are process-wide; read them once.
                ScopeKind::Globals if depth > 0 => continue,
                ScopeKind::Heap if depth > 0 => continue,
                ScopeKind::Globals => &mut snapshot.globals,
                ScopeKind::Heap => &mut snapshot.heap,
                ScopeKind::Locals => &mut info.locals,
            };
            read_variables(controller, reference, target).await?;
        }
        snapshot.frames.push(info);
    }
    Ok(snapshot)
}

async fn read_variables(
    controller: &DapController,
    reference: i64,
    target: &mut Map<String, Value>,
) -> Result<()> {
    let body = controller.variables(reference).await?;
    for var in body
        .get("variables")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(name) = var.get("name").and_then(Value::as_str) else {
            continue;
        };
        let mut info = variable_info(var);

        let child_ref = var
            .get("variablesReference")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if child_ref > 0 && info["primitive"] == "class" {
            let children = controller.variables(child_ref).await?;
            let members: Map<String, Value> = children
                .get("variables")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .take(MAX_MEMBERS)
                .filter_map(|m| {
                    let n = m.get("name")?.as_str()?;
                    Some((n.to_string(), variable_info(m)))
                })
                .collect();
            info["members"] = Value::Object(members);
        }
        target.insert(name.to_string(), info);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Locals,
    Globals,
    Registers,
    Heap,
}

impl ScopeKind {
    fn of(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("global") || lower.contains("static") {
            ScopeKind::Globals
        } else if lower.contains("register") {
            ScopeKind::Registers
        } else if lower == "heap" {
            ScopeKind::Heap
        } else {
            ScopeKind::Locals
        }
    }
}

/// `{name, type, value, primitive, address, className?}` for one DAP variable.
fn variable_info(var: &Value) -> Value {
    let name = var.get("name").and_then(Value::as_str).unwrap_or_default();
    let type_name = var.get("type").and_then(Value::as_str).unwrap_or_default();
    let raw_value = var.get("value").and_then(Value::as_str).unwrap_or_default();
    let has_children = var
        .get("variablesReference")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        > 0;

    let primitive = classify(type_name, has_children);
    let mut info = json!({
        "name": name,
        "type": type_name,
        "value": clean_value(raw_value),
        "primitive": primitive,
        "address": var.get("memoryReference").cloned().unwrap_or(Value::Null),
    });
    if primitive == "class" {
        let class_name = type_name
            .trim_start_matches("struct ")
            .trim_start_matches("class ")
            .to_string();
        info["className"] = Value::String(class_name);
    }
    info
}

fn classify(type_name: &str, has_children: bool) -> &'static str {
    let t = type_name.trim();
    if t.ends_with('*') || t.ends_with("*const") {
        "pointer"
    } else if t.contains('[') {
        "array"
    } else if has_children || t.starts_with("struct ") || t.starts_with("class ") {
        "class"
    } else {
        "primitive"
    }
}

/// Strip the quoting debuggers put around string values.
fn clean_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Accumulates raw steps for one session.
#[derive(Debug, Clone)]
pub struct TraceRecorder {
    max_steps: usize,
    steps: Vec<RawStep>,
    previous_locals: Map<String, Value>,
    global_decls: Vec<Value>,
    functions: Vec<Value>,
    finished: bool,
}

impl TraceRecorder {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps,
            steps: Vec::new(),
            previous_locals: Map::new(),
            global_decls: Vec::new(),
            functions: Vec::new(),
            finished: false,
        }
    }

    pub fn steps(&self) -> &[RawStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step budget used up; no more stops are recorded.
    pub fn is_full(&self) -> bool {
        self.steps.len() >= self.max_steps
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Take a snapshot from the adapter and record it.
    pub async fn capture(&mut self, controller: &DapController) -> Result<Option<&RawStep>> {
        if self.finished || self.is_full() {
            return Ok(None);
        }
        let snapshot = take_snapshot(controller).await?;
        Ok(Some(self.record(snapshot)))
    }

    /// Turn one snapshot into the next raw step.
    pub fn record(&mut self, snapshot: StopSnapshot) -> &RawStep {
        let top = snapshot.frames.first().cloned().unwrap_or_default();
        let detected = detect_step_type(&top, &self.previous_locals);

        self.note_globals(&snapshot.globals);
        for frame in &snapshot.frames {
            self.note_function(frame);
        }

        let state = MemoryState {
            globals: snapshot.globals.clone(),
            stack: snapshot
                .frames
                .iter()
                .map(|f| json!({ "function": f.function, "line": f.line, "locals": f.locals }))
                .collect(),
            heap: snapshot.heap.clone(),
            call_stack: snapshot
                .frames
                .iter()
                .map(|f| json!({ "function": f.function, "line": f.line, "file": f.file }))
                .collect(),
        };

        let mut extra = detected.extra;
        if let Some(var_name) = &detected.variable {
            if let Some(var) = top.locals.get(var_name) {
                extra.insert("name".to_string(), Value::String(var_name.clone()));
                extra.insert("dataType".to_string(), var["type"].clone());
                extra.insert("primitive".to_string(), var["primitive"].clone());
                extra.insert("value".to_string(), var["value"].clone());
                extra.insert("address".to_string(), var["address"].clone());
                extra.insert("scope".to_string(), json!("local"));
            }
        }

        let step = RawStep {
            id: self.steps.len() as u64,
            step_type: detected.step_type.to_string(),
            line: top.line,
            explanation: Some(format!("Executing line {}", top.line)),
            function: Some(top.function.clone()),
            state,
            animation: None,
            extra,
        };
        trace!(step_id = step.id, step_type = %step.step_type, line = step.line, "step recorded");

        self.previous_locals = top.locals;
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    /// Replace everything recorded so far with a trace produced elsewhere
    /// (e.g. delivered whole by the adapter).
    pub fn replace(&mut self, steps: Vec<RawStep>) {
        self.steps = steps;
        self.previous_locals.clear();
        for step in self.steps.clone() {
            if let Some(f) = &step.function {
                let frame = FrameInfo {
                    function: f.clone(),
                    line: step.line,
                    ..FrameInfo::default()
                };
                self.note_function(&frame);
            }
            self.note_globals(&step.state.globals);
        }
        self.finished = self
            .steps
            .last()
            .is_some_and(|s| s.step_type == "program_end");
    }

    /// Append the closing `program_end` step (once).
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        let line = self.steps.last().map(|s| s.line).unwrap_or(0);
        self.steps.push(RawStep {
            id: self.steps.len() as u64,
            step_type: "program_end".to_string(),
            line,
            explanation: Some("Program execution completed".to_string()),
            function: None,
            state: MemoryState::default(),
            animation: None,
            extra: Map::new(),
        });
        self.finished = true;
        debug!(steps = self.steps.len(), "trace recording finished");
    }

    pub fn metadata(&self) -> TraceMetadata {
        TraceMetadata {
            total_steps: self.steps.len(),
            globals: self.global_decls.clone(),
            functions: self.functions.clone(),
        }
    }

    /// Start over (e.g. after relaunching on a fresh worker).
    pub fn reset(&mut self) {
        *self = Self::new(self.max_steps);
    }

    fn note_globals(&mut self, globals: &Map<String, Value>) {
        for (name, info) in globals {
            let known = self
                .global_decls
                .iter()
                .any(|g| g.get("name").and_then(Value::as_str) == Some(name));
            if !known {
                self.global_decls.push(json!({
                    "name": name,
                    "type": info.get("type").cloned().unwrap_or(Value::Null),
                    "value": info.get("value").cloned().unwrap_or_else(|| info.clone()),
                }));
            }
        }
    }

    fn note_function(&mut self, frame: &FrameInfo) {
        let known = self
            .functions
            .iter()
            .any(|f| f.get("name").and_then(Value::as_str) == Some(frame.function.as_str()));
        if !known && !frame.function.is_empty() {
            self.functions.push(json!({ "name": frame.function, "firstLine": frame.line }));
        }
    }
}

struct Detected {
    step_type: &'static str,
    variable: Option<String>,
    extra: Map<String, Value>,
}

/// Classify a step by comparing the top frame's locals with the previous stop.
fn detect_step_type(top: &FrameInfo, previous_locals: &Map<String, Value>) -> Detected {
    let mut extra = Map::new();

    if let Some((name, info)) = top
        .locals
        .iter()
        .find(|(name, _)| !previous_locals.contains_key(*name))
    {
        let step_type = match info.get("primitive").and_then(Value::as_str) {
            Some("class") => {
                extra.insert(
                    "className".to_string(),
                    info.get("className").cloned().unwrap_or(Value::Null),
                );
                extra.insert("objectName".to_string(), Value::String(name.clone()));
                "object_creation"
            }
            Some("pointer") => "pointer_declaration",
            Some("array") => "array_declaration",
            _ => "variable_declaration",
        };
        extra.insert("variable".to_string(), Value::String(name.clone()));
        return Detected {
            step_type,
            variable: Some(name.clone()),
            extra,
        };
    }

    if let Some((name, _)) = top.locals.iter().find(|(name, info)| {
        previous_locals
            .get(*name)
            .is_some_and(|prev| prev.get("value") != info.get("value"))
    }) {
        extra.insert("variable".to_string(), Value::String(name.clone()));
        return Detected {
            step_type: "assignment",
            variable: Some(name.clone()),
            extra,
        };
    }

    if let Some((class_name, method)) = top.function.split_once("::") {
        let method = method.split('(').next().unwrap_or(method);
        if method == class_name {
            extra.insert("className".to_string(), Value::String(class_name.to_string()));
            return Detected {
                step_type: "object_creation",
                variable: None,
                extra,
            };
        }
        if method.starts_with('~') {
            extra.insert("className".to_string(), Value::String(class_name.to_string()));
            return Detected {
                step_type: "object_destruction",
                variable: None,
                extra,
            };
        }
    }

    Detected {
        step_type: "line_execution",
        variable: None,
        extra,
    }
}
