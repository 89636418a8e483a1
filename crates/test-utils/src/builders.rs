#![allow(dead_code)]

use serde_json::{json, Map, Value};
use tracerelay::config::{ConfigFile, RawConfigFile};
use tracerelay::trace::{MemoryState, RawStep};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.pool.max_workers = n;
        self.config.pool.warm_workers = self.config.pool.warm_workers.min(n);
        self
    }

    pub fn acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.config.pool.acquire_timeout_ms = ms;
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.adapter.request_timeout_ms = ms;
        self
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.transport.chunk_size = n;
        self
    }

    pub fn max_steps(mut self, n: usize) -> Self {
        self.config.trace.max_steps = n;
        self
    }

    pub fn auto_step(mut self, val: bool) -> Self {
        self.config.trace.auto_step = val;
        self
    }

    pub fn encrypt(mut self, val: bool) -> Self {
        self.config.transport.encrypt = val;
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for one `RawStep`.
pub struct StepBuilder {
    step: RawStep,
}

impl StepBuilder {
    pub fn new(id: u64, line: u32) -> Self {
        Self {
            step: RawStep {
                id,
                step_type: "line_execution".to_string(),
                line,
                explanation: Some(format!("Executing line {line}")),
                function: Some("main".to_string()),
                state: MemoryState::default(),
                animation: None,
                extra: Map::new(),
            },
        }
    }

    pub fn step_type(mut self, t: &str) -> Self {
        self.step.step_type = t.to_string();
        self
    }

    pub fn function(mut self, f: &str) -> Self {
        self.step.function = Some(f.to_string());
        self
    }

    pub fn global(mut self, name: &str, value: Value) -> Self {
        self.step.state.globals.insert(name.to_string(), value);
        self
    }

    /// Set one local in a single `main` frame.
    pub fn local(mut self, name: &str, value: Value) -> Self {
        if self.step.state.stack.is_empty() {
            self.step
                .state
                .stack
                .push(json!({"function": "main", "line": self.step.line, "locals": {}}));
        }
        self.step.state.stack[0]["locals"][name] = value;
        self
    }

    pub fn heap(mut self, addr: &str, value: Value) -> Self {
        self.step.state.heap.insert(addr.to_string(), value);
        self
    }

    pub fn animation(mut self, anim: Value) -> Self {
        self.step.animation = Some(anim);
        self
    }

    pub fn extra(mut self, key: &str, value: Value) -> Self {
        self.step.extra.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> RawStep {
        self.step
    }
}

/// A trace where local `x` counts up, so consecutive steps differ only a bit.
pub fn counting_trace(len: usize) -> Vec<RawStep> {
    (0..len)
        .map(|i| {
            StepBuilder::new(i as u64, 3 + (i as u32 % 5))
                .global("limit", json!(len))
                .local("x", json!(i / 2))
                .build()
        })
        .collect()
}
