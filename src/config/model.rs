// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::StoreMode;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [server]
/// listen = "127.0.0.1:4710"
///
/// [pool]
/// max_workers = 4
/// acquire_timeout_ms = 5000
///
/// [adapter]
/// command = "lldb-dap"
///
/// [transport]
/// chunk_size = 100
/// encrypt = true
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub adapter: AdapterSection,

    #[serde(default)]
    pub trace: TraceSection,

    #[serde(default)]
    pub transport: TransportSection,

    #[serde(default)]
    pub crypto: CryptoSection,

    #[serde(default)]
    pub store: StoreSection,
}

/// A configuration that passed semantic validation.
///
/// Only constructible through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone, Serialize)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub pool: PoolSection,
    pub adapter: AdapterSection,
    pub trace: TraceSection,
    pub transport: TransportSection,
    pub crypto: CryptoSection,
    pub store: StoreSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            server: raw.server,
            pool: raw.pool,
            adapter: raw.adapter,
            trace: raw.trace,
            transport: raw.transport,
            crypto: raw.crypto,
            store: raw.store,
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    /// Address the duplex channel listens on.
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:4710".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// `[pool]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSection {
    /// Hard upper bound on live workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Workers provisioned eagerly at startup.
    #[serde(default = "default_warm_workers")]
    pub warm_workers: usize,

    /// How long `acquire` may wait for a release before `PoolExhausted`.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Parent directory of the per-worker scratch directories.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

fn default_max_workers() -> usize {
    4
}

fn default_warm_workers() -> usize {
    1
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".tracerelay/workers")
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            warm_workers: default_warm_workers(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            workspace_root: default_workspace_root(),
        }
    }
}

impl PoolSection {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// `[adapter]` section: the debug adapter subprocess.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdapterSection {
    /// Executable of the debug adapter (spoken to over stdio).
    #[serde(default = "default_adapter_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// `adapterID` sent in the initialize request.
    #[serde(default = "default_adapter_id")]
    pub adapter_id: String,

    /// Deadline for a single request/response exchange.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_adapter_command() -> String {
    "lldb-dap".to_string()
}

fn default_adapter_id() -> String {
    "tracerelay".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for AdapterSection {
    fn default() -> Self {
        Self {
            command: default_adapter_command(),
            args: Vec::new(),
            adapter_id: default_adapter_id(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl AdapterSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// `[trace]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceSection {
    /// Upper bound on recorded steps (the `program_end` step is extra).
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// If true the recorder steps the program itself; otherwise the client
    /// drives it with `debug:next` & co.
    #[serde(default = "default_auto_step")]
    pub auto_step: bool,
}

fn default_max_steps() -> usize {
    200
}

fn default_auto_step() -> bool {
    true
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            auto_step: default_auto_step(),
        }
    }
}

/// `[transport]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportSection {
    /// Steps per chunk; also the compactor's keyframe interval.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Client-side cache capacity in chunks.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Fraction of a chunk consumed before prefetching starts.
    #[serde(default = "default_prefetch_threshold")]
    pub prefetch_threshold: f64,

    /// How many chunk ids ahead to prefetch.
    #[serde(default = "default_prefetch_ahead")]
    pub prefetch_ahead: usize,

    /// Encrypt chunk payloads with the per-session key.
    #[serde(default = "default_encrypt")]
    pub encrypt: bool,
}

fn default_chunk_size() -> usize {
    100
}

fn default_cache_capacity() -> usize {
    8
}

fn default_prefetch_threshold() -> f64 {
    0.8
}

fn default_prefetch_ahead() -> usize {
    2
}

fn default_encrypt() -> bool {
    true
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            cache_capacity: default_cache_capacity(),
            prefetch_threshold: default_prefetch_threshold(),
            prefetch_ahead: default_prefetch_ahead(),
            encrypt: default_encrypt(),
        }
    }
}

/// `[crypto]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CryptoSection {
    /// Environment variable holding the server secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

fn default_secret_env() -> String {
    "TRACERELAY_SECRET".to_string()
}

impl Default for CryptoSection {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreSection {
    #[serde(default)]
    pub mode: StoreMode,

    /// Directory used by `mode = "file"`.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Lazy expiry of session records; `None` keeps them forever.
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".tracerelay/store")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            path: default_store_path(),
            session_ttl_secs: None,
        }
    }
}

impl StoreSection {
    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl_secs.map(Duration::from_secs)
    }
}
