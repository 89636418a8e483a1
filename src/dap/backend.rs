// src/dap/backend.rs

//! Pluggable debugger-adapter backend.
//!
//! The controller talks to an `AdapterBackend` instead of spawning a process
//! itself. `RealAdapterBackend` runs the configured adapter command inside the
//! worker's scratch directory; tests provide a scripted in-memory adapter
//! over `tokio::io::duplex`.

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::AdapterSection;
use crate::errors::{RelayError, Result};
use crate::types::BoxFuture;

/// Byte streams of a running adapter plus a way to stop it.
pub struct AdapterProcess {
    /// Adapter → controller (stdout).
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Controller → adapter (stdin).
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Firing this asks the backend to tear the adapter down. The reader
    /// side observes end-of-stream once it is gone.
    pub teardown: Option<oneshot::Sender<()>>,
}

impl fmt::Debug for AdapterProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterProcess")
            .field("teardown", &self.teardown.is_some())
            .finish_non_exhaustive()
    }
}

/// Trait abstracting how an adapter subprocess is started.
pub trait AdapterBackend: Send + Sync + 'static {
    /// Start one adapter whose working directory is `workdir`.
    fn spawn<'a>(&'a self, workdir: &'a Path) -> BoxFuture<'a, Result<AdapterProcess>>;
}

/// Runs the configured adapter command as a child process.
#[derive(Debug, Clone)]
pub struct RealAdapterBackend {
    command: String,
    args: Vec<String>,
}

impl RealAdapterBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(cfg: &AdapterSection) -> Self {
        Self::new(cfg.command.clone(), cfg.args.clone())
    }
}

impl AdapterBackend for RealAdapterBackend {
    fn spawn<'a>(&'a self, workdir: &'a Path) -> BoxFuture<'a, Result<AdapterProcess>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.command);
            cmd.args(&self.args)
                .current_dir(workdir)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|e| {
                RelayError::AdapterSpawnFailure(format!("{}: {e}", self.command))
            })?;

            let stdin = child.stdin.take().ok_or_else(|| {
                RelayError::AdapterSpawnFailure("adapter stdin not captured".to_string())
            })?;
            let stdout = child.stdout.take().ok_or_else(|| {
                RelayError::AdapterSpawnFailure("adapter stdout not captured".to_string())
            })?;
            let pid = child.id();

            // Always consume stderr so buffers don't fill; log at debug.
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(pid, "adapter stderr: {}", line);
                    }
                });
            }

            let (teardown_tx, teardown_rx) = oneshot::channel::<()>();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => info!(pid, exit_code = status.code().unwrap_or(-1), "adapter exited"),
                            Err(e) => warn!(pid, error = %e, "waiting for adapter failed"),
                        }
                    }
                    _ = teardown_rx => {
                        debug!(pid, "adapter teardown requested; killing process");
                        if let Err(e) = child.kill().await {
                            warn!(pid, error = %e, "failed to kill adapter process");
                        }
                    }
                }
            });

            info!(command = %self.command, pid, workdir = ?workdir, "adapter spawned");
            Ok(AdapterProcess {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                teardown: Some(teardown_tx),
            })
        })
    }
}
