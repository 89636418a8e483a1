// src/pool/provisioner.rs

//! Pluggable worker provisioning.
//!
//! The pool talks to a `WorkerProvisioner` instead of creating execution
//! environments itself. Production uses [`LocalProvisioner`], which isolates
//! each worker in a private scratch directory; tests swap in a fake that
//! hands out in-memory handles.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::BoxFuture;

/// Reference to an isolated execution environment owned by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: String,
    /// Scratch directory the adapter runs in and sources are written to.
    pub workdir: PathBuf,
}

/// Trait abstracting how execution workers are created and maintained.
pub trait WorkerProvisioner: Send + Sync + 'static {
    /// Create a fresh worker with the given id.
    fn provision(&self, worker_id: &str) -> BoxFuture<'_, Result<WorkerHandle>>;

    /// Return the worker to a clean state between sessions.
    fn reset<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, Result<()>>;

    /// Whether the worker can be handed out again.
    fn health_check<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, bool>;

    /// Tear the worker down for good. Best effort.
    fn destroy<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, ()>;
}

/// One private directory per worker under `root`.
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    root: PathBuf,
}

impl LocalProvisioner {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl WorkerProvisioner for LocalProvisioner {
    fn provision(&self, worker_id: &str) -> BoxFuture<'_, Result<WorkerHandle>> {
        let workdir = self.root.join(worker_id);
        let id = worker_id.to_string();
        Box::pin(async move {
            tokio::fs::create_dir_all(&workdir)
                .await
                .with_context(|| format!("creating worker directory {:?}", workdir))?;
            debug!(worker_id = %id, workdir = ?workdir, "worker provisioned");
            Ok(WorkerHandle { id, workdir })
        })
    }

    fn reset<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if tokio::fs::try_exists(&handle.workdir).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&handle.workdir)
                    .await
                    .with_context(|| format!("clearing worker directory {:?}", handle.workdir))?;
            }
            tokio::fs::create_dir_all(&handle.workdir)
                .await
                .with_context(|| format!("recreating worker directory {:?}", handle.workdir))?;
            Ok(())
        })
    }

    fn health_check<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let probe = handle.workdir.join(".health");
            match tokio::fs::write(&probe, b"ok").await {
                Ok(()) => tokio::fs::remove_file(&probe).await.is_ok(),
                Err(e) => {
                    warn!(worker_id = %handle.id, error = %e, "worker health check failed");
                    false
                }
            }
        })
    }

    fn destroy<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&handle.workdir).await {
                debug!(worker_id = %handle.id, error = %e, "worker directory already gone");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_provisioner_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let prov = LocalProvisioner::new(dir.path().to_path_buf());

        let handle = prov.provision("w0-g1").await.unwrap();
        assert!(handle.workdir.is_dir());
        assert!(prov.health_check(&handle).await);

        std::fs::write(handle.workdir.join("main.c"), "int main(){}").unwrap();
        prov.reset(&handle).await.unwrap();
        assert!(!handle.workdir.join("main.c").exists());
        assert!(handle.workdir.is_dir());

        prov.destroy(&handle).await;
        assert!(!handle.workdir.exists());
        assert!(!prov.health_check(&handle).await);
    }
}
