use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tracerelay::errors::{RelayError, Result};
use tracerelay::pool::{WorkerHandle, WorkerProvisioner};
use tracerelay::types::BoxFuture;

/// A fake provisioner that:
/// - hands out worker directories under a private temp dir
/// - counts provision / reset / destroy calls
/// - can be told to fail provisioning, provision slowly, or report workers
///   unhealthy
#[derive(Clone)]
pub struct FakeProvisioner {
    inner: Arc<Inner>,
}

struct Inner {
    root: TempDir,
    provisioned: AtomicUsize,
    resets: AtomicUsize,
    destroyed: Mutex<Vec<String>>,
    fail_next_provisions: AtomicUsize,
    provision_delay: Mutex<Option<Duration>>,
    unhealthy: Mutex<HashSet<String>>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                root: TempDir::new().expect("create provisioner temp dir"),
                provisioned: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                destroyed: Mutex::new(Vec::new()),
                fail_next_provisions: AtomicUsize::new(0),
                provision_delay: Mutex::new(None),
                unhealthy: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        self.inner.root.path()
    }

    /// Make the next `n` calls to `provision` fail.
    pub fn fail_next_provisions(&self, n: usize) {
        self.inner.fail_next_provisions.store(n, Ordering::SeqCst);
    }

    /// Sleep for `delay` inside every later `provision` call.
    pub fn provision_delay(&self, delay: Duration) {
        *self.inner.provision_delay.lock().unwrap() = Some(delay);
    }

    /// Make the health check of `worker_id` fail from now on.
    pub fn mark_unhealthy(&self, worker_id: &str) {
        self.inner.unhealthy.lock().unwrap().insert(worker_id.to_string());
    }

    pub fn provisioned(&self) -> usize {
        self.inner.provisioned.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.inner.resets.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.inner.destroyed.lock().unwrap().clone()
    }

    fn workdir(&self, worker_id: &str) -> PathBuf {
        self.inner.root.path().join(worker_id)
    }
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerProvisioner for FakeProvisioner {
    fn provision(&self, worker_id: &str) -> BoxFuture<'_, Result<WorkerHandle>> {
        let id = worker_id.to_string();
        Box::pin(async move {
            let delay = *self.inner.provision_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let should_fail = self
                .inner
                .fail_next_provisions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(RelayError::Other(anyhow::anyhow!(
                    "injected provisioning failure for {id}"
                )));
            }
            let workdir = self.workdir(&id);
            std::fs::create_dir_all(&workdir)?;
            self.inner.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(WorkerHandle { id, workdir })
        })
    }

    fn reset<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.inner.resets.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(&handle.workdir)?;
            Ok(())
        })
    }

    fn health_check<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, bool> {
        Box::pin(async move { !self.inner.unhealthy.lock().unwrap().contains(&handle.id) })
    }

    fn destroy<'a>(&'a self, handle: &'a WorkerHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.inner.destroyed.lock().unwrap().push(handle.id.clone());
        })
    }
}
