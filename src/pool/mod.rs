// src/pool/mod.rs

//! Bounded pool of isolated execution workers.
//!
//! `WorkerPool` is the async IO shell around the pure [`PoolCore`]:
//! - the core decides which slot to use and guards the "never handed out
//!   twice" invariant under a mutex
//! - the shell performs provisioning, reset, health checks and teardown
//!   through a [`WorkerProvisioner`] without holding the lock
//! - waiters blocked in `acquire` are woken through a `Notify` whenever a
//!   worker becomes idle or a slot is freed
//! - a slot reserved for provisioning is held by a `Reservation`, which
//!   gives it back if the provisioning caller goes away

pub mod core;
pub mod provisioner;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{RelayError, Result};

pub use self::core::{AcquireDecision, PoolCore, PoolStats};
pub use self::provisioner::{LocalProvisioner, WorkerHandle, WorkerProvisioner};

struct PoolInner {
    core: Mutex<PoolCore>,
    provisioner: Arc<dyn WorkerProvisioner>,
    available: Notify,
}

/// Cheaply cloneable handle to the shared pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(max_workers: usize, provisioner: Arc<dyn WorkerProvisioner>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                core: Mutex::new(PoolCore::new(max_workers)),
                provisioner,
                available: Notify::new(),
            }),
        }
    }

    /// Provision up to `count` idle workers eagerly.
    pub async fn warm_up(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            let Some((slot, worker_id)) = self.inner.core.lock().await.reserve_vacant() else {
                break;
            };
            let reservation = Reservation::new(self, slot, &worker_id);
            match self.inner.provisioner.provision(&worker_id).await {
                Ok(handle) => {
                    if reservation.commit(handle, false).await.is_none() {
                        debug!(worker_id = %worker_id, "warm worker ready");
                    }
                }
                Err(e) => {
                    reservation.abandon().await;
                    return Err(e);
                }
            }
        }
        self.inner.available.notify_one();
        info!(stats = ?self.stats().await, "worker pool warmed up");
        Ok(())
    }

    /// Hand out an idle worker, provisioning one while below capacity.
    ///
    /// Everything, provisioning included, happens within `timeout`; past it
    /// the call fails with `PoolExhausted`. Dropping the future mid-provision
    /// gives the reserved slot back.
    pub async fn acquire(&self, timeout: Duration) -> Result<WorkerHandle> {
        let deadline = Instant::now() + timeout;
        let timeout_ms = timeout.as_millis() as u64;

        loop {
            // Register interest before inspecting the core so a release
            // between the check and the wait is not lost.
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let decision = self.inner.core.lock().await.try_acquire();
            match decision {
                AcquireDecision::Ready(handle) => {
                    debug!(worker_id = %handle.id, "worker acquired");
                    return Ok(handle);
                }
                AcquireDecision::Provision { slot, worker_id } => {
                    let reservation = Reservation::new(self, slot, &worker_id);
                    let provisioned = tokio::time::timeout_at(
                        deadline,
                        self.inner.provisioner.provision(&worker_id),
                    )
                    .await;
                    match provisioned {
                        Ok(Ok(handle)) => {
                            if reservation.commit(handle.clone(), true).await.is_none() {
                                info!(worker_id = %handle.id, "worker provisioned and acquired");
                                return Ok(handle);
                            }
                            // The slot was retired while provisioning; try again.
                        }
                        Ok(Err(e)) => {
                            reservation.abandon().await;
                            warn!(worker_id = %worker_id, error = %e, "worker provisioning failed");
                            return Err(e);
                        }
                        Err(_) => {
                            reservation.abandon().await;
                            warn!(worker_id = %worker_id, timeout_ms, "worker provisioning timed out");
                            return Err(RelayError::PoolExhausted { timeout_ms });
                        }
                    }
                }
                AcquireDecision::Exhausted => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(timeout_ms, "worker pool exhausted");
                        return Err(RelayError::PoolExhausted { timeout_ms });
                    }
                }
            }
        }
    }

    /// Reset a worker and return it to service.
    ///
    /// If reset or the health check fails the worker is discarded and a
    /// replacement is provisioned in the background.
    pub async fn release(&self, worker_id: &str) -> Result<()> {
        let handle = self.inner.core.lock().await.begin_release(worker_id)?;

        let healthy = match self.inner.provisioner.reset(&handle).await {
            Ok(()) => self.inner.provisioner.health_check(&handle).await,
            Err(e) => {
                warn!(worker_id, error = %e, "worker reset failed");
                false
            }
        };

        let discarded = self
            .inner
            .core
            .lock()
            .await
            .finish_release(worker_id, healthy);
        match discarded {
            Some(handle) => {
                warn!(worker_id, "worker failed health check; replacing");
                self.retire(handle);
            }
            None => {
                debug!(worker_id, "worker released");
                self.inner.available.notify_one();
            }
        }
        Ok(())
    }

    /// Remove a worker from service immediately.
    ///
    /// Returns `false` when the worker was already gone.
    pub async fn mark_unhealthy(&self, worker_id: &str) -> bool {
        let removed = self.inner.core.lock().await.mark_unhealthy(worker_id);
        match removed {
            Some(handle) => {
                warn!(worker_id, "worker marked unhealthy");
                self.retire(handle);
                true
            }
            None => {
                debug!(worker_id, "mark_unhealthy on unknown worker; ignoring");
                false
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        self.inner.core.lock().await.stats()
    }

    pub async fn status_of(&self, worker_id: &str) -> Option<crate::types::WorkerStatus> {
        self.inner.core.lock().await.status_of(worker_id)
    }

    /// Tear `handle` down and provision a replacement into a free slot.
    fn retire(&self, handle: WorkerHandle) {
        // The slot is already vacant; a blocked acquirer may provision it
        // itself before the replacement below gets there.
        self.inner.available.notify_one();

        let pool = self.clone();
        tokio::spawn(async move {
            pool.inner.provisioner.destroy(&handle).await;

            let Some((slot, worker_id)) = pool.inner.core.lock().await.reserve_vacant() else {
                debug!("no vacant slot for replacement worker");
                return;
            };
            let reservation = Reservation::new(&pool, slot, &worker_id);
            match pool.inner.provisioner.provision(&worker_id).await {
                Ok(replacement) => {
                    if reservation.commit(replacement, false).await.is_none() {
                        info!(worker_id = %worker_id, replaced = %handle.id, "replacement worker ready");
                    }
                }
                Err(e) => {
                    reservation.abandon().await;
                    warn!(worker_id = %worker_id, error = %e, "replacement provisioning failed");
                }
            }
            pool.inner.available.notify_one();
        });
    }
}

/// A slot reserved for provisioning.
///
/// Unless committed or abandoned explicitly, dropping it gives the slot
/// back from a spawned task.
struct Reservation {
    pool: WorkerPool,
    slot: usize,
    worker_id: String,
    settled: bool,
}

impl Reservation {
    fn new(pool: &WorkerPool, slot: usize, worker_id: &str) -> Self {
        Self {
            pool: pool.clone(),
            slot,
            worker_id: worker_id.to_string(),
            settled: false,
        }
    }

    /// Record the provisioned worker. A stale handle comes back after
    /// being torn down.
    async fn commit(mut self, handle: WorkerHandle, hand_out: bool) -> Option<WorkerHandle> {
        let stale = self
            .pool
            .inner
            .core
            .lock()
            .await
            .complete_provision(self.slot, handle, hand_out);
        self.settled = true;
        if let Some(stale) = &stale {
            warn!(worker_id = %stale.id, "slot retired while provisioning; discarding worker");
            self.pool.inner.provisioner.destroy(stale).await;
        }
        stale
    }

    async fn abandon(mut self) {
        self.pool
            .inner
            .core
            .lock()
            .await
            .fail_provision(self.slot, &self.worker_id);
        self.settled = true;
        self.pool.inner.available.notify_one();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        let slot = self.slot;
        let worker_id = std::mem::take(&mut self.worker_id);
        runtime.spawn(async move {
            pool.inner.core.lock().await.fail_provision(slot, &worker_id);
            pool.inner.available.notify_one();
            debug!(worker_id = %worker_id, "abandoned reservation released");
        });
    }
}
