// src/pool/core.rs

//! Pure worker-pool bookkeeping.
//!
//! `PoolCore` is a fixed-capacity arena of slots plus a free list of idle
//! slots. It decides *what* should happen (hand out an idle worker, provision
//! into a vacant slot, report exhaustion) and records the result once the
//! async shell (`pool::WorkerPool`) has done the actual IO.
//!
//! It has no Tokio types and performs no IO, so the invariants can be
//! unit tested directly:
//! - a slot in `Busy` was handed out by exactly one `try_acquire`
//! - a worker id maps to at most one slot
//! - the number of occupied slots never exceeds the capacity

use std::collections::{HashMap, VecDeque};

use crate::errors::{RelayError, Result};
use crate::pool::provisioner::WorkerHandle;
use crate::types::WorkerStatus;

#[derive(Debug, Clone)]
enum SlotState {
    Vacant,
    Provisioning { worker_id: String },
    Idle(WorkerHandle),
    Busy(WorkerHandle),
    Resetting(WorkerHandle),
}

#[derive(Debug, Clone)]
struct Slot {
    state: SlotState,
    generation: u64,
}

/// What the shell should do in response to an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireDecision {
    /// An idle worker was handed out.
    Ready(WorkerHandle),
    /// A vacant slot was reserved; the shell must provision `worker_id`
    /// and report back through [`PoolCore::complete_provision`].
    Provision { slot: usize, worker_id: String },
    /// Every slot is occupied and none is idle.
    Exhausted,
}

/// Point-in-time slot counts, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub busy: usize,
    pub provisioning: usize,
    pub resetting: usize,
}

#[derive(Debug)]
pub struct PoolCore {
    slots: Vec<Slot>,
    idle: VecDeque<usize>,
    by_id: HashMap<String, usize>,
}

impl PoolCore {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                state: SlotState::Vacant,
                generation: 0,
            })
            .collect();
        Self {
            slots,
            idle: VecDeque::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn try_acquire(&mut self) -> AcquireDecision {
        while let Some(slot) = self.idle.pop_front() {
            let entry = &mut self.slots[slot];
            if let SlotState::Idle(handle) = &entry.state {
                let handle = handle.clone();
                entry.state = SlotState::Busy(handle.clone());
                return AcquireDecision::Ready(handle);
            }
            // Stale free-list entry (slot retired while idle); skip it.
        }

        match self.reserve_vacant() {
            Some((slot, worker_id)) => AcquireDecision::Provision { slot, worker_id },
            None => AcquireDecision::Exhausted,
        }
    }

    /// Reserve a vacant slot for provisioning without handing anything out.
    pub fn reserve_vacant(&mut self) -> Option<(usize, String)> {
        let slot = self
            .slots
            .iter()
            .position(|s| matches!(s.state, SlotState::Vacant))?;
        let entry = &mut self.slots[slot];
        entry.generation += 1;
        let worker_id = format!("w{slot}-g{}", entry.generation);
        entry.state = SlotState::Provisioning {
            worker_id: worker_id.clone(),
        };
        self.by_id.insert(worker_id.clone(), slot);
        Some((slot, worker_id))
    }

    /// Record the outcome of provisioning `slot`.
    ///
    /// With `hand_out` the new worker goes straight to `Busy` (the caller
    /// that triggered provisioning owns it); otherwise it joins the idle list.
    ///
    /// The slot must still hold the reservation for `handle.id`. If it was
    /// retired meanwhile (and possibly re-reserved under a newer generation)
    /// the handle is returned for teardown and nothing changes.
    #[must_use]
    pub fn complete_provision(
        &mut self,
        slot: usize,
        handle: WorkerHandle,
        hand_out: bool,
    ) -> Option<WorkerHandle> {
        let Some(entry) = self.slots.get_mut(slot) else {
            return Some(handle);
        };
        match &entry.state {
            SlotState::Provisioning { worker_id } if *worker_id == handle.id => {}
            _ => return Some(handle),
        }
        if hand_out {
            entry.state = SlotState::Busy(handle);
        } else {
            entry.state = SlotState::Idle(handle);
            self.idle.push_back(slot);
        }
        None
    }

    /// Provisioning `worker_id` into `slot` failed: give the slot back.
    ///
    /// A no-op when the slot no longer holds that reservation.
    pub fn fail_provision(&mut self, slot: usize, worker_id: &str) {
        let Some(entry) = self.slots.get_mut(slot) else {
            return;
        };
        if matches!(&entry.state, SlotState::Provisioning { worker_id: w } if w == worker_id) {
            self.by_id.remove(worker_id);
            entry.state = SlotState::Vacant;
        }
    }

    /// Move a busy worker into `Resetting` and return its handle.
    pub fn begin_release(&mut self, worker_id: &str) -> Result<WorkerHandle> {
        let slot = self.slot_of(worker_id)?;
        let entry = &mut self.slots[slot];
        match &entry.state {
            SlotState::Busy(handle) => {
                let handle = handle.clone();
                entry.state = SlotState::Resetting(handle.clone());
                Ok(handle)
            }
            _ => Err(RelayError::UnknownWorker(format!(
                "{worker_id} is not checked out"
            ))),
        }
    }

    /// Finish a release. A healthy worker goes back to the idle list; an
    /// unhealthy one frees its slot and its handle is returned for teardown.
    pub fn finish_release(&mut self, worker_id: &str, healthy: bool) -> Option<WorkerHandle> {
        let slot = *self.by_id.get(worker_id)?;
        let entry = &mut self.slots[slot];
        let SlotState::Resetting(handle) = &entry.state else {
            return None;
        };
        let handle = handle.clone();
        if healthy {
            entry.state = SlotState::Idle(handle);
            self.idle.push_back(slot);
            None
        } else {
            entry.state = SlotState::Vacant;
            self.by_id.remove(worker_id);
            Some(handle)
        }
    }

    /// Take a worker out of service regardless of its state.
    ///
    /// Returns the handle to tear down, or `None` if the id is unknown
    /// (already retired).
    pub fn mark_unhealthy(&mut self, worker_id: &str) -> Option<WorkerHandle> {
        let slot = self.by_id.remove(worker_id)?;
        let entry = &mut self.slots[slot];
        let previous = std::mem::replace(&mut entry.state, SlotState::Vacant);
        self.idle.retain(|s| *s != slot);
        match previous {
            SlotState::Idle(h) | SlotState::Busy(h) | SlotState::Resetting(h) => Some(h),
            SlotState::Provisioning { .. } | SlotState::Vacant => None,
        }
    }

    pub fn status_of(&self, worker_id: &str) -> Option<WorkerStatus> {
        let slot = *self.by_id.get(worker_id)?;
        match self.slots[slot].state {
            SlotState::Idle(_) => Some(WorkerStatus::Idle),
            SlotState::Busy(_) | SlotState::Resetting(_) | SlotState::Provisioning { .. } => {
                Some(WorkerStatus::Busy)
            }
            SlotState::Vacant => None,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.slots.len(),
            ..PoolStats::default()
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Vacant => {}
                SlotState::Provisioning { .. } => stats.provisioning += 1,
                SlotState::Idle(_) => stats.idle += 1,
                SlotState::Busy(_) => stats.busy += 1,
                SlotState::Resetting(_) => stats.resetting += 1,
            }
        }
        stats
    }

    fn slot_of(&self, worker_id: &str) -> Result<usize> {
        self.by_id
            .get(worker_id)
            .copied()
            .ok_or_else(|| RelayError::UnknownWorker(worker_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn handle(id: &str) -> WorkerHandle {
        WorkerHandle {
            id: id.to_string(),
            workdir: PathBuf::from("/tmp").join(id),
        }
    }

    fn provision_busy(core: &mut PoolCore) -> WorkerHandle {
        match core.try_acquire() {
            AcquireDecision::Provision { slot, worker_id } => {
                let h = handle(&worker_id);
                assert!(core.complete_provision(slot, h.clone(), true).is_none());
                h
            }
            other => panic!("expected provision, got {other:?}"),
        }
    }

    #[test]
    fn provisions_up_to_capacity_then_exhausts() {
        let mut core = PoolCore::new(2);
        let a = provision_busy(&mut core);
        let b = provision_busy(&mut core);
        assert_ne!(a.id, b.id);
        assert_eq!(core.try_acquire(), AcquireDecision::Exhausted);
        assert_eq!(core.stats().busy, 2);
    }

    #[test]
    fn released_worker_is_reused_and_never_double_handed() {
        let mut core = PoolCore::new(1);
        let a = provision_busy(&mut core);

        let h = core.begin_release(&a.id).unwrap();
        assert_eq!(h, a);
        // Still resetting: not available yet.
        assert_eq!(core.try_acquire(), AcquireDecision::Exhausted);

        assert!(core.finish_release(&a.id, true).is_none());
        assert_eq!(core.try_acquire(), AcquireDecision::Ready(a.clone()));
        assert_eq!(core.try_acquire(), AcquireDecision::Exhausted);
    }

    #[test]
    fn failed_health_check_frees_the_slot() {
        let mut core = PoolCore::new(1);
        let a = provision_busy(&mut core);
        core.begin_release(&a.id).unwrap();
        assert_eq!(core.finish_release(&a.id, false), Some(a.clone()));
        assert_eq!(core.status_of(&a.id), None);

        // Next acquire provisions a new generation in the same slot.
        match core.try_acquire() {
            AcquireDecision::Provision { worker_id, .. } => assert_ne!(worker_id, a.id),
            other => panic!("expected provision, got {other:?}"),
        }
    }

    #[test]
    fn release_of_idle_or_unknown_worker_is_rejected() {
        let mut core = PoolCore::new(1);
        assert!(matches!(
            core.begin_release("nope"),
            Err(RelayError::UnknownWorker(_))
        ));

        let (slot, id) = core.reserve_vacant().unwrap();
        assert!(core.complete_provision(slot, handle(&id), false).is_none());
        assert!(matches!(
            core.begin_release(&id),
            Err(RelayError::UnknownWorker(_))
        ));
    }

    #[test]
    fn mark_unhealthy_removes_idle_worker_from_free_list() {
        let mut core = PoolCore::new(1);
        let (slot, id) = core.reserve_vacant().unwrap();
        assert!(core.complete_provision(slot, handle(&id), false).is_none());
        assert_eq!(core.status_of(&id), Some(WorkerStatus::Idle));

        assert!(core.mark_unhealthy(&id).is_some());
        assert!(core.mark_unhealthy(&id).is_none());
        assert!(matches!(
            core.try_acquire(),
            AcquireDecision::Provision { .. }
        ));
    }

    #[test]
    fn failed_provision_returns_slot() {
        let mut core = PoolCore::new(1);
        let AcquireDecision::Provision { slot, worker_id } = core.try_acquire() else {
            panic!("expected provision");
        };
        core.fail_provision(slot, &worker_id);
        assert_eq!(core.status_of(&worker_id), None);
        assert_eq!(core.stats(), PoolStats { capacity: 1, ..PoolStats::default() });
    }

    #[test]
    fn late_provision_does_not_overwrite_a_newer_reservation() {
        let mut core = PoolCore::new(1);
        let AcquireDecision::Provision { slot, worker_id: old } = core.try_acquire() else {
            panic!("expected provision");
        };
        // Retired while still provisioning, then reserved again.
        assert!(core.mark_unhealthy(&old).is_none());
        let AcquireDecision::Provision { slot: again, worker_id: new } = core.try_acquire() else {
            panic!("expected provision");
        };
        assert_eq!(slot, again);
        assert_ne!(old, new);

        let stale = handle(&old);
        assert_eq!(core.complete_provision(slot, stale.clone(), true), Some(stale));
        core.fail_provision(slot, &old);
        assert_eq!(core.status_of(&new), Some(WorkerStatus::Busy));
        assert_eq!(core.stats().provisioning, 1);

        let fresh = handle(&new);
        assert!(core.complete_provision(slot, fresh.clone(), true).is_none());
        assert_eq!(core.begin_release(&new).unwrap(), fresh);
        assert!(matches!(core.begin_release(&old), Err(RelayError::UnknownWorker(_))));
    }
}
