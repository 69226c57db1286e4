//! Process-group synchronization state.
//!
//! One `ProcessGroup` per job. It owns the job's KVS, the v1 barrier counter,
//! the v2 fence epoch and per-connection fence records, and the set of
//! processes that will never call in again.
//!
//! Completion conditions compare against the *effective* size (members minus
//! dead processes), so a crash cannot leave a barrier or fence unreachable.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::KvsError;
use crate::kvs::{Kvs, KvsPair};
use crate::service::ConnId;

/// Process identifier within a group (its rank).
pub type Pid = i32;
/// Process-group identifier.
pub type Pgid = i32;
/// Fence round counter.
pub type Epoch = u64;

/// A connection blocked in the v1 barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BarrierWaiter {
    pub conn: ConnId,
    pub pid: Pid,
}

/// Highest fence epoch a connection has entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FenceRecord {
    pub conn: ConnId,
    pub pid: Pid,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// The caller already exited and can no longer take part.
    Exited,
    /// The caller's rank is already waiting in this round.
    Duplicate,
    Waiting { count: usize, needed: usize },
    Released(BarrierRelease),
}

/// Every connection that was blocked when the barrier released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierRelease {
    pub waiters: Vec<BarrierWaiter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceOutcome {
    /// The caller already exited and can no longer take part.
    Exited,
    /// This rank already entered the current epoch.
    Duplicate,
    /// The caller named an epoch other than the current one.
    WrongEpoch { requested: Epoch, current: Epoch },
    Pending { count: usize, needed: usize },
    Completed(FenceCompletion),
}

/// An epoch every live member has reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceCompletion {
    /// The epoch that just completed.
    pub epoch: Epoch,
    /// Members that entered it, to be notified.
    pub members: Vec<FenceRecord>,
}

/// Synchronization points unblocked by a process death.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeathOutcome {
    pub barrier: Option<BarrierRelease>,
    pub fence: Option<FenceCompletion>,
}

impl DeathOutcome {
    pub fn is_empty(&self) -> bool {
        self.barrier.is_none() && self.fence.is_none()
    }
}

/// Scratch state for one process group.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Pgid,
    size: usize,

    barrier_count: usize,
    barrier_waiters: Vec<BarrierWaiter>,

    epoch: Epoch,
    fence_count: usize,
    fence_records: Vec<FenceRecord>,

    dead: BTreeSet<Pid>,

    kvs: Kvs,
    keyval_dist_count: usize,
}

impl ProcessGroup {
    /// Create a group of `size` members with a freshly named KVS.
    pub fn create(pgid: Pgid, size: usize, strict_keys: bool) -> Result<Self, KvsError> {
        let kvs = Kvs::create(std::process::id(), pgid, strict_keys)?;
        Ok(Self::with_kvs(pgid, size, kvs))
    }

    pub fn with_kvs(pgid: Pgid, size: usize, kvs: Kvs) -> Self {
        Self {
            pgid,
            size,
            barrier_count: 0,
            barrier_waiters: Vec::new(),
            epoch: 0,
            fence_count: 0,
            fence_records: Vec::new(),
            dead: BTreeSet::new(),
            kvs,
            keyval_dist_count: 0,
        }
    }

    pub fn pgid(&self) -> Pgid {
        self.pgid
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Members still expected to take part in synchronization.
    pub fn effective_size(&self) -> usize {
        self.size.saturating_sub(self.dead.len())
    }

    pub fn kvs(&self) -> &Kvs {
        &self.kvs
    }

    pub fn kvs_mut(&mut self) -> &mut Kvs {
        &mut self.kvs
    }

    pub fn barrier_count(&self) -> usize {
        self.barrier_count
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn fence_count(&self) -> usize {
        self.fence_count
    }

    pub fn is_dead(&self, pid: Pid) -> bool {
        self.dead.contains(&pid)
    }

    pub fn dead_count(&self) -> usize {
        self.dead.len()
    }

    /// True once every member has exited or died.
    pub fn is_complete(&self) -> bool {
        self.size > 0 && self.effective_size() == 0
    }

    /// Enter the blocking barrier. On release every waiter is returned and
    /// the counter is back at zero.
    ///
    /// A dead rank is already counted as satisfied, and a rank counts once
    /// per round, so neither entry moves the counter.
    pub fn enter_barrier(&mut self, conn: ConnId, pid: Pid) -> BarrierOutcome {
        if self.dead.contains(&pid) {
            tracing::debug!(pgid = self.pgid, pid, "Rejecting barrier entry from exited process");
            return BarrierOutcome::Exited;
        }
        if self.barrier_waiters.iter().any(|w| w.pid == pid) {
            tracing::debug!(pgid = self.pgid, pid, "Rejecting repeated barrier entry");
            return BarrierOutcome::Duplicate;
        }
        self.barrier_count += 1;
        self.barrier_waiters.push(BarrierWaiter { conn, pid });
        tracing::trace!(
            pgid = self.pgid,
            pid,
            count = self.barrier_count,
            needed = self.effective_size(),
            "Barrier entered"
        );

        match self.try_release_barrier() {
            Some(release) => BarrierOutcome::Released(release),
            None => BarrierOutcome::Waiting {
                count: self.barrier_count,
                needed: self.effective_size(),
            },
        }
    }

    fn try_release_barrier(&mut self) -> Option<BarrierRelease> {
        if self.barrier_count == 0 || self.barrier_count < self.effective_size() {
            return None;
        }
        self.barrier_count = 0;
        let waiters = std::mem::take(&mut self.barrier_waiters);
        tracing::debug!(pgid = self.pgid, waiters = waiters.len(), "Barrier released");
        Some(BarrierRelease { waiters })
    }

    /// Register arrival at fence `epoch` without blocking.
    ///
    /// Re-entry by a rank that already entered the current epoch, or a call
    /// naming a stale epoch, is ignored. A dead rank cannot enter at all.
    pub fn enter_fence(&mut self, conn: ConnId, pid: Pid, epoch: Epoch) -> FenceOutcome {
        if self.dead.contains(&pid) {
            tracing::debug!(pgid = self.pgid, pid, "Rejecting fence entry from exited process");
            return FenceOutcome::Exited;
        }
        if epoch != self.epoch {
            tracing::debug!(
                pgid = self.pgid,
                pid,
                requested = epoch,
                current = self.epoch,
                "Ignoring fence entry for wrong epoch"
            );
            return FenceOutcome::WrongEpoch {
                requested: epoch,
                current: self.epoch,
            };
        }

        let current = self.epoch;
        if self
            .fence_records
            .iter()
            .any(|r| r.pid == pid && r.epoch == current)
        {
            return FenceOutcome::Duplicate;
        }
        match self
            .fence_records
            .iter_mut()
            .find(|r| r.conn == conn && r.pid == pid)
        {
            Some(record) => record.epoch = current,
            None => self.fence_records.push(FenceRecord {
                conn,
                pid,
                epoch: self.epoch,
            }),
        }
        self.fence_count += 1;
        tracing::trace!(
            pgid = self.pgid,
            pid,
            epoch = self.epoch,
            count = self.fence_count,
            needed = self.effective_size(),
            "Fence entered"
        );

        match self.try_complete_fence() {
            Some(completion) => FenceOutcome::Completed(completion),
            None => FenceOutcome::Pending {
                count: self.fence_count,
                needed: self.effective_size(),
            },
        }
    }

    fn try_complete_fence(&mut self) -> Option<FenceCompletion> {
        if self.fence_count == 0 || self.fence_count < self.effective_size() {
            return None;
        }
        let epoch = self.epoch;
        let members: Vec<FenceRecord> = self
            .fence_records
            .iter()
            .filter(|r| r.epoch == epoch)
            .copied()
            .collect();
        self.epoch += 1;
        self.fence_count = 0;
        tracing::debug!(
            pgid = self.pgid,
            epoch,
            members = members.len(),
            "Fence epoch completed"
        );
        Some(FenceCompletion { epoch, members })
    }

    /// Record that `pid` exited or crashed.
    ///
    /// From now on it counts as permanently satisfied. If it was waiting in
    /// the current barrier or fence round its entry is withdrawn, and any
    /// synchronization point that the smaller group now satisfies completes.
    pub fn mark_dead(&mut self, pid: Pid) -> DeathOutcome {
        if !self.dead.insert(pid) {
            return DeathOutcome::default();
        }
        tracing::debug!(
            pgid = self.pgid,
            pid,
            dead = self.dead.len(),
            size = self.size,
            "Process marked dead"
        );

        let before = self.barrier_waiters.len();
        self.barrier_waiters.retain(|w| w.pid != pid);
        self.barrier_count -= before - self.barrier_waiters.len();

        let epoch = self.epoch;
        let before = self.fence_records.len();
        self.fence_records
            .retain(|r| !(r.pid == pid && r.epoch == epoch));
        let withdrawn = before - self.fence_records.len();
        self.fence_count = self.fence_count.saturating_sub(withdrawn);

        DeathOutcome {
            barrier: self.try_release_barrier(),
            fence: self.try_complete_fence(),
        }
    }

    /// Drop everything a closed connection left behind. Its entries in the
    /// current barrier or fence round no longer count.
    pub fn forget_connection(&mut self, conn: ConnId) {
        let before = self.barrier_waiters.len();
        self.barrier_waiters.retain(|w| w.conn != conn);
        self.barrier_count -= before - self.barrier_waiters.len();

        let epoch = self.epoch;
        let current = self
            .fence_records
            .iter()
            .filter(|r| r.conn == conn && r.epoch == epoch)
            .count();
        self.fence_records.retain(|r| r.conn != conn);
        self.fence_count = self.fence_count.saturating_sub(current);
    }

    /// Pairs written since the last barrier or fence release.
    pub fn undistributed_keyvals(&self) -> &[KvsPair] {
        self.kvs.pairs_since(self.keyval_dist_count)
    }

    /// Mark everything currently in the KVS as distributed. Returns how many
    /// pairs were new.
    pub fn mark_keyvals_distributed(&mut self) -> usize {
        let fresh = self.undistributed_keyvals().len();
        self.keyval_dist_count = self.kvs.len();
        fresh
    }

    pub fn keyval_dist_count(&self) -> usize {
        self.keyval_dist_count
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            pgid: self.pgid,
            kvsname: self.kvs.name().to_string(),
            size: self.size,
            barrier_count: self.barrier_count,
            epoch: self.epoch,
            fence_count: self.fence_count,
            fence_records: self.fence_records.clone(),
            dead_processes: self.dead.iter().copied().collect(),
            keyvals: self.kvs.len(),
            keyval_dist_count: self.keyval_dist_count,
        }
    }
}

/// Point-in-time view of a group, for logs and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub pgid: Pgid,
    pub kvsname: String,
    pub size: usize,
    pub barrier_count: usize,
    pub epoch: Epoch,
    pub fence_count: usize,
    pub fence_records: Vec<FenceRecord>,
    pub dead_processes: Vec<Pid>,
    pub keyvals: usize,
    pub keyval_dist_count: usize,
}
