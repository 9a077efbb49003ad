//! DTX cache (§3, §4.I): distributed-transaction bookkeeping shared
//! across participants, backed by the same [`crate::lru::LruArray`]
//! substrate as the object cache.
//!
//! No direct teacher analogue exists (the teacher has no multi-target
//! transaction coordinator); built in the crate's established register,
//! leaning on [`crate::hlc`] for the `(uuid, hlc)` identity the spec
//! requires.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Result, VosError};
use crate::hlc::HlcTimestamp;
use crate::lru::{LruArray, LruFlags, LruIndex};

/// Transaction identity: a client-chosen uuid paired with the HLC
/// timestamp at which the transaction began (§4.I).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DtxId {
    pub uuid: Uuid,
    pub hlc: HlcTimestamp,
}

impl DtxId {
    fn cache_key(&self) -> u64 {
        self.uuid.as_u128() as u64 ^ self.hlc.0
    }
}

/// DTX state machine (§4.I).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DtxStatus {
    Inited,
    Preparing,
    Prepared,
    Committing,
    Committable,
    Committed,
    Aborting,
    Aborted,
    Corrupted,
}

/// Participant membership for a transaction (§4.I "collective DTX").
#[derive(Clone, Debug, Default)]
pub struct Membership {
    pub targets: Vec<u32>,
    pub redundancy_groups: Vec<Vec<u32>>,
    pub collective_bitmap: Option<Vec<u64>>,
    pub rank_range: Option<(u32, u32)>,
    /// Up to four leader-candidate ranks, re-derived from the object
    /// layout whenever the leader changes.
    pub leader_candidates: Vec<u32>,
}

impl Membership {
    const MAX_LEADER_CANDIDATES: usize = 4;

    pub fn set_leader_candidates(&mut self, mut candidates: Vec<u32>) {
        candidates.truncate(Self::MAX_LEADER_CANDIDATES);
        self.leader_candidates = candidates;
    }
}

struct DtxSlot {
    dti: DtxId,
    status: DtxStatus,
    membership: Membership,
    epoch: u64,
    minor_epc: u32,
    in_doubt: bool,
}

/// Availability classification returned by [`DtxCache::check`] (§4.I).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Availability {
    Available,
    InDoubt,
    Conflict,
    Unknown,
}

/// What every alive participant reported during [`DtxCache::resync`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParticipantReport {
    Prepared,
    Aborted,
    RedundancyGroupCorrupted,
}

/// Default batching thresholds (§4.I "Batched commit").
pub const DEFAULT_COMMIT_THRESHOLD_COUNT: usize = 512;
pub const DEFAULT_COMMIT_THRESHOLD_AGE: Duration = Duration::from_secs(10);

/// Distributed-transaction cache keyed by `(uuid, hlc)`, with batched
/// commit and aggregation-window rejection.
pub struct DtxCache {
    lru: LruArray<DtxSlot>,
    index_of: HashMap<DtxId, LruIndex>,
    pending_commits: Vec<DtxId>,
    commit_threshold_count: usize,
    /// Upper bound (in HLC physical time) below which reads/updates must
    /// restart because aggregation may have already run past it.
    aggregation_upper_bound: u64,
}

impl DtxCache {
    pub fn new(capacity: u32) -> Result<Self> {
        Ok(Self {
            lru: LruArray::alloc(capacity, 1, LruFlags::default())?,
            index_of: HashMap::new(),
            pending_commits: Vec::new(),
            commit_threshold_count: DEFAULT_COMMIT_THRESHOLD_COUNT,
            aggregation_upper_bound: 0,
        })
    }

    /// Begins tracking a new transaction, returning its cache slot.
    pub fn begin(&mut self, dti: DtxId, epoch: u64, minor_epc: u32) -> Result<LruIndex> {
        if epoch < self.aggregation_upper_bound {
            return Err(VosError::TxRestart(
                "epoch falls inside the aggregation window".into(),
            ));
        }
        let key = dti.cache_key();
        let (idx, slot) = self.lru.find_free(key)?;
        *slot = Some(DtxSlot {
            dti,
            status: DtxStatus::Inited,
            membership: Membership::default(),
            epoch,
            minor_epc,
            in_doubt: false,
        });
        self.index_of.insert(dti, idx);
        Ok(idx)
    }

    fn slot_mut(&mut self, dti: DtxId) -> Result<&mut DtxSlot> {
        let idx = *self
            .index_of
            .get(&dti)
            .ok_or(VosError::NotFound("dtx not resident in cache"))?;
        self.lru
            .lookup(idx, dti.cache_key())
            .ok_or(VosError::NotFound("dtx not resident in cache"))
    }

    pub fn set_membership(&mut self, dti: DtxId, membership: Membership) -> Result<()> {
        self.slot_mut(dti)?.membership = membership;
        Ok(())
    }

    pub fn prepare(&mut self, dti: DtxId) -> Result<()> {
        let slot = self.slot_mut(dti)?;
        slot.status = DtxStatus::Preparing;
        slot.status = DtxStatus::Prepared;
        Ok(())
    }

    /// Marks a transaction committable, queuing it for the next batch.
    pub fn commit(&mut self, dti: DtxId) -> Result<()> {
        {
            let slot = self.slot_mut(dti)?;
            slot.status = DtxStatus::Committable;
        }
        self.pending_commits.push(dti);
        if self.pending_commits.len() >= self.commit_threshold_count {
            self.flush_commits();
        }
        Ok(())
    }

    /// Commits an explicit batch of transactions immediately, regardless
    /// of the batching thresholds.
    pub fn commit_batch(&mut self, dtis: &[DtxId]) -> Result<()> {
        for &dti in dtis {
            let slot = self.slot_mut(dti)?;
            slot.status = DtxStatus::Committing;
            slot.in_doubt = false;
            slot.status = DtxStatus::Committed;
        }
        Ok(())
    }

    /// Flushes whatever is queued from [`commit`](Self::commit) calls,
    /// whether or not the count threshold was reached (the age threshold
    /// is enforced by the caller on its own timer).
    pub fn flush_commits(&mut self) {
        let pending = std::mem::take(&mut self.pending_commits);
        for dti in pending {
            if let Ok(slot) = self.slot_mut(dti) {
                slot.status = DtxStatus::Committed;
                slot.in_doubt = false;
            }
        }
    }

    pub fn abort(&mut self, dti: DtxId) -> Result<()> {
        let slot = self.slot_mut(dti)?;
        slot.status = DtxStatus::Aborting;
        slot.status = DtxStatus::Aborted;
        Ok(())
    }

    pub fn refresh(&mut self, dti: DtxId) -> Result<DtxStatus> {
        Ok(self.slot_mut(dti)?.status)
    }

    /// Classifies availability for an intent check against a resident
    /// transaction.
    pub fn check(&mut self, dti: DtxId, _intent: &str) -> Availability {
        match self.slot_mut(dti) {
            Ok(slot) => match slot.status {
                DtxStatus::Committed => Availability::Available,
                DtxStatus::Aborted => Availability::Available,
                DtxStatus::Prepared | DtxStatus::Committable | DtxStatus::Committing => {
                    Availability::InDoubt
                }
                DtxStatus::Corrupted => Availability::Conflict,
                _ => Availability::Unknown,
            },
            Err(_) => Availability::Unknown,
        }
    }

    /// Leader-election re-derivation (§4.I `resync`): commits a prepared
    /// transaction only if every alive participant reports `Prepared` and
    /// no redundancy group is corrupted; aborts if any reports `Aborted`;
    /// otherwise marks it `Corrupted` pending external intervention.
    pub fn resync(&mut self, dti: DtxId, reports: &[ParticipantReport]) -> Result<DtxStatus> {
        let slot = self.slot_mut(dti)?;
        if slot.status != DtxStatus::Prepared {
            return Ok(slot.status);
        }
        let any_corrupted = reports
            .iter()
            .any(|r| *r == ParticipantReport::RedundancyGroupCorrupted);
        let any_aborted = reports.iter().any(|r| *r == ParticipantReport::Aborted);
        let all_prepared = !reports.is_empty()
            && reports.iter().all(|r| *r == ParticipantReport::Prepared);

        slot.status = if any_corrupted {
            DtxStatus::Corrupted
        } else if any_aborted {
            DtxStatus::Aborted
        } else if all_prepared {
            DtxStatus::Committed
        } else {
            DtxStatus::Corrupted
        };
        Ok(slot.status)
    }

    /// Advances the aggregation upper bound. Reads/updates with an epoch
    /// below this bound must restart (§4.I "Aggregation interaction").
    pub fn advance_aggregation_bound(&mut self, hlc_now: u64, commit_age_secs: u64, grace_secs: u64) {
        self.aggregation_upper_bound = hlc_now.saturating_sub(commit_age_secs + grace_secs);
    }

    pub fn aggregation_upper_bound(&self) -> u64 {
        self.aggregation_upper_bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dti(n: u128) -> DtxId {
        DtxId {
            uuid: Uuid::from_u128(n),
            hlc: HlcTimestamp(n as u64),
        }
    }

    #[test]
    fn begin_prepare_commit_transitions_status() {
        let mut cache = DtxCache::new(4).unwrap();
        let id = dti(1);
        cache.begin(id, 100, 0).unwrap();
        cache.prepare(id).unwrap();
        assert_eq!(cache.refresh(id).unwrap(), DtxStatus::Prepared);
        cache.commit(id).unwrap();
        assert_eq!(cache.refresh(id).unwrap(), DtxStatus::Committable);
        cache.flush_commits();
        assert_eq!(cache.refresh(id).unwrap(), DtxStatus::Committed);
    }

    #[test]
    fn resync_commits_only_when_all_participants_prepared() {
        let mut cache = DtxCache::new(4).unwrap();
        let id = dti(2);
        cache.begin(id, 100, 0).unwrap();
        cache.prepare(id).unwrap();
        let status = cache
            .resync(id, &[ParticipantReport::Prepared, ParticipantReport::Prepared])
            .unwrap();
        assert_eq!(status, DtxStatus::Committed);
    }

    #[test]
    fn resync_aborts_on_any_abort_report() {
        let mut cache = DtxCache::new(4).unwrap();
        let id = dti(3);
        cache.begin(id, 100, 0).unwrap();
        cache.prepare(id).unwrap();
        let status = cache
            .resync(id, &[ParticipantReport::Prepared, ParticipantReport::Aborted])
            .unwrap();
        assert_eq!(status, DtxStatus::Aborted);
    }

    #[test]
    fn resync_marks_corrupted_on_redundancy_group_loss() {
        let mut cache = DtxCache::new(4).unwrap();
        let id = dti(4);
        cache.begin(id, 100, 0).unwrap();
        cache.prepare(id).unwrap();
        let status = cache
            .resync(id, &[ParticipantReport::RedundancyGroupCorrupted])
            .unwrap();
        assert_eq!(status, DtxStatus::Corrupted);
    }

    #[test]
    fn begin_rejects_epoch_inside_aggregation_window() {
        let mut cache = DtxCache::new(4).unwrap();
        cache.advance_aggregation_bound(1_000, 10, 5);
        assert!(cache.aggregation_upper_bound() > 0);
        let id = dti(5);
        let result = cache.begin(id, cache.aggregation_upper_bound() - 1, 0);
        assert!(matches!(result, Err(VosError::TxRestart(_))));
    }

    #[test]
    fn leader_candidates_capped_at_four() {
        let mut m = Membership::default();
        m.set_leader_candidates(vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(m.leader_candidates.len(), 4);
    }
}
