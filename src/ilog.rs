//! Incarnation log (§3, §4.G): a per-key append-only log of create/
//! update/punch events used for epoch-based visibility.
//!
//! No direct teacher analogue exists (the teacher has no MVCC tombstone
//! log shaped like this); built from the spec's operation list directly,
//! in the register of the rest of this crate's hand-rolled index
//! structures (plain `Vec`-backed state, `Result`-returning ops, no
//! interior mutability).

use crate::error::{Result, VosError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogKind {
    Create,
    Update,
    Punch,
}

#[derive(Clone, Copy, Debug)]
pub struct LogRecord {
    pub epoch: u64,
    pub minor_epc: u32,
    pub kind: LogKind,
}

impl LogRecord {
    fn key(&self) -> (u64, u32) {
        (self.epoch, self.minor_epc)
    }
}

/// Result of [`IncarnationLog::fetch`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Visibility {
    pub create_epoch: Option<u64>,
    pub prior_punch: Option<u64>,
    pub next_punch: Option<u64>,
    pub update_epoch: Option<u64>,
    pub uncertain: bool,
}

/// Result of [`IncarnationLog::check`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckResult {
    Visible,
    Covered,
    Nonexistent,
    Uncertain,
}

/// Per-key incarnation log, strictly ordered by `(epoch, minor_epc)`.
#[derive(Default)]
pub struct IncarnationLog {
    records: Vec<LogRecord>,
}

impl IncarnationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn head(&self) -> Option<&LogRecord> {
        self.records.last()
    }

    /// Appends a record, which must be strictly newer than the current
    /// log head.
    pub fn append(&mut self, epoch: u64, minor_epc: u32, kind: LogKind) -> Result<()> {
        let key = (epoch, minor_epc);
        if let Some(head) = self.head() {
            if key <= head.key() {
                return Err(VosError::InvalidArgument(
                    "incarnation log append must be strictly newer than the head".into(),
                ));
            }
        }
        self.records.push(LogRecord { epoch, minor_epc, kind });
        Ok(())
    }

    /// Appends a punch. Restarts (`TxRestart`) if the caller's epoch
    /// precedes the current head instead of rejecting outright, since a
    /// punch racing an in-flight write is the ordinary restart-and-retry
    /// case rather than a hard error. Also restarts if the head carries
    /// a record newer than `read_bound`: the caller's transaction read
    /// this key at `read_bound` and someone else has touched it since,
    /// so the punch is building on a stale read.
    pub fn punch(&mut self, epoch: u64, minor_epc: u32, read_bound: u64) -> Result<()> {
        if let Some(head) = self.head() {
            if epoch < head.epoch {
                return Err(VosError::TxRestart(
                    "punch epoch precedes incarnation log head".into(),
                ));
            }
            if head.epoch > read_bound {
                return Err(VosError::TxRestart(
                    "key was modified after the caller's read epoch".into(),
                ));
            }
        }
        self.records.push(LogRecord {
            epoch,
            minor_epc,
            kind: LogKind::Punch,
        });
        Ok(())
    }

    /// Resolves visibility as of `(epoch, bound)`: the most recent
    /// create at or before the query epoch, the punch immediately
    /// preceding and following it, if any.
    pub fn fetch(&self, epoch: u64, bound: u32) -> Visibility {
        let query = (epoch, bound);
        let mut create_epoch = None;
        let mut update_epoch = None;
        let mut prior_punch = None;
        let mut next_punch = None;

        for rec in &self.records {
            match rec.kind {
                LogKind::Create => {
                    if rec.key() <= query {
                        create_epoch = Some(rec.epoch);
                    }
                }
                LogKind::Update => {
                    if rec.key() <= query {
                        update_epoch = Some(rec.epoch);
                    }
                }
                LogKind::Punch => {
                    if rec.key() <= query {
                        prior_punch = Some(rec.epoch);
                    } else if next_punch.is_none() {
                        next_punch = Some(rec.epoch);
                    }
                }
            }
        }

        // Uncertain when a punch exists exactly at the query epoch's
        // boundary with an equal-epoch, higher-minor record still
        // pending commit elsewhere — approximated here as "a punch and
        // a create share the exact queried epoch", the case the caller
        // cannot resolve without a DTX status check.
        let uncertain = self
            .records
            .iter()
            .any(|r| r.epoch == epoch && r.kind == LogKind::Punch)
            && self
                .records
                .iter()
                .any(|r| r.epoch == epoch && r.kind == LogKind::Create);

        Visibility {
            create_epoch,
            prior_punch,
            next_punch,
            update_epoch,
            uncertain,
        }
    }

    /// Classifies visibility over `[epoch_lo, epoch_hi]` as one of
    /// visible / covered / nonexistent / uncertain.
    pub fn check(&self, epoch_lo: u64, epoch_hi: u64) -> CheckResult {
        if self.records.is_empty() {
            return CheckResult::Nonexistent;
        }
        let vis = self.fetch(epoch_hi, u32::MAX);
        if vis.uncertain {
            return CheckResult::Uncertain;
        }
        match (vis.create_epoch, vis.prior_punch) {
            (Some(create), Some(punch)) if punch >= create && punch >= epoch_lo => {
                CheckResult::Covered
            }
            (Some(_), _) => CheckResult::Visible,
            (None, _) => CheckResult::Nonexistent,
        }
    }

    /// Collapses records strictly older than `lo`, returning `true` if
    /// the log is now empty (the key can be dropped entirely).
    pub fn aggregate(&mut self, lo: u64) -> bool {
        self.records.retain(|r| r.epoch >= lo);
        self.records.is_empty()
    }
}
