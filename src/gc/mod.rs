//! Garbage collector (§3, §4.J): four tiers of fixed-size bag bins,
//! draining credit by credit from the leaf (akey) tier upward to the
//! container tier.
//!
//! No direct teacher analogue exists (the teacher's pager has no
//! tiered reclamation scheme); the bin-of-bags shape is built directly
//! from the spec's pseudocode, in the crate's established register.

use crate::error::{Result, VosError};

/// GC tier, ordered leaf-to-root (§4.J).
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Tier {
    Akey,
    Dkey,
    Object,
    Container,
}

impl Tier {
    fn next_higher(self) -> Option<Tier> {
        match self {
            Tier::Akey => Some(Tier::Dkey),
            Tier::Dkey => Some(Tier::Object),
            Tier::Object => Some(Tier::Container),
            Tier::Container => None,
        }
    }

    /// Per-drain credit budget for this tier (§4.J), with `Akey` using
    /// whatever credits the caller supplies to [`GarbageCollector::drain`].
    fn default_budget(self) -> u32 {
        match self {
            Tier::Akey => u32::MAX,
            Tier::Dkey => 32,
            Tier::Object => 8,
            Tier::Container => 1,
        }
    }
}

const BAG_CAPACITY: usize = 250;

/// One item pending reclamation: an opaque reference plus whether
/// draining it has already emptied its children.
#[derive(Clone, Copy, Debug)]
pub struct GcItem {
    pub handle: u64,
    pub empty: bool,
}

/// A fixed-size bag of items (~4 KiB in the original layout; here
/// capped at [`BAG_CAPACITY`] items and chained singly via `next`).
struct Bag {
    items: Vec<GcItem>,
}

impl Bag {
    fn new() -> Self {
        Self { items: Vec::with_capacity(BAG_CAPACITY) }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= BAG_CAPACITY
    }
}

/// A per-tier bin: a singly-chained list of bags, drained front-first.
#[derive(Default)]
struct Bin {
    bags: Vec<Bag>,
}

impl Bin {
    fn push(&mut self, item: GcItem) {
        if self.bags.last().map(|b| b.is_full()).unwrap_or(true) {
            self.bags.push(Bag::new());
        }
        self.bags.last_mut().unwrap().items.push(item);
    }

    fn peek_mut(&mut self) -> Option<&mut GcItem> {
        self.bags.first_mut().and_then(|b| b.items.first_mut())
    }

    fn pop_front(&mut self) {
        if let Some(bag) = self.bags.first_mut() {
            if !bag.items.is_empty() {
                bag.items.remove(0);
            }
            if bag.items.is_empty() {
                self.bags.remove(0);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.bags.iter().all(|b| b.items.is_empty())
    }

    /// Moves every item from this bin into `other`, used when migrating
    /// a container's residual bags up to the pool-level bin.
    fn migrate_into(&mut self, other: &mut Bin) {
        for bag in self.bags.drain(..) {
            for item in bag.items {
                other.push(item);
            }
        }
    }
}

/// Result returned by a [`GarbageCollector::drain`] slice.
#[derive(Clone, Copy, Debug, Default)]
pub struct DrainReport {
    pub items_freed: u32,
    pub credits_spent: u32,
    pub aborted: bool,
}

/// Credit mode requested by the yield hook (§4.J).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CreditMode {
    Tight,
    Slack,
}

impl CreditMode {
    fn credits(self) -> u32 {
        match self {
            CreditMode::Tight => 32,
            CreditMode::Slack => 8,
        }
    }
}

/// A four-tier garbage collector for one container's reclamation work,
/// plus the pool-level bin that container-tier drains migrate into.
pub struct GarbageCollector {
    akey_bin: Bin,
    dkey_bin: Bin,
    object_bin: Bin,
    container_bin: Bin,
    pool_bin: Bin,
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            akey_bin: Bin::default(),
            dkey_bin: Bin::default(),
            object_bin: Bin::default(),
            container_bin: Bin::default(),
            pool_bin: Bin::default(),
        }
    }

    fn bin_mut(&mut self, tier: Tier) -> &mut Bin {
        match tier {
            Tier::Akey => &mut self.akey_bin,
            Tier::Dkey => &mut self.dkey_bin,
            Tier::Object => &mut self.object_bin,
            Tier::Container => &mut self.container_bin,
        }
    }

    pub fn enqueue(&mut self, tier: Tier, item: GcItem) {
        self.bin_mut(tier).push(item);
    }

    /// Runs one drain slice starting at `start_tier`, following the
    /// spec's pseudocode: escalate to the next-higher tier when the
    /// current tier's bin is empty; otherwise drain the head item,
    /// freeing and consuming a credit if it becomes empty, then move to
    /// the child tier for the next iteration. `yield_hook` is polled
    /// between items and an orderly stop happens if it returns `< 0`.
    pub fn drain<F, Y>(
        &mut self,
        start_tier: Tier,
        mut credits: u32,
        mut drain_item: F,
        mut yield_hook: Y,
    ) -> Result<DrainReport>
    where
        F: FnMut(Tier, &mut GcItem, &mut GarbageCollector) -> Result<()>,
        Y: FnMut() -> i32,
    {
        let mut report = DrainReport::default();
        let mut current_tier = start_tier;
        // `credits` gates the caller-controlled (akey) tier; lower tiers
        // additionally cap themselves at their own fixed budget.
        let mut tier_remaining = current_tier.default_budget().min(credits);

        loop {
            if yield_hook() < 0 {
                report.aborted = true;
                break;
            }
            if credits == 0 || tier_remaining == 0 {
                break;
            }
            if self.bin_mut(current_tier).is_empty() {
                match current_tier.next_higher() {
                    Some(next) => {
                        current_tier = next;
                        tier_remaining = current_tier.default_budget().min(credits);
                        continue;
                    }
                    None => break,
                }
            }

            let mut item = *self
                .bin_mut(current_tier)
                .peek_mut()
                .ok_or(VosError::Corruption("gc bin reported non-empty but yielded none".into()))?;

            drain_item(current_tier, &mut item, self)?;

            if let Some(slot) = self.bin_mut(current_tier).peek_mut() {
                *slot = item;
            }

            if item.empty {
                self.bin_mut(current_tier).pop_front();
                report.items_freed += 1;
                credits -= 1;
                tier_remaining -= 1;
            }

            if current_tier == Tier::Container && self.bin_mut(Tier::Container).is_empty() {
                self.migrate_container_residuals_to_pool();
            }
        }
        report.credits_spent = report.items_freed;
        Ok(report)
    }

    /// After a container-tier drain empties its bin, any residual bags
    /// (items re-enqueued mid-slice) move up to the pool bin so the
    /// container's heap region can be released (§4.J).
    pub fn migrate_container_residuals_to_pool(&mut self) {
        self.container_bin.migrate_into(&mut self.pool_bin);
    }

    pub fn pool_bin_len(&self) -> usize {
        self.pool_bin.bags.iter().map(|b| b.items.len()).sum()
    }

    pub fn tier_len(&mut self, tier: Tier) -> usize {
        self.bin_mut(tier).bags.iter().map(|b| b.items.len()).sum()
    }
}

pub use CreditMode as GcCreditMode;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_single_tier_until_empty() {
        let mut gc = GarbageCollector::new();
        for i in 0..5 {
            gc.enqueue(Tier::Akey, GcItem { handle: i, empty: false });
        }
        let report = gc
            .drain(
                Tier::Akey,
                100,
                |_tier, item, _gc| {
                    item.empty = true;
                    Ok(())
                },
                || 0,
            )
            .unwrap();
        assert_eq!(report.items_freed, 5);
        assert_eq!(gc.tier_len(Tier::Akey), 0);
    }

    #[test]
    fn escalates_to_next_tier_when_current_empty() {
        let mut gc = GarbageCollector::new();
        gc.enqueue(Tier::Dkey, GcItem { handle: 1, empty: false });
        let report = gc
            .drain(
                Tier::Akey,
                10,
                |_tier, item, _gc| {
                    item.empty = true;
                    Ok(())
                },
                || 0,
            )
            .unwrap();
        assert_eq!(report.items_freed, 1);
    }

    #[test]
    fn yield_hook_returning_negative_aborts_drain() {
        let mut gc = GarbageCollector::new();
        for i in 0..10 {
            gc.enqueue(Tier::Akey, GcItem { handle: i, empty: false });
        }
        let mut calls = 0;
        let report = gc
            .drain(
                Tier::Akey,
                100,
                |_tier, item, _gc| {
                    item.empty = true;
                    Ok(())
                },
                move || {
                    calls += 1;
                    if calls > 2 { -1 } else { 0 }
                },
            )
            .unwrap();
        assert!(report.aborted);
        assert!(report.items_freed < 10);
    }

    #[test]
    fn container_tier_migrates_residuals_to_pool() {
        let mut gc = GarbageCollector::new();
        gc.enqueue(Tier::Container, GcItem { handle: 1, empty: false });
        gc.drain(
            Tier::Container,
            1,
            |_tier, item, gc| {
                gc.enqueue(Tier::Container, GcItem { handle: 99, empty: false });
                item.empty = true;
                Ok(())
            },
            || 0,
        )
        .unwrap();
        gc.migrate_container_residuals_to_pool();
        assert!(gc.pool_bin_len() >= 1);
    }

    #[test]
    fn credit_mode_budgets_match_spec_defaults() {
        assert_eq!(CreditMode::Tight.credits(), 32);
        assert_eq!(CreditMode::Slack.credits(), 8);
    }
}
