use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mediaflow_model::OwnerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::QuotaConfig;
use crate::error::ConsistencyError;

/// Active-task accounting for one owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub owner_id: OwnerId,
    pub active_count: u32,
    pub limit: u32,
    pub last_seen_at: DateTime<Utc>,
}

impl QuotaEntry {
    fn new(owner_id: OwnerId, limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            active_count: 0,
            limit,
            last_seen_at: now,
        }
    }
}

/// Adjustment made while reconciling an entry against live tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaAdjustment {
    pub owner_id: OwnerId,
    pub previous: u32,
    pub current: u32,
}

/// Per-owner admission ledger.
///
/// Entries live in a sharded map; `admit`, `release` and `reconcile` mutate a
/// single entry under its shard lock, so owners never contend with each
/// other on a global lock.
pub struct QuotaLedger {
    entries: DashMap<OwnerId, QuotaEntry>,
    default_limit: u32,
    overrides: HashMap<OwnerId, u32>,
}

impl fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("owners", &self.entries.len())
            .field("default_limit", &self.default_limit)
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl QuotaLedger {
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            entries: DashMap::new(),
            default_limit: config.default_limit,
            overrides: config.overrides.clone(),
        }
    }

    pub fn limit_for(&self, owner_id: &OwnerId) -> u32 {
        self.overrides
            .get(owner_id)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Claims a slot for `owner_id` if one is free.
    pub fn admit(&self, owner_id: &OwnerId) -> bool {
        let now = Utc::now();
        let limit = self.limit_for(owner_id);
        let mut entry = self
            .entries
            .entry(owner_id.clone())
            .or_insert_with(|| QuotaEntry::new(owner_id.clone(), limit, now));

        entry.limit = limit;
        entry.last_seen_at = now;
        if entry.active_count < entry.limit {
            entry.active_count += 1;
            debug!(
                target: "mediaflow::quota",
                owner_id = %owner_id,
                active = entry.active_count,
                limit = entry.limit,
                "slot admitted"
            );
            true
        } else {
            debug!(
                target: "mediaflow::quota",
                owner_id = %owner_id,
                active = entry.active_count,
                limit = entry.limit,
                "slot denied"
            );
            false
        }
    }

    /// Returns a slot. Releasing an owner with no active tasks leaves the
    /// entry untouched and reports the violation.
    pub fn release(&self, owner_id: &OwnerId) -> Result<(), ConsistencyError> {
        let now = Utc::now();
        match self.entries.get_mut(owner_id) {
            Some(mut entry) if entry.active_count > 0 => {
                entry.active_count -= 1;
                entry.last_seen_at = now;
                Ok(())
            }
            _ => {
                let err = ConsistencyError::DoubleRelease(owner_id.clone());
                warn!(target: "mediaflow::quota", owner_id = %owner_id, "{err}");
                Err(err)
            }
        }
    }

    pub fn entry(&self, owner_id: &OwnerId) -> Option<QuotaEntry> {
        self.entries.get(owner_id).map(|entry| entry.value().clone())
    }

    pub fn entries(&self) -> Vec<QuotaEntry> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Owners whose entries have not been touched since `cutoff`.
    pub fn idle_owners(&self, cutoff: DateTime<Utc>) -> Vec<OwnerId> {
        self.entries
            .iter()
            .filter(|entry| entry.last_seen_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Sets an idle entry's count to the number of live tasks holding a slot.
    ///
    /// `live_count` is computed outside the entry lock, so the entry is
    /// skipped when it was touched after `idle_cutoff`.
    pub fn reconcile(
        &self,
        owner_id: &OwnerId,
        live_count: u32,
        idle_cutoff: DateTime<Utc>,
    ) -> Option<QuotaAdjustment> {
        let mut entry = self.entries.get_mut(owner_id)?;
        if entry.last_seen_at >= idle_cutoff {
            return None;
        }
        Self::apply_count(&mut entry, live_count)
    }

    /// Unconditionally sets an owner's count. Used while recovering.
    pub fn reset(&self, owner_id: &OwnerId, live_count: u32) -> Option<QuotaAdjustment> {
        let now = Utc::now();
        let limit = self.limit_for(owner_id);
        let mut entry = self
            .entries
            .entry(owner_id.clone())
            .or_insert_with(|| QuotaEntry::new(owner_id.clone(), limit, now));
        entry.limit = limit;
        Self::apply_count(&mut entry, live_count)
    }

    fn apply_count(entry: &mut QuotaEntry, live_count: u32) -> Option<QuotaAdjustment> {
        let target = if live_count > entry.limit {
            warn!(
                target: "mediaflow::quota",
                owner_id = %entry.owner_id,
                live = live_count,
                limit = entry.limit,
                "live tasks exceed the current limit; clamping"
            );
            entry.limit
        } else {
            live_count
        };

        if entry.active_count == target {
            return None;
        }

        let previous = entry.active_count;
        entry.active_count = target;
        entry.last_seen_at = Utc::now();
        Some(QuotaAdjustment {
            owner_id: entry.owner_id.clone(),
            previous,
            current: target,
        })
    }

    /// Loads persisted entries, applying the currently configured limits.
    pub fn restore<I>(&self, entries: I)
    where
        I: IntoIterator<Item = QuotaEntry>,
    {
        for mut entry in entries {
            entry.limit = self.limit_for(&entry.owner_id);
            entry.active_count = entry.active_count.min(entry.limit);
            self.entries.insert(entry.owner_id.clone(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;

    use super::*;

    fn ledger(limit: u32) -> QuotaLedger {
        QuotaLedger::new(&QuotaConfig {
            default_limit: limit,
            ..QuotaConfig::default()
        })
    }

    #[test]
    fn admit_stops_at_limit_and_release_frees_a_slot() {
        let ledger = ledger(2);
        let alice = OwnerId::new("alice");

        assert!(ledger.admit(&alice));
        assert!(ledger.admit(&alice));
        assert!(!ledger.admit(&alice));
        assert_eq!(ledger.entry(&alice).unwrap().active_count, 2);

        ledger.release(&alice).unwrap();
        assert!(ledger.admit(&alice));
    }

    #[test]
    fn owners_do_not_share_slots() {
        let ledger = ledger(1);
        assert!(ledger.admit(&OwnerId::new("alice")));
        assert!(ledger.admit(&OwnerId::new("bob")));
        assert!(!ledger.admit(&OwnerId::new("alice")));
    }

    #[test]
    fn overrides_replace_the_default_limit() {
        let mut config = QuotaConfig {
            default_limit: 1,
            ..QuotaConfig::default()
        };
        config.overrides.insert(OwnerId::new("studio"), 3);
        let ledger = QuotaLedger::new(&config);
        let studio = OwnerId::new("studio");
        assert!((0..3).all(|_| ledger.admit(&studio)));
        assert!(!ledger.admit(&studio));
    }

    #[test]
    fn double_release_is_reported_and_floored() {
        let ledger = ledger(1);
        let alice = OwnerId::new("alice");
        assert!(ledger.admit(&alice));
        ledger.release(&alice).unwrap();

        let err = ledger.release(&alice).unwrap_err();
        assert_eq!(err, ConsistencyError::DoubleRelease(alice.clone()));
        assert_eq!(ledger.entry(&alice).unwrap().active_count, 0);
        assert!(ledger.release(&OwnerId::new("ghost")).is_err());
    }

    #[test]
    fn reconcile_skips_recently_touched_entries() {
        let ledger = ledger(3);
        let alice = OwnerId::new("alice");
        assert!(ledger.admit(&alice));
        assert!(ledger.admit(&alice));

        let past = Utc::now() - ChronoDuration::hours(1);
        assert!(ledger.reconcile(&alice, 0, past).is_none());

        let future = Utc::now() + ChronoDuration::hours(1);
        let adjustment = ledger.reconcile(&alice, 1, future).unwrap();
        assert_eq!(adjustment.previous, 2);
        assert_eq!(adjustment.current, 1);
        assert_eq!(ledger.entry(&alice).unwrap().active_count, 1);
    }

    #[test]
    fn restore_clamps_to_current_limits() {
        let ledger = ledger(2);
        let alice = OwnerId::new("alice");
        ledger.restore([QuotaEntry {
            owner_id: alice.clone(),
            active_count: 5,
            limit: 10,
            last_seen_at: Utc::now(),
        }]);
        let entry = ledger.entry(&alice).unwrap();
        assert_eq!(entry.limit, 2);
        assert_eq!(entry.active_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_never_exceed_the_limit() {
        let ledger = Arc::new(ledger(5));
        let owner = OwnerId::new("alice");

        let mut handles = Vec::new();
        for _ in 0..64 {
            let ledger = Arc::clone(&ledger);
            let owner = owner.clone();
            handles.push(tokio::spawn(async move { ledger.admit(&owner) }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(ledger.entry(&owner).unwrap().active_count, 5);
    }
}
