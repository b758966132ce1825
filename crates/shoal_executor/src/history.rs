//! Time-bounded history of demoted and removed brokers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::cluster::BrokerId;
use crate::now_ms;

/// Entries carrying this timestamp never expire; they stay until a caller
/// drops them explicitly.
pub const PERMANENT_TIMESTAMP_MS: u64 = u64::MAX;

/// Last demote/remove start time per broker, with per-kind retention.
#[derive(Debug)]
pub struct BrokerChangeHistory {
    demoted: RwLock<BTreeMap<BrokerId, u64>>,
    removed: RwLock<BTreeMap<BrokerId, u64>>,
    demotion_retention_ms: u64,
    removal_retention_ms: u64,
}

impl BrokerChangeHistory {
    pub fn new(demotion_retention: Duration, removal_retention: Duration) -> Self {
        Self {
            demoted: RwLock::new(BTreeMap::new()),
            removed: RwLock::new(BTreeMap::new()),
            demotion_retention_ms: demotion_retention.as_millis() as u64,
            removal_retention_ms: removal_retention.as_millis() as u64,
        }
    }

    /// Record the start of a demotion; permanent entries keep their mark.
    pub fn record_demoted(&self, brokers: impl IntoIterator<Item = BrokerId>, now_ms: u64) {
        Self::record(&self.demoted, brokers, now_ms);
    }

    /// Record the start of a removal; permanent entries keep their mark.
    pub fn record_removed(&self, brokers: impl IntoIterator<Item = BrokerId>, now_ms: u64) {
        Self::record(&self.removed, brokers, now_ms);
    }

    /// Pin brokers into the demoted set until explicitly dropped.
    pub fn add_permanent_demoted(&self, brokers: impl IntoIterator<Item = BrokerId>) {
        let mut map = self.demoted.write().unwrap();
        for broker in brokers {
            map.insert(broker, PERMANENT_TIMESTAMP_MS);
        }
    }

    /// Pin brokers into the removed set until explicitly dropped.
    pub fn add_permanent_removed(&self, brokers: impl IntoIterator<Item = BrokerId>) {
        let mut map = self.removed.write().unwrap();
        for broker in brokers {
            map.insert(broker, PERMANENT_TIMESTAMP_MS);
        }
    }

    /// Returns `true` when any entry was dropped.
    pub fn drop_demoted(&self, brokers: &BTreeSet<BrokerId>) -> bool {
        let mut map = self.demoted.write().unwrap();
        let before = map.len();
        map.retain(|broker, _| !brokers.contains(broker));
        map.len() != before
    }

    /// Returns `true` when any entry was dropped.
    pub fn drop_removed(&self, brokers: &BTreeSet<BrokerId>) -> bool {
        let mut map = self.removed.write().unwrap();
        let before = map.len();
        map.retain(|broker, _| !brokers.contains(broker));
        map.len() != before
    }

    pub fn demoted_brokers(&self) -> BTreeSet<BrokerId> {
        self.demoted.read().unwrap().keys().copied().collect()
    }

    pub fn removed_brokers(&self) -> BTreeSet<BrokerId> {
        self.removed.read().unwrap().keys().copied().collect()
    }

    /// Drop non-permanent entries past their retention window.
    pub fn expire(&self, now_ms: u64) {
        Self::expire_map(&self.demoted, self.demotion_retention_ms, now_ms);
        Self::expire_map(&self.removed, self.removal_retention_ms, now_ms);
    }

    fn record(
        map: &RwLock<BTreeMap<BrokerId, u64>>,
        brokers: impl IntoIterator<Item = BrokerId>,
        now_ms: u64,
    ) {
        let mut map = map.write().unwrap();
        for broker in brokers {
            match map.get(&broker) {
                Some(&PERMANENT_TIMESTAMP_MS) => {}
                _ => {
                    map.insert(broker, now_ms);
                }
            }
        }
    }

    fn expire_map(map: &RwLock<BTreeMap<BrokerId, u64>>, retention_ms: u64, now_ms: u64) {
        map.write().unwrap().retain(|_, start| {
            *start == PERMANENT_TIMESTAMP_MS || start.saturating_add(retention_ms) >= now_ms
        });
    }
}

/// Spawn the periodic history expiry scanner.
pub fn spawn_scanner(
    history: Arc<BrokerChangeHistory>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            history.expire(now_ms());
        }
    })
}
