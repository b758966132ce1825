//! Per-broker and cluster-wide movement concurrency caps.
//!
//! Writers mutate under a lock; readers get consistent snapshots. AIMD
//! bounds are compile-time tables per dimension, and every cap write is
//! clamped into `[min_cap, max_cap]`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::cluster::BrokerId;
use crate::config::ExecutorConfig;

/// Concurrency dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConcurrencyType {
    /// Inter-broker replica movements per broker.
    InterBrokerReplica,
    /// Intra-broker disk movements per broker.
    IntraBrokerReplica,
    /// Leadership movements per broker.
    LeadershipBroker,
    /// Leadership movements across the cluster.
    LeadershipCluster,
}

impl ConcurrencyType {
    pub const fn min_cap(self) -> u32 {
        match self {
            ConcurrencyType::InterBrokerReplica => 1,
            ConcurrencyType::IntraBrokerReplica => 1,
            ConcurrencyType::LeadershipBroker => 1,
            ConcurrencyType::LeadershipCluster => 100,
        }
    }

    pub const fn max_cap(self) -> u32 {
        match self {
            ConcurrencyType::InterBrokerReplica => 12,
            ConcurrencyType::IntraBrokerReplica => 12,
            ConcurrencyType::LeadershipBroker => 250,
            ConcurrencyType::LeadershipCluster => 1250,
        }
    }

    pub const fn additive_increase(self) -> u32 {
        match self {
            ConcurrencyType::InterBrokerReplica => 1,
            ConcurrencyType::IntraBrokerReplica => 1,
            ConcurrencyType::LeadershipBroker => 25,
            ConcurrencyType::LeadershipCluster => 100,
        }
    }

    pub const fn multiplicative_decrease(self) -> u32 {
        2
    }

    pub fn clamp(self, cap: u32) -> u32 {
        cap.clamp(self.min_cap(), self.max_cap())
    }
}

/// One AIMD step down, saturating at the dimension minimum.
pub fn decreased_cap(concurrency_type: ConcurrencyType, current: u32) -> u32 {
    (current / concurrency_type.multiplicative_decrease()).max(concurrency_type.min_cap())
}

/// One AIMD step up, saturating at the dimension maximum.
pub fn increased_cap(concurrency_type: ConcurrencyType, current: u32) -> u32 {
    current
        .saturating_add(concurrency_type.additive_increase())
        .min(concurrency_type.max_cap())
}

/// Requested cap overrides for one execution; `None` falls back to the
/// configured default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestedConcurrency {
    pub inter_broker: Option<u32>,
    pub intra_broker: Option<u32>,
    pub broker_leadership: Option<u32>,
    pub cluster_leadership: Option<u32>,
}

/// Min/max/avg over the per-broker caps of one dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionSummary {
    pub min: u32,
    pub max: u32,
    pub avg: f64,
}

/// Snapshot of the current cap configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencySummary {
    pub inter_broker: DimensionSummary,
    pub intra_broker: DimensionSummary,
    pub broker_leadership: DimensionSummary,
    pub cluster_leadership_cap: u32,
    pub cluster_inter_broker_cap: Option<u32>,
}

#[derive(Debug, Default)]
struct CapsInner {
    initialized: bool,
    inter_broker: BTreeMap<BrokerId, u32>,
    intra_broker: BTreeMap<BrokerId, u32>,
    broker_leadership: BTreeMap<BrokerId, u32>,
    cluster_leadership: u32,
    cluster_inter_broker: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct DefaultCaps {
    inter_broker: u32,
    intra_broker: u32,
    broker_leadership: u32,
    cluster_leadership: u32,
}

/// Holds the cap tables for all four dimensions.
#[derive(Debug)]
pub struct ConcurrencyManager {
    defaults: DefaultCaps,
    inner: RwLock<CapsInner>,
}

impl ConcurrencyManager {
    pub fn new(config: &ExecutorConfig) -> Self {
        let defaults = DefaultCaps {
            inter_broker: config.default_inter_broker_concurrency,
            intra_broker: config.default_intra_broker_concurrency,
            broker_leadership: config.default_broker_leadership_concurrency,
            cluster_leadership: config.default_cluster_leadership_concurrency,
        };
        let inner = CapsInner {
            cluster_leadership: ConcurrencyType::LeadershipCluster.clamp(defaults.cluster_leadership),
            ..CapsInner::default()
        };
        Self {
            defaults,
            inner: RwLock::new(inner),
        }
    }

    /// Seed per-broker caps for an execution from the request or defaults.
    pub fn initialize(&self, brokers: &BTreeSet<BrokerId>, requested: RequestedConcurrency) {
        let inter = ConcurrencyType::InterBrokerReplica
            .clamp(requested.inter_broker.unwrap_or(self.defaults.inter_broker));
        let intra = ConcurrencyType::IntraBrokerReplica
            .clamp(requested.intra_broker.unwrap_or(self.defaults.intra_broker));
        let leadership = ConcurrencyType::LeadershipBroker.clamp(
            requested
                .broker_leadership
                .unwrap_or(self.defaults.broker_leadership),
        );
        let cluster = ConcurrencyType::LeadershipCluster.clamp(
            requested
                .cluster_leadership
                .unwrap_or(self.defaults.cluster_leadership),
        );

        let mut inner = self.inner.write().unwrap();
        inner.inter_broker = brokers.iter().map(|b| (*b, inter)).collect();
        inner.intra_broker = brokers.iter().map(|b| (*b, intra)).collect();
        inner.broker_leadership = brokers.iter().map(|b| (*b, leadership)).collect();
        inner.cluster_leadership = cluster;
        inner.initialized = true;
    }

    /// Drop per-execution state; caps fall back to defaults.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap();
        *inner = CapsInner {
            cluster_leadership: ConcurrencyType::LeadershipCluster
                .clamp(self.defaults.cluster_leadership),
            ..CapsInner::default()
        };
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().unwrap().initialized
    }

    /// Write one uniform cap for every known broker of a per-broker
    /// dimension, or the cluster cap for the cluster dimension. `None`
    /// restores the configured default.
    pub fn set_for_all_brokers_or_cluster(
        &self,
        concurrency: Option<u32>,
        concurrency_type: ConcurrencyType,
    ) {
        let mut inner = self.inner.write().unwrap();
        match concurrency_type {
            ConcurrencyType::LeadershipCluster => {
                let cap = concurrency_type
                    .clamp(concurrency.unwrap_or(self.defaults.cluster_leadership));
                inner.cluster_leadership = cap;
            }
            ConcurrencyType::InterBrokerReplica => {
                let cap =
                    concurrency_type.clamp(concurrency.unwrap_or(self.defaults.inter_broker));
                inner.inter_broker.values_mut().for_each(|v| *v = cap);
            }
            ConcurrencyType::IntraBrokerReplica => {
                let cap =
                    concurrency_type.clamp(concurrency.unwrap_or(self.defaults.intra_broker));
                inner.intra_broker.values_mut().for_each(|v| *v = cap);
            }
            ConcurrencyType::LeadershipBroker => {
                let cap = concurrency_type
                    .clamp(concurrency.unwrap_or(self.defaults.broker_leadership));
                inner.broker_leadership.values_mut().for_each(|v| *v = cap);
            }
        }
    }

    /// Write the cap of one broker in a per-broker dimension.
    ///
    /// Calling this for [`ConcurrencyType::LeadershipCluster`] is a
    /// programmer error.
    pub fn set_for_broker(
        &self,
        broker: BrokerId,
        concurrency: u32,
        concurrency_type: ConcurrencyType,
    ) {
        let cap = concurrency_type.clamp(concurrency);
        let mut inner = self.inner.write().unwrap();
        match concurrency_type {
            ConcurrencyType::InterBrokerReplica => {
                inner.inter_broker.insert(broker, cap);
            }
            ConcurrencyType::IntraBrokerReplica => {
                inner.intra_broker.insert(broker, cap);
            }
            ConcurrencyType::LeadershipBroker => {
                inner.broker_leadership.insert(broker, cap);
            }
            ConcurrencyType::LeadershipCluster => {
                panic!("cluster leadership concurrency has no per-broker cap")
            }
        }
    }

    /// Current cap for one broker; the cluster dimension returns the
    /// cluster cap.
    pub fn broker_cap(&self, broker: BrokerId, concurrency_type: ConcurrencyType) -> u32 {
        let inner = self.inner.read().unwrap();
        match concurrency_type {
            ConcurrencyType::InterBrokerReplica => inner
                .inter_broker
                .get(&broker)
                .copied()
                .unwrap_or_else(|| concurrency_type.clamp(self.defaults.inter_broker)),
            ConcurrencyType::IntraBrokerReplica => inner
                .intra_broker
                .get(&broker)
                .copied()
                .unwrap_or_else(|| concurrency_type.clamp(self.defaults.intra_broker)),
            ConcurrencyType::LeadershipBroker => inner
                .broker_leadership
                .get(&broker)
                .copied()
                .unwrap_or_else(|| concurrency_type.clamp(self.defaults.broker_leadership)),
            ConcurrencyType::LeadershipCluster => inner.cluster_leadership,
        }
    }

    pub fn cluster_leadership_cap(&self) -> u32 {
        self.inner.read().unwrap().cluster_leadership
    }

    /// Optional cluster-wide bound on concurrent inter-broker movements.
    pub fn cluster_inter_broker_cap(&self) -> Option<u32> {
        self.inner.read().unwrap().cluster_inter_broker
    }

    pub fn set_cluster_inter_broker_cap(&self, cap: Option<u32>) {
        self.inner.write().unwrap().cluster_inter_broker = cap.map(|c| c.max(1));
    }

    pub fn summary(&self) -> ConcurrencySummary {
        fn dimension(caps: &BTreeMap<BrokerId, u32>) -> DimensionSummary {
            if caps.is_empty() {
                return DimensionSummary::default();
            }
            let min = caps.values().copied().min().unwrap_or(0);
            let max = caps.values().copied().max().unwrap_or(0);
            let avg = caps.values().map(|v| *v as f64).sum::<f64>() / caps.len() as f64;
            DimensionSummary { min, max, avg }
        }

        let inner = self.inner.read().unwrap();
        ConcurrencySummary {
            inter_broker: dimension(&inner.inter_broker),
            intra_broker: dimension(&inner.intra_broker),
            broker_leadership: dimension(&inner.broker_leadership),
            cluster_leadership_cap: inner.cluster_leadership,
            cluster_inter_broker_cap: inner.cluster_inter_broker,
        }
    }
}
