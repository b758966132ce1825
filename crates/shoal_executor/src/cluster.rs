//! Cluster metadata snapshot types and the metadata client seam.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type BrokerId = u64;

/// One partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Broker descriptor as reported by cluster metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub id: BrokerId,
    pub host: String,
    pub rack: Option<String>,
}

/// Partition placement as reported by cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub leader: Option<BrokerId>,
    pub replicas: Vec<BrokerId>,
    pub in_sync_replicas: Vec<BrokerId>,
}

/// Point-in-time view of cluster membership and partition placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub brokers: BTreeMap<BrokerId, BrokerInfo>,
    pub partitions: BTreeMap<TopicPartition, PartitionInfo>,
}

impl ClusterSnapshot {
    pub fn node_by_id(&self, id: BrokerId) -> Option<&BrokerInfo> {
        self.brokers.get(&id)
    }

    pub fn partition(&self, tp: &TopicPartition) -> Option<&PartitionInfo> {
        self.partitions.get(tp)
    }

    pub fn topics(&self) -> BTreeSet<String> {
        self.partitions.keys().map(|tp| tp.topic.clone()).collect()
    }

    pub fn broker_ids(&self) -> BTreeSet<BrokerId> {
        self.brokers.keys().copied().collect()
    }
}

/// Read access to cluster metadata with an explicit refresh.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Fetch fresh metadata from the cluster and return the new snapshot.
    async fn refresh(&self) -> anyhow::Result<ClusterSnapshot>;

    /// Return the most recently refreshed snapshot without a round trip.
    fn cluster(&self) -> ClusterSnapshot;
}
