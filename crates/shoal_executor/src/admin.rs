//! Admin-interface seam: reassignments, elections, log dirs, throttles.
//!
//! Implementations own their per-call timeouts and return `anyhow` errors
//! for anything transient; the execution loop decides whether a failure is
//! retried, absorbed, or fatal.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::{BrokerId, TopicPartition};

/// Per-partition outcome of a reassignment submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReassignmentOutcome {
    /// Accepted by the controller.
    Accepted,
    /// The topic no longer exists.
    DeletedTopic,
    /// A destination broker is not available.
    BrokerUnavailable,
    /// A cancellation was requested but nothing is in flight.
    NoReassignmentToCancel,
}

/// One reassignment submission. `target_replicas = None` cancels whatever
/// reassignment is in flight for the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassignmentRequest {
    pub topic_partition: TopicPartition,
    pub target_replicas: Option<Vec<BrokerId>>,
}

/// An in-flight reassignment as reported by the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OngoingReassignment {
    pub replicas: Vec<BrokerId>,
    pub adding_replicas: Vec<BrokerId>,
    pub removing_replicas: Vec<BrokerId>,
}

/// Per-partition outcome of a preferred-leader election request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionOutcome {
    Elected,
    DeletedTopic,
}

/// One replica move to a different log dir on its broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirMoveRequest {
    pub topic_partition: TopicPartition,
    pub broker: BrokerId,
    pub target_dir: String,
}

/// Current and future log dirs of one replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLogDirInfo {
    pub current_dir: Option<String>,
    pub future_dir: Option<String>,
}

/// The slice of per-topic configuration the executor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub min_insync_replicas: u32,
}

/// Async admin surface of the cluster. All calls are expected to carry a
/// bounded timeout inside the implementation.
#[async_trait]
pub trait AdminInterface: Send + Sync {
    async fn alter_partition_reassignments(
        &self,
        requests: Vec<ReassignmentRequest>,
    ) -> anyhow::Result<BTreeMap<TopicPartition, ReassignmentOutcome>>;

    async fn list_partition_reassignments(
        &self,
    ) -> anyhow::Result<BTreeMap<TopicPartition, OngoingReassignment>>;

    async fn elect_preferred_leaders(
        &self,
        partitions: Vec<TopicPartition>,
    ) -> anyhow::Result<BTreeMap<TopicPartition, ElectionOutcome>>;

    async fn alter_replica_log_dirs(&self, moves: Vec<LogDirMoveRequest>) -> anyhow::Result<()>;

    async fn describe_replica_log_dirs(
        &self,
        replicas: Vec<(TopicPartition, BrokerId)>,
    ) -> anyhow::Result<BTreeMap<(TopicPartition, BrokerId), ReplicaLogDirInfo>>;

    async fn describe_topic_configs(
        &self,
        topics: BTreeSet<String>,
    ) -> anyhow::Result<BTreeMap<String, TopicConfig>>;

    /// Brokers among `brokers` that currently report an in-flight replica
    /// move between their own log dirs.
    async fn brokers_with_ongoing_log_dir_moves(
        &self,
        brokers: BTreeSet<BrokerId>,
    ) -> anyhow::Result<BTreeSet<BrokerId>>;

    async fn set_broker_replication_throttle(
        &self,
        broker: BrokerId,
        bytes_per_sec: u64,
    ) -> anyhow::Result<()>;

    async fn clear_broker_replication_throttle(&self, broker: BrokerId) -> anyhow::Result<()>;

    /// Mark the given `(partition, broker)` replicas of a topic as subject
    /// to the replication throttle.
    async fn set_topic_throttled_replicas(
        &self,
        topic: &str,
        replicas: Vec<(u32, BrokerId)>,
    ) -> anyhow::Result<()>;

    async fn clear_topic_throttled_replicas(&self, topic: &str) -> anyhow::Result<()>;
}

/// Grouped per-partition outcomes of one reassignment or election request.
#[derive(Debug, Clone, Default)]
pub struct SubmissionReport {
    pub deleted: BTreeSet<TopicPartition>,
    pub dead: BTreeSet<TopicPartition>,
    pub no_reassignment_to_cancel: BTreeSet<TopicPartition>,
}

impl SubmissionReport {
    pub fn from_outcomes(outcomes: &BTreeMap<TopicPartition, ReassignmentOutcome>) -> Self {
        let mut report = Self::default();
        for (tp, outcome) in outcomes {
            match outcome {
                ReassignmentOutcome::Accepted => {}
                ReassignmentOutcome::DeletedTopic => {
                    report.deleted.insert(tp.clone());
                }
                ReassignmentOutcome::BrokerUnavailable => {
                    report.dead.insert(tp.clone());
                }
                ReassignmentOutcome::NoReassignmentToCancel => {
                    report.no_reassignment_to_cancel.insert(tp.clone());
                }
            }
        }
        report
    }
}
