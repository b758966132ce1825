//! Replication throttle management for inter-broker movements.
//!
//! While inter-broker tasks are in flight, participating brokers carry a
//! replication rate limit and their topics list the moving replicas as
//! throttled. Throttles are cleared as soon as no in-flight task needs
//! them. Brokers already dead at execution start are skipped; altering
//! their configs would park the change until they return.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::admin::AdminInterface;
use crate::cluster::BrokerId;
use crate::task::{ExecutionProposal, ExecutionTask};

pub struct ReplicationThrottleHelper {
    admin: Arc<dyn AdminInterface>,
    throttle_rate: Option<u64>,
    skip_brokers: BTreeSet<BrokerId>,
    throttled_brokers: BTreeSet<BrokerId>,
    throttled_topics: BTreeSet<String>,
}

impl ReplicationThrottleHelper {
    pub fn new(
        admin: Arc<dyn AdminInterface>,
        throttle_rate: Option<u64>,
        dead_brokers: BTreeSet<BrokerId>,
    ) -> Self {
        Self {
            admin,
            throttle_rate,
            skip_brokers: dead_brokers,
            throttled_brokers: BTreeSet::new(),
            throttled_topics: BTreeSet::new(),
        }
    }

    /// Replicas of a proposal that should be listed as throttled:
    /// every `(partition, broker)` across the old and new replica sets.
    fn throttled_replicas(proposal: &ExecutionProposal) -> Vec<(u32, BrokerId)> {
        proposal
            .involved_brokers()
            .into_iter()
            .map(|b| (proposal.topic_partition.partition, b))
            .collect()
    }

    /// Apply the replication rate to every broker participating in the
    /// given proposals and mark their replicas as throttled.
    pub async fn set_throttles(&mut self, proposals: &[ExecutionProposal]) -> anyhow::Result<()> {
        let Some(rate) = self.throttle_rate else {
            return Ok(());
        };

        for proposal in proposals {
            for broker in proposal.involved_brokers() {
                if self.skip_brokers.contains(&broker) || self.throttled_brokers.contains(&broker) {
                    continue;
                }
                self.admin
                    .set_broker_replication_throttle(broker, rate)
                    .await?;
                self.throttled_brokers.insert(broker);
            }

            let topic = proposal.topic_partition.topic.clone();
            self.admin
                .set_topic_throttled_replicas(&topic, Self::throttled_replicas(proposal))
                .await?;
            self.throttled_topics.insert(topic);
        }
        Ok(())
    }

    /// Clear throttles no longer needed by any in-flight task, keeping the
    /// ones still covering `in_progress`.
    pub async fn clear_throttles(
        &mut self,
        completed: &[ExecutionTask],
        in_progress: &[ExecutionTask],
    ) -> anyhow::Result<()> {
        if self.throttle_rate.is_none() {
            return Ok(());
        }

        let mut still_needed_brokers: BTreeSet<BrokerId> = BTreeSet::new();
        let mut still_needed_topics: BTreeSet<String> = BTreeSet::new();
        for task in in_progress {
            still_needed_brokers.extend(task.proposal.involved_brokers());
            still_needed_topics.insert(task.proposal.topic_partition.topic.clone());
        }

        let completed_brokers: BTreeSet<BrokerId> = completed
            .iter()
            .flat_map(|t| t.proposal.involved_brokers())
            .collect();
        let completed_topics: BTreeSet<String> = completed
            .iter()
            .map(|t| t.proposal.topic_partition.topic.clone())
            .collect();

        for broker in completed_brokers {
            if still_needed_brokers.contains(&broker) || !self.throttled_brokers.contains(&broker) {
                continue;
            }
            self.admin.clear_broker_replication_throttle(broker).await?;
            self.throttled_brokers.remove(&broker);
        }
        for topic in completed_topics {
            if still_needed_topics.contains(&topic) || !self.throttled_topics.contains(&topic) {
                continue;
            }
            self.admin.clear_topic_throttled_replicas(&topic).await?;
            self.throttled_topics.remove(&topic);
        }
        Ok(())
    }

    /// Clear every throttle this helper has applied.
    pub async fn clear_all(&mut self) -> anyhow::Result<()> {
        let brokers: Vec<BrokerId> = self.throttled_brokers.iter().copied().collect();
        for broker in brokers {
            self.admin.clear_broker_replication_throttle(broker).await?;
            self.throttled_brokers.remove(&broker);
        }
        let topics: Vec<String> = self.throttled_topics.iter().cloned().collect();
        for topic in topics {
            self.admin.clear_topic_throttled_replicas(&topic).await?;
            self.throttled_topics.remove(&topic);
        }
        Ok(())
    }

    pub fn throttled_brokers(&self) -> BTreeMap<BrokerId, u64> {
        match self.throttle_rate {
            Some(rate) => self
                .throttled_brokers
                .iter()
                .map(|b| (*b, rate))
                .collect(),
            None => BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::admin::{
        ElectionOutcome, LogDirMoveRequest, OngoingReassignment, ReassignmentOutcome,
        ReassignmentRequest, ReplicaLogDirInfo, TopicConfig,
    };
    use crate::cluster::TopicPartition;
    use crate::task::TaskType;

    #[derive(Default)]
    struct RecordingAdmin {
        throttled_brokers: Mutex<BTreeSet<BrokerId>>,
        throttled_topics: Mutex<BTreeSet<String>>,
    }

    #[async_trait]
    impl AdminInterface for RecordingAdmin {
        async fn alter_partition_reassignments(
            &self,
            _requests: Vec<ReassignmentRequest>,
        ) -> anyhow::Result<BTreeMap<TopicPartition, ReassignmentOutcome>> {
            Ok(BTreeMap::new())
        }

        async fn list_partition_reassignments(
            &self,
        ) -> anyhow::Result<BTreeMap<TopicPartition, OngoingReassignment>> {
            Ok(BTreeMap::new())
        }

        async fn elect_preferred_leaders(
            &self,
            _partitions: Vec<TopicPartition>,
        ) -> anyhow::Result<BTreeMap<TopicPartition, ElectionOutcome>> {
            Ok(BTreeMap::new())
        }

        async fn alter_replica_log_dirs(
            &self,
            _moves: Vec<LogDirMoveRequest>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn describe_replica_log_dirs(
            &self,
            _replicas: Vec<(TopicPartition, BrokerId)>,
        ) -> anyhow::Result<BTreeMap<(TopicPartition, BrokerId), ReplicaLogDirInfo>> {
            Ok(BTreeMap::new())
        }

        async fn describe_topic_configs(
            &self,
            _topics: BTreeSet<String>,
        ) -> anyhow::Result<BTreeMap<String, TopicConfig>> {
            Ok(BTreeMap::new())
        }

        async fn brokers_with_ongoing_log_dir_moves(
            &self,
            _brokers: BTreeSet<BrokerId>,
        ) -> anyhow::Result<BTreeSet<BrokerId>> {
            Ok(BTreeSet::new())
        }

        async fn set_broker_replication_throttle(
            &self,
            broker: BrokerId,
            _bytes_per_sec: u64,
        ) -> anyhow::Result<()> {
            self.throttled_brokers.lock().unwrap().insert(broker);
            Ok(())
        }

        async fn clear_broker_replication_throttle(&self, broker: BrokerId) -> anyhow::Result<()> {
            self.throttled_brokers.lock().unwrap().remove(&broker);
            Ok(())
        }

        async fn set_topic_throttled_replicas(
            &self,
            topic: &str,
            _replicas: Vec<(u32, BrokerId)>,
        ) -> anyhow::Result<()> {
            self.throttled_topics.lock().unwrap().insert(topic.to_string());
            Ok(())
        }

        async fn clear_topic_throttled_replicas(&self, topic: &str) -> anyhow::Result<()> {
            self.throttled_topics.lock().unwrap().remove(topic);
            Ok(())
        }
    }

    fn proposal(topic: &str, partition: u32, old: &[BrokerId], new: &[BrokerId]) -> ExecutionProposal {
        ExecutionProposal::new(
            TopicPartition::new(topic, partition),
            old.to_vec(),
            new.to_vec(),
        )
    }

    fn task(id: u64, proposal: ExecutionProposal) -> ExecutionTask {
        ExecutionTask::new(id, TaskType::InterBrokerReplica, proposal, None)
    }

    #[tokio::test]
    async fn throttles_cover_involved_brokers_except_skipped_ones() {
        let admin = Arc::new(RecordingAdmin::default());
        let mut helper = ReplicationThrottleHelper::new(
            admin.clone(),
            Some(1_000_000),
            [3].into_iter().collect(),
        );

        helper
            .set_throttles(&[proposal("t", 0, &[1, 2, 3], &[2, 3, 4])])
            .await
            .unwrap();

        assert_eq!(
            *admin.throttled_brokers.lock().unwrap(),
            [1, 2, 4].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(
            *admin.throttled_topics.lock().unwrap(),
            ["t".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(
            helper.throttled_brokers(),
            [(1, 1_000_000), (2, 1_000_000), (4, 1_000_000)]
                .into_iter()
                .collect::<BTreeMap<_, _>>()
        );
    }

    #[tokio::test]
    async fn clearing_keeps_throttles_needed_by_in_progress_tasks() {
        let admin = Arc::new(RecordingAdmin::default());
        let mut helper =
            ReplicationThrottleHelper::new(admin.clone(), Some(1_000_000), BTreeSet::new());

        let finished_move = proposal("t", 0, &[1, 2], &[2, 3]);
        let ongoing_move = proposal("u", 1, &[2, 3], &[3, 4]);
        helper
            .set_throttles(&[finished_move.clone(), ongoing_move.clone()])
            .await
            .unwrap();
        assert_eq!(
            *admin.throttled_brokers.lock().unwrap(),
            [1, 2, 3, 4].into_iter().collect::<BTreeSet<_>>()
        );

        helper
            .clear_throttles(&[task(1, finished_move)], &[task(2, ongoing_move)])
            .await
            .unwrap();

        // Brokers 2 and 3 still carry the in-progress move; only broker 1
        // loses its throttle, and only topic t is done.
        assert_eq!(
            *admin.throttled_brokers.lock().unwrap(),
            [2, 3, 4].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(
            *admin.throttled_topics.lock().unwrap(),
            ["u".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test]
    async fn without_a_rate_the_helper_touches_nothing() {
        let admin = Arc::new(RecordingAdmin::default());
        let mut helper = ReplicationThrottleHelper::new(admin.clone(), None, BTreeSet::new());

        helper
            .set_throttles(&[proposal("t", 0, &[1], &[2])])
            .await
            .unwrap();

        assert!(admin.throttled_brokers.lock().unwrap().is_empty());
        assert!(admin.throttled_topics.lock().unwrap().is_empty());
        assert!(helper.throttled_brokers().is_empty());
    }
}
