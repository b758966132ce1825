//! Ordering strategies for replica movement tasks.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cluster::ClusterSnapshot;
use crate::min_isr_cache::MinIsrWithTime;
use crate::task::ExecutionTask;

/// Inputs available to ordering decisions: a cluster snapshot taken when
/// the proposals were accepted, plus the cached per-topic MinISR values.
#[derive(Debug, Clone, Default)]
pub struct StrategyOptions {
    pub cluster: ClusterSnapshot,
    pub min_isr_by_topic: BTreeMap<String, MinIsrWithTime>,
}

/// Decides the execution order of replica movement tasks.
///
/// `Ordering::Less` means `a` executes before `b`. Implementations should
/// return `Equal` for pairs they have no opinion on so chained strategies
/// and the deterministic fallback can break the tie.
pub trait ReplicaMovementStrategy: Send + Sync {
    fn compare(&self, a: &ExecutionTask, b: &ExecutionTask, opts: &StrategyOptions) -> Ordering;

    fn name(&self) -> &'static str;
}

/// Deterministic fallback order: topic-partition lexicographic, then id.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseMovementStrategy;

impl ReplicaMovementStrategy for BaseMovementStrategy {
    fn compare(&self, a: &ExecutionTask, b: &ExecutionTask, _opts: &StrategyOptions) -> Ordering {
        a.proposal
            .topic_partition
            .cmp(&b.proposal.topic_partition)
            .then(a.id.cmp(&b.id))
    }

    fn name(&self) -> &'static str {
        "base"
    }
}

/// Move the smallest partitions first to free capacity early.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrioritizeSmallMovesStrategy;

impl ReplicaMovementStrategy for PrioritizeSmallMovesStrategy {
    fn compare(&self, a: &ExecutionTask, b: &ExecutionTask, _opts: &StrategyOptions) -> Ordering {
        a.data_to_move_mb().cmp(&b.data_to_move_mb())
    }

    fn name(&self) -> &'static str {
        "prioritize-small-moves"
    }
}

/// Move the largest partitions first to overlap long transfers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrioritizeLargeMovesStrategy;

impl ReplicaMovementStrategy for PrioritizeLargeMovesStrategy {
    fn compare(&self, a: &ExecutionTask, b: &ExecutionTask, _opts: &StrategyOptions) -> Ordering {
        b.data_to_move_mb().cmp(&a.data_to_move_mb())
    }

    fn name(&self) -> &'static str {
        "prioritize-large-moves"
    }
}

/// Execute moves of under-replicated partitions last, so healthy
/// partitions are not held up behind recovering ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostponeUnderReplicatedStrategy;

impl PostponeUnderReplicatedStrategy {
    fn is_under_replicated(task: &ExecutionTask, opts: &StrategyOptions) -> bool {
        opts.cluster
            .partition(&task.proposal.topic_partition)
            .map(|p| p.in_sync_replicas.len() < p.replicas.len())
            .unwrap_or(false)
    }
}

impl ReplicaMovementStrategy for PostponeUnderReplicatedStrategy {
    fn compare(&self, a: &ExecutionTask, b: &ExecutionTask, opts: &StrategyOptions) -> Ordering {
        let a_urp = Self::is_under_replicated(a, opts);
        let b_urp = Self::is_under_replicated(b, opts);
        a_urp.cmp(&b_urp)
    }

    fn name(&self) -> &'static str {
        "postpone-under-replicated"
    }
}

/// Chain of strategies applied in priority order.
pub struct ChainedStrategy {
    first: Arc<dyn ReplicaMovementStrategy>,
    then: Arc<dyn ReplicaMovementStrategy>,
}

impl ChainedStrategy {
    pub fn new(
        first: Arc<dyn ReplicaMovementStrategy>,
        then: Arc<dyn ReplicaMovementStrategy>,
    ) -> Self {
        Self { first, then }
    }
}

impl ReplicaMovementStrategy for ChainedStrategy {
    fn compare(&self, a: &ExecutionTask, b: &ExecutionTask, opts: &StrategyOptions) -> Ordering {
        self.first
            .compare(a, b, opts)
            .then_with(|| self.then.compare(a, b, opts))
    }

    fn name(&self) -> &'static str {
        "chained"
    }
}

/// Sort tasks by a strategy, always falling back to the base order so the
/// result is deterministic regardless of the strategy's tie behavior.
pub fn sort_tasks(
    tasks: &mut [ExecutionTask],
    strategy: &dyn ReplicaMovementStrategy,
    opts: &StrategyOptions,
) {
    tasks.sort_by(|a, b| {
        strategy
            .compare(a, b, opts)
            .then_with(|| BaseMovementStrategy.compare(a, b, opts))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{PartitionInfo, TopicPartition};
    use crate::task::{ExecutionProposal, TaskType};

    fn task(id: u64, topic: &str, partition: u32, data_mb: u64) -> ExecutionTask {
        let mut proposal = ExecutionProposal::new(
            TopicPartition::new(topic, partition),
            vec![1, 2],
            vec![2, 3],
        );
        proposal.data_to_move_mb = data_mb;
        ExecutionTask::new(id, TaskType::InterBrokerReplica, proposal, None)
    }

    #[test]
    fn base_strategy_orders_by_topic_partition() {
        let mut tasks = vec![task(1, "b", 0, 0), task(2, "a", 1, 0), task(3, "a", 0, 0)];
        sort_tasks(&mut tasks, &BaseMovementStrategy, &StrategyOptions::default());
        let order: Vec<u64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn small_moves_first_with_deterministic_ties() {
        let mut tasks = vec![task(1, "b", 0, 50), task(2, "a", 0, 50), task(3, "c", 0, 1)];
        sort_tasks(
            &mut tasks,
            &PrioritizeSmallMovesStrategy,
            &StrategyOptions::default(),
        );
        let order: Vec<u64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn under_replicated_moves_go_last() {
        let mut opts = StrategyOptions::default();
        opts.cluster.partitions.insert(
            TopicPartition::new("a", 0),
            PartitionInfo {
                leader: Some(1),
                replicas: vec![1, 2],
                in_sync_replicas: vec![1],
            },
        );
        opts.cluster.partitions.insert(
            TopicPartition::new("b", 0),
            PartitionInfo {
                leader: Some(1),
                replicas: vec![1, 2],
                in_sync_replicas: vec![1, 2],
            },
        );

        let mut tasks = vec![task(1, "a", 0, 0), task(2, "b", 0, 0)];
        sort_tasks(&mut tasks, &PostponeUnderReplicatedStrategy, &opts);
        let order: Vec<u64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn chained_strategy_breaks_ties_with_second_strategy() {
        let chained = ChainedStrategy::new(
            Arc::new(PostponeUnderReplicatedStrategy),
            Arc::new(PrioritizeSmallMovesStrategy),
        );
        let mut tasks = vec![task(1, "a", 0, 90), task(2, "b", 0, 10)];
        sort_tasks(&mut tasks, &chained, &StrategyOptions::default());
        let order: Vec<u64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![2, 1]);
    }
}
