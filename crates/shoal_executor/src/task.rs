//! Task model: one unit of movement work and its state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::{BrokerId, TopicPartition};

pub type TaskId = u64;

/// Kind of movement a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskType {
    InterBrokerReplica,
    IntraBrokerReplica,
    Leader,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [
        TaskType::InterBrokerReplica,
        TaskType::IntraBrokerReplica,
        TaskType::Leader,
    ];
}

/// Lifecycle state of a task.
///
/// Transitions form a DAG:
/// `Pending -> InProgress -> { Completed | Aborting -> { Aborted, Dead } | Dead }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    InProgress,
    Aborting,
    Aborted,
    Dead,
    Completed,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::InProgress,
        TaskState::Aborting,
        TaskState::Aborted,
        TaskState::Dead,
        TaskState::Completed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Aborted | TaskState::Dead)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::InProgress)
                | (TaskState::InProgress, TaskState::Completed)
                | (TaskState::InProgress, TaskState::Aborting)
                | (TaskState::InProgress, TaskState::Dead)
                | (TaskState::Aborting, TaskState::Aborted)
                | (TaskState::Aborting, TaskState::Dead)
        )
    }
}

/// One replica move between disks on a single broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskMove {
    pub source_dir: String,
    pub target_dir: String,
    pub data_to_move_mb: u64,
}

/// Proposed change to one partition's replica set, disk placement, or leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProposal {
    pub topic_partition: TopicPartition,
    pub old_replicas: Vec<BrokerId>,
    pub new_replicas: Vec<BrokerId>,
    pub old_leader: Option<BrokerId>,
    pub new_leader: Option<BrokerId>,
    pub disk_moves_by_broker: BTreeMap<BrokerId, DiskMove>,
    /// Logical size of the partition data this proposal moves.
    pub data_to_move_mb: u64,
}

impl ExecutionProposal {
    pub fn new(
        topic_partition: TopicPartition,
        old_replicas: Vec<BrokerId>,
        new_replicas: Vec<BrokerId>,
    ) -> Self {
        Self {
            topic_partition,
            old_replicas,
            new_replicas,
            old_leader: None,
            new_leader: None,
            disk_moves_by_broker: BTreeMap::new(),
            data_to_move_mb: 0,
        }
    }

    /// True when the replica set changes across brokers.
    pub fn has_replica_move(&self) -> bool {
        let old: BTreeSet<BrokerId> = self.old_replicas.iter().copied().collect();
        let new: BTreeSet<BrokerId> = self.new_replicas.iter().copied().collect();
        old != new
    }

    /// True when the preferred leader changes.
    pub fn has_leader_move(&self) -> bool {
        match (self.old_leader, self.new_leader) {
            (_, None) => false,
            (old, new) => old != new,
        }
    }

    /// Brokers that carry replication work for this proposal (union of the
    /// old and new replica sets).
    pub fn involved_brokers(&self) -> BTreeSet<BrokerId> {
        self.old_replicas
            .iter()
            .chain(self.new_replicas.iter())
            .copied()
            .collect()
    }
}

/// One unit of movement work.
///
/// Everything except `state` and the two timestamps is immutable after
/// construction; state transitions go through the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub proposal: ExecutionProposal,
    /// The broker a disk move runs on; `None` for other task types.
    pub broker_id: Option<BrokerId>,
    state: TaskState,
    start_time_ms: Option<u64>,
    end_time_ms: Option<u64>,
}

impl ExecutionTask {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        proposal: ExecutionProposal,
        broker_id: Option<BrokerId>,
    ) -> Self {
        Self {
            id,
            task_type,
            proposal,
            broker_id,
            state: TaskState::Pending,
            start_time_ms: None,
            end_time_ms: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn start_time_ms(&self) -> Option<u64> {
        self.start_time_ms
    }

    pub fn end_time_ms(&self) -> Option<u64> {
        self.end_time_ms
    }

    /// Data moved by this task, in MB.
    pub fn data_to_move_mb(&self) -> u64 {
        match self.task_type {
            TaskType::InterBrokerReplica => self.proposal.data_to_move_mb,
            TaskType::IntraBrokerReplica => self
                .broker_id
                .and_then(|b| self.proposal.disk_moves_by_broker.get(&b))
                .map(|m| m.data_to_move_mb)
                .unwrap_or(0),
            TaskType::Leader => 0,
        }
    }

    /// Apply a state transition. Illegal transitions are a programmer error.
    pub(crate) fn transition_to(&mut self, next: TaskState, now_ms: u64) {
        assert!(
            self.state.can_transition_to(next),
            "illegal task state transition {:?} -> {:?} for task {}",
            self.state,
            next,
            self.id
        );
        self.state = next;
        if next == TaskState::InProgress {
            self.start_time_ms = Some(now_ms);
        }
        if next.is_terminal() {
            self.end_time_ms = Some(now_ms);
        }
    }

    /// True when the task has been running longer than the alerting
    /// threshold without reaching a terminal state.
    pub fn is_slow(&self, now_ms: u64, threshold_ms: u64) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        match self.start_time_ms {
            Some(start) => now_ms.saturating_sub(start) > threshold_ms,
            None => false,
        }
    }
}

impl fmt::Display for ExecutionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} ({:?} {} {:?})",
            self.id, self.task_type, self.proposal.topic_partition, self.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> ExecutionProposal {
        ExecutionProposal::new(TopicPartition::new("t", 0), vec![1, 2, 3], vec![2, 3, 4])
    }

    #[test]
    fn transition_dag_allows_only_legal_moves() {
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                let legal = matches!(
                    (from, to),
                    (TaskState::Pending, TaskState::InProgress)
                        | (TaskState::InProgress, TaskState::Completed)
                        | (TaskState::InProgress, TaskState::Aborting)
                        | (TaskState::InProgress, TaskState::Dead)
                        | (TaskState::Aborting, TaskState::Aborted)
                        | (TaskState::Aborting, TaskState::Dead)
                );
                assert_eq!(from.can_transition_to(to), legal, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn end_time_set_iff_terminal() {
        let mut task = ExecutionTask::new(1, TaskType::InterBrokerReplica, proposal(), None);
        assert_eq!(task.end_time_ms(), None);
        task.transition_to(TaskState::InProgress, 10);
        assert_eq!(task.start_time_ms(), Some(10));
        assert_eq!(task.end_time_ms(), None);
        task.transition_to(TaskState::Completed, 25);
        assert_eq!(task.end_time_ms(), Some(25));
    }

    #[test]
    #[should_panic(expected = "illegal task state transition")]
    fn illegal_transition_panics() {
        let mut task = ExecutionTask::new(1, TaskType::Leader, proposal(), None);
        task.transition_to(TaskState::Completed, 10);
    }

    #[test]
    fn slow_detection_respects_threshold_and_terminal_state() {
        let mut task = ExecutionTask::new(1, TaskType::InterBrokerReplica, proposal(), None);
        assert!(!task.is_slow(1_000, 100));
        task.transition_to(TaskState::InProgress, 0);
        assert!(!task.is_slow(100, 100));
        assert!(task.is_slow(101, 100));
        task.transition_to(TaskState::Completed, 200);
        assert!(!task.is_slow(10_000, 100));
    }

    #[test]
    fn proposal_expansion_predicates() {
        let p = proposal();
        assert!(p.has_replica_move());
        assert!(!p.has_leader_move());
        assert_eq!(
            p.involved_brokers(),
            [1, 2, 3, 4].into_iter().collect::<BTreeSet<_>>()
        );

        let mut same = p.clone();
        same.new_replicas = vec![3, 2, 1];
        assert!(!same.has_replica_move());

        let mut lead = p;
        lead.old_leader = Some(1);
        lead.new_leader = Some(2);
        assert!(lead.has_leader_move());
    }
}
