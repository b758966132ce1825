//! Task tracker: pending queues, concurrency admission, and task-state
//! bookkeeping for one execution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::cluster::BrokerId;
use crate::concurrency::{ConcurrencyManager, ConcurrencyType};
use crate::strategy::{sort_tasks, ReplicaMovementStrategy, StrategyOptions};
use crate::task::{ExecutionProposal, ExecutionTask, TaskId, TaskState, TaskType};

/// Per-type, per-state task counts plus data-movement totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionTasksSummary {
    pub task_counts: BTreeMap<TaskType, BTreeMap<TaskState, usize>>,
    pub remaining_inter_broker_data_to_move_mb: u64,
    pub remaining_intra_broker_data_to_move_mb: u64,
    pub in_execution_inter_broker_data_mb: u64,
    /// Full task lists for the requested types.
    pub filtered_tasks: BTreeMap<TaskType, Vec<ExecutionTask>>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    next_task_id: TaskId,
    tasks: BTreeMap<TaskId, ExecutionTask>,
    /// Strategy-ordered pending task ids per type.
    pending: BTreeMap<TaskType, Vec<TaskId>>,
    in_progress: BTreeSet<TaskId>,
    aborting: BTreeSet<TaskId>,
    brokers_skip_concurrency: BTreeSet<BrokerId>,
    stop_requested: bool,
}

impl TrackerInner {
    fn pending_ids(&self, task_type: TaskType) -> &[TaskId] {
        self.pending
            .get(&task_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn in_execution_ids(&self, task_type: TaskType) -> impl Iterator<Item = TaskId> + '_ {
        self.in_progress
            .iter()
            .chain(self.aborting.iter())
            .copied()
            .filter(move |id| self.tasks[id].task_type == task_type)
    }

    fn clear_for_next_execution(&mut self) {
        let next_task_id = self.next_task_id;
        *self = TrackerInner {
            next_task_id,
            ..TrackerInner::default()
        };
    }
}

/// Tracks every task of the current execution. Internally synchronized;
/// batch retrievals and state transitions are atomic.
#[derive(Debug)]
pub struct ExecutionTaskTracker {
    inner: Mutex<TrackerInner>,
    concurrency: Arc<ConcurrencyManager>,
}

impl ExecutionTaskTracker {
    pub fn new(concurrency: Arc<ConcurrencyManager>) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            concurrency,
        }
    }

    /// Expand proposals into tasks and order the pending queues.
    ///
    /// Each proposal yields up to three tasks: an inter-broker replica
    /// movement when the replica set changes, one intra-broker movement per
    /// disk move, and a leadership movement when the preferred leader
    /// changes. Replica movement queues are ordered by `strategy`;
    /// leadership movements use the deterministic base order.
    pub fn add_proposals(
        &self,
        proposals: &[ExecutionProposal],
        brokers_skip_concurrency: BTreeSet<BrokerId>,
        opts: &StrategyOptions,
        strategy: &dyn ReplicaMovementStrategy,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.brokers_skip_concurrency = brokers_skip_concurrency;

        let mut new_tasks: BTreeMap<TaskType, Vec<ExecutionTask>> = BTreeMap::new();
        for proposal in proposals {
            if proposal.has_replica_move() {
                let id = inner.next_task_id;
                inner.next_task_id += 1;
                new_tasks.entry(TaskType::InterBrokerReplica).or_default().push(
                    ExecutionTask::new(id, TaskType::InterBrokerReplica, proposal.clone(), None),
                );
            }
            for broker in proposal.disk_moves_by_broker.keys() {
                let id = inner.next_task_id;
                inner.next_task_id += 1;
                new_tasks.entry(TaskType::IntraBrokerReplica).or_default().push(
                    ExecutionTask::new(
                        id,
                        TaskType::IntraBrokerReplica,
                        proposal.clone(),
                        Some(*broker),
                    ),
                );
            }
            if proposal.has_leader_move() {
                let id = inner.next_task_id;
                inner.next_task_id += 1;
                new_tasks
                    .entry(TaskType::Leader)
                    .or_default()
                    .push(ExecutionTask::new(id, TaskType::Leader, proposal.clone(), None));
            }
        }

        for (task_type, mut tasks) in new_tasks {
            match task_type {
                TaskType::InterBrokerReplica | TaskType::IntraBrokerReplica => {
                    sort_tasks(&mut tasks, strategy, opts)
                }
                TaskType::Leader => {
                    sort_tasks(&mut tasks, &crate::strategy::BaseMovementStrategy, opts)
                }
            }
            for task in tasks {
                inner.pending.entry(task_type).or_default().push(task.id);
                inner.tasks.insert(task.id, task);
            }
        }
    }

    /// Longest admissible prefix of the pending inter-broker queue.
    pub fn get_inter_broker_batch(&self) -> Vec<ExecutionTask> {
        self.admissible_prefix(TaskType::InterBrokerReplica)
    }

    /// Longest admissible prefix of the pending intra-broker queue.
    pub fn get_intra_broker_batch(&self) -> Vec<ExecutionTask> {
        self.admissible_prefix(TaskType::IntraBrokerReplica)
    }

    /// Longest admissible prefix of the pending leadership queue.
    pub fn get_leader_batch(&self) -> Vec<ExecutionTask> {
        self.admissible_prefix(TaskType::Leader)
    }

    fn admissible_prefix(&self, task_type: TaskType) -> Vec<ExecutionTask> {
        let inner = self.inner.lock().unwrap();
        if inner.stop_requested {
            return Vec::new();
        }

        // Provisional usage starts from the in-execution set of this type.
        let mut usage: BTreeMap<BrokerId, u32> = BTreeMap::new();
        let mut in_flight: u32 = 0;
        for id in inner.in_execution_ids(task_type) {
            in_flight += 1;
            for broker in Self::touched_brokers(&inner.tasks[&id]) {
                *usage.entry(broker).or_default() += 1;
            }
        }

        let (dimension, cluster_cap) = match task_type {
            TaskType::InterBrokerReplica => (
                ConcurrencyType::InterBrokerReplica,
                self.concurrency.cluster_inter_broker_cap(),
            ),
            TaskType::IntraBrokerReplica => (ConcurrencyType::IntraBrokerReplica, None),
            TaskType::Leader => (
                ConcurrencyType::LeadershipBroker,
                Some(self.concurrency.cluster_leadership_cap()),
            ),
        };

        let mut admitted = Vec::new();
        for id in inner.pending_ids(task_type) {
            let task = &inner.tasks[id];
            let brokers = Self::touched_brokers(task);

            let cluster_ok = cluster_cap.map_or(true, |cap| in_flight < cap);
            let brokers_ok = brokers.iter().all(|broker| {
                inner.brokers_skip_concurrency.contains(broker)
                    || usage.get(broker).copied().unwrap_or(0)
                        < self.concurrency.broker_cap(*broker, dimension)
            });
            if !(cluster_ok && brokers_ok) {
                break;
            }

            in_flight += 1;
            for broker in brokers {
                *usage.entry(broker).or_default() += 1;
            }
            admitted.push(task.clone());
        }
        admitted
    }

    /// Brokers whose concurrency allowance a task consumes.
    fn touched_brokers(task: &ExecutionTask) -> BTreeSet<BrokerId> {
        match task.task_type {
            TaskType::InterBrokerReplica => task.proposal.involved_brokers(),
            TaskType::IntraBrokerReplica => task.broker_id.into_iter().collect(),
            TaskType::Leader => task.proposal.new_leader.into_iter().collect(),
        }
    }

    /// Move tasks from pending to in-progress.
    pub fn mark_in_progress(&self, tasks: &[ExecutionTask], now_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        for task in tasks {
            let id = task.id;
            let queue = inner
                .pending
                .get_mut(&task.task_type)
                .unwrap_or_else(|| panic!("no pending queue for task {id}"));
            let pos = queue
                .iter()
                .position(|pending| *pending == id)
                .unwrap_or_else(|| panic!("task {id} is not pending"));
            queue.remove(pos);
            inner
                .tasks
                .get_mut(&id)
                .expect("tracked task")
                .transition_to(TaskState::InProgress, now_ms);
            inner.in_progress.insert(id);
        }
    }

    /// Finish a task: in-progress tasks complete, aborting tasks abort.
    pub fn mark_done(&self, id: TaskId, now_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        let next = if inner.aborting.contains(&id) {
            TaskState::Aborted
        } else {
            TaskState::Completed
        };
        inner.in_progress.remove(&id);
        inner.aborting.remove(&id);
        inner
            .tasks
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown task {id}"))
            .transition_to(next, now_ms);
    }

    pub fn mark_aborting(&self, id: TaskId, now_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.in_progress.remove(&id), "task {id} is not in progress");
        inner
            .tasks
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown task {id}"))
            .transition_to(TaskState::Aborting, now_ms);
        inner.aborting.insert(id);
    }

    pub fn mark_dead(&self, id: TaskId, now_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        let was_in_execution = inner.in_progress.remove(&id) || inner.aborting.remove(&id);
        assert!(was_in_execution, "task {id} is not in execution");
        inner
            .tasks
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown task {id}"))
            .transition_to(TaskState::Dead, now_ms);
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.inner.lock().unwrap().tasks.get(&id).map(|t| t.state())
    }

    /// Tasks currently `InProgress` or `Aborting`, optionally filtered by
    /// type.
    pub fn in_execution_tasks(&self, types: Option<&BTreeSet<TaskType>>) -> Vec<ExecutionTask> {
        let inner = self.inner.lock().unwrap();
        inner
            .in_progress
            .iter()
            .chain(inner.aborting.iter())
            .map(|id| inner.tasks[id].clone())
            .filter(|t| types.map_or(true, |set| set.contains(&t.task_type)))
            .collect()
    }

    pub fn num_remaining(&self, task_type: TaskType) -> usize {
        self.inner.lock().unwrap().pending_ids(task_type).len()
    }

    pub fn num_finished(&self, task_type: TaskType) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| t.task_type == task_type && t.state().is_terminal())
            .count()
    }

    /// Data still to move: pending plus in-execution tasks of the type.
    pub fn remaining_data_to_move_mb(&self, task_type: TaskType) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| t.task_type == task_type && !t.state().is_terminal())
            .map(|t| t.data_to_move_mb())
            .sum()
    }

    pub fn finished_data_movement_mb(&self, task_type: TaskType) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .values()
            .filter(|t| t.task_type == task_type && t.state().is_terminal())
            .map(|t| t.data_to_move_mb())
            .sum()
    }

    pub fn in_execution_data_mb(&self, task_type: TaskType) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .in_execution_ids(task_type)
            .map(|id| inner.tasks[&id].data_to_move_mb())
            .sum()
    }

    /// Forbid future batch admission. Existing tasks are not touched.
    pub fn set_stop_requested(&self) {
        self.inner.lock().unwrap().stop_requested = true;
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.lock().unwrap().stop_requested
    }

    /// Reset all per-execution state. Task ids stay monotonic across
    /// executions.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear_for_next_execution();
    }

    /// Summarize task counts and data totals; include full task lists for
    /// the requested types.
    pub fn summary(&self, types_with_full_list: &BTreeSet<TaskType>) -> ExecutionTasksSummary {
        let inner = self.inner.lock().unwrap();
        let mut task_counts: BTreeMap<TaskType, BTreeMap<TaskState, usize>> = BTreeMap::new();
        for task_type in TaskType::ALL {
            let mut counts: BTreeMap<TaskState, usize> =
                TaskState::ALL.into_iter().map(|s| (s, 0)).collect();
            for task in inner.tasks.values().filter(|t| t.task_type == task_type) {
                *counts.entry(task.state()).or_default() += 1;
            }
            task_counts.insert(task_type, counts);
        }

        let non_terminal_data = |task_type: TaskType| -> u64 {
            inner
                .tasks
                .values()
                .filter(|t| t.task_type == task_type && !t.state().is_terminal())
                .map(|t| t.data_to_move_mb())
                .sum()
        };

        let filtered_tasks = types_with_full_list
            .iter()
            .map(|task_type| {
                let tasks = inner
                    .tasks
                    .values()
                    .filter(|t| t.task_type == *task_type)
                    .cloned()
                    .collect();
                (*task_type, tasks)
            })
            .collect();

        ExecutionTasksSummary {
            task_counts,
            remaining_inter_broker_data_to_move_mb: non_terminal_data(TaskType::InterBrokerReplica),
            remaining_intra_broker_data_to_move_mb: non_terminal_data(TaskType::IntraBrokerReplica),
            in_execution_inter_broker_data_mb: inner
                .in_execution_ids(TaskType::InterBrokerReplica)
                .map(|id| inner.tasks[&id].data_to_move_mb())
                .sum(),
            filtered_tasks,
        }
    }
}
