//! Proposal execution loop: drives tracked tasks through the three
//! movement phases against the admin interface.
//!
//! Phases run strictly in order: inter-broker replica movement, then
//! intra-broker disk movement, then leadership movement. Each phase polls
//! cluster metadata between batches; transient admin failures inside the
//! progress loop are logged and absorbed, the next tick retries and
//! re-execution compensates for lost submissions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};

use crate::admin::{
    AdminInterface, ElectionOutcome, LogDirMoveRequest, ReassignmentRequest, ReplicaLogDirInfo,
    SubmissionReport,
};
use crate::adjuster;
use crate::cluster::{BrokerId, ClusterSnapshot, TopicPartition};
use crate::executor::{ExecutorCore, PROGRESS_CHECK_INTERVAL_ADJUSTING_MS};
use crate::hooks::UserTaskInfo;
use crate::monitor::{LoadMonitor, SamplingMode};
use crate::now_ms;
use crate::state::{ExecutorPhase, ExecutorState};
use crate::task::{ExecutionTask, TaskState, TaskType};
use crate::throttle::ReplicationThrottleHelper;

/// Completion check for an inter-broker movement: the on-disk replica set
/// matches the proposal target.
fn is_inter_broker_action_done(cluster: &ClusterSnapshot, task: &ExecutionTask) -> bool {
    cluster
        .partition(&task.proposal.topic_partition)
        .map(|p| {
            let current: BTreeSet<BrokerId> = p.replicas.iter().copied().collect();
            let target: BTreeSet<BrokerId> = task.proposal.new_replicas.iter().copied().collect();
            current == target
        })
        .unwrap_or(false)
}

/// Completion check for a leadership movement: metadata reports the target
/// broker as the partition leader.
fn is_leadership_action_done(cluster: &ClusterSnapshot, task: &ExecutionTask) -> bool {
    match task.proposal.new_leader {
        Some(leader) => cluster
            .partition(&task.proposal.topic_partition)
            .map(|p| p.leader == Some(leader))
            .unwrap_or(false),
        None => true,
    }
}

/// Completion check for a disk movement: the reported current log dir is
/// the task's target dir.
fn is_intra_broker_action_done(
    logdirs: &BTreeMap<(TopicPartition, BrokerId), ReplicaLogDirInfo>,
    task: &ExecutionTask,
) -> bool {
    let Some(broker) = task.broker_id else {
        return false;
    };
    let Some(disk_move) = task.proposal.disk_moves_by_broker.get(&broker) else {
        return false;
    };
    logdirs
        .get(&(task.proposal.topic_partition.clone(), broker))
        .map(|info| info.current_dir.as_deref() == Some(disk_move.target_dir.as_str()))
        .unwrap_or(false)
}

/// Death predicate for an inter-broker task: a destination broker is gone
/// from metadata, or the partition was dead upon submission.
fn should_mark_inter_broker_dead(
    cluster: &ClusterSnapshot,
    task: &ExecutionTask,
    dead_upon_submission: &BTreeSet<TopicPartition>,
) -> bool {
    task.proposal
        .new_replicas
        .iter()
        .any(|broker| cluster.node_by_id(*broker).is_none())
        || dead_upon_submission.contains(&task.proposal.topic_partition)
}

/// Death predicate for a leadership task: the target broker is gone, or
/// the movement exceeded its timeout.
fn should_mark_leader_dead(
    cluster: &ClusterSnapshot,
    task: &ExecutionTask,
    now_ms: u64,
    timeout_ms: u64,
) -> bool {
    let target_down = task
        .proposal
        .new_leader
        .map(|broker| cluster.node_by_id(broker).is_none())
        .unwrap_or(false);
    let timed_out = task
        .start_time_ms()
        .map(|start| now_ms > start.saturating_add(timeout_ms))
        .unwrap_or(false);
    target_down || timed_out
}

async fn submit_replica_reassignments(
    admin: &Arc<dyn AdminInterface>,
    tasks: &[ExecutionTask],
) -> anyhow::Result<SubmissionReport> {
    let requests: Vec<ReassignmentRequest> = tasks
        .iter()
        .map(|task| ReassignmentRequest {
            topic_partition: task.proposal.topic_partition.clone(),
            target_replicas: Some(task.proposal.new_replicas.clone()),
        })
        .collect();
    let outcomes = admin
        .alter_partition_reassignments(requests)
        .await
        .context("failed to submit replica reassignments")?;
    Ok(SubmissionReport::from_outcomes(&outcomes))
}

async fn submit_reassignment_cancellations(
    admin: &Arc<dyn AdminInterface>,
    tasks: &[ExecutionTask],
) -> anyhow::Result<SubmissionReport> {
    let requests: Vec<ReassignmentRequest> = tasks
        .iter()
        .map(|task| ReassignmentRequest {
            topic_partition: task.proposal.topic_partition.clone(),
            target_replicas: None,
        })
        .collect();
    let outcomes = admin
        .alter_partition_reassignments(requests)
        .await
        .context("failed to submit reassignment cancellations")?;
    Ok(SubmissionReport::from_outcomes(&outcomes))
}

fn log_dir_move(task: &ExecutionTask) -> Option<LogDirMoveRequest> {
    let broker = task.broker_id?;
    let disk_move = task.proposal.disk_moves_by_broker.get(&broker)?;
    Some(LogDirMoveRequest {
        topic_partition: task.proposal.topic_partition.clone(),
        broker,
        target_dir: disk_move.target_dir.clone(),
    })
}

async fn submit_log_dir_moves(
    admin: &Arc<dyn AdminInterface>,
    tasks: &[ExecutionTask],
) -> anyhow::Result<()> {
    let moves: Vec<LogDirMoveRequest> = tasks.iter().filter_map(log_dir_move).collect();
    admin
        .alter_replica_log_dirs(moves)
        .await
        .context("failed to submit intra-broker replica movements")
}

/// Runs one execution end to end on a dedicated worker task.
pub(crate) struct ProposalExecutionRunner {
    core: Arc<ExecutorCore>,
    load_monitor: Arc<dyn LoadMonitor>,
    replication_throttle: Option<u64>,
    triggered_by_user: bool,
    last_slow_report_ms: u64,
    execution_error: Option<anyhow::Error>,
}

impl ProposalExecutionRunner {
    pub(crate) fn new(
        core: Arc<ExecutorCore>,
        load_monitor: Arc<dyn LoadMonitor>,
        replication_throttle: Option<u64>,
        triggered_by_user: bool,
    ) -> Self {
        Self {
            core,
            load_monitor,
            replication_throttle,
            triggered_by_user,
            last_slow_report_ms: 0,
            execution_error: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let uuid = self.core.uuid().unwrap_or_default();
        let start = now_ms();
        tracing::info!(uuid = %uuid, "starting to execute proposals");

        let user_task_info = self.init_execution();
        self.execute(user_task_info).await;

        let duration_ms = now_ms().saturating_sub(start);
        match &self.execution_error {
            Some(err) => {
                tracing::info!(uuid = %uuid, duration_ms, error = %err, "execution failed")
            }
            None => tracing::info!(uuid = %uuid, duration_ms, "execution succeeded"),
        }
        self.clear_completed_execution();
    }

    fn init_execution(&mut self) -> Option<UserTaskInfo> {
        let uuid = self.core.uuid().unwrap_or_default();
        let mut user_task_info = None;
        if self.triggered_by_user {
            let manager = self.core.user_task_manager.read().unwrap().clone();
            if let Some(manager) = manager {
                match manager.mark_task_execution_began(&uuid) {
                    Ok(info) => user_task_info = Some(info),
                    Err(err) => {
                        tracing::warn!(uuid = %uuid, error = ?err, "failed to mark user task execution began")
                    }
                }
            }
        }
        let reason = self.core.reason();
        self.core
            .publish_state(ExecutorState::Starting(self.core.ongoing_info()));
        tracing::info!(uuid = %uuid, reason = %reason, "task execution starts");
        self.core.reset_modification_intent();
        user_task_info
    }

    async fn execute(&mut self, user_task_info: Option<UserTaskInfo>) {
        if let Err(err) = self.execute_phases().await {
            tracing::error!(
                uuid = ?self.core.uuid(),
                error = ?err,
                "executor got an error during execution"
            );
            self.execution_error = Some(err);
        }
        self.notify_finished_task(user_task_info);
    }

    async fn execute_phases(&mut self) -> anyhow::Result<()> {
        self.adjust_sampling_mode_before_execution().await;

        if self.core.phase() == ExecutorPhase::Starting {
            self.publish_progress(ExecutorPhase::InterBrokerMovement);
            self.inter_broker_move_replicas().await?;
            self.update_ongoing_execution_state();
        }
        if self.core.phase() == ExecutorPhase::InterBrokerMovement {
            self.publish_progress(ExecutorPhase::IntraBrokerMovement);
            self.intra_broker_move_replicas().await?;
            self.update_ongoing_execution_state();
        }
        if self.core.phase() == ExecutorPhase::IntraBrokerMovement {
            self.publish_progress(ExecutorPhase::LeaderMovement);
            self.move_leaderships().await?;
            self.update_ongoing_execution_state();
        }
        Ok(())
    }

    /// Pause metric sampling, switch it to ongoing-execution mode, and
    /// resume, so partition metrics keep their accuracy while placement is
    /// being rewritten.
    async fn adjust_sampling_mode_before_execution(&self) {
        while self.load_monitor.sampling_mode() != SamplingMode::OngoingExecution {
            match self
                .load_monitor
                .pause_metric_sampling("paused-before-starting-execution", true)
            {
                Ok(()) => {
                    self.load_monitor.set_sampling_mode(SamplingMode::OngoingExecution);
                    break;
                }
                Err(err) => {
                    tracing::debug!(
                        error = ?err,
                        "waiting for the load monitor before adjusting sampling mode"
                    );
                    tokio::time::sleep(self.core.progress_check_interval()).await;
                }
            }
        }
        self.load_monitor
            .resume_metric_sampling("resumed-before-starting-execution");
    }

    fn publish_progress(&self, phase: ExecutorPhase) {
        let state = match phase {
            ExecutorPhase::InterBrokerMovement => ExecutorState::InterBrokerMovement(
                self.core
                    .movement_progress(&[TaskType::InterBrokerReplica].into_iter().collect()),
            ),
            ExecutorPhase::IntraBrokerMovement => ExecutorState::IntraBrokerMovement(
                self.core
                    .movement_progress(&[TaskType::IntraBrokerReplica].into_iter().collect()),
            ),
            ExecutorPhase::LeaderMovement => ExecutorState::LeaderMovement(
                self.core
                    .movement_progress(&[TaskType::Leader].into_iter().collect()),
            ),
            _ => return,
        };
        self.core.publish_state(state);
    }

    /// Republish the current phase with fresh summaries, or the stopping
    /// state once the stop signal is set.
    fn update_ongoing_execution_state(&self) {
        if self.core.is_stop_requested() {
            let all: BTreeSet<TaskType> = TaskType::ALL.into_iter().collect();
            self.core
                .publish_state(ExecutorState::Stopping(self.core.movement_progress(&all)));
            return;
        }
        match self.core.phase() {
            phase @ (ExecutorPhase::InterBrokerMovement
            | ExecutorPhase::IntraBrokerMovement
            | ExecutorPhase::LeaderMovement) => self.publish_progress(phase),
            phase => {
                tracing::error!(?phase, "unexpected ongoing execution state");
            }
        }
    }

    fn in_execution_tasks_all(&self) -> Vec<ExecutionTask> {
        self.core.tracker.in_execution_tasks(None)
    }

    fn in_execution_tasks_of(&self, task_type: TaskType) -> Vec<ExecutionTask> {
        let filter: BTreeSet<TaskType> = [task_type].into_iter().collect();
        self.core.tracker.in_execution_tasks(Some(&filter))
    }

    /// Sleep one progress-check interval, then refresh cluster metadata.
    /// A failed refresh falls back to the cached snapshot.
    async fn cluster_for_progress_check(&self) -> ClusterSnapshot {
        tokio::time::sleep(self.core.progress_check_interval()).await;
        tracing::debug!(
            in_execution = self.in_execution_tasks_all().len(),
            "checking execution progress"
        );
        match self.core.metadata.refresh().await {
            Ok(cluster) => cluster,
            Err(err) => {
                tracing::warn!(error = ?err, "metadata refresh failed; using cached cluster");
                self.core.metadata.cluster()
            }
        }
    }

    fn send_slow_task_alert(&mut self, slow_tasks: &[ExecutionTask]) {
        if slow_tasks.is_empty() {
            return;
        }
        let mut message = String::from("slow tasks detected:\n");
        for task in slow_tasks {
            message.push_str(&format!(
                "  id={} started_at_ms={:?} {}\n",
                task.id,
                task.start_time_ms(),
                task
            ));
        }
        self.core.notifier.send_alert(&message);
        self.last_slow_report_ms = now_ms();
    }

    fn should_report_slow_tasks(&self, now_ms: u64) -> bool {
        let backoff_ms = self.core.config.slow_task_alerting_backoff.as_millis() as u64;
        now_ms.saturating_sub(self.last_slow_report_ms) > backoff_ms
    }

    fn slow_threshold_ms(&self) -> u64 {
        self.core.config.task_execution_alerting_threshold.as_millis() as u64
    }

    // Phase I: inter-broker replica movement.

    async fn inter_broker_move_replicas(&mut self) -> anyhow::Result<()> {
        let dead_brokers = self
            .load_monitor
            .dead_brokers_with_replicas(self.core.config.metadata_wait_timeout)
            .await
            .context("failed to retrieve dead brokers with replicas")?;
        let mut throttle = ReplicationThrottleHelper::new(
            self.core.admin.clone(),
            self.replication_throttle,
            dead_brokers,
        );

        let total_movements = self.core.tracker.num_remaining(TaskType::InterBrokerReplica);
        let total_data_mb = self
            .core
            .tracker
            .remaining_data_to_move_mb(TaskType::InterBrokerReplica);
        tracing::info!(
            total_movements,
            total_data_mb,
            "starting inter-broker partition movements"
        );

        let mut remaining = total_movements;
        while (remaining > 0 || !self.in_execution_tasks_all().is_empty())
            && !self.core.is_stop_requested()
        {
            let tasks = self.core.tracker.get_inter_broker_batch();
            tracing::info!(batch = tasks.len(), "executing inter-broker task batch");

            let mut report = SubmissionReport::default();
            if !tasks.is_empty() {
                let proposals: Vec<_> = tasks.iter().map(|t| t.proposal.clone()).collect();
                throttle
                    .set_throttles(&proposals)
                    .await
                    .context("failed to set replication throttles")?;
                self.core.tracker.mark_in_progress(&tasks, now_ms());
                report = submit_replica_reassignments(&self.core.admin, &tasks).await?;
                if !report.no_reassignment_to_cancel.is_empty() {
                    bail!(
                        "attempt to cancel reassignment of partitions {:?} during regular execution",
                        report.no_reassignment_to_cancel
                    );
                }
            }

            let finished = self.wait_for_inter_broker_tasks_to_finish(report).await?;

            remaining = self.core.tracker.num_remaining(TaskType::InterBrokerReplica);
            tracing::info!(
                finished = self.core.tracker.num_finished(TaskType::InterBrokerReplica),
                total = total_movements,
                finished_data_mb =
                    self.core.tracker.finished_data_movement_mb(TaskType::InterBrokerReplica),
                total_data_mb,
                "inter-broker partition movement progress"
            );

            let in_progress = self.in_execution_tasks_of(TaskType::InterBrokerReplica);
            throttle
                .clear_throttles(&finished, &in_progress)
                .await
                .context("failed to clear replication throttles")?;
        }

        if !self.core.is_stop_requested() {
            tracing::info!("inter-broker partition movements finished");
        } else {
            let summary = self.core.tracker.summary(&BTreeSet::new());
            tracing::info!(
                task_counts = ?summary.task_counts,
                remaining_data_mb = summary.remaining_inter_broker_data_to_move_mb,
                "inter-broker partition movements stopped"
            );
        }
        Ok(())
    }

    async fn wait_for_inter_broker_tasks_to_finish(
        &mut self,
        mut report: SubmissionReport,
    ) -> anyhow::Result<Vec<ExecutionTask>> {
        let mut finished: Vec<ExecutionTask> = Vec::new();
        let mut stopped_ids = BTreeSet::new();
        let mut deleted_ids = BTreeSet::new();
        let mut dead_ids = BTreeSet::new();

        loop {
            let cluster = self.cluster_for_progress_check().await;
            let mut dead_tasks: Vec<ExecutionTask> = Vec::new();
            let mut stopped_tasks: Vec<ExecutionTask> = Vec::new();
            let mut slow_tasks: Vec<ExecutionTask> = Vec::new();

            let in_execution = self.in_execution_tasks_all();
            let num_in_execution = in_execution.len();
            let mut num_finished_or_deleted = 0usize;
            let now = now_ms();
            let report_slow = self.should_report_slow_tasks(now);

            for task in in_execution {
                let tp = task.proposal.topic_partition.clone();
                if self.core.is_stop_requested() {
                    // Stop with a rollback rather than waiting the batch out.
                    tracing::debug!(task = %task, "marking task dead to stop the execution");
                    self.core.tracker.mark_dead(task.id, now);
                    stopped_ids.insert(task.id);
                    stopped_tasks.push(task.clone());
                    finished.push(task);
                } else if cluster.partition(&tp).is_none() || report.deleted.contains(&tp) {
                    num_finished_or_deleted += 1;
                    deleted_ids.insert(task.id);
                    self.handle_progress_with_topic_deletion(&task, &mut finished, now);
                } else if is_inter_broker_action_done(&cluster, &task) {
                    num_finished_or_deleted += 1;
                    self.core.tracker.mark_done(task.id, now);
                    finished.push(task);
                } else {
                    if report_slow && task.is_slow(now, self.slow_threshold_ms()) {
                        slow_tasks.push(task.clone());
                    }
                    if should_mark_inter_broker_dead(&cluster, &task, &report.dead) {
                        tracing::warn!(task = %task, "killing task because a destination broker is down");
                        self.core.tracker.mark_dead(task.id, now);
                        dead_ids.insert(task.id);
                        dead_tasks.push(task.clone());
                        finished.push(task);
                    }
                }
            }

            // Shrink the poll interval when the whole batch finished within
            // one tick, grow it when tasks are still running.
            let current_ms = self.core.progress_check_interval().as_millis() as u64;
            if num_finished_or_deleted == num_in_execution {
                self.core.set_progress_check_interval_ms(
                    current_ms.saturating_sub(PROGRESS_CHECK_INTERVAL_ADJUSTING_MS),
                );
            } else {
                self.core.set_progress_check_interval_ms(
                    current_ms + PROGRESS_CHECK_INTERVAL_ADJUSTING_MS,
                );
            }

            self.send_slow_task_alert(&slow_tasks);
            self.handle_dead_inter_broker_tasks(&dead_tasks, &stopped_tasks)
                .await?;
            self.update_ongoing_execution_state();

            let retry = !self.in_execution_tasks_all().is_empty() && finished.is_empty();
            if !retry {
                break;
            }
            // Nothing finished while tasks remain: check whether anything
            // is blocked on a lost submission.
            self.maybe_reexecute_inter_broker_tasks(&mut report).await?;
        }

        tracing::info!(
            finished = finished.len(),
            stopped = ?stopped_ids,
            deleted = ?deleted_ids,
            dead = ?dead_ids,
            "inter-broker task batch settled"
        );
        Ok(finished)
    }

    fn handle_progress_with_topic_deletion(
        &self,
        task: &ExecutionTask,
        finished: &mut Vec<ExecutionTask>,
        now_ms: u64,
    ) {
        tracing::debug!(task = %task, "task finished because its topic was deleted");
        self.core.tracker.mark_aborting(task.id, now_ms);
        self.core.tracker.mark_done(task.id, now_ms);
        finished.push(task.clone());
    }

    /// Cancel the reassignment of dead or user-stopped inter-broker tasks
    /// and stop the execution if not already requested. Waits for the
    /// rollback to drain only when every cancelled task was user-stopped;
    /// with dead brokers around the rollback may be stuck server-side, and
    /// the next execution's sanity check will spot it instead.
    async fn handle_dead_inter_broker_tasks(
        &self,
        dead_tasks: &[ExecutionTask],
        stopped_tasks: &[ExecutionTask],
    ) -> anyhow::Result<()> {
        let mut tasks_to_cancel: Vec<ExecutionTask> = dead_tasks.to_vec();
        tasks_to_cancel.extend_from_slice(stopped_tasks);
        if tasks_to_cancel.is_empty() {
            return Ok(());
        }

        for task in &tasks_to_cancel {
            let state = self.core.tracker.task_state(task.id);
            assert_eq!(
                state,
                Some(TaskState::Dead),
                "task {} must be dead before its reassignment is cancelled",
                task.id
            );
        }

        let report = submit_reassignment_cancellations(&self.core.admin, &tasks_to_cancel).await?;
        tracing::debug!(
            cancelled = tasks_to_cancel.len(),
            deleted = ?report.deleted,
            dead = ?report.dead,
            no_reassignment = ?report.no_reassignment_to_cancel,
            "handled dead inter-broker tasks"
        );

        if !self.core.is_stop_requested() {
            tracing::info!(
                num_dead = tasks_to_cancel.len(),
                "stopping the execution due to dead tasks"
            );
            self.core.stop_execution();
        }

        if dead_tasks.is_empty() {
            let mut being_cancelled: BTreeSet<TopicPartition> = tasks_to_cancel
                .iter()
                .map(|t| t.proposal.topic_partition.clone())
                .collect();
            for tp in report
                .deleted
                .iter()
                .chain(report.dead.iter())
                .chain(report.no_reassignment_to_cancel.iter())
            {
                being_cancelled.remove(tp);
            }

            loop {
                let ongoing = self
                    .core
                    .admin
                    .list_partition_reassignments()
                    .await
                    .context("failed to list reassignments while waiting for rollback")?;
                let still_rolling_back: Vec<&TopicPartition> = being_cancelled
                    .iter()
                    .filter(|tp| ongoing.contains_key(*tp))
                    .collect();
                if still_rolling_back.is_empty() {
                    break;
                }
                tracing::info!(
                    partitions = ?still_rolling_back,
                    "waiting for the rollback of cancelled inter-broker reassignments"
                );
                tokio::time::sleep(self.core.progress_check_interval()).await;
            }
        }
        Ok(())
    }

    /// Re-submit in-execution inter-broker tasks that the cluster no longer
    /// reports as being reassigned, e.g. after a controller failover.
    async fn maybe_reexecute_inter_broker_tasks(
        &self,
        report: &mut SubmissionReport,
    ) -> anyhow::Result<()> {
        let candidates = self.in_execution_tasks_of(TaskType::InterBrokerReplica);
        if candidates.is_empty() {
            return Ok(());
        }
        let ongoing = match self.core.admin.list_partition_reassignments().await {
            Ok(ongoing) => ongoing,
            Err(err) => {
                tracing::warn!(
                    error = ?err,
                    "failed to list partition reassignments; skipping re-execution check"
                );
                return Ok(());
            }
        };
        let tasks_to_reexecute: Vec<ExecutionTask> = candidates
            .into_iter()
            .filter(|task| !ongoing.contains_key(&task.proposal.topic_partition))
            .collect();
        if tasks_to_reexecute.is_empty() {
            return Ok(());
        }

        tracing::info!(
            count = tasks_to_reexecute.len(),
            "re-submitting inter-broker reassignments absent from the cluster"
        );
        let new_report = submit_replica_reassignments(&self.core.admin, &tasks_to_reexecute).await?;
        if !new_report.no_reassignment_to_cancel.is_empty() {
            bail!(
                "attempt to cancel reassignment of partitions {:?} during re-execution",
                new_report.no_reassignment_to_cancel
            );
        }
        report.deleted.extend(new_report.deleted);
        report.dead.extend(new_report.dead);
        Ok(())
    }

    // Phase II: intra-broker disk movement.

    async fn intra_broker_move_replicas(&mut self) -> anyhow::Result<()> {
        let total_movements = self.core.tracker.num_remaining(TaskType::IntraBrokerReplica);
        let total_data_mb = self
            .core
            .tracker
            .remaining_data_to_move_mb(TaskType::IntraBrokerReplica);
        tracing::info!(
            total_movements,
            total_data_mb,
            "starting intra-broker partition movements"
        );

        let mut remaining = total_movements;
        while (remaining > 0 || !self.in_execution_tasks_all().is_empty())
            && !self.core.is_stop_requested()
        {
            let tasks = self.core.tracker.get_intra_broker_batch();
            tracing::info!(batch = tasks.len(), "executing intra-broker task batch");
            if !tasks.is_empty() {
                self.core.tracker.mark_in_progress(&tasks, now_ms());
                submit_log_dir_moves(&self.core.admin, &tasks).await?;
            }
            self.wait_for_intra_broker_tasks_to_finish().await;
            remaining = self.core.tracker.num_remaining(TaskType::IntraBrokerReplica);
            tracing::info!(
                finished = self.core.tracker.num_finished(TaskType::IntraBrokerReplica),
                total = total_movements,
                finished_data_mb =
                    self.core.tracker.finished_data_movement_mb(TaskType::IntraBrokerReplica),
                total_data_mb,
                "intra-broker partition movement progress"
            );
        }

        // Disk moves are broker-local and cannot be rolled back; wait out
        // whatever is still running even after a stop.
        while !self.in_execution_tasks_all().is_empty() {
            tracing::info!(
                in_flight = self.in_execution_tasks_all().len(),
                in_flight_data_mb =
                    self.core.tracker.in_execution_data_mb(TaskType::IntraBrokerReplica),
                "waiting for in-flight intra-broker movements to finish"
            );
            self.wait_for_intra_broker_tasks_to_finish().await;
        }

        if !self.core.is_stop_requested() {
            tracing::info!("intra-broker partition movements finished");
        } else {
            let summary = self.core.tracker.summary(&BTreeSet::new());
            tracing::info!(
                task_counts = ?summary.task_counts,
                remaining_data_mb = summary.remaining_intra_broker_data_to_move_mb,
                "intra-broker partition movements stopped"
            );
        }
        Ok(())
    }

    async fn wait_for_intra_broker_tasks_to_finish(&mut self) {
        let mut finished: Vec<ExecutionTask> = Vec::new();
        let mut deleted_ids = BTreeSet::new();
        let mut dead_ids = BTreeSet::new();

        loop {
            self.maybe_reexecute_intra_broker_tasks().await;
            let cluster = self.cluster_for_progress_check().await;

            let in_execution = self.in_execution_tasks_of(TaskType::IntraBrokerReplica);
            let replicas: Vec<(TopicPartition, BrokerId)> = in_execution
                .iter()
                .filter_map(|t| {
                    t.broker_id
                        .map(|b| (t.proposal.topic_partition.clone(), b))
                })
                .collect();
            let logdirs = if replicas.is_empty() {
                Some(BTreeMap::new())
            } else {
                match self.core.admin.describe_replica_log_dirs(replicas).await {
                    Ok(logdirs) => Some(logdirs),
                    Err(err) => {
                        tracing::warn!(
                            error = ?err,
                            "failed to describe replica log dirs; retrying next tick"
                        );
                        None
                    }
                }
            };

            let now = now_ms();
            let report_slow = self.should_report_slow_tasks(now);
            let mut slow_tasks: Vec<ExecutionTask> = Vec::new();

            for task in in_execution {
                let tp = task.proposal.topic_partition.clone();
                if cluster.partition(&tp).is_none() {
                    deleted_ids.insert(task.id);
                    self.handle_progress_with_topic_deletion(&task, &mut finished, now);
                } else if let Some(logdirs) = &logdirs {
                    if is_intra_broker_action_done(logdirs, &task) {
                        self.core.tracker.mark_done(task.id, now);
                        finished.push(task);
                    } else {
                        if report_slow && task.is_slow(now, self.slow_threshold_ms()) {
                            slow_tasks.push(task.clone());
                        }
                        let key = (tp, task.broker_id.unwrap_or_default());
                        if !logdirs.contains_key(&key) {
                            tracing::warn!(task = %task, "killing task because the destination disk is down");
                            self.core.tracker.mark_dead(task.id, now);
                            dead_ids.insert(task.id);
                            finished.push(task);
                        }
                    }
                } else if report_slow && task.is_slow(now, self.slow_threshold_ms()) {
                    slow_tasks.push(task.clone());
                }
            }

            self.send_slow_task_alert(&slow_tasks);
            self.update_ongoing_execution_state();

            if self.in_execution_tasks_all().is_empty() || !finished.is_empty() {
                break;
            }
        }

        tracing::info!(
            finished = finished.len(),
            deleted = ?deleted_ids,
            dead = ?dead_ids,
            "intra-broker task batch settled"
        );
    }

    /// Re-submit in-execution disk moves the broker no longer reports as
    /// current or in-flight.
    async fn maybe_reexecute_intra_broker_tasks(&self) {
        let candidates = self.in_execution_tasks_of(TaskType::IntraBrokerReplica);
        if candidates.is_empty() {
            return;
        }
        let replicas: Vec<(TopicPartition, BrokerId)> = candidates
            .iter()
            .filter_map(|t| {
                t.broker_id
                    .map(|b| (t.proposal.topic_partition.clone(), b))
            })
            .collect();
        let logdirs = match self.core.admin.describe_replica_log_dirs(replicas).await {
            Ok(logdirs) => logdirs,
            Err(err) => {
                tracing::warn!(
                    error = ?err,
                    "failed to describe replica log dirs; skipping re-execution check"
                );
                return;
            }
        };

        let tasks_to_reexecute: Vec<ExecutionTask> = candidates
            .into_iter()
            .filter(|task| {
                let Some(broker) = task.broker_id else {
                    return false;
                };
                let Some(disk_move) = task.proposal.disk_moves_by_broker.get(&broker) else {
                    return false;
                };
                let target = disk_move.target_dir.as_str();
                match logdirs.get(&(task.proposal.topic_partition.clone(), broker)) {
                    Some(info) => {
                        info.current_dir.as_deref() != Some(target)
                            && info.future_dir.as_deref() != Some(target)
                    }
                    None => false,
                }
            })
            .collect();
        if tasks_to_reexecute.is_empty() {
            return;
        }

        tracing::info!(
            count = tasks_to_reexecute.len(),
            "re-submitting intra-broker movements"
        );
        if let Err(err) = submit_log_dir_moves(&self.core.admin, &tasks_to_reexecute).await {
            tracing::warn!(error = ?err, "failed to re-submit intra-broker movements");
        }
    }

    // Phase III: leadership movement.

    async fn move_leaderships(&mut self) -> anyhow::Result<()> {
        // Interval tuning from Phase I ends here; leadership movements run
        // at the requested or default cadence.
        self.core.reset_progress_check_interval();

        let total_movements = self.core.tracker.num_remaining(TaskType::Leader);
        tracing::info!(total_movements, "starting leadership movements");
        let mut num_finished = 0usize;
        while self.core.tracker.num_remaining(TaskType::Leader) != 0
            && !self.core.is_stop_requested()
        {
            self.update_ongoing_execution_state();
            num_finished += self.move_leadership_batch().await?;
            tracing::info!(
                finished = num_finished,
                total = total_movements,
                "leadership movement progress"
            );
        }

        if self.in_execution_tasks_all().is_empty() {
            tracing::info!("leadership movements finished");
        } else if self.core.is_stop_requested() {
            let summary = self.core.tracker.summary(&BTreeSet::new());
            tracing::info!(
                task_counts = ?summary.task_counts,
                "leadership movements stopped"
            );
        }
        Ok(())
    }

    async fn move_leadership_batch(&mut self) -> anyhow::Result<usize> {
        let tasks = self.core.tracker.get_leader_batch();
        let batch_size = tasks.len();
        tracing::debug!(batch = batch_size, "executing leadership movements batch");

        if !tasks.is_empty() && !self.core.is_stop_requested() {
            self.core.tracker.mark_in_progress(&tasks, now_ms());
            let partitions: Vec<TopicPartition> = tasks
                .iter()
                .map(|t| t.proposal.topic_partition.clone())
                .collect();
            let outcomes = self
                .core
                .admin
                .elect_preferred_leaders(partitions)
                .await
                .context("failed to submit preferred leader elections")?;
            let mut deleted: BTreeSet<TopicPartition> = outcomes
                .iter()
                .filter(|(_, outcome)| **outcome == ElectionOutcome::DeletedTopic)
                .map(|(tp, _)| tp.clone())
                .collect();

            while !self.in_execution_tasks_all().is_empty() && !self.core.is_stop_requested() {
                self.wait_for_leadership_tasks_to_finish(&mut deleted).await;
            }
        }
        Ok(batch_size)
    }

    async fn wait_for_leadership_tasks_to_finish(&mut self, deleted: &mut BTreeSet<TopicPartition>) {
        let mut finished: Vec<ExecutionTask> = Vec::new();
        let mut stopped_ids = BTreeSet::new();
        let mut deleted_ids = BTreeSet::new();
        let mut dead_ids = BTreeSet::new();
        let timeout_ms = self.core.config.leader_movement_timeout.as_millis() as u64;

        loop {
            let cluster = self.cluster_for_progress_check().await;
            let now = now_ms();
            let report_slow = self.should_report_slow_tasks(now);
            let mut slow_tasks: Vec<ExecutionTask> = Vec::new();

            for task in self.in_execution_tasks_all() {
                let tp = task.proposal.topic_partition.clone();
                if self.core.is_stop_requested() {
                    tracing::debug!(task = %task, "marking task dead to stop the execution");
                    self.core.tracker.mark_dead(task.id, now);
                    stopped_ids.insert(task.id);
                    finished.push(task);
                } else if cluster.partition(&tp).is_none() || deleted.contains(&tp) {
                    deleted_ids.insert(task.id);
                    self.handle_progress_with_topic_deletion(&task, &mut finished, now);
                } else if is_leadership_action_done(&cluster, &task) {
                    self.core.tracker.mark_done(task.id, now);
                    finished.push(task);
                } else {
                    if report_slow && task.is_slow(now, self.slow_threshold_ms()) {
                        slow_tasks.push(task.clone());
                    }
                    if should_mark_leader_dead(&cluster, &task, now, timeout_ms) {
                        tracing::warn!(
                            task = %task,
                            timeout_ms,
                            "killing leadership task: target broker down or movement timed out"
                        );
                        self.core.tracker.mark_dead(task.id, now);
                        dead_ids.insert(task.id);
                        finished.push(task);
                    }
                }
            }

            self.send_slow_task_alert(&slow_tasks);
            self.update_ongoing_execution_state();

            let retry = !self.in_execution_tasks_all().is_empty() && finished.is_empty();
            if !retry {
                break;
            }
            self.maybe_reexecute_leadership_tasks(deleted).await;
        }

        tracing::info!(
            finished = finished.len(),
            stopped = ?stopped_ids,
            deleted = ?deleted_ids,
            dead = ?dead_ids,
            "leadership task batch settled"
        );
    }

    /// Re-submit elections the controller may have dropped without
    /// executing.
    async fn maybe_reexecute_leadership_tasks(&self, deleted: &mut BTreeSet<TopicPartition>) {
        let tasks = self.in_execution_tasks_of(TaskType::Leader);
        if tasks.is_empty() {
            return;
        }
        tracing::info!(count = tasks.len(), "re-submitting leadership movements");
        let partitions: Vec<TopicPartition> = tasks
            .iter()
            .map(|t| t.proposal.topic_partition.clone())
            .collect();
        match self.core.admin.elect_preferred_leaders(partitions).await {
            Ok(outcomes) => {
                deleted.extend(
                    outcomes
                        .into_iter()
                        .filter(|(_, outcome)| *outcome == ElectionOutcome::DeletedTopic)
                        .map(|(tp, _)| tp),
                );
            }
            Err(err) => {
                tracing::warn!(error = ?err, "failed to re-submit leadership movements");
            }
        }
    }

    // Completion.

    fn notify_finished_task(&self, user_task_info: Option<UserTaskInfo>) {
        let uuid = self.core.uuid().unwrap_or_default();
        let complete_with_error =
            self.core.phase() == ExecutorPhase::Stopping || self.execution_error.is_some();

        match &user_task_info {
            Some(_) => {
                let manager = self.core.user_task_manager.read().unwrap().clone();
                if let Some(manager) = manager {
                    manager.mark_task_execution_finished(&uuid, complete_with_error);
                }
            }
            None => self
                .core
                .anomaly_detector
                .mark_self_healing_finished(&uuid, complete_with_error),
        }

        let origin = match &user_task_info {
            Some(info) => format!("user ({})", info.request_url),
            None => "self-healing".to_string(),
        };
        let prefix = format!("Task [{uuid}] {origin} execution is ");
        if self.core.phase() == ExecutorPhase::Stopping {
            let stopped_by = if self.core.execution_stopped_by_user.load(Ordering::Acquire) {
                "user"
            } else {
                "the executor"
            };
            let message = format!("{prefix}stopped by {stopped_by}.");
            self.core.notifier.send_alert(&message);
            tracing::warn!("{message}");
        } else if let Some(err) = &self.execution_error {
            let message = format!("{prefix}interrupted with error: {err:#}.");
            self.core.notifier.send_alert(&message);
            tracing::warn!("{message}");
        } else {
            let message = format!("{prefix}finished.");
            self.core.notifier.send_notification(&message);
            tracing::info!("{message}");
        }
    }

    /// Always runs, whatever the execution outcome: resets state, releases
    /// the ongoing-execution gate, restores sampling, clears the adjuster.
    fn clear_completed_execution(&self) {
        self.core.tracker.clear();
        self.core.clear_execution_context();
        self.core.publish_state(self.core.no_task_state());
        self.core.set_has_ongoing_execution(false);
        self.core.no_ongoing_gate.add_permits(1);
        self.core.reset_stop_signal();
        self.core
            .execution_stopped_by_user
            .store(false, Ordering::Release);
        self.load_monitor.set_sampling_mode(SamplingMode::All);
        adjuster::clear_adjustment(&self.core);
    }
}
