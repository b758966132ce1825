//! End-to-end execution scenarios over mock collaborators.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{
    cluster, test_config, MockAdmin, MockLoadMonitor, MockMetadata, NoopAnomalyDetector,
    RecordingNotifier, RecordingUserTasks,
};
use shoal_executor::admin::TopicConfig;
use shoal_executor::cluster::TopicPartition;
use shoal_executor::config::ExecutorConfig;
use shoal_executor::error::ExecutorError;
use shoal_executor::executor::{ExecutionRequest, Executor};
use shoal_executor::state::ExecutorPhase;
use shoal_executor::task::ExecutionProposal;
use shoal_executor::ClusterSnapshot;
use shoal_executor::ConcurrencyType;

struct Harness {
    executor: Executor,
    admin: Arc<MockAdmin>,
    metadata: Arc<MockMetadata>,
    monitor: Arc<MockLoadMonitor>,
    notifier: Arc<RecordingNotifier>,
}

fn harness_with_config(config: ExecutorConfig, initial: ClusterSnapshot) -> Harness {
    common::init_tracing();
    let admin = Arc::new(MockAdmin::new());
    let metadata = Arc::new(MockMetadata::new(initial.clone()));
    let monitor = Arc::new(MockLoadMonitor::new(initial));
    let notifier = Arc::new(RecordingNotifier::default());
    let executor = Executor::new(
        config,
        admin.clone(),
        metadata.clone(),
        notifier.clone(),
        Arc::new(NoopAnomalyDetector),
    );
    Harness {
        executor,
        admin,
        metadata,
        monitor,
        notifier,
    }
}

fn harness(initial: ClusterSnapshot) -> Harness {
    harness_with_config(test_config(), initial)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn replica_move(topic: &str, partition: u32, old: &[u64], new: &[u64]) -> ExecutionProposal {
    ExecutionProposal::new(TopicPartition::new(topic, partition), old.to_vec(), new.to_vec())
}

async fn start_generating(h: &Harness, uuid: &str) {
    h.executor
        .set_generating_proposals_for_execution(
            uuid,
            Box::new(|| "rebalance disk usage".to_string()),
            false,
        )
        .await
        .expect("generating proposals");
}

#[tokio::test(flavor = "multi_thread")]
async fn replica_move_completes_when_metadata_catches_up() {
    let before = cluster(&[1, 2, 3, 4], &[("T", 0, &[1, 2, 3], Some(1))]);
    let after = cluster(&[1, 2, 3, 4], &[("T", 0, &[2, 3, 4], Some(2))]);
    let h = harness(before);

    start_generating(&h, "exec-1").await;
    let mut request = ExecutionRequest::new(
        "exec-1",
        vec![replica_move("T", 0, &[1, 2, 3], &[2, 3, 4])],
    );
    request.requested_inter_broker_concurrency = Some(1);
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");
    assert!(h.executor.has_ongoing_execution());

    wait_until("reassignment submission", || h.admin.submission_count() > 0).await;
    h.metadata.set_current(after);

    wait_until("execution completion", || {
        !h.executor.has_ongoing_execution()
            && h.executor.state().phase() == ExecutorPhase::NoTask
    })
    .await;

    let submissions = h.admin.submissions_for(&TopicPartition::new("T", 0));
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].target_replicas, Some(vec![2, 3, 4]));
    assert_eq!(h.executor.num_execution_stopped(), 0);
    assert!(h
        .notifier
        .notifications()
        .iter()
        .any(|m| m.contains("finished")));
    assert!(h.notifier.alerts().is_empty());
    assert!(h.executor.in_execution_tasks().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn replication_throttle_is_applied_and_cleared_around_the_move() {
    let before = cluster(&[1, 2, 3, 4], &[("T", 0, &[1, 2, 3], Some(1))]);
    let after = cluster(&[1, 2, 3, 4], &[("T", 0, &[2, 3, 4], Some(2))]);
    let h = harness(before);

    start_generating(&h, "exec-11").await;
    let mut request = ExecutionRequest::new(
        "exec-11",
        vec![replica_move("T", 0, &[1, 2, 3], &[2, 3, 4])],
    );
    request.replication_throttle = Some(5_000_000);
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");

    // Throttles go on before the reassignment is submitted and stay on
    // while the task is in flight.
    wait_until("reassignment submission", || h.admin.submission_count() > 0).await;
    {
        let state = h.admin.state.lock().unwrap();
        assert_eq!(
            state.throttled_brokers,
            [1, 2, 3, 4].into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(
            state.throttled_topics,
            ["T".to_string()].into_iter().collect::<BTreeSet<_>>()
        );
    }

    h.metadata.set_current(after);
    wait_until("execution completion", || !h.executor.has_ongoing_execution()).await;

    let state = h.admin.state.lock().unwrap();
    assert!(
        state.throttled_brokers.is_empty(),
        "broker throttles cleared after completion"
    );
    assert!(
        state.throttled_topics.is_empty(),
        "topic throttles cleared after completion"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn user_stop_kills_in_flight_tasks_and_rolls_back() {
    let before = cluster(
        &[1, 2, 3, 4, 5],
        &[("T", 0, &[1, 2, 3], Some(1)), ("T", 1, &[1, 2, 3], Some(1))],
    );
    let h = harness(before);

    start_generating(&h, "exec-2").await;
    let request = ExecutionRequest::new(
        "exec-2",
        vec![
            replica_move("T", 0, &[1, 2, 3], &[2, 3, 4]),
            replica_move("T", 1, &[1, 2, 3], &[2, 3, 5]),
        ],
    );
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");

    wait_until("both tasks in flight", || {
        h.executor.in_execution_tasks().len() == 2
    })
    .await;

    assert!(h.executor.user_triggered_stop_execution(false).await);
    wait_until("execution stopped", || {
        !h.executor.has_ongoing_execution()
            && h.executor.state().phase() == ExecutorPhase::NoTask
    })
    .await;

    for partition in [0u32, 1] {
        let tp = TopicPartition::new("T", partition);
        let cancellations: Vec<_> = h
            .admin
            .submissions_for(&tp)
            .into_iter()
            .filter(|r| r.target_replicas.is_none())
            .collect();
        assert_eq!(cancellations.len(), 1, "one cancellation for {tp}");
    }
    assert_eq!(h.executor.num_execution_stopped_by_user(), 1);
    assert!(h
        .notifier
        .alerts()
        .iter()
        .any(|m| m.contains("stopped by user")));
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_destination_broker_kills_task_and_stops_execution() {
    // Broker 9 never exists in metadata.
    let before = cluster(&[1, 2, 3], &[("T", 2, &[1, 2, 3], Some(1))]);
    let h = harness(before);

    start_generating(&h, "exec-3").await;
    let request = ExecutionRequest::new("exec-3", vec![replica_move("T", 2, &[1, 2, 3], &[2, 3, 9])]);
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");

    wait_until("execution stopped", || {
        !h.executor.has_ongoing_execution()
            && h.executor.state().phase() == ExecutorPhase::NoTask
    })
    .await;

    let tp = TopicPartition::new("T", 2);
    let submissions = h.admin.submissions_for(&tp);
    assert!(submissions.iter().any(|r| r.target_replicas.is_some()));
    assert!(
        submissions.iter().any(|r| r.target_replicas.is_none()),
        "rollback cancellation submitted"
    );
    assert_eq!(h.executor.num_execution_stopped(), 1);
    assert_eq!(h.executor.num_execution_stopped_by_user(), 0);
    assert!(h
        .notifier
        .alerts()
        .iter()
        .any(|m| m.contains("stopped by the executor")));
}

#[tokio::test(flavor = "multi_thread")]
async fn topic_deleted_mid_flight_finishes_without_failure() {
    let before = cluster(&[1, 2, 3, 4], &[("T", 3, &[1, 2, 3], Some(1))]);
    let after = cluster(&[1, 2, 3, 4], &[]);
    let h = harness(before);

    start_generating(&h, "exec-4").await;
    let request = ExecutionRequest::new("exec-4", vec![replica_move("T", 3, &[1, 2, 3], &[2, 3, 4])]);
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");

    wait_until("reassignment submission", || h.admin.submission_count() > 0).await;
    h.metadata.set_current(after);

    wait_until("execution completion", || {
        !h.executor.has_ongoing_execution()
            && h.executor.state().phase() == ExecutorPhase::NoTask
    })
    .await;

    // Deleted topics finish the task; they are not failures.
    assert_eq!(h.executor.num_execution_stopped(), 0);
    assert!(h
        .notifier
        .notifications()
        .iter()
        .any(|m| m.contains("finished")));
    assert!(h.notifier.alerts().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_submission_is_reexecuted() {
    let before = cluster(&[1, 2, 3, 4], &[("T", 5, &[1, 2, 3], Some(1))]);
    let after = cluster(&[1, 2, 3, 4], &[("T", 5, &[2, 3, 4], Some(2))]);
    let h = harness(before);
    // The mock accepts submissions but never lists them as in flight,
    // like a controller that lost them.
    h.admin.set_record_accepted(false);

    start_generating(&h, "exec-5").await;
    let request = ExecutionRequest::new("exec-5", vec![replica_move("T", 5, &[1, 2, 3], &[2, 3, 4])]);
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");

    wait_until("re-execution of the lost submission", || {
        h.admin.submission_count() >= 2
    })
    .await;
    h.metadata.set_current(after);

    wait_until("execution completion", || {
        !h.executor.has_ongoing_execution()
    })
    .await;

    let tp = TopicPartition::new("T", 5);
    let submissions = h.admin.submissions_for(&tp);
    assert!(submissions.len() >= 2);
    assert!(submissions
        .iter()
        .all(|r| r.target_replicas == Some(vec![2, 3, 4])));
}

#[tokio::test(flavor = "multi_thread")]
async fn at_min_isr_partitions_drive_concurrency_down() {
    let mut config = test_config();
    config.concurrency_adjuster_interval = Duration::from_millis(90);
    config.concurrency_adjuster_num_min_isr_checks = 3;
    config.concurrency_adjuster_inter_broker_enabled = true;

    // (U,4) sits exactly at its MinISR with broker 2 in the shrunk ISR;
    // (T,0) is the partition being moved and stays healthy.
    let mut snapshot = cluster(
        &[1, 2, 3],
        &[("T", 0, &[1, 2], Some(1)), ("U", 4, &[1, 2, 3], Some(2))],
    );
    snapshot
        .partitions
        .get_mut(&TopicPartition::new("U", 4))
        .unwrap()
        .in_sync_replicas = vec![2];

    let h = harness_with_config(config, snapshot);
    h.admin.state.lock().unwrap().topic_configs.extend([
        (
            "T".to_string(),
            TopicConfig {
                min_insync_replicas: 1,
            },
        ),
        (
            "U".to_string(),
            TopicConfig {
                min_insync_replicas: 1,
            },
        ),
    ]);

    start_generating(&h, "exec-6").await;
    let mut request = ExecutionRequest::new("exec-6", vec![replica_move("T", 0, &[1, 2], &[1, 3])]);
    request.requested_inter_broker_concurrency = Some(8);
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");

    // The task never completes, so the executor stays in the inter-broker
    // phase while the adjuster halves broker 2's cap down to the minimum.
    wait_until("adjuster decreases broker 2's cap", || {
        h.executor.execution_concurrency_summary().inter_broker.min
            == ConcurrencyType::InterBrokerReplica.min_cap()
    })
    .await;
    assert_eq!(
        h.executor.execution_concurrency_summary().inter_broker.max,
        8,
        "untouched brokers keep the requested cap"
    );

    h.executor.user_triggered_stop_execution(false).await;
    wait_until("execution stopped", || !h.executor.has_ongoing_execution()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_the_ongoing_execution_and_waits_for_it() {
    let before = cluster(&[1, 2, 3, 4], &[("T", 0, &[1, 2, 3], Some(1))]);
    let h = harness(before);

    start_generating(&h, "exec-7").await;
    let request = ExecutionRequest::new("exec-7", vec![replica_move("T", 0, &[1, 2, 3], &[2, 3, 4])]);
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");
    wait_until("task in flight", || !h.executor.in_execution_tasks().is_empty()).await;

    h.executor.shutdown().await;
    assert!(!h.executor.has_ongoing_execution());
    assert_eq!(h.executor.state().phase(), ExecutorPhase::NoTask);
}

#[tokio::test(flavor = "multi_thread")]
async fn user_triggered_execution_reports_to_the_user_task_manager() {
    let before = cluster(&[1, 2, 3, 4], &[("T", 0, &[1, 2, 3], Some(1))]);
    let after = cluster(&[1, 2, 3, 4], &[("T", 0, &[2, 3, 4], Some(2))]);
    let h = harness(before);
    let user_tasks = Arc::new(RecordingUserTasks::default());
    h.executor.set_user_task_manager(user_tasks.clone());

    h.executor
        .set_generating_proposals_for_execution(
            "exec-8",
            Box::new(|| "user-requested rebalance".to_string()),
            true,
        )
        .await
        .unwrap();
    let mut request = ExecutionRequest::new("exec-8", vec![replica_move("T", 0, &[1, 2, 3], &[2, 3, 4])]);
    request.triggered_by_user = true;
    h.executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .expect("execution starts");

    wait_until("reassignment submission", || h.admin.submission_count() > 0).await;
    h.metadata.set_current(after);
    wait_until("execution completion", || !h.executor.has_ongoing_execution()).await;

    assert_eq!(user_tasks.began.lock().unwrap().clone(), vec!["exec-8"]);
    assert_eq!(
        user_tasks.finished.lock().unwrap().clone(),
        vec![("exec-8".to_string(), false)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_preconditions_are_enforced() {
    let before = cluster(&[1, 2, 3], &[("T", 0, &[1, 2], Some(1))]);
    let h = harness(before);

    // Executing without generating proposals first is an illegal state.
    let request = ExecutionRequest::new("exec-9", vec![replica_move("T", 0, &[1, 2], &[1, 3])]);
    let err = h
        .executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::IllegalState(_)));

    start_generating(&h, "exec-9").await;

    // A second generation attempt collides with the first.
    let err = h
        .executor
        .set_generating_proposals_for_execution("exec-10", Box::new(String::new), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::OngoingExecution(_)));

    // Executing under a different uuid is rejected and leaves the
    // generating state untouched.
    let request = ExecutionRequest::new("exec-10", vec![replica_move("T", 0, &[1, 2], &[1, 3])]);
    let err = h
        .executor
        .execute_proposals(h.monitor.clone(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::IllegalState(_)));
    assert_eq!(
        h.executor.state().phase(),
        ExecutorPhase::GeneratingProposals
    );

    // A mismatched failure report is a no-op; the matching one resets.
    h.executor
        .fail_generating_proposals_for_execution("exec-10")
        .await;
    assert_eq!(
        h.executor.state().phase(),
        ExecutorPhase::GeneratingProposals
    );
    h.executor
        .fail_generating_proposals_for_execution("exec-9")
        .await;
    assert_eq!(h.executor.state().phase(), ExecutorPhase::NoTask);
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_check_interval_is_validated_and_restorable() {
    let h = harness(cluster(&[1], &[]));
    let default = test_config().execution_progress_check_interval;

    let err = h
        .executor
        .set_requested_execution_progress_check_interval(Some(Duration::from_millis(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidArgument(_)));

    h.executor
        .set_requested_execution_progress_check_interval(Some(Duration::from_millis(15)))
        .await
        .unwrap();
    assert_eq!(
        h.executor.execution_progress_check_interval(),
        Duration::from_millis(15)
    );

    h.executor
        .set_requested_execution_progress_check_interval(None)
        .await
        .unwrap();
    assert_eq!(h.executor.execution_progress_check_interval(), default);
}

#[tokio::test(flavor = "multi_thread")]
async fn adjuster_toggles_round_trip() {
    let h = harness(cluster(&[1], &[]));

    assert!(!h
        .executor
        .set_concurrency_adjuster_for(ConcurrencyType::InterBrokerReplica, true)
        .await
        .unwrap());
    assert!(h
        .executor
        .set_concurrency_adjuster_for(ConcurrencyType::InterBrokerReplica, true)
        .await
        .unwrap());
    assert!(h
        .executor
        .set_concurrency_adjuster_for(ConcurrencyType::IntraBrokerReplica, true)
        .await
        .is_err());

    assert!(h.executor.set_concurrency_adjuster_min_isr_check(false).await);
    assert!(!h.executor.set_concurrency_adjuster_min_isr_check(true).await);

    // Per-broker cap writes accept the per-broker dimensions only.
    h.executor
        .set_execution_concurrency_for_broker(1, 5, ConcurrencyType::InterBrokerReplica)
        .await
        .unwrap();
    let err = h
        .executor
        .set_execution_concurrency_for_broker(1, 5, ConcurrencyType::LeadershipCluster)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::InvalidArgument(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_history_entries_survive_drops_of_others() {
    let h = harness(cluster(&[1], &[]));

    h.executor.add_recently_demoted_brokers([7, 8].into_iter().collect());
    assert_eq!(
        h.executor.recently_demoted_brokers(),
        [7, 8].into_iter().collect::<BTreeSet<_>>()
    );
    assert!(h
        .executor
        .drop_recently_demoted_brokers(&[7].into_iter().collect()));
    assert_eq!(
        h.executor.recently_demoted_brokers(),
        [8].into_iter().collect::<BTreeSet<_>>()
    );
}
