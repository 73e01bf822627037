use crate::{
    cluster::{
        AllocationId, AllocationListener, ClusterClient, ClusterError, CompletedResource,
        ProcessListener, ProcessStatus, EXIT_ABORTED,
    },
    handlers::{allocation::AllocationHandler, node::NodeHandler, poller::StatusPoller},
    orchestrator::phase::{FailureCause, Phase},
    slot::SlotKey,
    testing::{eventually, handle, Harness},
};
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

fn completed(id: &str, exit_code: i32) -> CompletedResource {
    CompletedResource {
        id: AllocationId::from(id),
        exit_code,
        diagnostics: String::from("container exited"),
    }
}

/// one server bound to `s0` and one worker bound to `w1`, job is running
fn running_job() -> Harness {
    let harness = Harness::new(1, 2);
    harness.start();
    harness.await_requests(1);

    let cluster: Arc<dyn ClusterClient> = harness.cluster.clone();
    let allocation = AllocationHandler::new(harness.orchestrator.clone(), &cluster);

    allocation.on_resources_allocated(vec![handle("s0")]);
    harness
        .orchestrator
        .report_status(&AllocationId::from("s0"), crate::slot::SlotStatus::Running);
    allocation.on_resources_allocated(vec![handle("w1")]);
    harness
        .orchestrator
        .report_status(&AllocationId::from("w1"), crate::slot::SlotStatus::Running);

    assert_eq!(harness.orchestrator.phase(), Phase::Running);

    harness
}

#[test]
pub fn completed_resources_report_by_exit_code() {
    let harness = running_job();
    let cluster: Arc<dyn ClusterClient> = harness.cluster.clone();
    let allocation = AllocationHandler::new(harness.orchestrator.clone(), &cluster);

    allocation.on_resources_completed(vec![completed("w1", 0)]);

    assert_eq!(harness.orchestrator.counters().succeeded_workers, 1);
    assert_eq!(allocation.progress(), 0.5);

    allocation.on_resources_completed(vec![completed("s0", EXIT_ABORTED)]);

    assert_eq!(harness.orchestrator.phase(), Phase::Failed);
    assert_eq!(
        harness.orchestrator.cause(),
        Some(FailureCause::ProcessFailed)
    );
}

#[test]
pub fn shutdown_request_fails_job() {
    let harness = Harness::new(1, 1);
    harness.start();

    let cluster: Arc<dyn ClusterClient> = harness.cluster.clone();
    AllocationHandler::new(harness.orchestrator.clone(), &cluster).on_shutdown_request();

    assert_eq!(harness.orchestrator.phase(), Phase::Failed);
    assert_eq!(
        harness.orchestrator.cause(),
        Some(FailureCause::ShutdownRequested)
    );
}

#[test]
pub fn cluster_error_fails_job_and_stops_cluster() {
    let harness = Harness::new(1, 1);
    harness.start();

    let cluster: Arc<dyn ClusterClient> = harness.cluster.clone();
    AllocationHandler::new(harness.orchestrator.clone(), &cluster)
        .on_error(ClusterError::Transport(String::from("connection reset")));

    assert_eq!(harness.orchestrator.phase(), Phase::Failed);
    assert_eq!(
        harness.orchestrator.cause(),
        Some(FailureCause::ClusterError)
    );
    assert!(harness.cluster.stopped.load(Ordering::SeqCst));
}

#[test]
pub fn node_status_drives_slot() {
    let harness = running_job();
    let cluster: Arc<dyn ClusterClient> = harness.cluster.clone();
    let poller = Arc::new(StatusPoller::start(cluster, Duration::from_secs(60)).unwrap());
    let node = NodeHandler::new(harness.orchestrator.clone(), poller.clone());
    let w1 = AllocationId::from("w1");

    node.on_status_received(&w1, ProcessStatus::running());
    assert_eq!(poller.scheduled(), 1);

    node.on_status_error(&w1, ClusterError::Status(String::from("timeout")));
    assert_eq!(poller.scheduled(), 2);
    assert_eq!(harness.orchestrator.phase(), Phase::Running);

    node.on_status_received(&w1, ProcessStatus::complete(0));
    assert_eq!(harness.orchestrator.counters().succeeded_workers, 1);

    // the slot is finished but still bound, failures after success are ignored
    node.on_start_error(&w1, ClusterError::Spawn(String::from("late")));
    assert_eq!(harness.orchestrator.phase(), Phase::Running);

    poller.stop();
}

#[test]
pub fn start_error_requeues_worker() {
    let harness = Harness::new(1, 3);
    harness.start();
    harness.await_requests(1);
    harness.orchestrator.put_resources(vec![handle("s0")]);
    harness
        .orchestrator
        .report_status(&AllocationId::from("s0"), crate::slot::SlotStatus::Running);
    harness.orchestrator.put_resources(vec![handle("w1")]);

    let cluster: Arc<dyn ClusterClient> = harness.cluster.clone();
    let poller = Arc::new(StatusPoller::start(cluster, Duration::from_secs(60)).unwrap());
    let node = NodeHandler::new(harness.orchestrator.clone(), poller.clone());

    node.on_start_error(
        &AllocationId::from("w1"),
        ClusterError::Spawn(String::from("no such file")),
    );

    assert_eq!(harness.orchestrator.phase(), Phase::AllocatingWorkers);
    assert!(harness
        .orchestrator
        .pending(crate::slot::Role::Worker)
        .contains(&1));
    assert_eq!(harness.orchestrator.lookup(&AllocationId::from("w1")), None);

    // an unbound allocation is not polled again
    node.on_status_error(
        &AllocationId::from("w1"),
        ClusterError::Status(String::from("gone")),
    );
    assert_eq!(poller.scheduled(), 0);

    poller.stop();
}

#[test]
pub fn process_started_reports_running() {
    let harness = Harness::new(2, 1);
    harness.start();
    harness.await_requests(2);
    harness
        .orchestrator
        .put_resources(vec![handle("s0"), handle("s1")]);

    let cluster: Arc<dyn ClusterClient> = harness.cluster.clone();
    let poller = Arc::new(StatusPoller::start(cluster, Duration::from_secs(60)).unwrap());
    let node = NodeHandler::new(harness.orchestrator.clone(), poller.clone());

    node.on_process_started(&AllocationId::from("s0"));

    assert_eq!(harness.orchestrator.counters().started_servers, 1);
    assert_eq!(poller.scheduled(), 1);
    assert_eq!(
        harness
            .orchestrator
            .slot(SlotKey::server(0))
            .map(|slot| slot.status),
        Some(crate::slot::SlotStatus::Running)
    );

    poller.stop();
}

#[test]
pub fn poller_queries_after_interval() {
    let harness = Harness::new(1, 1);
    let cluster: Arc<dyn ClusterClient> = harness.cluster.clone();
    let poller = StatusPoller::start(cluster, Duration::from_millis(10)).unwrap();

    poller.schedule(AllocationId::from("b"));
    poller.schedule(AllocationId::from("a"));

    assert!(eventually(|| harness.cluster.queries.lock().len() == 2));
    assert_eq!(poller.scheduled(), 0);

    poller.stop();
    poller.schedule(AllocationId::from("c"));

    assert_eq!(poller.scheduled(), 0);
}
