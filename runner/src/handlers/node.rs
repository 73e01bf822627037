use super::poller::StatusPoller;
use crate::{
    cluster::{AllocationId, ClusterError, ProcessListener, ProcessState, ProcessStatus, EXIT_SUCCESS},
    orchestrator::Orchestrator,
    slot::SlotStatus,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Turns process callbacks into slot status reports and keeps polling live
/// processes.
pub struct NodeHandler {
    orchestrator: Orchestrator,
    poller: Arc<StatusPoller>,
}

impl NodeHandler {
    pub fn new(orchestrator: Orchestrator, poller: Arc<StatusPoller>) -> Self {
        Self {
            orchestrator,
            poller,
        }
    }

    /// keep polling only while the allocation is bound to a slot
    fn reschedule(&self, id: &AllocationId) {
        if self.orchestrator.lookup(id).is_some() {
            self.poller.schedule(id.clone());
        } else {
            debug!(allocation = %id, "Not polling unbound allocation");
        }
    }
}

impl ProcessListener for NodeHandler {
    fn on_process_started(&self, id: &AllocationId) {
        info!(allocation = %id, "Process started");

        self.orchestrator.report_status(id, SlotStatus::Running);
        self.reschedule(id);
    }

    fn on_status_received(&self, id: &AllocationId, status: ProcessStatus) {
        debug!(allocation = %id, status = ?status, "Received process status");

        match status.state {
            ProcessState::Running => {
                self.orchestrator.report_status(id, SlotStatus::Running);
                self.reschedule(id);
            }
            ProcessState::Complete if status.exit_code == EXIT_SUCCESS => {
                self.orchestrator.report_status(id, SlotStatus::Succeeded);
            }
            ProcessState::Complete => {
                warn!(
                    allocation = %id,
                    exit_code = status.exit_code,
                    "Process exited with {}",
                    status.exit_code
                );
                self.orchestrator.report_status(id, SlotStatus::Failed);
            }
        }
    }

    fn on_process_stopped(&self, id: &AllocationId) {
        info!(allocation = %id, "Process stopped");

        self.orchestrator.report_status(id, SlotStatus::Failed);
    }

    fn on_start_error(&self, id: &AllocationId, error: ClusterError) {
        error!(allocation = %id, error = ?error, "Failed to start process: {error}");

        self.orchestrator.report_status(id, SlotStatus::Failed);
    }

    fn on_status_error(&self, id: &AllocationId, error: ClusterError) {
        // transient, never escalated
        warn!(allocation = %id, error = ?error, "Failed to query process status: {error}");

        self.reschedule(id);
    }
}
