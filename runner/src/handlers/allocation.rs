use crate::{
    cluster::{
        AllocationListener, ClusterClient, ClusterError, CompletedResource, ResourceHandle,
        EXIT_ABORTED, EXIT_SUCCESS,
    },
    orchestrator::{phase::FailureCause, Orchestrator},
    slot::SlotStatus,
};
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

/// Turns allocation callbacks into orchestrator calls.
pub struct AllocationHandler {
    orchestrator: Orchestrator,
    // the cluster owns this handler, a strong reference would never be dropped
    cluster: Weak<dyn ClusterClient>,
}

impl AllocationHandler {
    pub fn new(orchestrator: Orchestrator, cluster: &Arc<dyn ClusterClient>) -> Self {
        Self {
            orchestrator,
            cluster: Arc::downgrade(cluster),
        }
    }
}

impl AllocationListener for AllocationHandler {
    fn on_resources_allocated(&self, handles: Vec<ResourceHandle>) {
        self.orchestrator.put_resources(handles);
    }

    fn on_resources_completed(&self, completed: Vec<CompletedResource>) {
        info!("Got {} completed resources", completed.len());

        for resource in completed {
            let status = match resource.exit_code {
                EXIT_SUCCESS => SlotStatus::Succeeded,
                EXIT_ABORTED => {
                    warn!(
                        allocation = %resource.id,
                        diagnostics = %resource.diagnostics,
                        "Resource was aborted"
                    );
                    SlotStatus::Failed
                }
                code => {
                    warn!(
                        allocation = %resource.id,
                        exit_code = code,
                        diagnostics = %resource.diagnostics,
                        "Resource completed with {code}"
                    );
                    SlotStatus::Failed
                }
            };

            self.orchestrator.report_status(&resource.id, status);
        }
    }

    fn on_shutdown_request(&self) {
        warn!("Cluster requested shutdown");

        self.orchestrator.fail(FailureCause::ShutdownRequested);
    }

    fn on_error(&self, error: ClusterError) {
        error!(error = ?error, "Cluster client failed: {error}");

        self.orchestrator.fail(FailureCause::ClusterError);

        if let Some(cluster) = self.cluster.upgrade() {
            cluster.stop();
        }
    }

    fn progress(&self) -> f32 {
        self.orchestrator.progress()
    }
}
