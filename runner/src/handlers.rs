pub mod allocation;
pub mod node;
pub mod poller;

use crate::{
    cluster::{ClusterClient, Listeners},
    orchestrator::Orchestrator,
};
use allocation::AllocationHandler;
use node::NodeHandler;
use poller::StatusPoller;
use std::sync::Arc;

/// Build both listener halves for one orchestrator.
pub fn listeners(
    orchestrator: &Orchestrator,
    cluster: &Arc<dyn ClusterClient>,
    poller: Arc<StatusPoller>,
) -> Listeners {
    Listeners {
        allocation: Arc::new(AllocationHandler::new(orchestrator.clone(), cluster)),
        process: Arc::new(NodeHandler::new(orchestrator.clone(), poller)),
    }
}
