pub mod local;


use crate::{
    config::{ClusterConfig, ConfigErrors, LauncherConfig},
    slot::SlotKey,
};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, sync::Arc};
use thiserror::Error;

/// exit code reported for a process that finished successfully
pub const EXIT_SUCCESS: i32 = 0;
/// exit code reported for a process that was killed or lost by the cluster
pub const EXIT_ABORTED: i32 = -100;

/// Signal the process group led by `pid`.
///
/// Launch scripts are spawned as group leaders, so this reaches the processes
/// the script started as well.
pub fn signal_group(pid: u32, signal: Signal) -> Result<(), Errno> {
    let raw = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;

    killpg(Pid::from_raw(raw), signal)
}

#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("Cluster client is not running")]
    NotRunning,
    #[error("Unknown allocation {0}")]
    UnknownAllocation(AllocationId),
    #[error("Failed to spawn process: {0}")]
    Spawn(String),
    #[error("Failed to query process status: {0}")]
    Status(String),
    #[error("Cluster transport failed: {0}")]
    Transport(String),
}

/// stable id of one granted execution unit
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub String);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AllocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque token for one granted execution unit.
///
/// Equality covers the whole handle, the orchestrator keys one map by the
/// handle and one by its allocation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub id: AllocationId,
    pub host: String,
    pub port: u16,
}

impl ResourceHandle {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: AllocationId(id.into()),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// per-process resource ask
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceProfile {
    /// memory in MB
    pub memory: u32,
    pub cores: u32,
}

/// everything the cluster needs to start one slot's process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub slot: SlotKey,
    pub script: PathBuf,
    pub work_dir: PathBuf,
    /// opaque credential blob, passed through untouched
    pub credentials: Option<Arc<[u8]>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub exit_code: i32,
}

impl ProcessStatus {
    pub fn running() -> Self {
        Self {
            state: ProcessState::Running,
            exit_code: EXIT_SUCCESS,
        }
    }

    pub fn complete(exit_code: i32) -> Self {
        Self {
            state: ProcessState::Complete,
            exit_code,
        }
    }
}

/// completion notice for one allocation
#[derive(Debug, Clone)]
pub struct CompletedResource {
    pub id: AllocationId,
    pub exit_code: i32,
    pub diagnostics: String,
}

/// callbacks from the resource allocation side of the cluster
pub trait AllocationListener: Send + Sync {
    fn on_resources_allocated(&self, handles: Vec<ResourceHandle>);
    fn on_resources_completed(&self, completed: Vec<CompletedResource>);
    fn on_shutdown_request(&self);
    fn on_error(&self, error: ClusterError);
    /// job progress in [0, 1], pulled by the cluster on every heartbeat
    fn progress(&self) -> f32;
}

/// callbacks from the process management side of the cluster
pub trait ProcessListener: Send + Sync {
    fn on_process_started(&self, id: &AllocationId);
    fn on_status_received(&self, id: &AllocationId, status: ProcessStatus);
    fn on_process_stopped(&self, id: &AllocationId);
    fn on_start_error(&self, id: &AllocationId, error: ClusterError);
    fn on_status_error(&self, id: &AllocationId, error: ClusterError);
}

/// both listener halves, registered together before any request is made
#[derive(Clone)]
pub struct Listeners {
    pub allocation: Arc<dyn AllocationListener>,
    pub process: Arc<dyn ProcessListener>,
}

/// The external cluster resource manager as seen by the launcher.
///
/// Every method may be called from any thread. Results of `start_process` and
/// `query_status` arrive asynchronously through the registered listeners.
pub trait ClusterClient: Send + Sync {
    fn register(&self, listeners: Listeners) -> Result<(), ClusterError>;
    fn request_resource(&self, profile: &ResourceProfile) -> Result<(), ClusterError>;
    /// releasing an unknown or already released allocation is a no-op
    fn release_resource(&self, id: &AllocationId) -> Result<(), ClusterError>;
    fn start_process(&self, handle: &ResourceHandle, launch: &LaunchSpec)
        -> Result<(), ClusterError>;
    fn query_status(&self, id: &AllocationId);
    /// stop all processes and drop the listeners
    fn stop(&self);
}

/// select a cluster client by name, see `ClusterConfig::name`
pub struct Clusters;

impl Clusters {
    pub fn load(config: &LauncherConfig) -> Result<Arc<dyn ClusterClient>, ConfigErrors> {
        let ClusterConfig { name, .. } = &config.cluster;

        match name.as_str() {
            "local" => Ok(Arc::new(local::LocalCluster::load(config)?)),
            _ => Err(ConfigErrors::UnsupportedCluster(name.clone())),
        }
    }
}
