use crate::{
    cluster::ResourceProfile,
    orchestrator::{JobSpec, RetryPolicy},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    ReadConfig(#[source] Error),
    #[error("Failed to parse config")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Cluster not supported: {0}")]
    UnsupportedCluster(String),
    #[error("Cluster parameter {0} is invalid")]
    InvalidClusterParameter(String),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Failed to read credentials")]
    Credentials(#[source] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    pub job: JobConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    // wall clock bound for the whole job in seconds
    #[serde(default = "default_execute_timeout")]
    pub execute_timeout: u64,
    #[serde(default)]
    pub launcher: LaunchConfig,
    pub paths: PathsConfig,
    pub cluster: ClusterConfig,
    // print diagnostics from inside the generated launch scripts
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub servers: usize,
    pub workers: usize,
    pub process: ResourceProfile,
    // port every server listens on for its workers
    pub port: u16,
    #[serde(default)]
    pub server_args: String,
    #[serde(default)]
    pub worker_args: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AllocationConfig {
    // seconds a pending queue may stall before a cooldown
    #[serde(default = "default_allocate_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    // seconds to back off after a stall
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,
    // interval of the request loop in milliseconds
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
    // seconds to wait for granted slots to confirm once nothing is pending
    #[serde(default = "default_start_wait")]
    pub start_wait: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            timeout: default_allocate_timeout(),
            max_retries: default_max_retries(),
            cooldown: default_cooldown(),
            tick_ms: default_tick(),
            start_wait: default_start_wait(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LaunchConfig {
    // size of the launch pool, independent of the job size
    #[serde(default = "default_launch_threads")]
    pub threads: usize,
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
    // seconds to wait for outstanding launches on teardown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            threads: default_launch_threads(),
            status_interval_ms: default_status_interval(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    // where the per slot launch scripts are written
    pub scripts: PathBuf,
    pub server_dir: PathBuf,
    pub worker_dir: PathBuf,
    #[serde(default = "default_start_file")]
    pub start_file: String,
    #[serde(default = "default_endpoint_list")]
    pub endpoint_list: String,
    #[serde(default = "default_machine_list")]
    pub machine_list: String,
    pub credentials: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    // Name of the selected cluster client, see Clusters::load for the selection proccess
    pub name: String,
    // parameters specific to the cluster client
    // TODO: Make this fully typed once a second cluster client exists
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

impl LauncherConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(ConfigErrors::ReadConfig)?;
        let config = serde_yaml::from_str(&content)?;

        info!(path = ?path, "Loaded launcher config");

        Ok(config)
    }

    pub fn job_spec(&self) -> JobSpec {
        JobSpec {
            servers: self.job.servers,
            workers: self.job.workers,
            profile: self.job.process,
            execute_timeout: Duration::from_secs(self.execute_timeout),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            allocate_timeout: Duration::from_secs(self.allocation.timeout),
            max_retries: self.allocation.max_retries,
            cooldown: Duration::from_secs(self.allocation.cooldown),
            tick: Duration::from_millis(self.allocation.tick_ms),
            start_wait: Duration::from_secs(self.allocation.start_wait),
        }
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.launcher.status_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.launcher.drain_timeout)
    }

    /// read the opaque credential blob handed to every launched process
    pub fn read_credentials(&self) -> Result<Option<Arc<[u8]>>, ConfigErrors> {
        match &self.paths.credentials {
            Some(path) => fs::read(path)
                .map(|bytes| Some(Arc::from(bytes)))
                .map_err(ConfigErrors::Credentials),
            None => Ok(None),
        }
    }

    /// Validate the whole config, returns true if any error was found.
    ///
    /// Every problem is logged instead of failing on the first one.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if self.job.servers == 0 {
            error!("job.servers must be at least 1, workers need a server to connect to");
            contains_error = true;
        }

        if self.job.workers == 0 {
            error!("job.workers must be at least 1, worker 0 is the primary worker");
            contains_error = true;
        }

        if self.job.process.memory == 0 || self.job.process.cores == 0 {
            error!(
                "job.process must ask for memory and cores, got {}MB/{} cores",
                self.job.process.memory, self.job.process.cores
            );
            contains_error = true;
        }

        if self.job.port == 0 {
            error!("job.port cannot be 0, workers need a fixed port to reach the servers");
            contains_error = true;
        }

        if self.allocation.tick_ms == 0 {
            error!("allocation.tick_ms cannot be 0, the request loop would spin");
            contains_error = true;
        }

        if self.allocation.timeout == 0 {
            warn!("allocation.timeout is 0, every request round will count as a stall");
        }

        if self.launcher.threads == 0 {
            warn!("launcher.threads is 0. Falling back to a single launch thread");
            self.launcher.threads = 1;
        }

        if self.launcher.status_interval_ms == 0 {
            error!("launcher.status_interval_ms cannot be 0");
            contains_error = true;
        }

        if self.execute_timeout == 0 {
            error!("execute_timeout cannot be 0");
            contains_error = true;
        }

        for (name, dir) in [
            ("server_dir", &self.paths.server_dir),
            ("worker_dir", &self.paths.worker_dir),
        ] {
            if !dir.is_dir() {
                error!(
                    "paths.{name} must be a directory, found nothing at {}",
                    dir.to_string_lossy()
                );
                contains_error = true;

                continue;
            }

            let start_file = dir.join(&self.paths.start_file);

            match check_executable(&start_file) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Start file {} is not executable",
                        start_file.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to check paths.{name} start file {}: {e}",
                        start_file.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if self.paths.endpoint_list == self.paths.machine_list {
            error!(
                "paths.endpoint_list and paths.machine_list both point to {}",
                self.paths.endpoint_list
            );
            contains_error = true;
        }

        if let Some(ref credentials) = self.paths.credentials {
            if !credentials.is_file() {
                error!(
                    "paths.credentials does not point to a file: {}",
                    credentials.to_string_lossy()
                );
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_execute_timeout() -> u64 {
    30 * 24 * 60 * 60
}

fn default_allocate_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    10 * 60
}

fn default_tick() -> u64 {
    1000
}

fn default_start_wait() -> u64 {
    300
}

fn default_launch_threads() -> usize {
    30
}

fn default_status_interval() -> u64 {
    2000
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_start_file() -> String {
    String::from("start.sh")
}

fn default_endpoint_list() -> String {
    String::from("_endpointlist")
}

fn default_machine_list() -> String {
    String::from("_machinelist")
}
