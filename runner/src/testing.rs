//! Test doubles shared by the unit tests.

use crate::{
    cluster::{
        AllocationId, ClusterClient, ClusterError, LaunchSpec, Listeners, ResourceHandle,
        ResourceProfile, EXIT_ABORTED,
    },
    config::{AllocationConfig, ClusterConfig, JobConfig, LaunchConfig, LauncherConfig, PathsConfig},
    generator::CommandGenerator,
    orchestrator::{launch::LaunchError, launch::PrimaryRunner, Orchestrator, RetryPolicy},
    slot::SlotKey,
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tempfile::TempDir;

/// poll `condition` until it holds, gives up after five seconds
pub fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(5));
    }

    condition()
}

/// pid the script wrote to `file`, once it is there
pub fn read_pid(file: &Path) -> u32 {
    assert!(eventually(|| fs::read_to_string(file)
        .map(|content| content.ends_with('\n'))
        .unwrap_or(false)));

    fs::read_to_string(file).unwrap().trim().parse().unwrap()
}

/// whether `pid` is a live process, zombies count as gone
pub fn alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// cluster client that only records what it was asked to do
#[derive(Default)]
pub struct RecordingCluster {
    pub requests: AtomicUsize,
    pub releases: Mutex<Vec<AllocationId>>,
    pub starts: Mutex<Vec<(ResourceHandle, SlotKey)>>,
    pub queries: Mutex<Vec<AllocationId>>,
    pub stopped: AtomicBool,
    pub reject_starts: AtomicBool,
    pub listeners: Mutex<Option<Listeners>>,
}

impl RecordingCluster {
    pub fn released(&self, id: &str) -> bool {
        self.releases.lock().contains(&AllocationId::from(id))
    }

    pub fn started(&self) -> Vec<SlotKey> {
        self.starts.lock().iter().map(|(_, slot)| *slot).collect()
    }
}

impl ClusterClient for RecordingCluster {
    fn register(&self, listeners: Listeners) -> Result<(), ClusterError> {
        *self.listeners.lock() = Some(listeners);
        Ok(())
    }

    fn request_resource(&self, _profile: &ResourceProfile) -> Result<(), ClusterError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release_resource(&self, id: &AllocationId) -> Result<(), ClusterError> {
        self.releases.lock().push(id.clone());
        Ok(())
    }

    fn start_process(
        &self,
        handle: &ResourceHandle,
        launch: &LaunchSpec,
    ) -> Result<(), ClusterError> {
        if self.reject_starts.load(Ordering::SeqCst) {
            return Err(ClusterError::Spawn(String::from("rejected")));
        }

        self.starts.lock().push((handle.clone(), launch.slot));
        Ok(())
    }

    fn query_status(&self, id: &AllocationId) {
        self.queries.lock().push(id.clone());
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.listeners.lock().take();
    }
}

/// primary runner whose exit code is decided by the test
#[derive(Default)]
pub struct ManualRunner {
    exit: Mutex<Option<i32>>,
    changed: Condvar,
    pub runs: AtomicUsize,
}

impl ManualRunner {
    pub fn finish(&self, code: i32) {
        *self.exit.lock() = Some(code);
        self.changed.notify_all();
    }
}

impl PrimaryRunner for ManualRunner {
    fn run(&self, _launch: &LaunchSpec, started: &dyn Fn()) -> Result<i32, LaunchError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        started();

        let mut exit = self.exit.lock();

        loop {
            if let Some(code) = *exit {
                return Ok(code);
            }

            self.changed.wait(&mut exit);
        }
    }

    fn stop(&self) {
        self.finish(EXIT_ABORTED);
    }
}

/// a config whose directories live in `dir`, with an executable start file
pub fn config(dir: &Path, servers: usize, workers: usize) -> LauncherConfig {
    let server_dir = dir.join("server");
    let worker_dir = dir.join("worker");

    for work_dir in [&server_dir, &worker_dir] {
        fs::create_dir_all(work_dir).unwrap();

        let start_file = work_dir.join("start.sh");
        fs::write(&start_file, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&start_file, fs::Permissions::from_mode(0o755)).unwrap();
    }

    LauncherConfig {
        job: JobConfig {
            servers,
            workers,
            process: ResourceProfile {
                memory: 1024,
                cores: 1,
            },
            port: 9000,
            server_args: String::new(),
            worker_args: String::from("--epochs 3"),
        },
        allocation: AllocationConfig::default(),
        execute_timeout: 60,
        launcher: LaunchConfig {
            threads: 4,
            ..LaunchConfig::default()
        },
        paths: PathsConfig {
            scripts: dir.join("scripts"),
            server_dir,
            worker_dir,
            start_file: String::from("start.sh"),
            endpoint_list: String::from("_endpointlist"),
            machine_list: String::from("_machinelist"),
            credentials: None,
        },
        cluster: ClusterConfig {
            name: String::from("local"),
            parameter: BTreeMap::new(),
        },
        verbose: false,
    }
}

/// fast loop timing, nothing times out unless a test asks for it
pub fn policy() -> RetryPolicy {
    RetryPolicy {
        allocate_timeout: Duration::from_secs(30),
        max_retries: 3,
        cooldown: Duration::from_millis(10),
        tick: Duration::from_millis(5),
        start_wait: Duration::from_secs(30),
    }
}

pub fn handle(id: &str) -> ResourceHandle {
    ResourceHandle::new(id, "127.0.0.1", 8042)
}

/// an orchestrator wired to a recording cluster and a manual primary runner
pub struct Harness {
    pub dir: TempDir,
    pub config: LauncherConfig,
    pub cluster: Arc<RecordingCluster>,
    pub primary: Arc<ManualRunner>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(servers: usize, workers: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), servers, workers);
        let cluster = Arc::new(RecordingCluster::default());
        let primary = Arc::new(ManualRunner::default());

        let orchestrator = Orchestrator::init(
            config.job_spec(),
            cluster.clone(),
            CommandGenerator::load(&config),
            primary.clone(),
            config.launcher.threads,
            None,
        )
        .unwrap();

        Self {
            dir,
            config,
            cluster,
            primary,
            orchestrator,
        }
    }

    pub fn start(&self) {
        self.orchestrator.start(policy()).unwrap();
    }

    /// wait until the allocation loop asked for at least `count` resources
    pub fn await_requests(&self, count: usize) {
        assert!(eventually(|| self.cluster.requests.load(Ordering::SeqCst) >= count));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.orchestrator.stop(Duration::from_secs(1));
    }
}
