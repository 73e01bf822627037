use crate::{
    cluster::{
        signal_group, ClusterClient, ClusterError, LaunchSpec, ResourceHandle, EXIT_ABORTED,
    },
    generator::GeneratorError,
    slot::SlotKey,
};
use nix::sys::signal::Signal;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    io,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to build launch pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to generate launch script")]
    Script(#[from] GeneratorError),
    #[error("Failed to spawn process")]
    Spawn(#[source] io::Error),
    #[error("Cluster rejected the start request")]
    Start(#[from] ClusterError),
}

/// Runs the primary worker, which is started directly instead of through a
/// cluster allocation.
pub trait PrimaryRunner: Send + Sync {
    /// run the process to completion and return its exit code,
    /// `started` is called once the process is up
    fn run(&self, launch: &LaunchSpec, started: &dyn Fn()) -> Result<i32, LaunchError>;

    /// ask a running process to terminate
    fn stop(&self) {}
}

/// Runs the primary worker's launch script with `sh` on this host.
#[derive(Debug, Default)]
pub struct ShellRunner {
    pid: Mutex<Option<u32>>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrimaryRunner for ShellRunner {
    fn run(&self, launch: &LaunchSpec, started: &dyn Fn()) -> Result<i32, LaunchError> {
        let mut child = Command::new("sh")
            .arg(&launch.script)
            .current_dir(&launch.work_dir)
            .process_group(0)
            .stdin(Stdio::null())
            .spawn()
            .map_err(LaunchError::Spawn)?;

        *self.pid.lock() = Some(child.id());
        info!(pid = child.id(), "Primary worker started");
        started();

        let status = child.wait().map_err(LaunchError::Spawn);
        *self.pid.lock() = None;

        Ok(status?.code().unwrap_or(EXIT_ABORTED))
    }

    fn stop(&self) {
        if let Some(pid) = *self.pid.lock() {
            if let Err(error) = signal_group(pid, Signal::SIGTERM) {
                warn!(pid = pid, error = ?error, "Failed to signal primary worker");
            }
        }
    }
}

/// counts launch tasks that have not finished yet
#[derive(Debug, Default)]
struct Outstanding {
    count: Mutex<usize>,
    done: Condvar,
}

/// decrements the outstanding count even if the task panics
struct TaskGuard(Arc<Outstanding>);

impl TaskGuard {
    fn new(outstanding: &Arc<Outstanding>) -> Self {
        *outstanding.count.lock() += 1;

        Self(outstanding.clone())
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count = count.saturating_sub(1);

        if *count == 0 {
            self.0.done.notify_all();
        }
    }
}

/// Dispatches start requests onto a bounded pool so that a slow start call
/// never blocks the thread that reported the grant.
pub struct Launcher {
    pool: ThreadPool,
    cluster: Arc<dyn ClusterClient>,
    credentials: Option<Arc<[u8]>>,
    outstanding: Arc<Outstanding>,
}

impl Launcher {
    pub fn new(
        threads: usize,
        cluster: Arc<dyn ClusterClient>,
        credentials: Option<Arc<[u8]>>,
    ) -> Result<Self, LaunchError> {
        debug!("Starting launch pool with {threads} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|index| format!("launcher-{index}"))
            .build()?;

        Ok(Self {
            pool,
            cluster,
            credentials,
            outstanding: Arc::new(Outstanding::default()),
        })
    }

    pub fn launch_spec(&self, slot: SlotKey, script: PathBuf, work_dir: PathBuf) -> LaunchSpec {
        LaunchSpec {
            slot,
            script,
            work_dir,
            credentials: self.credentials.clone(),
        }
    }

    /// submit the start request, `on_error` runs on the pool if it is rejected
    pub fn dispatch<F>(&self, handle: ResourceHandle, launch: LaunchSpec, on_error: F)
    where
        F: FnOnce(LaunchError) + Send + 'static,
    {
        let guard = TaskGuard::new(&self.outstanding);
        let cluster = self.cluster.clone();

        self.pool.spawn(move || {
            let _guard = guard;

            info!(
                slot = %launch.slot,
                resource = %handle,
                "Setting up process for {}",
                launch.slot
            );

            if let Err(error) = cluster.start_process(&handle, &launch) {
                error!(slot = %launch.slot, error = ?error, "Failed to start process: {error}");
                on_error(error.into());
            }
        });
    }

    /// Run the primary worker on a dedicated thread, it lives as long as the job.
    pub fn spawn_primary<S, F>(
        &self,
        runner: Arc<dyn PrimaryRunner>,
        launch: LaunchSpec,
        started: S,
        finished: F,
    ) -> Result<(), LaunchError>
    where
        S: Fn() + Send + 'static,
        F: FnOnce(Result<i32, LaunchError>) + Send + 'static,
    {
        let guard = TaskGuard::new(&self.outstanding);

        thread::Builder::new()
            .name(String::from("primary-worker"))
            .spawn(move || {
                let _guard = guard;

                finished(runner.run(&launch, &started));
            })
            .map(|_| ())
            .map_err(LaunchError::Spawn)
    }

    /// Wait for outstanding launches, returns false if the timeout was hit.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.outstanding.count.lock();

        while *count > 0 {
            if self
                .outstanding
                .done
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                warn!("{} launch tasks still running after {timeout:?}", *count);

                return *count == 0;
            }
        }

        true
    }
}
