use super::{
    signal_group, AllocationId, ClusterClient, ClusterError, CompletedResource, LaunchSpec,
    Listeners, ProcessStatus, ResourceHandle, ResourceProfile, EXIT_ABORTED,
};
use crate::config::{ConfigErrors, LauncherConfig};
use itertools::Itertools;
use nix::sys::signal::Signal;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    os::unix::{fs::PermissionsExt, process::CommandExt},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// name of this machine, handed out as the host of every local grant
pub static HOSTNAME: Lazy<String> = Lazy::new(|| {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| String::from("localhost"))
});

/// environment variable pointing a process at its credentials file
pub const CREDENTIALS_ENV: &str = "PSJOB_CREDENTIALS";

/// exit code of a child, signal kills count as aborted
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_ABORTED)
}

/// one granted slot on this machine
struct Grant {
    handle: ResourceHandle,
    child: Option<Child>,
    exit: Option<i32>,
}

impl Grant {
    /// non blocking check of the child, remembers the exit code
    fn poll(&mut self) -> Result<Option<i32>, ClusterError> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }

        if let Some(ref mut child) = self.child {
            match child.try_wait() {
                Ok(Some(status)) => self.exit = Some(exit_code(status)),
                Ok(None) => {}
                Err(error) => return Err(ClusterError::Status(error.to_string())),
            }
        }

        Ok(self.exit)
    }

    /// kill the child's process group and wait for the child at most `grace`
    fn kill(&mut self, grace: Duration) {
        if let Some(ref mut child) = self.child {
            if self.exit.is_some() {
                return;
            }

            if let Err(error) = signal_group(child.id(), Signal::SIGKILL) {
                debug!(allocation = %self.handle.id, error = ?error, "Failed to kill process group");

                if let Err(error) = child.kill() {
                    debug!(allocation = %self.handle.id, error = ?error, "Failed to kill process");
                }
            }

            match child.wait_timeout(grace) {
                Ok(Some(status)) => self.exit = Some(exit_code(status)),
                Ok(None) => warn!(allocation = %self.handle.id, "Process did not exit after {grace:?}"),
                Err(error) => warn!(allocation = %self.handle.id, error = ?error, "Failed to reap process"),
            }
        }
    }
}

#[derive(Default)]
struct LocalState {
    listeners: Option<Listeners>,
    /// requests not granted yet
    requested: usize,
    next_id: u64,
    granted: HashMap<AllocationId, Grant>,
    /// exit codes of completed allocations, kept for late status queries
    finished: HashMap<AllocationId, i32>,
    progress: f32,
    stopped: bool,
}

struct Inner {
    capacity: usize,
    heartbeat: Duration,
    grace: Duration,
    host: String,
    base_port: u16,
    log_dir: Option<PathBuf>,
    state: Mutex<LocalState>,
    wake: Condvar,
}

/// Cluster client that runs every granted slot as a child process on this
/// machine.
///
/// Grants are issued on a heartbeat up to `capacity` concurrently held
/// allocations, completions are reaped on the same heartbeat.
pub struct LocalCluster {
    inner: Arc<Inner>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

fn parameter<T>(
    parameters: &BTreeMap<String, serde_yaml::Value>,
    name: &str,
    convert: impl Fn(&serde_yaml::Value) -> Option<T>,
    default: T,
) -> Result<T, ConfigErrors> {
    match parameters.get(name) {
        Some(value) => {
            convert(value).ok_or_else(|| ConfigErrors::InvalidClusterParameter(name.to_string()))
        }
        None => Ok(default),
    }
}

impl LocalCluster {
    pub fn load(config: &LauncherConfig) -> Result<Self, ConfigErrors> {
        let parameters = &config.cluster.parameter;

        let capacity = parameter(
            parameters,
            "capacity",
            |value| value.as_u64().and_then(|number| usize::try_from(number).ok()),
            config.job.servers + config.job.workers,
        )?;
        let heartbeat = parameter(parameters, "heartbeat_ms", |value| value.as_u64(), 1000)?;
        let grace = parameter(parameters, "grace_ms", |value| value.as_u64(), 5000)?;
        let host = parameter(
            parameters,
            "host",
            |value| value.as_str().map(String::from),
            HOSTNAME.to_string(),
        )?;
        let base_port = parameter(
            parameters,
            "base_port",
            |value| value.as_u64().and_then(|number| u16::try_from(number).ok()),
            20000,
        )?;
        let log_dir = parameter(
            parameters,
            "log_dir",
            |value| value.as_str().map(|path| Some(PathBuf::from(path))),
            None,
        )?;

        if capacity == 0 {
            return Err(ConfigErrors::InvalidClusterParameter(String::from(
                "capacity",
            )));
        }

        if heartbeat == 0 {
            return Err(ConfigErrors::InvalidClusterParameter(String::from(
                "heartbeat_ms",
            )));
        }

        debug!(
            capacity = capacity,
            heartbeat_ms = heartbeat,
            host = %host,
            "Loaded local cluster"
        );

        Ok(Self::new(
            capacity,
            Duration::from_millis(heartbeat),
            Duration::from_millis(grace),
            host,
            base_port,
            log_dir,
        ))
    }

    pub fn new(
        capacity: usize,
        heartbeat: Duration,
        grace: Duration,
        host: String,
        base_port: u16,
        log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                heartbeat,
                grace,
                host,
                base_port,
                log_dir,
                state: Mutex::new(LocalState::default()),
                wake: Condvar::new(),
            }),
            heartbeat: Mutex::new(None),
        }
    }

    /// progress last pulled from the allocation listener
    #[cfg(test)]
    pub fn progress(&self) -> f32 {
        self.inner.state.lock().progress
    }

    /// allocations currently held
    #[cfg(test)]
    pub fn granted(&self) -> usize {
        self.inner.state.lock().granted.len()
    }

    /// stdout and stderr of the process, both go to the log file if one is set
    fn open_log(&self, launch: &LaunchSpec) -> (Stdio, Stdio) {
        let Some(ref log_dir) = self.inner.log_dir else {
            return (Stdio::null(), Stdio::null());
        };

        let path = log_dir.join(format!("{}.log", launch.slot.script_name()));

        match fs::create_dir_all(log_dir)
            .and_then(|_| File::create(&path))
            .and_then(|file| Ok((file.try_clone()?, file)))
        {
            Ok((stdout, stderr)) => (Stdio::from(stdout), Stdio::from(stderr)),
            Err(error) => {
                warn!(path = ?path, error = ?error, "Failed to open process log");
                (Stdio::null(), Stdio::null())
            }
        }
    }

    /// store the credential blob next to the script, readable by the owner only
    fn write_credentials(launch: &LaunchSpec) -> Result<Option<PathBuf>, ClusterError> {
        let Some(ref credentials) = launch.credentials else {
            return Ok(None);
        };

        let path = launch.script.with_extension("credentials");

        fs::write(&path, credentials)
            .and_then(|_| fs::set_permissions(&path, fs::Permissions::from_mode(0o600)))
            .map_err(|error| ClusterError::Spawn(error.to_string()))?;

        Ok(Some(path))
    }
}

impl ClusterClient for LocalCluster {
    fn register(&self, listeners: Listeners) -> Result<(), ClusterError> {
        {
            let mut state = self.inner.state.lock();

            if state.stopped {
                return Err(ClusterError::NotRunning);
            }

            state.listeners = Some(listeners);
        }

        let mut heartbeat = self.heartbeat.lock();

        if heartbeat.is_none() {
            let inner = self.inner.clone();

            *heartbeat = Some(
                thread::Builder::new()
                    .name(String::from("local-heartbeat"))
                    .spawn(move || heartbeat_loop(&inner))
                    .map_err(|error| ClusterError::Transport(error.to_string()))?,
            );
        }

        info!(host = %self.inner.host, "Registered with local cluster");

        Ok(())
    }

    fn request_resource(&self, profile: &ResourceProfile) -> Result<(), ClusterError> {
        let mut state = self.inner.state.lock();

        if state.stopped {
            return Err(ClusterError::NotRunning);
        }

        trace!(profile = ?profile, "Resource requested");
        state.requested += 1;

        Ok(())
    }

    fn release_resource(&self, id: &AllocationId) -> Result<(), ClusterError> {
        let grant = self.inner.state.lock().granted.remove(id);

        let Some(mut grant) = grant else {
            return Ok(());
        };

        debug!(allocation = %id, "Releasing resource");
        grant.kill(self.inner.grace);

        Ok(())
    }

    #[instrument(skip(self, launch), fields(slot = %launch.slot))]
    fn start_process(
        &self,
        handle: &ResourceHandle,
        launch: &LaunchSpec,
    ) -> Result<(), ClusterError> {
        let credentials = Self::write_credentials(launch)?;
        let (stdout, stderr) = self.open_log(launch);

        let listeners = {
            let mut state = self.inner.state.lock();

            if state.stopped {
                return Err(ClusterError::NotRunning);
            }

            let grant = state
                .granted
                .get_mut(&handle.id)
                .ok_or_else(|| ClusterError::UnknownAllocation(handle.id.clone()))?;

            if grant.child.is_some() {
                return Err(ClusterError::Spawn(format!(
                    "{} already runs a process",
                    handle.id
                )));
            }

            let mut command = Command::new("sh");
            command
                .arg(&launch.script)
                .current_dir(&launch.work_dir)
                .process_group(0)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr);

            if let Some(ref path) = credentials {
                command.env(CREDENTIALS_ENV, path);
            }

            let child = command
                .spawn()
                .map_err(|error| ClusterError::Spawn(error.to_string()))?;

            debug!(allocation = %handle.id, pid = child.id(), "Spawned process");
            grant.child = Some(child);

            state.listeners.clone()
        };

        if let Some(listeners) = listeners {
            listeners.process.on_process_started(&handle.id);
        }

        Ok(())
    }

    fn query_status(&self, id: &AllocationId) {
        let (listeners, status) = {
            let mut state = self.inner.state.lock();

            let status = match state.granted.get_mut(id) {
                Some(grant) => grant.poll().map(|exit| match exit {
                    Some(code) => ProcessStatus::complete(code),
                    None => ProcessStatus::running(),
                }),
                None => match state.finished.get(id) {
                    Some(code) => Ok(ProcessStatus::complete(*code)),
                    None => Err(ClusterError::UnknownAllocation(id.clone())),
                },
            };

            (state.listeners.clone(), status)
        };

        let Some(listeners) = listeners else {
            return;
        };

        match status {
            Ok(status) => listeners.process.on_status_received(id, status),
            Err(error) => listeners.process.on_status_error(id, error),
        }
    }

    #[instrument(skip(self), level = "info")]
    fn stop(&self) {
        let (mut grants, progress) = {
            let mut state = self.inner.state.lock();

            if state.stopped {
                return;
            }

            state.stopped = true;
            state.listeners = None;
            self.inner.wake.notify_all();

            let grants = state.granted.drain().map(|(_, grant)| grant).collect_vec();

            (grants, state.progress)
        };

        for grant in grants.iter_mut() {
            grant.kill(self.inner.grace);
        }

        if let Some(heartbeat) = self.heartbeat.lock().take() {
            // stop may be called from a listener running on the heartbeat
            if heartbeat.thread().id() != thread::current().id() && heartbeat.join().is_err() {
                error!("Local heartbeat thread panicked");
            }
        }

        info!(
            progress = progress,
            "Stopped local cluster with {} processes killed",
            grants.len()
        );
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Issue grants, reap completions and pull progress once per heartbeat.
fn heartbeat_loop(inner: &Inner) {
    let mut state = inner.state.lock();

    while !state.stopped {
        let free = inner.capacity.saturating_sub(state.granted.len());
        let grant_count = state.requested.min(free);
        state.requested -= grant_count;

        let mut allocated = Vec::with_capacity(grant_count);

        for _ in 0..grant_count {
            state.next_id += 1;

            let id = state.next_id;
            let port = inner
                .base_port
                .wrapping_add(u16::try_from(id % u64::from(u16::MAX)).unwrap_or_default());
            let handle = ResourceHandle::new(format!("local_{id:06}"), inner.host.clone(), port);

            state.granted.insert(
                handle.id.clone(),
                Grant {
                    handle: handle.clone(),
                    child: None,
                    exit: None,
                },
            );
            allocated.push(handle);
        }

        let mut completed = Vec::new();

        for grant in state.granted.values_mut() {
            match grant.poll() {
                Ok(Some(exit_code)) => completed.push(CompletedResource {
                    id: grant.handle.id.clone(),
                    exit_code,
                    diagnostics: format!("process exited with {exit_code}"),
                }),
                Ok(None) => {}
                Err(error) => warn!(allocation = %grant.handle.id, error = ?error, "Failed to poll process"),
            }
        }

        for resource in completed.iter() {
            state.granted.remove(&resource.id);
            state.finished.insert(resource.id.clone(), resource.exit_code);
        }

        let listeners = state.listeners.clone();
        drop(state);

        if let Some(listeners) = listeners {
            if !allocated.is_empty() {
                debug!("Granting {} resources", allocated.len());
                listeners.allocation.on_resources_allocated(allocated);
            }

            if !completed.is_empty() {
                listeners.allocation.on_resources_completed(completed);
            }

            let progress = listeners.allocation.progress();
            inner.state.lock().progress = progress;
            trace!(progress = progress, "Heartbeat");
        }

        state = inner.state.lock();

        if !state.stopped {
            inner.wake.wait_for(&mut state, inner.heartbeat);
        }
    }

    debug!("Local heartbeat stopped");
}
