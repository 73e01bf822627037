pub mod launch;
pub mod phase;

#[cfg(test)]
mod launch_test;

use crate::{
    cluster::{
        AllocationId, ClusterClient, LaunchSpec, ResourceHandle, ResourceProfile, EXIT_SUCCESS,
    },
    generator::{CommandGenerator, Topology},
    slot::{Role, Slot, SlotKey, SlotStatus},
};
use itertools::Itertools;
use launch::{LaunchError, Launcher, PrimaryRunner};
use parking_lot::{Condvar, Mutex, MutexGuard};
use phase::{transition, Counters, Event, FailureCause, Phase};
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Immutable description of the job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub servers: usize,
    pub workers: usize,
    pub profile: ResourceProfile,
    pub execute_timeout: Duration,
}

/// timing of the allocation loop
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// time a pending queue may go without progress before a cooldown
    pub allocate_timeout: Duration,
    pub max_retries: u32,
    pub cooldown: Duration,
    pub tick: Duration,
    /// time granted slots get to confirm once nothing is pending anymore
    pub start_wait: Duration,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job needs at least one server and one worker, got {servers}/{workers}")]
    EmptyJob { servers: usize, workers: usize },
    #[error("Orchestrator was already started")]
    AlreadyStarted,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("Failed to spawn allocation thread")]
    Spawn(#[source] io::Error),
}

/// cluster calls collected under the lock, performed after it is released
#[derive(Default)]
struct Effects {
    launches: Vec<(ResourceHandle, LaunchSpec)>,
    releases: Vec<AllocationId>,
    primary: Option<LaunchSpec>,
}

struct State {
    phase: Phase,
    cause: Option<FailureCause>,
    history: Vec<Phase>,
    servers: Vec<Slot>,
    workers: Vec<Slot>,
    pending_servers: VecDeque<usize>,
    pending_workers: VecDeque<usize>,
    by_handle: HashMap<ResourceHandle, SlotKey>,
    by_id: HashMap<AllocationId, SlotKey>,
    /// requests sent to the cluster and not answered yet
    requesting: usize,
    counters: Counters,
    topology: Option<Topology>,
    /// cooldowns taken over the whole job
    retries: u32,
}

impl State {
    fn new(spec: &JobSpec) -> Self {
        Self {
            phase: Phase::New,
            cause: None,
            history: vec![Phase::New],
            servers: (0..spec.servers)
                .map(|index| Slot::new(SlotKey::server(index)))
                .collect(),
            workers: (0..spec.workers)
                .map(|index| Slot::new(SlotKey::worker(index)))
                .collect(),
            pending_servers: (0..spec.servers).collect(),
            // worker 0 never goes through the cluster
            pending_workers: (1..spec.workers).collect(),
            by_handle: HashMap::new(),
            by_id: HashMap::new(),
            requesting: 0,
            counters: Counters {
                servers: spec.servers,
                workers: spec.workers,
                ..Counters::default()
            },
            topology: None,
            retries: 0,
        }
    }

    fn slot_mut(&mut self, key: SlotKey) -> &mut Slot {
        match key.role {
            Role::Server => &mut self.servers[key.index],
            Role::Worker => &mut self.workers[key.index],
        }
    }

    fn slot(&self, key: SlotKey) -> Option<&Slot> {
        match key.role {
            Role::Server => self.servers.get(key.index),
            Role::Worker => self.workers.get(key.index),
        }
    }

    fn pending_mut(&mut self, role: Role) -> &mut VecDeque<usize> {
        match role {
            Role::Server => &mut self.pending_servers,
            Role::Worker => &mut self.pending_workers,
        }
    }

    fn pending(&self, role: Role) -> &VecDeque<usize> {
        match role {
            Role::Server => &self.pending_servers,
            Role::Worker => &self.pending_workers,
        }
    }

    fn log_summary(&self) {
        debug!(
            phase = %self.phase,
            pending_servers = self.pending_servers.len(),
            pending_workers = self.pending_workers.len(),
            allocated = self.by_id.len(),
            requesting = self.requesting,
            counters = ?self.counters,
            "Orchestrator state"
        );
    }
}

struct Shared {
    spec: JobSpec,
    state: Mutex<State>,
    changed: Condvar,
    /// mirror of the succeeded counter so progress never takes the lock
    succeeded: AtomicUsize,
    cluster: Arc<dyn ClusterClient>,
    generator: CommandGenerator,
    launcher: Launcher,
    primary: Arc<dyn PrimaryRunner>,
    allocation_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Drives one job from resource requests to the final outcome.
///
/// All mutable state sits behind one lock. Cluster calls are only made after
/// the lock is released, callbacks may arrive on any thread.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn init(
        spec: JobSpec,
        cluster: Arc<dyn ClusterClient>,
        generator: CommandGenerator,
        primary: Arc<dyn PrimaryRunner>,
        launch_threads: usize,
        credentials: Option<Arc<[u8]>>,
    ) -> Result<Self, OrchestratorError> {
        if spec.servers == 0 || spec.workers == 0 {
            return Err(OrchestratorError::EmptyJob {
                servers: spec.servers,
                workers: spec.workers,
            });
        }

        let launcher = Launcher::new(launch_threads, cluster.clone(), credentials)?;

        info!(
            servers = spec.servers,
            workers = spec.workers,
            execute_timeout = ?spec.execute_timeout,
            "Initialized orchestrator"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new(&spec)),
                spec,
                changed: Condvar::new(),
                succeeded: AtomicUsize::new(0),
                cluster,
                generator,
                launcher,
                primary,
                allocation_thread: Mutex::new(None),
            }),
        })
    }

    pub fn spec(&self) -> &JobSpec {
        &self.shared.spec
    }

    /// Leave `New` and start the allocation loop on its own thread.
    #[instrument(skip(self), level = "info")]
    pub fn start(&self, policy: RetryPolicy) -> Result<(), OrchestratorError> {
        let mut effects = Effects::default();

        {
            let mut state = self.shared.state.lock();

            if state.phase != Phase::New {
                return Err(OrchestratorError::AlreadyStarted);
            }

            self.settle(&mut state, Event::Start, &mut effects);
        }

        self.apply(effects);

        let orchestrator = self.clone();
        let handle = thread::Builder::new()
            .name(String::from("allocator"))
            .spawn(move || orchestrator.allocation_loop(policy))
            .map_err(OrchestratorError::Spawn)?;

        *self.shared.allocation_thread.lock() = Some(handle);

        Ok(())
    }

    /// Request resources for the pending queue of the current phase until it
    /// is drained, stalls too often, or the job reaches a terminal phase.
    ///
    /// Each allocating phase gets `max_retries` cooldowns of its own.
    fn allocation_loop(&self, policy: RetryPolicy) {
        let mut current: Option<Role> = None;
        let mut attempts = 0;
        let mut stalled = Duration::ZERO;
        let mut idle_since: Option<Instant> = None;

        loop {
            let mut state = self.shared.state.lock();

            let Some(role) = state.phase.allocating() else {
                debug!(phase = %state.phase, "Allocation loop finished");
                break;
            };

            if current != Some(role) {
                info!("Starting {} {role}s", state.pending(role).len());
                current = Some(role);
                attempts = 0;
                stalled = Duration::ZERO;
                idle_since = None;
            }

            state.log_summary();

            let pending = state.pending(role).len();

            if pending == 0 {
                // everything is granted, wait for the slots to confirm
                let since = *idle_since.get_or_insert_with(Instant::now);

                if since.elapsed() > policy.start_wait {
                    error!(
                        "{role}s did not confirm within {:?}, giving up",
                        policy.start_wait
                    );
                    self.fail_locked(state, FailureCause::StartStalled);
                    break;
                }

                self.shared.changed.wait_for(&mut state, policy.tick);
                continue;
            }

            idle_since = None;

            if stalled > policy.allocate_timeout {
                if attempts >= policy.max_retries {
                    error!(
                        retries = attempts,
                        "Failed to allocate {pending} {role}s, no retries left"
                    );
                    self.fail_locked(state, FailureCause::AllocationExhausted);
                    break;
                }

                attempts += 1;
                state.retries += 1;
                stalled = Duration::ZERO;

                warn!(
                    retry = attempts,
                    "Allocating {role}s timed out after {:?}, retrying in {:?}",
                    policy.allocate_timeout,
                    policy.cooldown
                );

                let deadline = Instant::now() + policy.cooldown;

                while !state.phase.is_terminal() {
                    if self
                        .shared
                        .changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }

                continue;
            }

            let ask = pending.saturating_sub(state.requesting);
            state.requesting += ask;
            drop(state);

            if ask > 0 {
                debug!("Requesting {ask} resources for {role}s");
            }

            let mut failed = 0;

            for _ in 0..ask {
                if let Err(error) = self.shared.cluster.request_resource(&self.shared.spec.profile) {
                    warn!(error = ?error, "Failed to request resource: {error}");
                    failed += 1;
                }
            }

            let mut state = self.shared.state.lock();
            state.requesting = state.requesting.saturating_sub(failed);

            let started = Instant::now();
            self.shared.changed.wait_for(&mut state, policy.tick);
            stalled += started.elapsed();
        }
    }

    /// Assign granted resources to pending slots in FIFO order and release
    /// whatever is left over.
    pub fn put_resources(&self, handles: Vec<ResourceHandle>) {
        let mut effects = Effects::default();

        {
            let mut state = self.shared.state.lock();

            let (fresh, consumed): (Vec<_>, Vec<_>) = handles
                .into_iter()
                .partition(|handle| !state.by_id.contains_key(&handle.id));

            for handle in consumed {
                debug!(resource = %handle, "Ignoring resource that is already bound");
            }

            info!("Got {} resources", fresh.len());
            state.requesting = state.requesting.saturating_sub(fresh.len());

            let mut grants = VecDeque::from(fresh);

            while !grants.is_empty() {
                let Some(role) = state.phase.allocating() else {
                    break;
                };
                let Some(index) = state.pending_mut(role).pop_front() else {
                    break;
                };
                let Some(handle) = grants.pop_front() else {
                    break;
                };

                self.bind(&mut state, SlotKey { role, index }, handle, &mut effects);
            }

            for handle in grants {
                info!(resource = %handle, "Releasing resource, no slot is pending");
                effects.releases.push(handle.id);
            }
        }

        self.apply(effects);
    }

    fn bind(
        &self,
        state: &mut State,
        key: SlotKey,
        handle: ResourceHandle,
        effects: &mut Effects,
    ) {
        let slot = state.slot_mut(key);
        slot.status = SlotStatus::Starting;
        slot.handle = Some(handle.clone());

        state.by_handle.insert(handle.clone(), key);
        state.by_id.insert(handle.id.clone(), key);

        info!(slot = %key, resource = %handle, "Launching {key}");

        let generator = &self.shared.generator;
        let script = match (key.role, state.topology.as_ref()) {
            (Role::Server, _) => Some(generator.server_script(key.index, &handle.host)),
            (Role::Worker, Some(topology)) => Some(generator.worker_script(key.index, topology)),
            (Role::Worker, None) => None,
        };

        match script {
            Some(Ok(script)) => {
                state.slot_mut(key).script = Some(script.clone());

                let launch = self.shared.launcher.launch_spec(
                    key,
                    script,
                    generator.work_dir(key.role).to_path_buf(),
                );
                effects.launches.push((handle, launch));
            }
            Some(Err(error)) => {
                error!(slot = %key, error = ?error, "Failed to generate launch script: {error}");
                self.transit(state, key, SlotStatus::Failed, effects);
            }
            None => {
                error!(slot = %key, "No topology published yet, cannot launch worker");
                self.transit(state, key, SlotStatus::Failed, effects);
            }
        }
    }

    /// Apply a status report for an allocation.
    pub fn report_status(&self, id: &AllocationId, status: SlotStatus) {
        let mut effects = Effects::default();

        {
            let mut state = self.shared.state.lock();

            match state.by_id.get(id).copied() {
                Some(key) => self.transit(&mut state, key, status, &mut effects),
                None => warn!(allocation = %id, "Status {status} for unknown allocation"),
            }
        }

        self.apply(effects);
    }

    fn report_primary(&self, status: SlotStatus) {
        let mut effects = Effects::default();

        {
            let mut state = self.shared.state.lock();
            self.transit(&mut state, SlotKey::worker(0), status, &mut effects);
        }

        self.apply(effects);
    }

    fn transit(&self, state: &mut State, key: SlotKey, to: SlotStatus, effects: &mut Effects) {
        let slot = state.slot_mut(key);
        let from = slot.status;

        if from == to {
            return;
        }

        if from == SlotStatus::Succeeded {
            debug!(slot = %key, "Ignoring {to} for finished slot");
            return;
        }

        info!(slot = %key, from = %from, to = %to, "Slot status changed");

        let was_started = slot.has_started();
        slot.status = to;

        let mut unbound = None;

        if to == SlotStatus::Failed {
            unbound = slot.handle.take();
        }

        if let Some(ref handle) = unbound {
            state.by_handle.remove(handle);
            state.by_id.remove(&handle.id);
            effects.releases.push(handle.id.clone());
        }

        if !key.is_primary() {
            let started = match key.role {
                Role::Server => &mut state.counters.started_servers,
                Role::Worker => &mut state.counters.started_workers,
            };

            if to == SlotStatus::Failed && was_started {
                *started = started.saturating_sub(1);
            } else if !was_started && matches!(to, SlotStatus::Running | SlotStatus::Succeeded) {
                *started += 1;
            }
        }

        if to == SlotStatus::Succeeded && key.role == Role::Worker {
            state.counters.succeeded_workers += 1;
            self.shared
                .succeeded
                .store(state.counters.succeeded_workers, Ordering::SeqCst);
        }

        let event = if to == SlotStatus::Failed {
            Event::SlotFailed(key)
        } else {
            Event::Recheck
        };

        self.settle(state, event, effects);

        if to == SlotStatus::Failed && !key.is_primary() {
            if state.phase.allocating() == Some(key.role) {
                info!(slot = %key, "Requeued {key}");
                state.pending_mut(key.role).push_back(key.index);
            } else {
                debug!(slot = %key, phase = %state.phase, "Not requeueing {key}");
            }
        }

        self.shared.changed.notify_all();
    }

    /// Apply `event` and keep rechecking until the phase is stable.
    fn settle(&self, state: &mut State, event: Event, effects: &mut Effects) {
        let mut event = event;

        loop {
            let next = transition(state.phase, event, &state.counters);

            if next.phase == state.phase {
                break;
            }

            let from = state.phase;
            state.phase = next.phase;
            state.history.push(next.phase);

            if state.cause.is_none() {
                state.cause = next.cause;
            }

            match next.cause {
                Some(cause) => error!(from = %from, to = %next.phase, cause = %cause, "Job phase changed"),
                None => info!(from = %from, to = %next.phase, "Job phase changed"),
            }

            self.shared.changed.notify_all();

            event = self.on_enter(state, effects).unwrap_or(Event::Recheck);
        }
    }

    /// side effects of entering a phase, may return a follow up event
    fn on_enter(&self, state: &mut State, effects: &mut Effects) -> Option<Event> {
        match state.phase {
            Phase::AllocatingWorkers => {
                let servers = state
                    .servers
                    .iter()
                    .filter_map(|slot| {
                        slot.handle
                            .as_ref()
                            .map(|handle| (slot.index(), handle.host.clone()))
                    })
                    .collect_vec();

                let topology = match self.shared.generator.write_topology(&servers) {
                    Ok(topology) => topology,
                    Err(error) => {
                        error!(error = ?error, "Failed to publish topology: {error}");
                        return Some(Event::Fatal(FailureCause::TopologyFailed));
                    }
                };

                // outstanding server requests are answered with releases from here on
                state.requesting = 0;

                let script = self.shared.generator.worker_script(0, &topology);
                state.topology = Some(topology);

                match script {
                    Ok(script) => {
                        let primary = state.slot_mut(SlotKey::worker(0));
                        primary.status = SlotStatus::Starting;
                        primary.script = Some(script.clone());

                        effects.primary = Some(self.shared.launcher.launch_spec(
                            SlotKey::worker(0),
                            script,
                            self.shared.generator.work_dir(Role::Worker).to_path_buf(),
                        ));

                        None
                    }
                    Err(error) => {
                        error!(error = ?error, "Failed to generate primary launch script: {error}");
                        Some(Event::Fatal(FailureCause::PrimaryLost))
                    }
                }
            }
            Phase::Running => {
                info!("All workers started, waiting for them to finish");
                None
            }
            Phase::Succeeded => {
                info!("All workers succeeded");
                None
            }
            _ => None,
        }
    }

    /// perform the cluster calls collected under the lock
    fn apply(&self, effects: Effects) {
        let Effects {
            launches,
            releases,
            primary,
        } = effects;

        for id in releases {
            if let Err(error) = self.shared.cluster.release_resource(&id) {
                warn!(allocation = %id, error = ?error, "Failed to release resource: {error}");
            }
        }

        for (handle, launch) in launches {
            let orchestrator = self.clone();
            let id = handle.id.clone();

            self.shared.launcher.dispatch(handle, launch, move |_| {
                orchestrator.report_status(&id, SlotStatus::Failed)
            });
        }

        if let Some(launch) = primary {
            self.launch_primary(launch);
        }
    }

    fn launch_primary(&self, launch: LaunchSpec) {
        let started = self.clone();
        let finished = self.clone();

        info!("Launching primary worker");

        let spawned = self.shared.launcher.spawn_primary(
            self.shared.primary.clone(),
            launch,
            move || started.report_primary(SlotStatus::Running),
            move |result| {
                let status = match result {
                    Ok(EXIT_SUCCESS) => SlotStatus::Succeeded,
                    Ok(code) => {
                        error!(exit_code = code, "Primary worker exited with {code}");
                        SlotStatus::Failed
                    }
                    Err(error) => {
                        error!(error = ?error, "Primary worker failed: {error}");
                        SlotStatus::Failed
                    }
                };

                finished.report_primary(status);
            },
        );

        if let Err(error) = spawned {
            error!(error = ?error, "Failed to launch primary worker: {error}");
            self.report_primary(SlotStatus::Failed);
        }
    }

    /// Fail the job unless it already reached a terminal phase.
    pub fn fail(&self, cause: FailureCause) {
        let state = self.shared.state.lock();
        self.fail_locked(state, cause);
    }

    fn fail_locked(&self, mut state: MutexGuard<'_, State>, cause: FailureCause) {
        let mut effects = Effects::default();
        self.settle(&mut state, Event::Fatal(cause), &mut effects);
        drop(state);

        self.apply(effects);
    }

    /// Block until the job is terminal, failing it once `timeout` has passed.
    pub fn await_completion(&self, timeout: Duration) -> Phase {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        while !state.phase.is_terminal() {
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                error!("Job did not finish within {timeout:?}");
                self.fail_locked(state, FailureCause::ExecuteTimeout);

                return self.phase();
            }
        }

        state.phase
    }

    /// Move to `Stopped` and tear everything down.
    ///
    /// Bound resources are released, the primary worker is signalled and
    /// outstanding launches get `drain` to finish.
    #[instrument(skip(self), level = "info")]
    pub fn stop(&self, drain: Duration) {
        let bound = {
            let mut state = self.shared.state.lock();
            let mut effects = Effects::default();

            self.settle(&mut state, Event::Stop, &mut effects);
            state.by_handle.clear();

            state.by_id.drain().map(|(id, _)| id).collect_vec()
        };

        if let Some(handle) = self.shared.allocation_thread.lock().take() {
            if handle.join().is_err() {
                error!("Allocation thread panicked");
            }
        }

        self.shared.primary.stop();

        if !self.shared.launcher.drain(drain) {
            warn!("Stopped with launches still outstanding");
        }

        for id in bound {
            if let Err(error) = self.shared.cluster.release_resource(&id) {
                warn!(allocation = %id, error = ?error, "Failed to release resource: {error}");
            }
        }

        info!("Orchestrator stopped");
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn cause(&self) -> Option<FailureCause> {
        self.shared.state.lock().cause
    }

    /// succeeded workers over all workers, never takes the lock
    pub fn progress(&self) -> f32 {
        let workers = self.shared.spec.workers.max(1);

        self.shared.succeeded.load(Ordering::SeqCst) as f32 / workers as f32
    }

    pub fn phase_history(&self) -> Vec<Phase> {
        self.shared.state.lock().history.clone()
    }

    pub fn topology(&self) -> Option<Topology> {
        self.shared.state.lock().topology.clone()
    }

    pub fn retries(&self) -> u32 {
        self.shared.state.lock().retries
    }

    pub fn requesting(&self) -> usize {
        self.shared.state.lock().requesting
    }

    pub fn counters(&self) -> Counters {
        self.shared.state.lock().counters
    }

    pub fn slot(&self, key: SlotKey) -> Option<Slot> {
        self.shared.state.lock().slot(key).cloned()
    }

    pub fn pending(&self, role: Role) -> Vec<usize> {
        self.shared
            .state
            .lock()
            .pending(role)
            .iter()
            .copied()
            .collect()
    }

    /// slot bound to the given allocation, if any
    pub fn lookup(&self, id: &AllocationId) -> Option<SlotKey> {
        self.shared.state.lock().by_id.get(id).copied()
    }

    /// slot bound to the given handle, if any
    pub fn lookup_handle(&self, handle: &ResourceHandle) -> Option<SlotKey> {
        self.shared.state.lock().by_handle.get(handle).copied()
    }
}
