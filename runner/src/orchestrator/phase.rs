use crate::slot::{Role, SlotKey};
use serde::Serialize;
use std::fmt;

/// job wide state of the orchestrator
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    New,
    AllocatingServers,
    AllocatingWorkers,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl Phase {
    /// no more allocation happens in a terminal phase
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }

    /// the role whose pending queue is drained in this phase
    pub fn allocating(&self) -> Option<Role> {
        match self {
            Self::AllocatingServers => Some(Role::Server),
            Self::AllocatingWorkers => Some(Role::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Numeric reason for a failed job, reported as the process exit code.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FailureCause {
    ExecuteTimeout = 2,
    ProcessFailed = 3,
    AllocationExhausted = 4,
    StartStalled = 5,
    ServerLost = 6,
    PrimaryLost = 7,
    ShutdownRequested = 8,
    ClusterError = 9,
    TopologyFailed = 10,
    Stopped = 11,
}

impl FailureCause {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExecuteTimeout => "execute timeout",
            Self::ProcessFailed => "process failed while running",
            Self::AllocationExhausted => "allocation exhausted",
            Self::StartStalled => "start stalled",
            Self::ServerLost => "server lost after topology was published",
            Self::PrimaryLost => "primary worker failed",
            Self::ShutdownRequested => "shutdown requested by cluster",
            Self::ClusterError => "cluster client error",
            Self::TopologyFailed => "failed to write topology",
            Self::Stopped => "stopped",
        })
    }
}

/// counters the transition rules look at
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub servers: usize,
    pub workers: usize,
    pub started_servers: usize,
    /// started workers, the primary worker is not counted
    pub started_workers: usize,
    pub succeeded_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    /// counters changed, see if the phase can advance
    Recheck,
    SlotFailed(SlotKey),
    Fatal(FailureCause),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub phase: Phase,
    pub cause: Option<FailureCause>,
}

impl Transition {
    fn to(phase: Phase) -> Self {
        Self { phase, cause: None }
    }

    fn fail(cause: FailureCause) -> Self {
        Self {
            phase: Phase::Failed,
            cause: Some(cause),
        }
    }
}

/// All phase rules in one place: `(phase, event, counters) -> next phase`.
pub fn transition(phase: Phase, event: Event, counters: &Counters) -> Transition {
    use Phase::*;

    match (phase, event) {
        (Stopped, _) => Transition::to(Stopped),
        (Succeeded | Failed, Event::Stop) => Transition::to(Stopped),
        (_, Event::Stop) => Transition {
            phase: Stopped,
            cause: Some(FailureCause::Stopped),
        },
        (Succeeded | Failed, _) => Transition::to(phase),
        (_, Event::Fatal(cause)) => Transition::fail(cause),
        (New, Event::Start) => Transition::to(AllocatingServers),
        (_, Event::Start) => Transition::to(phase),
        (New, _) => Transition::to(New),

        // the primary worker can never be requeued
        (_, Event::SlotFailed(key)) if key.is_primary() => {
            Transition::fail(FailureCause::PrimaryLost)
        }
        // workers may already depend on the published topology
        (AllocatingWorkers, Event::SlotFailed(key)) if key.role == Role::Server => {
            Transition::fail(FailureCause::ServerLost)
        }
        (Running, Event::SlotFailed(_)) => Transition::fail(FailureCause::ProcessFailed),
        (_, Event::SlotFailed(_)) => Transition::to(phase),

        (AllocatingServers, Event::Recheck) if counters.started_servers == counters.servers => {
            Transition::to(AllocatingWorkers)
        }
        (AllocatingWorkers, Event::Recheck)
            if counters.started_workers + 1 == counters.workers =>
        {
            Transition::to(Running)
        }
        (Running, Event::Recheck) if counters.succeeded_workers == counters.workers => {
            Transition::to(Succeeded)
        }
        (_, Event::Recheck) => Transition::to(phase),
    }
}
