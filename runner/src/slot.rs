use crate::cluster::ResourceHandle;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// the two roles of a parameter-server job
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Server,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("Server"),
            Self::Worker => f.write_str("Worker"),
        }
    }
}

/// lifecycle of a single slot
/// `Null -> Starting -> {Running, Succeeded} | Failed`
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Null,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// stable identity of a slot, (role, index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub role: Role,
    pub index: usize,
}

impl SlotKey {
    pub fn server(index: usize) -> Self {
        Self {
            role: Role::Server,
            index,
        }
    }

    pub fn worker(index: usize) -> Self {
        Self {
            role: Role::Worker,
            index,
        }
    }

    /// worker 0 is started by the launcher itself and never queued
    pub fn is_primary(&self) -> bool {
        self.role == Role::Worker && self.index == 0
    }

    /// file name of the generated launch script, e.g. `_server3.sh`
    pub fn script_name(&self) -> String {
        format!("_{}{}.sh", self.role.as_str(), self.index)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.role, self.index)
    }
}

/// One role instance tracked by the orchestrator.
///
/// Slots are only ever mutated while the orchestrator lock is held.
#[derive(Debug, Clone)]
pub struct Slot {
    pub key: SlotKey,
    pub status: SlotStatus,
    pub handle: Option<ResourceHandle>,
    pub script: Option<PathBuf>,
}

impl Slot {
    pub fn new(key: SlotKey) -> Self {
        Self {
            key,
            status: SlotStatus::Null,
            handle: None,
            script: None,
        }
    }

    pub fn index(&self) -> usize {
        self.key.index
    }

    /// whether this slot has been counted as started, i.e. it left `Starting`
    /// for a live state
    pub fn has_started(&self) -> bool {
        matches!(self.status, SlotStatus::Running | SlotStatus::Succeeded)
    }
}
