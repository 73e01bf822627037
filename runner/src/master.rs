use crate::{
    cluster::{ClusterClient, ClusterError, Clusters},
    config::{ConfigErrors, LauncherConfig},
    generator::CommandGenerator,
    handlers::{self, poller::StatusPoller},
    orchestrator::{
        launch::{PrimaryRunner, ShellRunner},
        phase::{FailureCause, Phase},
        Orchestrator, OrchestratorError,
    },
};
use std::{fmt, io, sync::Arc};
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("Failed to register with the cluster")]
    Register(#[from] ClusterError),
    #[error("Failed to start status poller")]
    Poller(#[source] io::Error),
}

/// final result of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub phase: Phase,
    pub cause: Option<FailureCause>,
}

impl Outcome {
    /// `0` on success, the failure cause otherwise
    pub fn exit_code(&self) -> i32 {
        match (self.phase, self.cause) {
            (Phase::Succeeded, _) => 0,
            (_, Some(cause)) => cause.code(),
            (_, None) => FailureCause::Stopped.code(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause {
            Some(cause) => write!(f, "{} ({cause})", self.phase),
            None => write!(f, "{}", self.phase),
        }
    }
}

/// Owns one job from registration with the cluster to teardown.
pub struct ApplicationMaster {
    config: LauncherConfig,
    cluster: Arc<dyn ClusterClient>,
    poller: Arc<StatusPoller>,
    orchestrator: Orchestrator,
}

impl ApplicationMaster {
    /// select the cluster client from the config and run the primary worker with `sh`
    pub fn load(config: LauncherConfig) -> Result<Self, MasterError> {
        let cluster = Clusters::load(&config)?;

        Self::with_cluster(config, cluster, Arc::new(ShellRunner::new()))
    }

    pub fn with_cluster(
        config: LauncherConfig,
        cluster: Arc<dyn ClusterClient>,
        primary: Arc<dyn PrimaryRunner>,
    ) -> Result<Self, MasterError> {
        let credentials = config.read_credentials()?;

        let orchestrator = Orchestrator::init(
            config.job_spec(),
            cluster.clone(),
            CommandGenerator::load(&config),
            primary,
            config.launcher.threads,
            credentials,
        )?;

        let poller = Arc::new(
            StatusPoller::start(cluster.clone(), config.status_interval())
                .map_err(MasterError::Poller)?,
        );

        if let Err(error) = cluster.register(handlers::listeners(
            &orchestrator,
            &cluster,
            poller.clone(),
        )) {
            poller.stop();
            return Err(error.into());
        }

        Ok(Self {
            config,
            cluster,
            poller,
            orchestrator,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run the job to a terminal phase and tear everything down.
    #[instrument(skip(self), level = "info")]
    pub fn run(&self) -> Result<Outcome, MasterError> {
        info!(
            servers = self.config.job.servers,
            workers = self.config.job.workers,
            "Starting job"
        );

        if let Err(error) = self.orchestrator.start(self.config.retry_policy()) {
            error!(error = ?error, "Failed to start orchestrator: {error}");
            self.teardown();

            return Err(error.into());
        }

        let phase = self
            .orchestrator
            .await_completion(self.orchestrator.spec().execute_timeout);
        let outcome = Outcome {
            phase,
            cause: self.orchestrator.cause(),
        };

        self.teardown();

        match outcome.phase {
            Phase::Succeeded => info!("Job finished: {outcome}"),
            _ => error!(exit_code = outcome.exit_code(), "Job finished: {outcome}"),
        }

        Ok(outcome)
    }

    fn teardown(&self) {
        self.orchestrator.stop(self.config.drain_timeout());
        self.poller.stop();
        self.cluster.stop();
    }
}
