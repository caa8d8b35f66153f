//! Process-level wiring of configuration and services.
//!
//! [`AppContext`] is built once at startup and owns every long-lived
//! component. Services are handed out by reference or as cheap clones; no
//! global state is involved. [`AppContext::run_simulation`] ties the
//! workflow lifecycle to storage so telemetry from the job can be ingested.

use std::sync::Arc;

use camino::Utf8Path;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, HpcConfig, MessagingConfig};
use crate::database::{DatabaseError, DatabaseService, InMemoryDatabase};
use crate::messaging::{MessagingError, MessagingService, connect_from_config};
use crate::models::{HpcRun, JobType, WorkerEvent};
use crate::nextflow::{
    NextflowJobError, NextflowServiceSlurm, PollPolicy, SimulationRun, TemplateError, TemplateSet,
};
use crate::scheduler::{JobScheduler, SchedulerError};
use crate::slurm::SlurmService;
use crate::ssh::{
    CommandRunner, ProcessCommandRunner, SshConfig, SshError, SshSession, SshSessionService,
};

/// Errors raised while assembling the application.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ContextError {
    /// Configuration could not be loaded or is incomplete.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// SSH settings are invalid.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Workflow templates could not be loaded.
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Errors raised by [`AppContext::run_simulation`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RunError {
    /// The workflow service could not be built.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// Submission, polling, or output listing failed.
    #[error("workflow failed: {0}")]
    Workflow(#[from] NextflowJobError),
    /// The run could not be registered or read back.
    #[error("run bookkeeping failed: {0}")]
    Database(#[from] DatabaseError),
    /// Worker events could not be subscribed to.
    #[error("event ingestion failed: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// A completed workflow run together with its storage record.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedRun {
    /// Stored run, carrying its final status.
    pub hpcrun: HpcRun,
    /// Submission, terminal snapshot, and outputs.
    pub run: SimulationRun,
    /// Worker events stored for the run, ordered by sequence number.
    pub events: Vec<WorkerEvent>,
}

/// Owns configuration and the services built from it.
#[derive(Debug)]
pub struct AppContext<R: CommandRunner = ProcessCommandRunner> {
    hpc: HpcConfig,
    messaging: MessagingConfig,
    ssh: SshSessionService<R>,
    slurm: SlurmService,
    database: Arc<InMemoryDatabase>,
    new_id: fn() -> Uuid,
}

impl AppContext<ProcessCommandRunner> {
    /// Loads every configuration section from files and the environment and
    /// wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Config`] when loading fails and
    /// [`ContextError::Ssh`] when SSH settings are incomplete.
    pub fn load() -> Result<Self, ContextError> {
        let ssh = SshConfig::load_without_cli_args()?;
        let hpc = HpcConfig::load_without_cli_args()?;
        let messaging = MessagingConfig::load_without_cli_args()?;
        Self::from_config(ssh, hpc, messaging, ProcessCommandRunner)
    }
}

impl<R: CommandRunner + 'static> AppContext<R> {
    /// Builds the context from explicit configuration.
    ///
    /// HPC settings are validated when a workflow service is requested, so
    /// commands that only query Slurm or listen for events do not need them.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Ssh`] for invalid SSH settings and
    /// [`ContextError::Config`] for invalid messaging settings.
    pub fn from_config(
        ssh: SshConfig,
        hpc: HpcConfig,
        messaging: MessagingConfig,
        runner: R,
    ) -> Result<Self, ContextError> {
        messaging.validate()?;
        let ssh_service = SshSessionService::new(ssh, runner)?;
        info!(host = %ssh_service.config().host, "application context ready");
        Ok(Self {
            hpc,
            messaging,
            ssh: ssh_service,
            slurm: SlurmService::new(),
            database: Arc::new(InMemoryDatabase::new()),
            new_id: Uuid::new_v4,
        })
    }

    /// Overrides the identifier source handed to workflow services.
    #[must_use]
    pub const fn with_id_source(mut self, new_id: fn() -> Uuid) -> Self {
        self.new_id = new_id;
        self
    }

    /// HPC configuration.
    #[must_use]
    pub const fn hpc(&self) -> &HpcConfig {
        &self.hpc
    }

    /// Messaging configuration.
    #[must_use]
    pub const fn messaging(&self) -> &MessagingConfig {
        &self.messaging
    }

    /// Session factory for the login node.
    #[must_use]
    pub const fn ssh(&self) -> &SshSessionService<R> {
        &self.ssh
    }

    /// Slurm front end.
    #[must_use]
    pub const fn slurm(&self) -> SlurmService {
        self.slurm
    }

    /// Shared storage.
    #[must_use]
    pub fn database(&self) -> Arc<dyn DatabaseService> {
        self.database.clone()
    }

    /// Builds the workflow service, loading templates from
    /// `hpc.template_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Config`] when HPC settings are incomplete and
    /// [`ContextError::Template`] when a template cannot be read.
    pub fn nextflow(&self) -> Result<NextflowServiceSlurm<R>, ContextError> {
        self.hpc.validate()?;
        let templates = TemplateSet::load(Utf8Path::new(&self.hpc.template_dir))?;
        Ok(NextflowServiceSlurm::new(
            self.ssh.clone(),
            self.slurm,
            self.hpc.clone(),
            templates,
        )
        .with_id_source(self.new_id))
    }

    /// Records an already submitted simulation job so its worker events and
    /// status can be stored.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::DuplicateCorrelationId`] when the
    /// correlation id is already registered.
    pub async fn track_run(
        &self,
        job_id: u64,
        simulator_id: i64,
        correlation_id: &str,
    ) -> Result<HpcRun, DatabaseError> {
        let run = self
            .database
            .insert_hpcrun(job_id, JobType::Simulation, simulator_id, correlation_id)
            .await?;
        info!(
            hpcrun_id = run.database_id,
            job_id,
            simulator_id,
            correlation_id,
            "registered simulation run"
        );
        Ok(run)
    }

    /// Submits the workflow for `experiment_id`, registers it as a run of
    /// `simulator_id`, waits for it to complete, and lists its outputs.
    ///
    /// When `listen` is given, worker events for `simulator_id` are consumed
    /// from it for the lifetime of the run and the connection is closed
    /// afterwards. The run is stored before polling starts, so events the
    /// job publishes resolve to it.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Context`] when HPC settings or templates are
    /// unusable, [`RunError::Scheduler`] when the subscription fails,
    /// [`RunError::Workflow`] for lifecycle failures, and
    /// [`RunError::Database`] when the run cannot be stored.
    pub async fn run_simulation(
        &self,
        experiment_id: &str,
        simulator_id: i64,
        listen: Option<Arc<dyn MessagingService>>,
    ) -> Result<TrackedRun, RunError> {
        let service = self.nextflow()?;
        let scheduler = match listen {
            Some(messaging) => {
                let listening = self.scheduler(messaging);
                listening.subscribe(simulator_id).await?;
                Some(listening)
            }
            None => None,
        };

        let result = self
            .run_registered(&service, experiment_id, simulator_id)
            .await;
        if let Some(listening) = &scheduler {
            if let Err(err) = listening.close().await {
                warn!(error = %err, "failed to close event subscription");
            }
        }
        let (hpcrun, run) = result?;

        let events = self
            .database
            .list_worker_events(hpcrun.database_id, None)
            .await?;
        Ok(TrackedRun {
            hpcrun,
            run,
            events,
        })
    }

    async fn run_registered(
        &self,
        service: &NextflowServiceSlurm<R>,
        experiment_id: &str,
        simulator_id: i64,
    ) -> Result<(HpcRun, SimulationRun), RunError> {
        let session = self.ssh.session().await.map_err(NextflowJobError::from)?;
        let result = self
            .run_lifecycle(service, &session, experiment_id, simulator_id)
            .await;
        session.close().await;
        result
    }

    async fn run_lifecycle(
        &self,
        service: &NextflowServiceSlurm<R>,
        session: &SshSession<R>,
        experiment_id: &str,
        simulator_id: i64,
    ) -> Result<(HpcRun, SimulationRun), RunError> {
        let submission = service.submit_simulation_job(session, experiment_id).await?;
        let registered = self
            .track_run(submission.job_id, simulator_id, &submission.correlation_id)
            .await?;
        let job = service
            .poll_simulation_job(session, &submission, PollPolicy::from_config(&self.hpc))
            .await?;
        self.database
            .update_hpcrun_status(registered.database_id, &job)
            .await?;
        let outputs = service.list_simulation_outputs(session, &submission).await?;
        let hpcrun = self
            .database
            .hpcrun(registered.database_id)
            .unwrap_or(registered);
        Ok((
            hpcrun,
            SimulationRun {
                submission,
                job,
                outputs,
            },
        ))
    }

    /// Connects the configured messaging backend.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError`] for an unknown backend or an unreachable
    /// server.
    pub async fn connect_messaging(&self) -> Result<Arc<dyn MessagingService>, MessagingError> {
        connect_from_config(&self.messaging).await
    }

    /// Builds a scheduler over `messaging` and the shared storage.
    #[must_use]
    pub fn scheduler(&self, messaging: Arc<dyn MessagingService>) -> JobScheduler<R> {
        JobScheduler::new(
            messaging,
            self.database(),
            self.ssh.clone(),
            self.messaging.subject_prefix.clone(),
        )
    }
}
