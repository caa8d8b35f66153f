//! Core library for the `slurmflow` HPC orchestration tool.
//!
//! The crate submits Nextflow workflows to a Slurm cluster over SSH, follows
//! them to a terminal state with squeue and sacct, and ingests the telemetry
//! the running job publishes on a NATS or Redis bus.
//!
//! Components are layered leaf first: [`ssh`] carries every remote command
//! and transfer, [`slurm`] drives `sbatch`/`squeue`/`sacct`, [`nextflow`]
//! renders and supervises workflow jobs, [`messaging`] abstracts the bus, and
//! [`scheduler`] joins telemetry back to runs in [`database`]. [`AppContext`]
//! builds them all from configuration.

pub mod config;
pub mod context;
pub mod database;
pub mod messaging;
pub mod models;
pub mod nextflow;
pub mod scheduler;
pub mod slurm;
pub mod ssh;
pub mod test_support;

pub use config::{ConfigError, HpcConfig, MessagingConfig};
pub use context::{AppContext, ContextError, RunError, TrackedRun};
pub use database::{DatabaseError, DatabaseService, InMemoryDatabase};
pub use messaging::{
    ConnectOptions, HandlerError, MessageHandler, MessagingBackend, MessagingError,
    MessagingService, NatsMessagingService, RedisMessagingService,
};
pub use models::{HpcRun, JobStatus, JobType, WorkerEvent};
pub use nextflow::{
    NextflowJobError, NextflowJobSubmission, NextflowServiceSlurm, PollPolicy, SimulationRun,
    TemplateError, TemplateSet,
};
pub use scheduler::{JobScheduler, SchedulerError, StatusRefresher};
pub use slurm::{JobObservation, SlurmError, SlurmJob, SlurmJobState, SlurmService};
pub use ssh::{
    CommandOutput, CommandRunner, ProcessCommandRunner, SshConfig, SshError, SshSession,
    SshSessionService,
};
