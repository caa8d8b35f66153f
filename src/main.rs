//! Binary entry point for the `slurmflow` CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use slurmflow::{
    AppContext, ContextError, DatabaseError, DatabaseService, HpcRun, MessagingError, RunError,
    SchedulerError, SlurmError, SshError,
};

mod cli;

use cli::{Cli, ListenCommand, RunCommand, StatusCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("status query failed: {0}")]
    Slurm(#[from] SlurmError),
    #[error("SSH failure: {0}")]
    Ssh(#[from] SshError),
    #[error("messaging failure: {0}")]
    Messaging(#[from] MessagingError),
    #[error("scheduler failure: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("storage failure: {0}")]
    Database(#[from] DatabaseError),
    #[error("job {0} not found in squeue or sacct")]
    JobNotFound(u64),
    #[error("failed to wait for Ctrl-C: {0}")]
    Signal(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .compact()
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let context = AppContext::load()?;
    match cli {
        Cli::Run(command) => run(&context, command).await,
        Cli::Status(command) => status(&context, command).await,
        Cli::Listen(command) => listen(&context, command).await,
    }
}

async fn run(context: &AppContext, command: RunCommand) -> Result<(), CliError> {
    let experiment_id = command
        .experiment_id
        .unwrap_or_else(|| format!("exp-{}", Uuid::new_v4().simple()));
    let listen = if command.listen {
        Some(context.connect_messaging().await?)
    } else {
        None
    };
    let tracked = context
        .run_simulation(&experiment_id, command.simulator_id, listen)
        .await?;

    let submission = &tracked.run.submission;
    let mut stdout = io::stdout().lock();
    writeln!(
        stdout,
        "job {} ({}) completed; correlation id {}",
        submission.job_id, submission.job_name, submission.correlation_id
    )
    .ok();
    for path in &tracked.run.outputs {
        writeln!(stdout, "{path}").ok();
    }
    if command.listen {
        writeln!(
            stdout,
            "{} worker events stored for run {}",
            tracked.events.len(),
            tracked.hpcrun.database_id
        )
        .ok();
    }
    Ok(())
}

async fn status(context: &AppContext, command: StatusCommand) -> Result<(), CliError> {
    let session = context.ssh().session().await?;
    let result = context
        .slurm()
        .get_job_status(&session, command.job_id)
        .await;
    session.close().await;

    let job = result?.ok_or(CliError::JobNotFound(command.job_id))?;
    writeln!(io::stdout(), "{job}").ok();
    Ok(())
}

async fn listen(context: &AppContext, command: ListenCommand) -> Result<(), CliError> {
    let mut runs = Vec::with_capacity(command.tracked.len());
    for job in &command.tracked {
        runs.push(
            context
                .track_run(job.job_id, command.simulator_id, &job.correlation_id)
                .await?,
        );
    }
    let messaging = context.connect_messaging().await?;
    let scheduler = context.scheduler(messaging);
    scheduler.subscribe(command.simulator_id).await?;
    if let Some(seconds) = command.poll_seconds {
        scheduler.start_polling(std::time::Duration::from_secs(seconds));
    }

    info!(simulator_id = command.simulator_id, runs = runs.len(), "press Ctrl-C to stop");
    let signal = tokio::signal::ctrl_c()
        .await
        .map_err(|err| CliError::Signal(err.to_string()));
    scheduler.close().await?;
    report_stored_events(context.database().as_ref(), &runs).await?;
    signal
}

async fn report_stored_events(
    database: &dyn DatabaseService,
    runs: &[HpcRun],
) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    for run in runs {
        let events = database.list_worker_events(run.database_id, None).await?;
        writeln!(
            stdout,
            "{} worker events stored for job {}",
            events.len(),
            run.slurmjobid.unwrap_or_default()
        )
        .ok();
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
