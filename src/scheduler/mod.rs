//! Worker-event ingestion and background status refresh.
//!
//! [`JobScheduler`] subscribes to `{subject_prefix}.{simulator_id}` and
//! stores every decoded [`WorkerEvent`] against the run that owns its
//! correlation id. Separately, a polling task refreshes the status of every
//! unfinished run from Slurm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::database::{DatabaseError, DatabaseService};
use crate::messaging::{HandlerError, MessagingError, MessagingService, handler};
use crate::models::{HpcRun, WorkerEvent};
use crate::slurm::{SlurmError, SlurmJob, SlurmService};
use crate::ssh::{CommandRunner, SshError, SshSession, SshSessionService};

/// Errors raised by [`JobScheduler`] operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SchedulerError {
    /// Subscribing or disconnecting failed.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    /// Storage failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// A status query failed.
    #[error(transparent)]
    Slurm(#[from] SlurmError),
    /// The login node could not be reached.
    #[error(transparent)]
    Ssh(#[from] SshError),
}

type CorrelationCache = Arc<Mutex<HashMap<String, i64>>>;

/// Refreshes unfinished runs from Slurm.
pub struct StatusRefresher<R: CommandRunner> {
    ssh: SshSessionService<R>,
    slurm: SlurmService,
    database: Arc<dyn DatabaseService>,
}

impl<R: CommandRunner> Clone for StatusRefresher<R> {
    fn clone(&self) -> Self {
        Self {
            ssh: self.ssh.clone(),
            slurm: self.slurm,
            database: Arc::clone(&self.database),
        }
    }
}

impl<R: CommandRunner> std::fmt::Debug for StatusRefresher<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusRefresher")
            .field("host", &self.ssh.config().host)
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner> StatusRefresher<R> {
    /// Creates a refresher over the given collaborators.
    #[must_use]
    pub fn new(
        ssh: SshSessionService<R>,
        slurm: SlurmService,
        database: Arc<dyn DatabaseService>,
    ) -> Self {
        Self {
            ssh,
            slurm,
            database,
        }
    }

    /// Queries squeue then sacct for every unfinished run in one SSH session
    /// and persists status changes. Returns the number of runs updated.
    ///
    /// # Errors
    ///
    /// Returns the first storage, transport, or parse error encountered.
    pub async fn update_running_jobs(&self) -> Result<usize, SchedulerError> {
        let runs = self.database.list_running_hpcruns().await?;
        let tracked: Vec<(HpcRun, u64)> = runs
            .into_iter()
            .filter_map(|run| run.slurmjobid.map(|job_id| (run, job_id)))
            .collect();
        if tracked.is_empty() {
            debug!("no running jobs to refresh");
            return Ok(0);
        }

        let session = self.ssh.session().await?;
        let result = self.refresh(&session, &tracked).await;
        session.close().await;
        result
    }

    async fn refresh(
        &self,
        session: &SshSession<R>,
        tracked: &[(HpcRun, u64)],
    ) -> Result<usize, SchedulerError> {
        let job_ids: Vec<u64> = tracked.iter().map(|(_, job_id)| *job_id).collect();
        let mut snapshots: HashMap<u64, SlurmJob> = HashMap::new();
        for job in self.slurm.get_job_status_squeue(session, &job_ids).await? {
            snapshots.insert(job.job_id, job);
        }
        for job in self.slurm.get_job_status_sacct(session, &job_ids).await? {
            snapshots.insert(job.job_id, job);
        }

        let mut updated = 0;
        for (run, job_id) in tracked {
            let Some(job) = snapshots.get(job_id) else {
                debug!(job_id, hpcrun_id = run.database_id, "no Slurm record yet");
                continue;
            };
            let status = job.job_status();
            if status == run.status {
                continue;
            }
            self.database
                .update_hpcrun_status(run.database_id, job)
                .await?;
            info!(
                job_id,
                hpcrun_id = run.database_id,
                from = %run.status,
                to = %status,
                "updated run status"
            );
            updated += 1;
        }
        Ok(updated)
    }
}

struct Polling {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Subscribes to worker telemetry and keeps run status current.
pub struct JobScheduler<R: CommandRunner> {
    messaging: Arc<dyn MessagingService>,
    database: Arc<dyn DatabaseService>,
    refresher: StatusRefresher<R>,
    subject_prefix: String,
    correlations: CorrelationCache,
    polling: Mutex<Option<Polling>>,
}

impl<R: CommandRunner> std::fmt::Debug for JobScheduler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("subject_prefix", &self.subject_prefix)
            .field(
                "polling",
                &self
                    .polling
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner + 'static> JobScheduler<R> {
    /// Creates a scheduler publishing nothing and subscribing to nothing yet.
    #[must_use]
    pub fn new(
        messaging: Arc<dyn MessagingService>,
        database: Arc<dyn DatabaseService>,
        ssh: SshSessionService<R>,
        subject_prefix: impl Into<String>,
    ) -> Self {
        let refresher = StatusRefresher::new(ssh, SlurmService::new(), Arc::clone(&database));
        Self {
            messaging,
            database,
            refresher,
            subject_prefix: subject_prefix.into(),
            correlations: Arc::new(Mutex::new(HashMap::new())),
            polling: Mutex::new(None),
        }
    }

    /// Subject carrying events for `simulator_id`.
    #[must_use]
    pub fn subject_for(&self, simulator_id: i64) -> String {
        format!("{}.{simulator_id}", self.subject_prefix)
    }

    /// Subscribes to events for `simulator_id`.
    ///
    /// Each payload is decoded as a [`WorkerEvent`], its correlation id is
    /// resolved to a run, and the event is stored. Events with an unknown
    /// correlation id are logged and dropped. Handler failures are logged by
    /// the messaging layer and never stop delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Messaging`] when the subscription cannot be
    /// registered.
    pub async fn subscribe(&self, simulator_id: i64) -> Result<(), SchedulerError> {
        let subject = self.subject_for(simulator_id);
        let database = Arc::clone(&self.database);
        let correlations = Arc::clone(&self.correlations);
        let on_event = handler(move |payload: Bytes| {
            let db = Arc::clone(&database);
            let cache = Arc::clone(&correlations);
            async move { ingest(db.as_ref(), &cache, &payload).await }
        });
        self.messaging.subscribe(&subject, on_event).await?;
        info!(subject, "listening for worker events");
        Ok(())
    }

    /// Refreshes every unfinished run once.
    ///
    /// # Errors
    ///
    /// See [`StatusRefresher::update_running_jobs`].
    pub async fn update_running_jobs(&self) -> Result<usize, SchedulerError> {
        self.refresher.update_running_jobs().await
    }

    /// Starts the background refresh loop. Does nothing when it is already
    /// running.
    pub fn start_polling(&self, interval: Duration) {
        let mut guard = self.polling.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.as_ref().is_some_and(|polling| !polling.task.is_finished()) {
            warn!("status polling already running");
            return;
        }
        let (stop, mut stopped) = watch::channel(false);
        let refresher = self.refresher.clone();
        let task = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "status polling started");
            loop {
                match refresher.update_running_jobs().await {
                    Ok(updated) => debug!(updated, "status refresh finished"),
                    Err(err) => error!(error = %err, "status refresh failed"),
                }
                tokio::select! {
                    _ = stopped.changed() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            info!("status polling stopped");
        });
        *guard = Some(Polling { stop, task });
    }

    /// Stops the refresh loop and waits for it to exit. Does nothing when it
    /// is not running.
    pub async fn stop_polling(&self) {
        let taken = self
            .polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(polling) = taken else {
            return;
        };
        if polling.stop.send(true).is_err() {
            debug!("status polling task already gone");
        }
        if let Err(err) = polling.task.await {
            warn!(error = %err, "status polling task ended abnormally");
        }
    }

    /// Whether the refresh loop is running.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|polling| !polling.task.is_finished())
    }

    /// Stops polling, then disconnects messaging.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Messaging`] if the disconnect fails.
    pub async fn close(&self) -> Result<(), SchedulerError> {
        self.stop_polling().await;
        self.messaging.disconnect().await?;
        info!("job scheduler closed");
        Ok(())
    }
}

async fn ingest(
    database: &dyn DatabaseService,
    correlations: &CorrelationCache,
    payload: &[u8],
) -> Result<(), HandlerError> {
    let event =
        WorkerEvent::from_json(payload).map_err(|err| HandlerError::Decode(err.to_string()))?;
    let Some(hpcrun_id) = resolve(database, correlations, &event.correlation_id).await? else {
        warn!(
            correlation_id = %event.correlation_id,
            sequence_number = event.sequence_number,
            "dropping event with unknown correlation id"
        );
        return Ok(());
    };
    let stored = database
        .insert_worker_event(event, hpcrun_id)
        .await
        .map_err(|err| HandlerError::Failed(err.to_string()))?;
    debug!(
        hpcrun_id,
        sequence_number = stored.sequence_number,
        "stored worker event"
    );
    Ok(())
}

async fn resolve(
    database: &dyn DatabaseService,
    correlations: &CorrelationCache,
    correlation_id: &str,
) -> Result<Option<i64>, HandlerError> {
    let cached = correlations
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(correlation_id)
        .copied();
    if cached.is_some() {
        return Ok(cached);
    }
    let found = database
        .get_hpcrun_id_by_correlation_id(correlation_id)
        .await
        .map_err(|err| HandlerError::Failed(err.to_string()))?;
    if let Some(hpcrun_id) = found {
        correlations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.to_owned(), hpcrun_id);
    }
    Ok(found)
}
