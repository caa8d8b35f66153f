//! Storage seam for runs and worker events.
//!
//! The scheduler and CLI depend on [`DatabaseService`] only. The bundled
//! [`InMemoryDatabase`] keeps everything in process memory; a SQL-backed
//! implementation plugs in behind the same trait.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;

use crate::models::{HpcRun, JobStatus, JobType, WorkerEvent};
use crate::slurm::SlurmJob;

/// Boxed future returned by [`DatabaseService`] operations.
pub type DatabaseFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DatabaseError>> + Send + 'a>>;

/// Errors raised by storage operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DatabaseError {
    /// The referenced run does not exist.
    #[error("hpc run {hpcrun_id} not found")]
    HpcRunNotFound {
        /// Requested identifier.
        hpcrun_id: i64,
    },
    /// A run with the same correlation id already exists.
    #[error("correlation id {correlation_id} is already registered")]
    DuplicateCorrelationId {
        /// Conflicting correlation id.
        correlation_id: String,
    },
    /// Backend-specific failure.
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Operations the orchestration core needs from persistent storage.
pub trait DatabaseService: Send + Sync {
    /// Stores `event` under `hpcrun_id` and returns it with storage fields
    /// populated.
    fn insert_worker_event(&self, event: WorkerEvent, hpcrun_id: i64)
    -> DatabaseFuture<'_, WorkerEvent>;

    /// Lists events for `hpcrun_id` ordered by sequence number, optionally
    /// only those after `prev_sequence_number`.
    fn list_worker_events(
        &self,
        hpcrun_id: i64,
        prev_sequence_number: Option<u64>,
    ) -> DatabaseFuture<'_, Vec<WorkerEvent>>;

    /// Records a newly submitted job.
    fn insert_hpcrun<'a>(
        &'a self,
        slurmjobid: u64,
        job_type: JobType,
        ref_id: i64,
        correlation_id: &'a str,
    ) -> DatabaseFuture<'a, HpcRun>;

    /// Finds the run owned by `ref_id` for `job_type`.
    fn get_hpcrun_by_ref(&self, ref_id: i64, job_type: JobType)
    -> DatabaseFuture<'_, Option<HpcRun>>;

    /// Resolves a correlation id to its run identifier.
    fn get_hpcrun_id_by_correlation_id<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> DatabaseFuture<'a, Option<i64>>;

    /// Lists runs whose status is not yet final.
    fn list_running_hpcruns(&self) -> DatabaseFuture<'_, Vec<HpcRun>>;

    /// Applies a fresh Slurm snapshot to the run.
    fn update_hpcrun_status<'a>(
        &'a self,
        hpcrun_id: i64,
        job: &'a SlurmJob,
    ) -> DatabaseFuture<'a, ()>;
}

impl<T: DatabaseService + ?Sized> DatabaseService for Arc<T> {
    fn insert_worker_event(
        &self,
        event: WorkerEvent,
        hpcrun_id: i64,
    ) -> DatabaseFuture<'_, WorkerEvent> {
        (**self).insert_worker_event(event, hpcrun_id)
    }

    fn list_worker_events(
        &self,
        hpcrun_id: i64,
        prev_sequence_number: Option<u64>,
    ) -> DatabaseFuture<'_, Vec<WorkerEvent>> {
        (**self).list_worker_events(hpcrun_id, prev_sequence_number)
    }

    fn insert_hpcrun<'a>(
        &'a self,
        slurmjobid: u64,
        job_type: JobType,
        ref_id: i64,
        correlation_id: &'a str,
    ) -> DatabaseFuture<'a, HpcRun> {
        (**self).insert_hpcrun(slurmjobid, job_type, ref_id, correlation_id)
    }

    fn get_hpcrun_by_ref(
        &self,
        ref_id: i64,
        job_type: JobType,
    ) -> DatabaseFuture<'_, Option<HpcRun>> {
        (**self).get_hpcrun_by_ref(ref_id, job_type)
    }

    fn get_hpcrun_id_by_correlation_id<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> DatabaseFuture<'a, Option<i64>> {
        (**self).get_hpcrun_id_by_correlation_id(correlation_id)
    }

    fn list_running_hpcruns(&self) -> DatabaseFuture<'_, Vec<HpcRun>> {
        (**self).list_running_hpcruns()
    }

    fn update_hpcrun_status<'a>(
        &'a self,
        hpcrun_id: i64,
        job: &'a SlurmJob,
    ) -> DatabaseFuture<'a, ()> {
        (**self).update_hpcrun_status(hpcrun_id, job)
    }
}

#[derive(Debug, Default)]
struct Tables {
    next_run_id: i64,
    next_event_id: i64,
    runs: BTreeMap<i64, HpcRun>,
    events: BTreeMap<(i64, u64), WorkerEvent>,
}

/// Process-local [`DatabaseService`].
///
/// Worker events are keyed by `(hpcrun_id, sequence_number)`, so a
/// redelivered event returns the stored copy instead of a duplicate.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDatabase {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the run with `hpcrun_id`, if present.
    #[must_use]
    pub fn hpcrun(&self, hpcrun_id: i64) -> Option<HpcRun> {
        self.with_tables(|tables| tables.runs.get(&hpcrun_id).cloned())
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut guard = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl DatabaseService for InMemoryDatabase {
    fn insert_worker_event(
        &self,
        event: WorkerEvent,
        hpcrun_id: i64,
    ) -> DatabaseFuture<'_, WorkerEvent> {
        let stored = self.with_tables(|tables| {
            if !tables.runs.contains_key(&hpcrun_id) {
                return Err(DatabaseError::HpcRunNotFound { hpcrun_id });
            }
            let key = (hpcrun_id, event.sequence_number);
            if let Some(existing) = tables.events.get(&key) {
                return Ok(existing.clone());
            }
            tables.next_event_id += 1;
            let mut record = event;
            record.database_id = Some(tables.next_event_id);
            record.hpcrun_id = Some(hpcrun_id);
            record.created_at = Some(Utc::now());
            tables.events.insert(key, record.clone());
            Ok(record)
        });
        Box::pin(async move { stored })
    }

    fn list_worker_events(
        &self,
        hpcrun_id: i64,
        prev_sequence_number: Option<u64>,
    ) -> DatabaseFuture<'_, Vec<WorkerEvent>> {
        let events = self.with_tables(|tables| {
            tables
                .events
                .range((hpcrun_id, 0)..=(hpcrun_id, u64::MAX))
                .filter(|((_, seq), _)| prev_sequence_number.is_none_or(|prev| *seq > prev))
                .map(|(_, event)| event.clone())
                .collect()
        });
        Box::pin(async move { Ok(events) })
    }

    fn insert_hpcrun<'a>(
        &'a self,
        slurmjobid: u64,
        job_type: JobType,
        ref_id: i64,
        correlation_id: &'a str,
    ) -> DatabaseFuture<'a, HpcRun> {
        let inserted = self.with_tables(|tables| {
            if tables
                .runs
                .values()
                .any(|run| run.correlation_id == correlation_id)
            {
                return Err(DatabaseError::DuplicateCorrelationId {
                    correlation_id: correlation_id.to_owned(),
                });
            }
            tables.next_run_id += 1;
            let run = HpcRun {
                database_id: tables.next_run_id,
                slurmjobid: Some(slurmjobid),
                correlation_id: correlation_id.to_owned(),
                job_type,
                ref_id,
                status: JobStatus::Running,
                start_time: Some(Utc::now().to_rfc3339()),
                end_time: None,
                error_message: None,
            };
            tables.runs.insert(run.database_id, run.clone());
            Ok(run)
        });
        Box::pin(async move { inserted })
    }

    fn get_hpcrun_by_ref(
        &self,
        ref_id: i64,
        job_type: JobType,
    ) -> DatabaseFuture<'_, Option<HpcRun>> {
        let found = self.with_tables(|tables| {
            tables
                .runs
                .values()
                .rev()
                .find(|run| run.ref_id == ref_id && run.job_type == job_type)
                .cloned()
        });
        Box::pin(async move { Ok(found) })
    }

    fn get_hpcrun_id_by_correlation_id<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> DatabaseFuture<'a, Option<i64>> {
        let found = self.with_tables(|tables| {
            tables
                .runs
                .values()
                .find(|run| run.correlation_id == correlation_id)
                .map(|run| run.database_id)
        });
        Box::pin(async move { Ok(found) })
    }

    fn list_running_hpcruns(&self) -> DatabaseFuture<'_, Vec<HpcRun>> {
        let runs = self.with_tables(|tables| {
            tables
                .runs
                .values()
                .filter(|run| !run.status.is_final())
                .cloned()
                .collect()
        });
        Box::pin(async move { Ok(runs) })
    }

    fn update_hpcrun_status<'a>(
        &'a self,
        hpcrun_id: i64,
        job: &'a SlurmJob,
    ) -> DatabaseFuture<'a, ()> {
        let updated = self.with_tables(|tables| {
            let run = tables
                .runs
                .get_mut(&hpcrun_id)
                .ok_or(DatabaseError::HpcRunNotFound { hpcrun_id })?;
            run.status = job.job_status();
            if let Some(start) = &job.start_time {
                run.start_time = Some(start.clone());
            }
            if let Some(end) = &job.end_time {
                run.end_time = Some(end.clone());
            }
            if run.status == JobStatus::Failed {
                run.error_message = Some(format!(
                    "Slurm job {} ended {}{}",
                    job.job_id,
                    job.job_state,
                    job.exit_code
                        .map(|code| format!(" with exit code {code}"))
                        .unwrap_or_default()
                ));
            }
            Ok(())
        });
        Box::pin(async move { updated })
    }
}
