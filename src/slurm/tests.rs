//! Unit tests for the Slurm service.

use super::*;
use crate::models::JobStatus;
use crate::ssh::{ExecutionFailure, SshSessionService};
use crate::test_support::{ScriptedRunner, sacct_output, squeue_output, ssh_config};
use rstest::{fixture, rstest};

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

async fn open_session(runner: &ScriptedRunner) -> SshSession<ScriptedRunner> {
    runner.push_ping();
    SshSessionService::new(ssh_config(), runner.clone())
        .expect("valid config")
        .session()
        .await
        .expect("session opens")
}

#[rstest]
#[tokio::test]
async fn submit_job_uploads_then_parses_id(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_success();
    runner.push_stdout("Submitted batch job 424242\n");

    let job_id = SlurmService::new()
        .submit_job(&session, Utf8Path::new("/stage/job.sbatch"), "/r/logs/job.sbatch")
        .await
        .expect("submits");

    assert_eq!(job_id, 424_242);
    assert_eq!(
        runner.remote_commands().last().map(String::as_str),
        Some("sbatch /r/logs/job.sbatch")
    );
    assert!(
        runner
            .invocations()
            .iter()
            .any(|inv| inv.program == "scp" && inv.last_arg().ends_with(":/r/logs/job.sbatch"))
    );
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn submit_job_non_zero_exit_is_a_submission_error(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_success();
    runner.push_failure(1, "sbatch: error: invalid partition");

    let err = SlurmService::new()
        .submit_job(&session, Utf8Path::new("/stage/job.sbatch"), "/r/job.sbatch")
        .await
        .expect_err("fails");

    assert_eq!(
        err,
        SlurmError::Submission {
            script: String::from("/r/job.sbatch"),
            output: String::from("sbatch: error: invalid partition"),
        }
    );
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn submit_job_connection_loss_stays_a_transport_error(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_success();
    runner.push_failure(255, "Connection reset by peer");

    let err = SlurmService::new()
        .submit_job(&session, Utf8Path::new("/stage/job.sbatch"), "/r/job.sbatch")
        .await
        .expect_err("fails");

    assert!(matches!(
        err,
        SlurmError::Ssh(SshError::Execution {
            reason: ExecutionFailure::ConnectionLost,
            ..
        })
    ));
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn squeue_command_filters_by_job_ids(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_stdout(squeue_output(&[(1, "a", "PENDING"), (2, "b", "RUNNING")]));

    let jobs = SlurmService::new()
        .get_job_status_squeue(&session, &[1, 2])
        .await
        .expect("queries");

    assert_eq!(jobs.len(), 2);
    assert_eq!(
        runner.remote_commands().last().map(String::as_str),
        Some("squeue -u $USER --format='%i|%j|%T' -j 1,2")
    );
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn squeue_invalid_job_id_means_absent(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_failure(1, "slurm_load_jobs error: Invalid job id specified");

    let jobs = SlurmService::new()
        .get_job_status_squeue(&session, &[99])
        .await
        .expect("absent, not an error");

    assert!(jobs.is_empty());
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn sacct_command_requests_named_fields(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_stdout(sacct_output(&[("7", "sim", "COMPLETED", "0:0")]));

    let jobs = SlurmService::new()
        .get_job_status_sacct(&session, &[7])
        .await
        .expect("queries");

    assert_eq!(jobs.first().map(SlurmJob::job_status), Some(JobStatus::Completed));
    assert_eq!(
        runner.remote_commands().last().map(String::as_str),
        Some(
            "sacct -u $USER -X --parsable2 --format=JobIDRaw,JobName,State,ExitCode,Start,End,Elapsed -j 7"
        )
    );
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn get_job_status_falls_back_to_sacct(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_stdout(squeue_output(&[]));
    runner.push_stdout(sacct_output(&[("8", "sim", "FAILED", "1:0")]));

    let job = SlurmService::new()
        .get_job_status(&session, 8)
        .await
        .expect("queries")
        .expect("found in sacct");

    assert_eq!(job.job_state, SlurmJobState::Failed);
    assert_eq!(job.exit_code, Some(1));
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn get_job_status_returns_none_when_unknown(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_stdout(squeue_output(&[]));
    runner.push_stdout(sacct_output(&[]));

    let job = SlurmService::new()
        .get_job_status(&session, 8)
        .await
        .expect("queries");

    assert_eq!(job, None);
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn get_job_status_rejects_multiple_rows(runner: ScriptedRunner) {
    let session = open_session(&runner).await;
    runner.push_stdout(squeue_output(&[(8, "a", "RUNNING"), (8, "b", "RUNNING")]));

    let err = SlurmService::new()
        .get_job_status(&session, 8)
        .await
        .expect_err("ambiguous");

    assert_eq!(err, SlurmError::Ambiguous { job_id: 8, count: 2 });
    session.close().await;
}

#[rstest]
#[case::queued(squeue_output(&[(3, "sim", "PENDING")]), None, "active")]
#[case::finished(squeue_output(&[]), Some(sacct_output(&[("3", "sim", "COMPLETED", "0:0")])), "terminal")]
#[case::lagging(squeue_output(&[]), Some(sacct_output(&[])), "unknown")]
#[case::accounting_behind(
    squeue_output(&[]),
    Some(sacct_output(&[("3", "sim", "RUNNING", "0:0")])),
    "active"
)]
#[tokio::test]
async fn observe_job_classifies_sources(
    runner: ScriptedRunner,
    #[case] squeue: String,
    #[case] sacct: Option<String>,
    #[case] expected: &str,
) {
    let session = open_session(&runner).await;
    runner.push_stdout(squeue);
    if let Some(out) = sacct {
        runner.push_stdout(out);
    }

    let observation = SlurmService::new()
        .observe_job(&session, 3)
        .await
        .expect("observes");

    let label = match observation {
        JobObservation::Active(_) => "active",
        JobObservation::Terminal(_) => "terminal",
        JobObservation::Unknown => "unknown",
    };
    assert_eq!(label, expected);
    session.close().await;
}

#[rstest]
#[case("RUNNING", SlurmJobState::Running)]
#[case("CD", SlurmJobState::Completed)]
#[case("CANCELLED by 1234", SlurmJobState::Cancelled)]
#[case("OUT_OF_MEMORY", SlurmJobState::OutOfMemory)]
#[case("REQUEUE_HOLD", SlurmJobState::Unknown(String::from("REQUEUE_HOLD")))]
fn state_parsing(#[case] raw: &str, #[case] expected: SlurmJobState) {
    assert_eq!(SlurmJobState::parse(raw), expected);
}

#[rstest]
#[case(SlurmJobState::Configuring, JobStatus::Pending)]
#[case(SlurmJobState::Running, JobStatus::Running)]
#[case(SlurmJobState::Completed, JobStatus::Completed)]
#[case(SlurmJobState::Timeout, JobStatus::Failed)]
#[case(SlurmJobState::Unknown(String::from("ODD")), JobStatus::Pending)]
fn job_status_mapping(#[case] state: SlurmJobState, #[case] expected: JobStatus) {
    let job = SlurmJob {
        job_id: 1,
        name: String::from("x"),
        job_state: state,
        exit_code: None,
        start_time: None,
        end_time: None,
        elapsed: None,
    };
    assert_eq!(job.job_status(), expected);
    assert_eq!(job.is_done(), expected.is_final());
}
