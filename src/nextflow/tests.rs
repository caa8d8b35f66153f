//! Unit tests for the Nextflow workflow lifecycle.

use std::time::Duration;

use rstest::{fixture, rstest};
use uuid::Uuid;

use super::*;
use crate::test_support::{ScriptedRunner, sacct_output, squeue_output, ssh_config};

const JOB_ID: u64 = 424_242;
const JOB_NAME: &str = "sim_0123abcd";
const CORRELATION_ID: &str = "0123abcd-0000-4000-8000-000000000001";

fn fixed_id() -> Uuid {
    Uuid::from_u128(0x0123_abcd_0000_4000_8000_0000_0000_0001)
}

fn hpc_config() -> HpcConfig {
    HpcConfig {
        slurm_log_base_path: String::from("/hpc/logs"),
        sim_base_path: String::from("/hpc/sims"),
        job_name: String::from("sim"),
        container_image: String::from("/hpc/images/vecoli.sif"),
        sim_data_path: String::from("/hpc/data/kb"),
        nextflow_profile: Some(String::from("slurm")),
        template_dir: String::from("templates"),
        poll_interval_seconds: 30,
        max_wait_seconds: 300,
        output_listing_limit: 5,
    }
}

fn templates() -> TemplateSet {
    TemplateSet::from_strings(
        "params.config = 'WORKFLOW_CONFIG_PATH'\nworkflow { sim() }\n",
        r#"{"experiment_id": "EXPERIMENT_ID_PLACEHOLDER", "publish_dir": "PUBLISH_DIR_PLACEHOLDER", "sim_data_path": "SIM_DATA_PATH_PLACEHOLDER"}"#,
        "workDir = 'WORK_DIR_PLACEHOLDER'\nprocess.container = 'CONTAINER_IMAGE_PLACEHOLDER'\n",
        "#!/bin/bash\n#SBATCH --job-name=JOB_NAME_PLACEHOLDER\n#SBATCH --output=REMOTE_LOG_OUTPUT_FILE\n#SBATCH --error=REMOTE_LOG_ERROR_FILE\nexport CORRELATION_ID=CORRELATION_ID_PLACEHOLDER\nnextflow run NEXTFLOW_SCRIPT_PATH -c NEXTFLOW_CONFIG_PATH NEXTFLOW_PROFILE_ARGS -with-report REMOTE_REPORT_FILE -with-trace REMOTE_TRACE_FILE > REMOTE_EVENTS_FILE\n",
    )
}

fn service(runner: &ScriptedRunner) -> NextflowServiceSlurm<ScriptedRunner> {
    let ssh = SshSessionService::new(ssh_config(), runner.clone()).expect("valid ssh config");
    NextflowServiceSlurm::new(ssh, SlurmService::new(), hpc_config(), templates())
        .with_id_source(fixed_id)
}

fn submission() -> NextflowJobSubmission {
    NextflowJobSubmission {
        job_id: JOB_ID,
        job_name: String::from(JOB_NAME),
        correlation_id: String::from(CORRELATION_ID),
        remote_output_file: format!("/hpc/logs/{JOB_NAME}.out"),
        remote_error_file: format!("/hpc/logs/{JOB_NAME}.err"),
        simulation_output_dir: String::from("/hpc/sims/exp1"),
    }
}

const fn policy(interval: u64, max_wait: u64) -> PollPolicy {
    PollPolicy {
        poll_interval: Duration::from_secs(interval),
        max_wait: Duration::from_secs(max_wait),
    }
}

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

async fn open(
    service: &NextflowServiceSlurm<ScriptedRunner>,
    runner: &ScriptedRunner,
) -> SshSession<ScriptedRunner> {
    runner.push_ping();
    service.ssh.session().await.expect("session opens")
}

fn push_submission(runner: &ScriptedRunner) {
    runner.push_success(); // mkdir -p
    runner.push_success(); // main.nf
    runner.push_success(); // nextflow.config
    runner.push_success(); // workflow_config.json
    runner.push_success(); // sbatch upload
    runner.push_stdout(format!("Submitted batch job {JOB_ID}\n"));
}

#[rstest]
fn prepare_submission_renders_every_template(runner: ScriptedRunner) {
    let prepared = service(&runner)
        .prepare_submission("exp1")
        .expect("renders");

    assert_eq!(prepared.layout.job_name, JOB_NAME);
    assert_eq!(prepared.correlation_id, CORRELATION_ID);
    let sbatch = &prepared.artifacts.sbatch;
    assert!(sbatch.contains(&format!("--job-name={JOB_NAME}")));
    assert!(sbatch.contains(&format!("CORRELATION_ID={CORRELATION_ID}")));
    assert!(sbatch.contains(&format!("-c /hpc/logs/{JOB_NAME}.config -profile slurm")));
    assert!(sbatch.contains(&format!("> /hpc/logs/{JOB_NAME}.events.ndjson")));
    assert!(
        prepared
            .artifacts
            .nextflow_config
            .contains(&format!("workDir = '/hpc/logs/{JOB_NAME}_work'"))
    );
    assert!(
        prepared
            .artifacts
            .nextflow_script
            .contains("/hpc/sims/exp1/workflow_config.json")
    );
    let workflow: serde_json::Value =
        serde_json::from_str(&prepared.artifacts.workflow_config).expect("json");
    assert_eq!(workflow["publish_dir"], "/hpc/sims/exp1");
    assert_eq!(workflow["sim_data_path"], "/hpc/data/kb");
}

#[rstest]
fn unknown_placeholder_fails_before_upload(runner: ScriptedRunner) {
    let ssh = SshSessionService::new(ssh_config(), runner.clone()).expect("valid ssh config");
    let mut broken = templates();
    broken.sbatch.push_str("echo OUTPUT_DIR_PLACEHOLDER\n");
    let service = NextflowServiceSlurm::new(ssh, SlurmService::new(), hpc_config(), broken);

    let err = service.prepare_submission("exp1").expect_err("unknown token");

    assert!(matches!(err, TemplateError::UnknownPlaceholder { .. }));
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn submit_uploads_artifacts_then_submits(runner: ScriptedRunner) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    push_submission(&runner);

    let submitted = service
        .submit_simulation_job(&session, "exp1")
        .await
        .expect("submits");

    assert_eq!(submitted, submission());
    let calls = runner.invocations();
    let targets: Vec<String> = calls
        .iter()
        .filter(|call| call.program == "scp")
        .map(|call| call.last_arg())
        .collect();
    assert_eq!(
        targets,
        vec![
            format!("svc@login.hpc.example:/hpc/logs/{JOB_NAME}.nf"),
            format!("svc@login.hpc.example:/hpc/logs/{JOB_NAME}.config"),
            String::from("svc@login.hpc.example:/hpc/sims/exp1/workflow_config.json"),
            format!("svc@login.hpc.example:/hpc/logs/{JOB_NAME}.sbatch"),
        ]
    );
    let remote = runner.remote_commands();
    assert_eq!(remote.get(1).map(String::as_str), Some("mkdir -p /hpc/sims/exp1"));
    assert_eq!(
        remote.last().map(String::as_str),
        Some(format!("sbatch /hpc/logs/{JOB_NAME}.sbatch").as_str())
    );
    session.close().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn poll_follows_squeue_then_sacct(runner: ScriptedRunner) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    runner.push_stdout(squeue_output(&[(JOB_ID, JOB_NAME, "PENDING")]));
    runner.push_stdout(squeue_output(&[(JOB_ID, JOB_NAME, "RUNNING")]));
    runner.push_stdout(squeue_output(&[]));
    runner.push_stdout(sacct_output(&[(
        "424242",
        JOB_NAME,
        "COMPLETED",
        "0:0",
    )]));

    let started = tokio::time::Instant::now();
    let job = service
        .poll_simulation_job(&session, &submission(), policy(30, 300))
        .await
        .expect("completes");

    assert_eq!(job.job_state, SlurmJobState::Completed);
    assert_eq!(job.exit_code, Some(0));
    assert!(job.is_done());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(90));
    assert_eq!(runner.pending(), 0);
    session.close().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn poll_times_out_without_terminal_state(runner: ScriptedRunner) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    for _ in 0..3 {
        runner.push_stdout(squeue_output(&[(JOB_ID, JOB_NAME, "RUNNING")]));
    }

    let err = service
        .poll_simulation_job(&session, &submission(), policy(30, 60))
        .await
        .expect_err("times out");

    let NextflowJobError::Timeout {
        job_id,
        waited_seconds,
        last_state,
        logs,
    } = err
    else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(job_id, JOB_ID);
    assert_eq!(waited_seconds, 60);
    assert_eq!(last_state, "RUNNING");
    assert_eq!(logs, submission().logs());
    session.close().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn zero_poll_interval_waits_the_minimum_between_checks(runner: ScriptedRunner) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    for _ in 0..4 {
        runner.push_stdout(squeue_output(&[(JOB_ID, JOB_NAME, "RUNNING")]));
    }

    let started = tokio::time::Instant::now();
    let err = service
        .poll_simulation_job(&session, &submission(), policy(0, 3))
        .await
        .expect_err("times out");

    assert!(
        matches!(err, NextflowJobError::Timeout { waited_seconds: 3, .. }),
        "{err:?}"
    );
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert_eq!(runner.pending(), 0);
    let checks = runner
        .remote_commands()
        .iter()
        .filter(|cmd| cmd.starts_with("squeue"))
        .count();
    assert_eq!(checks, 4);
    session.close().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn poll_tolerates_one_unknown_then_fails(runner: ScriptedRunner) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    for _ in 0..2 {
        runner.push_stdout(squeue_output(&[]));
        runner.push_stdout(sacct_output(&[]));
    }

    let err = service
        .poll_simulation_job(&session, &submission(), policy(30, 300))
        .await
        .expect_err("vanished");

    assert!(matches!(err, NextflowJobError::JobNotFound { job_id: JOB_ID, .. }));
    session.close().await;
}

#[rstest]
#[case("FAILED", "1:0", Some(1))]
#[case("CANCELLED by 1000", "0:15", Some(0))]
#[case("TIMEOUT", "0:0", Some(0))]
#[tokio::test(start_paused = true)]
async fn poll_rejects_unsuccessful_terminal_states(
    runner: ScriptedRunner,
    #[case] state: &str,
    #[case] exit: &str,
    #[case] expected_exit: Option<i32>,
) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    runner.push_stdout(squeue_output(&[]));
    runner.push_stdout(sacct_output(&[("424242", JOB_NAME, state, exit)]));

    let err = service
        .poll_simulation_job(&session, &submission(), policy(30, 300))
        .await
        .expect_err("not completed");

    let NextflowJobError::NotCompleted {
        exit_code, logs, ..
    } = &err
    else {
        panic!("expected NotCompleted, got {err:?}");
    };
    assert_eq!(*exit_code, expected_exit);
    assert_eq!(logs.error, format!("/hpc/logs/{JOB_NAME}.err"));
    assert!(err.to_string().contains(&format!("/hpc/logs/{JOB_NAME}.out")));
    session.close().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn poll_rejects_foreign_job_name(runner: ScriptedRunner) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    runner.push_stdout(squeue_output(&[]));
    runner.push_stdout(sacct_output(&[("424242", "other", "COMPLETED", "0:0")]));

    let err = service
        .poll_simulation_job(&session, &submission(), policy(30, 300))
        .await
        .expect_err("mismatch");

    assert_eq!(
        err,
        NextflowJobError::NameMismatch {
            job_id: JOB_ID,
            expected: String::from(JOB_NAME),
            actual: String::from("other"),
            logs: submission().logs(),
        }
    );
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn outputs_are_listed_with_a_bound(runner: ScriptedRunner) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    runner.push_stdout("/hpc/sims/exp1/a.parquet\n/hpc/sims/exp1/b.parquet\n");

    let files = service
        .list_simulation_outputs(&session, &submission())
        .await
        .expect("lists");

    assert_eq!(files, vec!["/hpc/sims/exp1/a.parquet", "/hpc/sims/exp1/b.parquet"]);
    assert_eq!(
        runner.remote_commands().last().map(String::as_str),
        Some("find /hpc/sims/exp1 -type f | head -n 5")
    );
    session.close().await;
}

#[rstest]
#[tokio::test]
async fn empty_output_directory_is_an_error(runner: ScriptedRunner) {
    let service = service(&runner);
    let session = open(&service, &runner).await;
    runner.push_stdout("\n");

    let err = service
        .list_simulation_outputs(&session, &submission())
        .await
        .expect_err("empty");

    assert!(matches!(
        err,
        NextflowJobError::EmptyOutput { ref output_dir, .. } if output_dir == "/hpc/sims/exp1"
    ));
    session.close().await;
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn run_simulation_uses_one_session(runner: ScriptedRunner) {
    let service = service(&runner);
    runner.push_ping();
    push_submission(&runner);
    runner.push_stdout(squeue_output(&[(JOB_ID, JOB_NAME, "RUNNING")]));
    runner.push_stdout(squeue_output(&[]));
    runner.push_stdout(sacct_output(&[("424242", JOB_NAME, "COMPLETED", "0:0")]));
    runner.push_stdout("/hpc/sims/exp1/out.json\n");
    runner.push_success(); // control master exit

    let run = service
        .run_simulation("exp1", policy(30, 300))
        .await
        .expect("lifecycle succeeds");

    assert_eq!(run.submission.job_id, JOB_ID);
    assert_eq!(run.outputs, vec!["/hpc/sims/exp1/out.json"]);
    let calls = runner.invocations();
    let control_paths: Vec<&str> = calls
        .iter()
        .filter_map(|call| {
            call.args
                .iter()
                .filter_map(|arg| arg.to_str())
                .find(|arg| arg.starts_with("ControlPath="))
        })
        .collect();
    assert!(control_paths.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(calls.last().is_some_and(|call| call.args.iter().any(|arg| arg == "-O")));
    assert!(runner.detached().is_empty());
}

#[rstest]
#[tokio::test]
async fn run_simulation_closes_session_on_failure(runner: ScriptedRunner) {
    let service = service(&runner);
    runner.push_ping();
    runner.push_failure(1, "mkdir: cannot create directory: Permission denied");
    runner.push_success(); // control master exit

    let err = service
        .run_simulation("exp1", policy(30, 300))
        .await
        .expect_err("mkdir fails");

    assert!(matches!(err, NextflowJobError::Ssh(_)));
    let calls = runner.invocations();
    assert!(calls.last().is_some_and(|call| call.args.iter().any(|arg| arg == "-O")));
    assert!(runner.detached().is_empty());
}
