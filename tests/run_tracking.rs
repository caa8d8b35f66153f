//! A workflow run started through [`AppContext::run_simulation`] is stored,
//! and telemetry its worker publishes while it runs lands against it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rstest::{fixture, rstest};
use slurmflow::test_support::{
    MemoryMessagingService, ScriptedRunner, sacct_output, squeue_output, ssh_config,
};
use slurmflow::{
    AppContext, DatabaseService, HpcConfig, JobStatus, JobType, MessagingConfig, MessagingService,
};
use uuid::Uuid;

const JOB_ID: u64 = 9_001;
const JOB_NAME: &str = "vecoli_fedcba98";
const SIMULATOR_ID: i64 = 7;

fn fixed_id() -> Uuid {
    Uuid::from_u128(0xfedc_ba98_7654_4321_8000_0000_0000_00ff)
}

fn hpc_config() -> HpcConfig {
    HpcConfig {
        slurm_log_base_path: String::from("/scratch/slurm/logs"),
        sim_base_path: String::from("/scratch/sims"),
        job_name: String::from("vecoli"),
        container_image: String::from("/scratch/images/vecoli.sif"),
        sim_data_path: String::from("/scratch/kb/simData.cPickle"),
        nextflow_profile: None,
        template_dir: format!("{}/templates", env!("CARGO_MANIFEST_DIR")),
        poll_interval_seconds: 15,
        max_wait_seconds: 120,
        output_listing_limit: 10,
    }
}

fn messaging_config() -> MessagingConfig {
    MessagingConfig {
        backend: String::from("nats"),
        url: String::from("nats://127.0.0.1:4222"),
        subject_prefix: String::from("simulator"),
        connect_timeout_seconds: 10,
    }
}

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn context(runner: &ScriptedRunner) -> AppContext<ScriptedRunner> {
    AppContext::from_config(ssh_config(), hpc_config(), messaging_config(), runner.clone())
        .expect("context")
        .with_id_source(fixed_id)
}

/// Session, submission, one running check, completion, output listing.
fn push_completed_run(runner: &ScriptedRunner) {
    runner.push_ping();
    for _ in 0..5 {
        runner.push_success();
    }
    runner.push_stdout(format!("Submitted batch job {JOB_ID}\n"));
    runner.push_stdout(squeue_output(&[(JOB_ID, JOB_NAME, "RUNNING")]));
    runner.push_stdout(squeue_output(&[]));
    runner.push_stdout(sacct_output(&[("9001", JOB_NAME, "COMPLETED", "0:0")]));
    runner.push_stdout("/scratch/sims/exp-42/baseline/daughter_A.json\n");
    runner.push_success();
}

fn worker_payload(correlation_id: &str, sequence_number: u64) -> Bytes {
    let event = serde_json::json!({
        "correlation_id": correlation_id,
        "sequence_number": sequence_number,
        "mass": {"protein": 152.625},
        "time": 3.5,
    });
    Bytes::from(serde_json::to_vec(&event).expect("json"))
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn events_published_during_the_run_are_stored(runner: ScriptedRunner) {
    push_completed_run(&runner);
    let context = context(&runner);
    let database = context.database();
    let bus = Arc::new(MemoryMessagingService::connected());
    let listener: Arc<dyn MessagingService> = bus.clone();
    let correlation_id = fixed_id().to_string();

    let worker = async {
        for _ in 0..30 {
            let registered = database
                .get_hpcrun_id_by_correlation_id(&correlation_id)
                .await
                .expect("lookup");
            if registered.is_some() {
                bus.publish("simulator.7", worker_payload(&correlation_id, 1))
                    .await
                    .expect("publish");
                bus.publish("simulator.7", worker_payload("someone-else", 2))
                    .await
                    .expect("publish foreign");
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("run was never registered");
    };
    let (result, ()) = tokio::join!(
        context.run_simulation("exp-42", SIMULATOR_ID, Some(listener)),
        worker
    );
    let tracked = result.expect("run completes");

    assert_eq!(tracked.run.submission.correlation_id, correlation_id);
    assert_eq!(tracked.hpcrun.slurmjobid, Some(JOB_ID));
    assert_eq!(tracked.hpcrun.ref_id, SIMULATOR_ID);
    assert_eq!(tracked.hpcrun.job_type, JobType::Simulation);
    assert_eq!(tracked.hpcrun.status, JobStatus::Completed);
    assert_eq!(tracked.events.len(), 1);
    let stored = tracked.events.first().expect("one event");
    assert_eq!(stored.correlation_id, correlation_id);
    assert_eq!(stored.hpcrun_id, Some(tracked.hpcrun.database_id));
    assert_eq!(stored.mass.get("protein").copied(), Some(152.625));
    assert!(!bus.is_connected(), "subscription closed after the run");
    assert_eq!(runner.pending(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn run_without_listening_still_registers_the_job(runner: ScriptedRunner) {
    push_completed_run(&runner);
    let context = context(&runner);

    let tracked = context
        .run_simulation("exp-42", SIMULATOR_ID, None)
        .await
        .expect("run completes");

    let stored = context
        .database()
        .get_hpcrun_by_ref(SIMULATOR_ID, JobType::Simulation)
        .await
        .expect("lookup")
        .expect("registered");
    assert_eq!(stored, tracked.hpcrun);
    assert_eq!(stored.correlation_id, fixed_id().to_string());
    assert!(tracked.events.is_empty());
}

#[rstest]
#[tokio::test]
async fn jobs_tracked_by_hand_receive_events(runner: ScriptedRunner) {
    let context = context(&runner);
    let run = context
        .track_run(JOB_ID, SIMULATOR_ID, "corr-1")
        .await
        .expect("registered");
    let bus = Arc::new(MemoryMessagingService::connected());
    let scheduler = context.scheduler(bus.clone());
    scheduler.subscribe(SIMULATOR_ID).await.expect("subscribe");

    bus.publish("simulator.7", worker_payload("corr-1", 4))
        .await
        .expect("publish");

    let events = context
        .database()
        .list_worker_events(run.database_id, None)
        .await
        .expect("list");
    assert_eq!(events.len(), 1);
    assert!(
        context
            .track_run(JOB_ID, SIMULATOR_ID, "corr-1")
            .await
            .is_err(),
        "correlation ids are unique"
    );
    scheduler.close().await.expect("close");
}
