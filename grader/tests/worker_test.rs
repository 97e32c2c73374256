use std::{path::Path, sync::Arc, time::Duration};

use base64::Engine;
use clap::Parser;
use grader::{
    agent::platform::PlatformClient,
    option::GraderOpt,
    reporter::{spool::Spool, Reporter},
    worker::{JudgeWorker, WorkerState},
};
use grader_core::compiler::Toolchains;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

const PICK_PATH: &str = "/api/v1/executor/jobs/pick";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options(server: &MockServer, work_dir: &Path, spool_dir: &Path) -> GraderOpt {
    GraderOpt::try_parse_from([
        "grader",
        "serve",
        "--server-url",
        &server.uri(),
        "--work-dir",
        work_dir.to_str().unwrap(),
        "--spool-dir",
        spool_dir.to_str().unwrap(),
        "--poll-interval",
        "1",
        "--isolation",
        "off",
        "--executor-uuid",
        "00000000-0000-0000-0000-000000000000",
    ])
    .unwrap()
}

fn worker(opt: &GraderOpt, spool: Spool) -> Arc<JudgeWorker> {
    let config = opt.executor_config().unwrap();
    let platform = Arc::new(
        PlatformClient::new(
            &config.server_url,
            config.secret.expose(),
            config.http_timeout,
            config.executor_uuid,
            config.hostname.clone(),
        )
        .unwrap(),
    );
    let reporter = Arc::new(Reporter::new(
        platform.clone(),
        spool,
        config.retry,
        config.message_size,
    ));
    Arc::new(JudgeWorker::new(
        &config,
        platform,
        reporter,
        Arc::new(Toolchains::default()),
        opt.judge_settings(),
        Arc::new(WorkerState::new(config.slots)),
    ))
}

async fn mount_single_pick(server: &MockServer, job: Value) {
    Mock::given(method("POST"))
        .and(path(PICK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "job": job })))
        .up_to_n_times(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(PICK_PATH))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

/// Run the worker until a request to `wanted` reaches the server, then stop it.
async fn run_until_requested(worker: Arc<JudgeWorker>, server: &MockServer, wanted: &str) {
    let shutdown = CancellationToken::new();
    let running = tokio::spawn(worker.run(shutdown.clone()));

    let mut seen = false;
    for _ in 0..300 {
        let requests = server.received_requests().await.unwrap_or_default();
        if requests.iter().any(|request| request.url.path() == wanted) {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(30), running)
        .await
        .unwrap()
        .unwrap();
    assert!(seen, "no request to {}", wanted);
}

#[tokio::test]
async fn test_verdict_without_a_home_releases_the_job() {
    init();
    let server = MockServer::start().await;
    let content = base64::engine::general_purpose::STANDARD.encode("echo hi\n");
    mount_single_pick(
        &server,
        json!({
            "id": "31",
            "language": "shell",
            "test_cases": [{"id": "t1", "validator": {"kind": "stdout", "expected": "hi\n"}}],
            "files": [{"path": "main.sh", "content": content}]
        }),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/executor/jobs/31/result"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad report"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/executor/jobs/31/release"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let work_dir = tempfile::tempdir().unwrap();
    let spool_dir = work_dir.path().join("spool");
    let opt = options(&server, work_dir.path(), &spool_dir);
    let spool = Spool::open(spool_dir.clone()).unwrap();
    // The spool becomes unwritable after startup.
    std::fs::remove_dir(&spool_dir).unwrap();
    std::fs::write(&spool_dir, "not a directory").unwrap();

    run_until_requested(
        worker(&opt, spool),
        &server,
        "/api/v1/executor/jobs/31/release",
    )
    .await;
    server.verify().await;
}

#[tokio::test]
async fn test_unreadable_job_is_answered_with_internal_error() {
    init();
    let server = MockServer::start().await;
    mount_single_pick(
        &server,
        json!({"id": "77", "language": "cobol", "test_cases": []}),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/executor/jobs/77/result"))
        .and(body_partial_json(json!({
            "report": {"job_id": "77", "verdict": {"status": "internal_error"}}
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let work_dir = tempfile::tempdir().unwrap();
    let spool_dir = work_dir.path().join("spool");
    let opt = options(&server, work_dir.path(), &spool_dir);
    let spool = Spool::open(spool_dir).unwrap();

    run_until_requested(
        worker(&opt, spool),
        &server,
        "/api/v1/executor/jobs/77/result",
    )
    .await;
    server.verify().await;
}
