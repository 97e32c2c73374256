use std::{fs, path::Path, sync::Arc};

use actix_web::{web::Data, App, HttpServer};
use anyhow::Context;
use grader::{
    agent::{hostinfo::HostInfo, platform::PlatformClient},
    handler::{self, state::StatusContext},
    option::{self, ExecutorConfig, GraderCommand, GraderOpt},
    reporter::{spool::Spool, Reporter},
    worker::{workspace::Workspace, JudgeWorker, WorkerState},
};
use grader_core::{
    compiler::Language,
    judge::{
        common::{run_job, JudgeContext},
        Job, JobState,
    },
    run::CancelFlag,
    utils::copy_recursively,
};
use tokio_util::sync::CancellationToken;

const JOB_FILE: &str = "job.json";

#[actix_web::main]
// The button provided by rust-analyzer will not work as expected here
// Use RUN AND DEBUG feature in VSCode
async fn main() -> anyhow::Result<()> {
    let opt = option::load_option();

    match &opt.cmd {
        GraderCommand::Serve => serve(&opt).await,
        GraderCommand::Judge { dir } => judge_local(&opt, dir),
        GraderCommand::Configure => configure(&opt).await,
        GraderCommand::Flush => flush(&opt).await,
    }
}

fn connect(config: &ExecutorConfig) -> anyhow::Result<(Arc<PlatformClient>, Arc<Reporter>)> {
    let platform = Arc::new(PlatformClient::new(
        &config.server_url,
        config.secret.expose(),
        config.http_timeout,
        config.executor_uuid,
        config.hostname.clone(),
    )?);
    let spool = Spool::open(config.spool_dir.clone())?;
    let reporter = Arc::new(Reporter::new(
        platform.clone(),
        spool,
        config.retry,
        config.message_size,
    ));
    Ok((platform, reporter))
}

async fn serve(opt: &GraderOpt) -> anyhow::Result<()> {
    let config = opt.executor_config()?;
    log::info!("Starting executor: {:?}", config);
    let toolchains = Arc::new(opt.load_toolchains()?);
    fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create work dir {:?}", config.work_dir))?;

    let (platform, reporter) = connect(&config)?;
    let worker_state = Arc::new(WorkerState::new(config.slots));
    let worker = Arc::new(JudgeWorker::new(
        &config,
        platform,
        reporter.clone(),
        toolchains,
        opt.judge_settings(),
        worker_state.clone(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let status_server = match config.status_port {
        Some(port) => {
            let context = Data::new(StatusContext {
                executor_uuid: config.executor_uuid,
                worker_state,
                reporter,
            });
            let server = HttpServer::new(move || {
                App::new()
                    .wrap(actix_web::middleware::Logger::default())
                    .app_data(context.clone())
                    .configure(handler::route)
            })
            .disable_signals()
            .bind(("0.0.0.0", port))?
            .run();
            log::info!("Status API listening on port {}", port);
            let handle = server.handle();
            actix_web::rt::spawn(server);
            Some(handle)
        }
        None => None,
    };

    worker.run(shutdown).await;

    if let Some(handle) = status_server {
        handle.stop(true).await;
    }
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.cancel();
                }
                return;
            }
        };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT"),
        _ = terminate.recv() => log::info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

/// Grade a local directory the way a pulled job would be graded.
fn judge_local(opt: &GraderOpt, dir: &Path) -> anyhow::Result<()> {
    let job_path = dir.join(JOB_FILE);
    let content = fs::read_to_string(&job_path)
        .with_context(|| format!("Failed to read {:?}", job_path))?;
    let job: Job = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {:?}", job_path))?;

    let toolchains = opt.load_toolchains()?;
    let settings = opt.judge_settings();
    fs::create_dir_all(&opt.work_dir)?;
    let mut workspace = Workspace::create(&opt.work_dir, &job.id, opt.cleanup)?;
    copy_recursively(dir, workspace.root())?;
    fs::remove_file(workspace.root().join(JOB_FILE))?;
    workspace.unpack_archives()?;

    let context = JudgeContext {
        toolchains: &toolchains,
        settings: &settings,
        cancel: CancelFlag::new(),
    };
    let mut observer = |state: JobState| log::info!("Job {}: {:?}", job.id, state);
    let result = run_job(&job, workspace.source_dir(), &context, &mut observer);
    workspace.purge();

    let mut report = result?;
    report.truncate_messages(opt.message_size);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn configure(opt: &GraderOpt) -> anyhow::Result<()> {
    let config = opt.executor_config()?;
    let toolchains = opt.load_toolchains()?;
    let languages = toolchains.available_languages();
    println!("{:#?}", config);
    println!("Isolation: {:?}", opt.isolation);
    for language in Language::ALL {
        let status = match languages.contains(&language) {
            true => "available",
            false => "missing",
        };
        let run = toolchains.get(language).map(|spec| spec.run.join(" "))?;
        println!("{:8} {:10} {}", language.to_string(), status, run);
    }

    let (platform, _) = connect(&config)?;
    let host = HostInfo::collect(config.executor_uuid, config.hostname.clone(), languages);
    platform.register(&host).await?;
    println!("Registered executor {}", host.uuid);
    Ok(())
}

async fn flush(opt: &GraderOpt) -> anyhow::Result<()> {
    let config = opt.executor_config()?;
    let (_, reporter) = connect(&config)?;
    let pending = reporter.spool().depth();
    let delivered = reporter.flush().await?;
    println!(
        "Delivered {} of {} spooled reports from {:?}",
        delivered,
        pending,
        reporter.spool().folder_path()
    );
    Ok(())
}
