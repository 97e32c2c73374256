pub mod archive;
pub mod workspace;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use grader_core::{
    compiler::{Language, Toolchains},
    error::GraderCoreError,
    judge::{
        common::{run_job, JudgeContext, JudgeSettings},
        result::JobReport,
        Job, JobState,
    },
    run::CancelFlag,
};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::agent::{
    hostinfo::HostInfo,
    platform::{JobDescriptor, PlatformClient},
};
use crate::error::ClientError;
use crate::option::ExecutorConfig;
use crate::reporter::Reporter;
use workspace::{Workspace, WorkspaceError};

/// Current state of one job held by a slot.
#[derive(Debug, Clone, PartialEq, Serialize, utoipa::ToSchema)]
pub struct JobStatus {
    pub job_id: String,
    #[schema(value_type = Object)]
    pub state: JobState,
}

/// Shared view of what every slot is doing.
#[derive(Debug)]
pub struct WorkerState {
    slots: usize,
    jobs: Mutex<HashMap<String, JobState>>,
}

impl WorkerState {
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn set(&self, job_id: &str, state: JobState) {
        log::debug!("Job {} -> {:?}", job_id, state);
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job_id.to_string(), state);
    }

    pub fn remove(&self, job_id: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(job_id);
    }

    pub fn snapshot(&self) -> Vec<JobStatus> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut statuses: Vec<JobStatus> = jobs
            .iter()
            .map(|(job_id, state)| JobStatus {
                job_id: job_id.clone(),
                state: *state,
            })
            .collect();
        statuses.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        statuses
    }
}

enum GradeOutcome {
    Report(JobReport),
    Release(String),
}

pub struct JudgeWorker {
    platform: Arc<PlatformClient>,
    reporter: Arc<Reporter>,
    toolchains: Arc<Toolchains>,
    settings: Arc<JudgeSettings>,
    state: Arc<WorkerState>,
    slots: Arc<Semaphore>,
    languages: Vec<Language>,
    hostname: String,
    work_dir: PathBuf,
    cleanup: bool,
    poll_interval: Duration,
}

impl JudgeWorker {
    pub fn new(
        config: &ExecutorConfig,
        platform: Arc<PlatformClient>,
        reporter: Arc<Reporter>,
        toolchains: Arc<Toolchains>,
        settings: JudgeSettings,
        state: Arc<WorkerState>,
    ) -> Self {
        let languages = toolchains.available_languages();
        Self {
            platform,
            reporter,
            toolchains,
            settings: Arc::new(settings),
            slots: Arc::new(Semaphore::new(state.slots())),
            state,
            languages,
            hostname: config.hostname.clone(),
            work_dir: config.work_dir.clone(),
            cleanup: config.cleanup,
            poll_interval: config.poll_interval,
        }
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    /// Pull and grade jobs until `shutdown` fires, then wait for the
    /// in-flight jobs to be released.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        log::info!(
            "Judge worker started: {} slots, languages {:?}",
            self.state.slots(),
            self.languages
        );
        if self.languages.is_empty() {
            log::warn!("No toolchain found on this host, jobs will not be offered");
        }
        self.flush_spool().await;

        let mut jobs = JoinSet::new();
        loop {
            while let Some(joined) = jobs.try_join_next() {
                if let Err(e) = joined {
                    log::error!("Job task failed: {}", e);
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let free_slots = self.slots.available_permits() + 1;
            let picked = tokio::select! {
                _ = shutdown.cancelled() => break,
                picked = self.platform.pick_job(&self.languages, free_slots) => picked,
            };

            match picked {
                Ok(Some(descriptor)) => {
                    let worker = self.clone();
                    let cancel = shutdown.child_token();
                    jobs.spawn(async move {
                        worker.grade(descriptor, cancel).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {
                    drop(permit);
                    log::debug!("No job available");
                    self.flush_spool().await;
                }
                Err(ClientError::UndecodableJob { job_id, reason }) => {
                    drop(permit);
                    self.answer_undecodable(job_id, &reason).await;
                    continue;
                }
                Err(ClientError::RegistrationRequired) => {
                    drop(permit);
                    log::info!("Executor {} unknown to the server", self.platform.executor_uuid());
                    self.register().await;
                }
                Err(e) => {
                    drop(permit);
                    log::warn!("Failed to pick job: {}", e);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        log::info!("Judge worker stopping, {} jobs in flight", jobs.len());
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                log::error!("Job task failed: {}", e);
            }
        }
        log::info!("Judge worker stopped");
    }

    pub async fn register(&self) {
        let host = HostInfo::collect(
            self.platform.executor_uuid(),
            self.hostname.clone(),
            self.languages.clone(),
        );
        if let Err(e) = self.platform.register(&host).await {
            log::error!("Failed to register executor: {}", e);
        }
    }

    /// A picked job that cannot be read is reported as an internal error so
    /// the server does not wait for it forever.
    async fn answer_undecodable(&self, job_id: Option<String>, reason: &str) {
        match job_id {
            Some(job_id) => {
                log::error!("Job {} could not be decoded: {}", job_id, reason);
                let report = JobReport::undecodable(job_id.clone(), reason);
                self.deliver(&job_id, report).await;
            }
            None => log::error!("Picked a job without a readable id: {}", reason),
        }
    }

    async fn flush_spool(&self) {
        match self.reporter.flush().await {
            Ok(0) => {}
            Ok(delivered) => log::info!("Delivered {} spooled reports", delivered),
            Err(e) => log::error!("Failed to flush spool: {}", e),
        }
    }

    async fn grade(&self, descriptor: JobDescriptor, cancel: CancellationToken) {
        let JobDescriptor { job, files } = descriptor;
        let job_id = job.id.clone();
        self.state.set(&job_id, JobState::Fetched);
        log::info!(
            "Job {} fetched: {} with {} test cases",
            job_id,
            job.language,
            job.test_cases.len()
        );

        let mut workspace = match Workspace::create(&self.work_dir, &job_id, self.cleanup) {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Job {}: failed to create workspace: {}", job_id, e);
                self.release(&job_id, &e.to_string()).await;
                self.state.remove(&job_id);
                return;
            }
        };

        let outcome = match workspace.write_files(&files) {
            Ok(()) => {
                let source_dir = workspace.source_dir().to_path_buf();
                match self.judge(job.clone(), source_dir, cancel).await {
                    Ok(report) => GradeOutcome::Report(report),
                    Err(GraderCoreError::Cancelled) => {
                        GradeOutcome::Release("executor shutting down".to_string())
                    }
                    Err(e) if e.is_fatal() => {
                        log::error!("Job {}: executor failure: {}", job_id, e);
                        GradeOutcome::Release(e.to_string())
                    }
                    Err(e) => {
                        log::error!("Job {}: grading failed: {}", job_id, e);
                        GradeOutcome::Report(JobReport::internal_error(&job, e, String::new()))
                    }
                }
            }
            Err(WorkspaceError::Rejected(explanation)) => {
                log::info!("Job {}: submission rejected: {}", job_id, explanation);
                GradeOutcome::Report(JobReport::rejected(&job, explanation))
            }
            Err(e @ WorkspaceError::Malformed { .. }) => {
                log::error!("Job {}: {}", job_id, e);
                GradeOutcome::Report(JobReport::internal_error(&job, e, String::new()))
            }
            Err(WorkspaceError::IOError(e)) => {
                log::error!("Job {}: failed to write submission: {}", job_id, e);
                GradeOutcome::Release(e.to_string())
            }
        };

        match outcome {
            GradeOutcome::Report(report) => {
                if self.deliver(&job_id, report).await {
                    self.state.set(&job_id, JobState::Reported);
                }
            }
            GradeOutcome::Release(reason) => self.release(&job_id, &reason).await,
        }
        workspace.purge();
        self.state.remove(&job_id);
    }

    /// Run the blocking pipeline on the blocking pool, with `cancel` wired
    /// into the sandbox.
    async fn judge(
        &self,
        job: Job,
        source_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Result<JobReport, GraderCoreError> {
        let flag = CancelFlag::new();
        let bridge = {
            let flag = flag.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                flag.cancel();
            })
        };

        let toolchains = self.toolchains.clone();
        let settings = self.settings.clone();
        let state = self.state.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let context = JudgeContext {
                toolchains: &toolchains,
                settings: &settings,
                cancel: flag,
            };
            let mut observer = |job_state: JobState| state.set(&job.id, job_state);
            run_job(&job, &source_dir, &context, &mut observer)
        });
        let joined = handle.await;
        bridge.abort();
        joined.map_err(|e| {
            GraderCoreError::AnyhowError(anyhow::anyhow!("Grading task panicked: {}", e))
        })?
    }

    /// Report, or spool, the verdict. When neither works the job is handed
    /// back so it gets graded again.
    async fn deliver(&self, job_id: &str, report: JobReport) -> bool {
        match self.reporter.report(report).await {
            Ok(outcome) => {
                log::info!("Job {} reported: {:?}", job_id, outcome);
                true
            }
            Err(e) => {
                log::error!("Job {}: failed to report or spool: {}", job_id, e);
                self.release(job_id, &format!("verdict could not be stored: {}", e))
                    .await;
                false
            }
        }
    }

    async fn release(&self, job_id: &str, reason: &str) {
        log::warn!("Releasing job {}: {}", job_id, reason);
        if let Err(e) = self.platform.release_job(job_id, reason).await {
            log::warn!("Failed to release job {}: {}", job_id, e);
        }
    }
}
