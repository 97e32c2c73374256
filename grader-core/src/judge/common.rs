use std::path::Path;

use crate::compiler::Toolchains;
use crate::error::{path_not_exist, GraderCoreError};
use crate::run::sandbox::Sandbox;
use crate::run::{CancelFlag, IsolationPolicy, ResourceLimits};

use super::result::{ExecutionSummary, JobReport, TestCaseVerdict, Verdict};
use super::validator::validate;
use super::{Job, JobState};

const DEFAULT_BUILD_TIMEOUT: u64 = 60;
const DEFAULT_LOG_LIMIT: usize = 10_000;

/// Settings shared by every job an executor grades.
#[derive(Debug, Clone)]
pub struct JudgeSettings {
    pub build_limits: ResourceLimits,
    pub isolation: IsolationPolicy,
    /// Bytes of stdout/stderr/build log kept per report entry.
    pub log_limit: usize,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            build_limits: ResourceLimits::for_build(DEFAULT_BUILD_TIMEOUT),
            isolation: IsolationPolicy::default(),
            log_limit: DEFAULT_LOG_LIMIT,
        }
    }
}

pub struct JudgeContext<'a> {
    pub toolchains: &'a Toolchains,
    pub settings: &'a JudgeSettings,
    pub cancel: CancelFlag,
}

/// Turn an error into a report when it is the toolchain's fault. Host
/// failures and cancellation still propagate so the job can be handed back.
fn tooling_failure(
    job: &Job,
    error: GraderCoreError,
    build_log: String,
) -> Result<JobReport, GraderCoreError> {
    match error {
        GraderCoreError::Cancelled => Err(error),
        error if error.is_fatal() => Err(error),
        error => {
            log::error!("Job {}: tooling failure: {}", job.id, error);
            Ok(JobReport::internal_error(job, error, build_log))
        }
    }
}

/// Build the submission in `source_dir` and grade it against every test case.
///
/// `observer` sees `Building`, then `Running(i)`/`Validating(i)` per test
/// case. Fetching and reporting are the caller's business.
pub fn run_job(
    job: &Job,
    source_dir: &Path,
    context: &JudgeContext,
    observer: &mut dyn FnMut(JobState),
) -> Result<JobReport, GraderCoreError> {
    if !source_dir.is_dir() {
        return Err(path_not_exist(source_dir));
    }
    let settings = context.settings;
    let sandbox = Sandbox::new(source_dir, settings.isolation, context.cancel.clone());

    observer(JobState::Building);
    log::info!("Job {}: building {} submission", job.id, job.language);
    let build = match context.toolchains.build(
        &sandbox,
        job.language,
        job.artifact.as_deref(),
        &settings.build_limits,
    ) {
        Ok(build) => build,
        Err(e) => return tooling_failure(job, e, String::new()),
    };

    let executor = match build.executor {
        Some(executor) if build.succeeded => executor,
        _ => {
            log::info!("Job {}: compile error", job.id);
            return Ok(JobReport::compile_error(
                job,
                build.build_log,
                settings.log_limit,
            ));
        }
    };

    let mut verdicts = Vec::with_capacity(job.test_cases.len());
    for (index, test_case) in job.test_cases.iter().enumerate() {
        let (verdict, execution) = if test_case.validator.requires_execution() {
            observer(JobState::Running(index));
            let result = match executor.execute(
                &sandbox,
                test_case.stdin.as_bytes(),
                &test_case.argv,
                &test_case.limits,
            ) {
                Ok(result) => Ok(result),
                Err(e) if e.is_unrunnable_program() => {
                    log::info!("Job {}: program could not be started: {}", job.id, e);
                    Err(e)
                }
                Err(e) => return tooling_failure(job, e, build.build_log),
            };
            observer(JobState::Validating(index));
            match result {
                Ok(result) => (
                    validate(test_case, Some(&result)),
                    Some(ExecutionSummary::new(&result, settings.log_limit)),
                ),
                Err(e) => (
                    Verdict::fail("Your program could not be started: it is not an executable.")
                        .with_tutor_explanation(e.to_string()),
                    None,
                ),
            }
        } else {
            observer(JobState::Validating(index));
            (validate(test_case, None), None)
        };
        log::info!(
            "Job {}: test case {} {}",
            job.id,
            test_case.id,
            verdict.status
        );
        verdicts.push(TestCaseVerdict {
            test_id: test_case.id.clone(),
            weight: test_case.weight,
            verdict,
            execution,
        });
    }

    let report = JobReport::new(job.id.clone(), verdicts, build.build_log);
    log::info!(
        "Job {}: {} {}/{}",
        job.id,
        report.verdict.status,
        report.verdict.passed,
        report.verdict.total
    );
    Ok(report)
}
