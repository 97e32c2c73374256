use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::run::sandbox::{ExecutionResult, TerminationCause};
use crate::utils::truncate_log;

use super::Job;

pub const INTERNAL_ERROR_PREFIX: &str = "Internal grading error:";
const INTERNAL_ERROR_STUDENT_TEXT: &str =
    "your submission could not be graded, the course staff has been notified.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Partial,
    InternalError,
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    /// Shown to the student.
    pub explanation: String,
    /// Shown to course staff only, when they need more than the student gets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tutor_explanation: Option<String>,
    /// Fraction of the test case weight earned, in `0.0..=1.0`.
    pub credit: f64,
}

impl Verdict {
    pub fn pass(explanation: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Pass,
            explanation: explanation.into(),
            tutor_explanation: None,
            credit: 1.0,
        }
    }

    pub fn fail(explanation: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Fail,
            explanation: explanation.into(),
            tutor_explanation: None,
            credit: 0.0,
        }
    }

    pub fn partial(explanation: impl Into<String>, credit: f64) -> Self {
        Self {
            status: VerdictStatus::Partial,
            explanation: explanation.into(),
            tutor_explanation: None,
            credit: credit.clamp(0.0, 1.0),
        }
    }

    /// The detail goes to the tutor; the student only learns that grading
    /// broke down.
    pub fn internal_error(detail: impl fmt::Display) -> Self {
        Self {
            status: VerdictStatus::InternalError,
            explanation: format!("{} {}", INTERNAL_ERROR_PREFIX, INTERNAL_ERROR_STUDENT_TEXT),
            tutor_explanation: Some(format!("{} {}", INTERNAL_ERROR_PREFIX, detail)),
            credit: 0.0,
        }
    }

    pub fn with_tutor_explanation(mut self, tutor_explanation: impl Into<String>) -> Self {
        self.tutor_explanation = Some(tutor_explanation.into());
        self
    }

    pub fn tutor_text(&self) -> &str {
        self.tutor_explanation.as_deref().unwrap_or(&self.explanation)
    }

    pub fn is_pass(&self) -> bool {
        self.status == VerdictStatus::Pass
    }
}

/// The part of an [`ExecutionResult`] kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: TerminationCause,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionSummary {
    pub fn new(result: &ExecutionResult, log_limit: usize) -> Self {
        Self {
            exit_code: result.exit_code,
            signal: result.signal,
            termination: result.termination,
            wall_time_ms: result.wall_time.as_millis() as u64,
            cpu_time_ms: result.cpu_time.as_millis() as u64,
            peak_memory_bytes: result.peak_memory_bytes,
            stdout: truncate_log(&result.stdout, log_limit),
            stderr: truncate_log(&result.stderr, log_limit),
            stdout_truncated: result.stdout_truncated,
            stderr_truncated: result.stderr_truncated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseVerdict {
    pub test_id: String,
    pub weight: f64,
    pub verdict: Verdict,
    #[serde(default)]
    pub execution: Option<ExecutionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobVerdict {
    pub status: VerdictStatus,
    pub explanation: String,
    #[serde(default)]
    pub tutor_explanation: String,
    pub passed: usize,
    pub total: usize,
    pub score: f64,
    pub max_score: f64,
}

fn fail_summary(explanation: &str, passed: usize, total: usize) -> String {
    format!("{} ({}/{} passed)", explanation, passed, total)
}

impl JobVerdict {
    /// Pass only if every test case passed; any internal error wins over
    /// student failures.
    pub fn aggregate(test_cases: &[TestCaseVerdict]) -> Self {
        let total = test_cases.len();
        let passed = test_cases.iter().filter(|tc| tc.verdict.is_pass()).count();
        let score = test_cases
            .iter()
            .map(|tc| tc.weight * tc.verdict.credit)
            .sum();
        let max_score = test_cases.iter().map(|tc| tc.weight).sum();

        let internal_error = test_cases
            .iter()
            .find(|tc| tc.verdict.status == VerdictStatus::InternalError);
        let first_failure = test_cases.iter().find(|tc| !tc.verdict.is_pass());

        let (status, explanation, tutor_explanation) = match (internal_error, first_failure) {
            (Some(tc), _) => (
                VerdictStatus::InternalError,
                tc.verdict.explanation.clone(),
                format!("Test case {}: {}", tc.test_id, tc.verdict.tutor_text()),
            ),
            (None, Some(tc)) => (
                VerdictStatus::Fail,
                fail_summary(
                    &format!("Test case {}: {}", tc.test_id, tc.verdict.explanation),
                    passed,
                    total,
                ),
                fail_summary(
                    &format!("Test case {}: {}", tc.test_id, tc.verdict.tutor_text()),
                    passed,
                    total,
                ),
            ),
            (None, None) => {
                let explanation = format!("All {} test cases passed.", total);
                (VerdictStatus::Pass, explanation.clone(), explanation)
            }
        };

        Self {
            status,
            explanation,
            tutor_explanation,
            passed,
            total,
            score,
            max_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub verdict: JobVerdict,
    pub test_cases: Vec<TestCaseVerdict>,
    #[serde(default)]
    pub build_log: String,
}

impl JobReport {
    pub fn new(job_id: String, test_cases: Vec<TestCaseVerdict>, build_log: String) -> Self {
        Self {
            job_id,
            verdict: JobVerdict::aggregate(&test_cases),
            test_cases,
            build_log,
        }
    }

    /// A job that ends before any test case runs carries one synthetic
    /// verdict standing in for all of them.
    fn short_circuit(job: &Job, test_id: &str, verdict: Verdict, build_log: String) -> Self {
        Self::single_verdict(
            job.id.clone(),
            job.test_cases.len(),
            job.max_score(),
            test_id,
            verdict,
            build_log,
        )
    }

    fn single_verdict(
        job_id: String,
        total: usize,
        max_score: f64,
        test_id: &str,
        verdict: Verdict,
        build_log: String,
    ) -> Self {
        let (explanation, tutor_explanation) = match verdict.status {
            VerdictStatus::InternalError => (
                verdict.explanation.clone(),
                verdict.tutor_text().to_string(),
            ),
            _ => (
                fail_summary(&verdict.explanation, 0, total),
                fail_summary(verdict.tutor_text(), 0, total),
            ),
        };
        Self {
            job_id,
            verdict: JobVerdict {
                status: verdict.status,
                explanation,
                tutor_explanation,
                passed: 0,
                total,
                score: 0.0,
                max_score,
            },
            test_cases: vec![TestCaseVerdict {
                test_id: test_id.to_string(),
                weight: 0.0,
                verdict,
                execution: None,
            }],
            build_log,
        }
    }

    pub fn compile_error(job: &Job, build_log: String, log_limit: usize) -> Self {
        let log = truncate_log(build_log.as_bytes(), log_limit);
        let verdict = Verdict::fail(format!("Compile error:\n{}", log));
        Self::short_circuit(job, "compile", verdict, log)
    }

    pub fn internal_error(job: &Job, detail: impl fmt::Display, build_log: String) -> Self {
        Self::short_circuit(job, "build", Verdict::internal_error(detail), build_log)
    }

    /// The job description itself could not be decoded, so nothing about
    /// its test cases is known.
    pub fn undecodable(job_id: String, detail: impl fmt::Display) -> Self {
        let verdict = Verdict::internal_error(format!("job could not be decoded: {}", detail));
        Self::single_verdict(job_id, 0, 0.0, "job", verdict, String::new())
    }

    /// The submission itself is unusable, e.g. its file manifest escapes the
    /// working directory.
    pub fn rejected(job: &Job, explanation: impl Into<String>) -> Self {
        Self::short_circuit(job, "submission", Verdict::fail(explanation), String::new())
    }

    /// Cut every free-form text in the report down to `limit` bytes.
    pub fn truncate_messages(&mut self, limit: usize) {
        let cut = |text: &mut String| {
            if limit > 0 && text.len() > limit {
                *text = truncate_log(text.as_bytes(), limit);
            }
        };
        cut(&mut self.verdict.explanation);
        cut(&mut self.verdict.tutor_explanation);
        cut(&mut self.build_log);
        for test_case in self.test_cases.iter_mut() {
            cut(&mut test_case.verdict.explanation);
            if let Some(tutor_explanation) = test_case.verdict.tutor_explanation.as_mut() {
                cut(tutor_explanation);
            }
            if let Some(execution) = test_case.execution.as_mut() {
                cut(&mut execution.stdout);
                cut(&mut execution.stderr);
            }
        }
    }
}
