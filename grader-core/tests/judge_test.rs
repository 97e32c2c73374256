use std::fs;

use grader_core::{
    compiler::{Language, Toolchains},
    error::GraderCoreError,
    judge::{
        common::{run_job, JudgeContext, JudgeSettings},
        result::{JobReport, VerdictStatus, INTERNAL_ERROR_PREFIX},
        validator::{Normalization, OutputCheck, Pattern, PatternCheck},
        Job, JobState, TestCase, ValidatorKind,
    },
    run::{CancelFlag, IsolationPolicy, ResourceLimits},
    utils::find_program,
};
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn submission(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

fn settings() -> JudgeSettings {
    JudgeSettings {
        isolation: IsolationPolicy::Off,
        ..JudgeSettings::default()
    }
}

fn limits() -> ResourceLimits {
    ResourceLimits {
        cpu_seconds: 1,
        wall_seconds: 5,
        memory_bytes: 64 * MIB,
        output_bytes: 4096,
    }
}

fn output_check(expected: &str) -> OutputCheck {
    OutputCheck {
        expected: expected.to_string(),
        normalization: Normalization::TrailingNewline,
        expected_exit_code: 0,
        ignore_exit_code: false,
    }
}

fn case(id: &str, validator: ValidatorKind, argv: &[&str]) -> TestCase {
    TestCase {
        id: id.to_string(),
        validator,
        stdin: String::new(),
        argv: argv.iter().map(|s| s.to_string()).collect(),
        limits: limits(),
        weight: 1.0,
    }
}

fn shell_job(test_cases: Vec<TestCase>) -> Job {
    Job {
        id: "job-1".to_string(),
        language: Language::Shell,
        artifact: None,
        test_cases,
    }
}

fn judge(job: &Job, dir: &TempDir) -> (Result<JobReport, GraderCoreError>, Vec<JobState>) {
    judge_with(job, dir, &Toolchains::default(), CancelFlag::new())
}

fn judge_with(
    job: &Job,
    dir: &TempDir,
    toolchains: &Toolchains,
    cancel: CancelFlag,
) -> (Result<JobReport, GraderCoreError>, Vec<JobState>) {
    let settings = settings();
    let context = JudgeContext {
        toolchains,
        settings: &settings,
        cancel,
    };
    let mut states = vec![];
    let report = run_job(job, dir.path(), &context, &mut |state| states.push(state));
    (report, states)
}

const ADDER: &str = r#"
if [ $# -ne 2 ]; then
    echo "Wrong number of arguments!"
    exit 1
fi
echo $(($1 + $2))
"#;

#[test]
fn test_adder_passes() {
    init();
    let dir = submission(&[("main.sh", ADDER)]);
    let job = shell_job(vec![case(
        "add",
        ValidatorKind::Arguments(output_check("7\n")),
        &["3", "4"],
    )]);
    let (report, states) = judge(&job, &dir);
    let report = report.unwrap();
    assert_eq!(report.verdict.status, VerdictStatus::Pass);
    assert_eq!(report.verdict.explanation, "All 1 test cases passed.");
    assert_eq!(report.verdict.score, 1.0);
    assert_eq!(
        states,
        vec![
            JobState::Building,
            JobState::Running(0),
            JobState::Validating(0)
        ]
    );
    let execution = report.test_cases[0].execution.as_ref().unwrap();
    assert_eq!(execution.stdout, "7\n");
}

#[test]
fn test_argument_count_message() {
    init();
    let dir = submission(&[("main.sh", ADDER)]);
    let mut check = output_check("Wrong number of arguments!\n");
    check.expected_exit_code = 1;
    let job = shell_job(vec![case("usage", ValidatorKind::Arguments(check.clone()), &[])]);
    assert_eq!(
        judge(&job, &dir).0.unwrap().verdict.status,
        VerdictStatus::Pass
    );

    let sloppy = submission(&[("main.sh", "echo 'Wrong number of args'\nexit 1\n")]);
    let report = judge(&job, &sloppy).0.unwrap();
    assert_eq!(report.verdict.status, VerdictStatus::Fail);
    let explanation = &report.test_cases[0].verdict.explanation;
    assert!(explanation.contains("-Wrong number of arguments!"));
    assert!(explanation.contains("+Wrong number of args"));
    assert!(report.verdict.explanation.ends_with("(0/1 passed)"));
}

#[test]
fn test_pattern_found_amid_noise() {
    init();
    let dir = submission(&[(
        "main.sh",
        "echo 'starting up'\necho 'result: expected-token (done)'\necho bye\n",
    )]);
    let job = shell_job(vec![case(
        "grep",
        ValidatorKind::Pattern(PatternCheck {
            patterns: vec![Pattern::Substring("expected-token".to_string())],
            expected_exit_code: None,
        }),
        &[],
    )]);
    assert_eq!(
        judge(&job, &dir).0.unwrap().verdict.status,
        VerdictStatus::Pass
    );
}

#[test]
fn test_compile_error_skips_test_cases() {
    init();
    let dir = submission(&[("main.sh", "if then fi (\n")]);
    let job = shell_job(vec![
        case("a", ValidatorKind::Stdout(output_check("x")), &[]),
        case("b", ValidatorKind::Stdout(output_check("y")), &[]),
    ]);
    let (report, states) = judge(&job, &dir);
    let report = report.unwrap();
    assert_eq!(states, vec![JobState::Building]);
    assert_eq!(report.verdict.status, VerdictStatus::Fail);
    assert_eq!(report.verdict.total, 2);
    assert_eq!(report.test_cases.len(), 1);
    assert_eq!(report.test_cases[0].test_id, "compile");
    assert!(report.test_cases[0]
        .verdict
        .explanation
        .starts_with("Compile error:"));
    assert!(!report.build_log.is_empty());
    assert!(!report.build_log.contains(&dir.path().to_string_lossy().to_string()));
}

#[test]
fn test_unbounded_allocation_is_oom() {
    init();
    let dir = submission(&[("main.sh", "exec tail /dev/zero\n")]);
    let job = shell_job(vec![case(
        "hog",
        ValidatorKind::Stdout(output_check("")),
        &[],
    )]);
    let report = judge(&job, &dir).0.unwrap();
    assert_eq!(report.verdict.status, VerdictStatus::Fail);
    let verdict = &report.test_cases[0].verdict;
    assert!(verdict.explanation.contains("memory limit"), "{}", verdict.explanation);
}

#[test]
fn test_infinite_loop_times_out_but_later_cases_run() {
    init();
    let dir = submission(&[(
        "main.sh",
        "if [ \"$1\" = spin ]; then while :; do :; done; fi\necho ok\n",
    )]);
    let job = shell_job(vec![
        case("spin", ValidatorKind::Stdout(output_check("ok")), &["spin"]),
        case("quick", ValidatorKind::Stdout(output_check("ok")), &[]),
    ]);
    let report = judge(&job, &dir).0.unwrap();
    assert_eq!(report.verdict.passed, 1);
    assert!(report.test_cases[0]
        .verdict
        .explanation
        .contains("CPU time limit"));
    assert!(report.test_cases[1].verdict.is_pass());
    assert!(report
        .verdict
        .explanation
        .starts_with("Test case spin: Your program exceeded the CPU time limit"));
}

#[test]
fn test_compile_only_does_not_run() {
    init();
    let dir = submission(&[("main.sh", "exit 9\n")]);
    let job = shell_job(vec![case("builds", ValidatorKind::CompileOnly, &[])]);
    let (report, states) = judge(&job, &dir);
    assert_eq!(report.unwrap().verdict.status, VerdictStatus::Pass);
    assert_eq!(states, vec![JobState::Building, JobState::Validating(0)]);
}

#[test]
fn test_missing_toolchain_is_internal_error() {
    init();
    let dir = submission(&[("main.sh", "echo hi\n")]);
    let toolchains = Toolchains::from_yaml(
        r#"
languages:
  shell:
    compile: ["no-such-shell-xyz", "-n", "{inputs}"]
    run: ["no-such-shell-xyz", "{artifact}"]
    extensions: ["sh"]
    artifact: "main.sh"
"#,
    )
    .unwrap();
    let job = shell_job(vec![case("a", ValidatorKind::Stdout(output_check("hi")), &[])]);
    let report = judge_with(&job, &dir, &toolchains, CancelFlag::new())
        .0
        .unwrap();
    assert_eq!(report.verdict.status, VerdictStatus::InternalError);
    assert!(report.verdict.explanation.starts_with(INTERNAL_ERROR_PREFIX));
    assert!(!report.verdict.explanation.contains("no-such-shell-xyz"));
    assert!(report.verdict.tutor_explanation.contains("no-such-shell-xyz"));
}

#[test]
fn test_cancelled_job_propagates() {
    init();
    let dir = submission(&[("main.sh", "echo hi\n")]);
    let cancel = CancelFlag::new();
    cancel.cancel();
    let job = shell_job(vec![case("a", ValidatorKind::Stdout(output_check("hi")), &[])]);
    let (report, _) = judge_with(&job, &dir, &Toolchains::default(), cancel);
    assert!(matches!(report, Err(GraderCoreError::Cancelled)));
}

fn native_toolchains(compile: &str) -> Toolchains {
    Toolchains::from_yaml(&format!(
        r#"
languages:
  c:
    compile: ["sh", "-c", {:?}]
    run: ["{{artifact}}"]
    extensions: ["c"]
    artifact: "main"
"#,
        compile
    ))
    .unwrap()
}

fn native_job(test_cases: Vec<TestCase>) -> Job {
    Job {
        language: Language::C,
        ..shell_job(test_cases)
    }
}

#[test]
fn test_non_executable_artifact_is_compile_error() {
    init();
    let dir = submission(&[("main.c", "int main() {}\n")]);
    let toolchains = native_toolchains("echo hi > main");
    let job = native_job(vec![case("a", ValidatorKind::Stdout(output_check("hi")), &[])]);
    let (report, states) = judge_with(&job, &dir, &toolchains, CancelFlag::new());
    let report = report.unwrap();
    assert_eq!(states, vec![JobState::Building]);
    assert_eq!(report.verdict.status, VerdictStatus::Fail);
    assert!(report.build_log.contains("Build produced no executable `main`."));
    assert!(report.verdict.explanation.starts_with("Compile error:"));
}

const SELF_DISARMING: &str =
    "printf '#!/bin/sh\\nchmod -x \"$0\"\\necho hi\\n' > main && chmod +x main";

#[test]
fn test_program_losing_exec_bit_fails_remaining_cases() {
    init();
    let dir = submission(&[("main.c", "int main() {}\n")]);
    let toolchains = native_toolchains(SELF_DISARMING);
    let job = native_job(vec![
        case("first", ValidatorKind::Stdout(output_check("hi")), &[]),
        case("second", ValidatorKind::Stdout(output_check("hi")), &[]),
    ]);
    let report = judge_with(&job, &dir, &toolchains, CancelFlag::new())
        .0
        .unwrap();
    assert_eq!(report.verdict.status, VerdictStatus::Fail);
    assert!(report.test_cases[0].verdict.is_pass());
    let second = &report.test_cases[1];
    assert_eq!(second.verdict.status, VerdictStatus::Fail);
    assert!(second.verdict.explanation.contains("could not be started"));
    assert!(second.verdict.tutor_text().starts_with("Failed to spawn"));
    assert!(second.execution.is_none());
}

const MALLOC_UNTIL_NULL: &str = r#"
#include <stdlib.h>

int main(void) {
    for (;;) {
        if (!malloc(1 << 20)) {
            return 1;
        }
    }
}
"#;

#[test]
fn test_untouched_allocation_up_to_address_limit_is_oom() {
    init();
    if find_program("gcc").is_none() {
        log::warn!("gcc not found, skipping");
        return;
    }
    let dir = submission(&[("main.c", MALLOC_UNTIL_NULL)]);
    let job = native_job(vec![case(
        "hog",
        ValidatorKind::Stdout(output_check("")),
        &[],
    )]);
    let report = judge(&job, &dir).0.unwrap();
    assert_eq!(report.verdict.status, VerdictStatus::Fail);
    let verdict = &report.test_cases[0].verdict;
    assert!(verdict.explanation.contains("memory limit"), "{}", verdict.explanation);
}
