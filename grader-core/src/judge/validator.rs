use std::borrow::Cow;

use nix::sys::signal::Signal;
use serde_derive::{Deserialize, Serialize};
use similar::TextDiff;

use super::result::Verdict;
use super::TestCase;
use crate::run::sandbox::{ExecutionResult, TerminationCause, TimeLimit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    Exact,
    /// Ignore trailing `\n`/`\r` characters at the end of the output.
    #[default]
    TrailingNewline,
    /// Ignore trailing whitespace on every line and trailing blank lines.
    TrailingWhitespace,
}

impl Normalization {
    pub fn apply<'a>(&self, output: &'a [u8]) -> Cow<'a, [u8]> {
        match self {
            Self::Exact => Cow::Borrowed(output),
            Self::TrailingNewline => {
                let end = output
                    .iter()
                    .rposition(|b| *b != b'\n' && *b != b'\r')
                    .map_or(0, |i| i + 1);
                Cow::Borrowed(&output[..end])
            }
            Self::TrailingWhitespace => {
                let lines: Vec<&[u8]> = output
                    .split(|b| *b == b'\n')
                    .map(|line| line.trim_ascii_end())
                    .collect();
                let mut joined = lines.join(&b'\n');
                while joined.last().map_or(false, |b| b.is_ascii_whitespace()) {
                    joined.pop();
                }
                Cow::Owned(joined)
            }
        }
    }
}

fn default_exit_code() -> i32 {
    0
}

/// Expected output compared against the program's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCheck {
    pub expected: String,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default = "default_exit_code")]
    pub expected_exit_code: i32,
    #[serde(default)]
    pub ignore_exit_code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Substring(String),
    Regex(String),
}

impl Pattern {
    fn text(&self) -> &str {
        match self {
            Self::Substring(text) | Self::Regex(text) => text,
        }
    }

    fn is_found(&self, haystack: &[u8]) -> Result<bool, regex::Error> {
        match self {
            Self::Substring(needle) => {
                let needle = needle.as_bytes();
                Ok(needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle))
            }
            Self::Regex(pattern) => Ok(regex::bytes::Regex::new(pattern)?.is_match(haystack)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternCheck {
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub expected_exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidatorKind {
    /// Feed stdin, compare stdout.
    Stdout(OutputCheck),
    /// Pass argv, compare stdout. Judged exactly like `Stdout`.
    Arguments(OutputCheck),
    Pattern(PatternCheck),
    CompileOnly,
}

impl ValidatorKind {
    pub fn requires_execution(&self) -> bool {
        !matches!(self, Self::CompileOnly)
    }
}

fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(signal) => format!("{} ({})", signal as i32, signal.as_str()),
        Err(_) => signal.to_string(),
    }
}

fn resource_failure(test_case: &TestCase, result: &ExecutionResult) -> Option<Verdict> {
    let limits = &test_case.limits;
    let explanation = match result.termination {
        TerminationCause::Normal => return None,
        TerminationCause::Timeout {
            limit: TimeLimit::Cpu,
        } => format!(
            "Your program exceeded the CPU time limit of {} seconds.",
            limits.cpu_seconds
        ),
        TerminationCause::Timeout {
            limit: TimeLimit::Wall,
        } => format!(
            "Your program exceeded the wall-clock time limit of {} seconds.",
            limits.wall_seconds
        ),
        TerminationCause::Oom => format!(
            "Your program exceeded the memory limit of {} bytes.",
            limits.memory_bytes
        ),
        TerminationCause::OutputTruncated => format!(
            "Your program exceeded the output limit of {} bytes, its output was truncated.",
            limits.output_bytes
        ),
        TerminationCause::Signaled { signal } => format!(
            "Your program was terminated by signal {}.",
            signal_name(signal)
        ),
    };
    let measured = format!(
        "{} Measured {} ms CPU, {} ms wall, {} bytes peak memory.",
        explanation,
        result.cpu_time.as_millis(),
        result.wall_time.as_millis(),
        result.peak_memory_bytes
    );
    Some(Verdict::fail(explanation).with_tutor_explanation(measured))
}

fn check_exit_code(expected: i32, actual: Option<i32>) -> Option<Verdict> {
    match actual {
        Some(code) if code == expected => None,
        Some(code) => Some(Verdict::fail(format!(
            "Your program exited with code {}, expected {}.",
            code, expected
        ))),
        None => Some(Verdict::fail(format!(
            "Your program did not exit normally, expected exit code {}.",
            expected
        ))),
    }
}

fn line_diff(expected: &[u8], actual: &[u8]) -> String {
    let expected = String::from_utf8_lossy(expected);
    let actual = String::from_utf8_lossy(actual);
    TextDiff::from_lines(expected.as_ref(), actual.as_ref())
        .unified_diff()
        .header("expected", "actual")
        .to_string()
}

fn compare_output(check: &OutputCheck, result: &ExecutionResult) -> Verdict {
    let expected = check.expected.as_bytes();
    let matches = if expected.is_empty() {
        result.stdout.is_empty()
    } else {
        check.normalization.apply(expected) == check.normalization.apply(&result.stdout)
    };

    if !matches {
        let diff = if expected.is_empty() {
            line_diff(b"", &result.stdout)
        } else {
            line_diff(
                &check.normalization.apply(expected),
                &check.normalization.apply(&result.stdout),
            )
        };
        return Verdict::fail(format!(
            "The output of your program does not match the expected output:\n{}",
            diff
        ));
    }

    if !check.ignore_exit_code {
        if let Some(verdict) = check_exit_code(check.expected_exit_code, result.exit_code) {
            return verdict;
        }
    }
    Verdict::pass("The output of your program matches the expected output.")
}

fn match_patterns(check: &PatternCheck, result: &ExecutionResult) -> Verdict {
    let total = check.patterns.len();
    if total == 0 {
        return Verdict::internal_error("pattern check declares no patterns");
    }

    let mut missing = vec![];
    for pattern in check.patterns.iter() {
        match pattern.is_found(&result.stdout) {
            Ok(true) => {}
            Ok(false) => missing.push(pattern.text()),
            Err(e) => {
                return Verdict::internal_error(format!(
                    "invalid pattern `{}`: {}",
                    pattern.text(),
                    e
                ))
            }
        }
    }

    let found = total - missing.len();
    if found == 0 {
        return Verdict::fail(format!(
            "None of the {} expected patterns were found in the output of your program.",
            total
        ));
    }
    if found < total {
        return Verdict::partial(
            format!(
                "Found {} of {} expected patterns, missing: {}.",
                found,
                total,
                missing.join(", ")
            ),
            found as f64 / total as f64,
        );
    }
    if let Some(expected) = check.expected_exit_code {
        if let Some(verdict) = check_exit_code(expected, result.exit_code) {
            return verdict;
        }
    }
    Verdict::pass(format!("All {} expected patterns were found.", total))
}

/// Judge one test case. `result` is `None` only for validators that do not
/// need the program to run. Identical inputs always give identical verdicts.
pub fn validate(test_case: &TestCase, result: Option<&ExecutionResult>) -> Verdict {
    let result = match (&test_case.validator, result) {
        (ValidatorKind::CompileOnly, _) => return Verdict::pass("The build succeeded."),
        (_, Some(result)) => result,
        (_, None) => {
            return Verdict::internal_error(format!(
                "test case {} was not executed",
                test_case.id
            ))
        }
    };

    if let Some(verdict) = resource_failure(test_case, result) {
        return verdict;
    }

    match &test_case.validator {
        ValidatorKind::Stdout(check) | ValidatorKind::Arguments(check) => {
            compare_output(check, result)
        }
        ValidatorKind::Pattern(check) => match_patterns(check, result),
        ValidatorKind::CompileOnly => Verdict::pass("The build succeeded."),
    }
}
