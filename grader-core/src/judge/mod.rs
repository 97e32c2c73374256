use serde_derive::{Deserialize, Serialize};

use crate::compiler::Language;
use crate::run::ResourceLimits;

pub mod common;
pub mod result;
pub mod validator;

pub use validator::ValidatorKind;

fn default_weight() -> f64 {
    1.0
}

/// One instructor-authored check. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub validator: ValidatorKind,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// One submission to grade, as far as the core is concerned: the files
/// already sit in a working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub language: Language,
    /// Overrides the toolchain's default artifact name, e.g. for Makefile builds.
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Job {
    pub fn max_score(&self) -> f64 {
        self.test_cases.iter().map(|tc| tc.weight).sum()
    }
}

/// Progress of one job through its slot. Indices point into `Job::test_cases`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "test_case", rename_all = "snake_case")]
pub enum JobState {
    Fetched,
    Building,
    Running(usize),
    Validating(usize),
    Reported,
}
