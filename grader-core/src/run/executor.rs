use serde_derive::Serialize;

use super::sandbox::{ExecutionResult, Sandbox};
use super::ResourceLimits;
use crate::compiler::Language;
use crate::error::GraderCoreError;

/// A built artifact ready to be invoked: the resolved run command of one job.
///
/// Built once per job and reused read-only by every test case.
#[derive(Debug, Clone, Serialize)]
pub struct Executor {
    pub language: Language,
    pub command: Vec<String>,
    pub limit_address_space: bool,
}

impl Executor {
    pub fn new(language: Language, command: Vec<String>, limit_address_space: bool) -> Self {
        Self {
            language,
            command,
            limit_address_space,
        }
    }

    pub fn command_line(&self, argv: &[String]) -> Vec<String> {
        let mut command = self.command.clone();
        command.extend(argv.iter().cloned());
        command
    }

    pub fn execute(
        &self,
        sandbox: &Sandbox,
        stdin: &[u8],
        argv: &[String],
        limits: &ResourceLimits,
    ) -> Result<ExecutionResult, GraderCoreError> {
        let command = self.command_line(argv);
        sandbox.run(&command, stdin, limits, self.limit_address_space)
    }
}
