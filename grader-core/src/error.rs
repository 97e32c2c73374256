use nix::errno::Errno;
use std::io;
use std::path::Path;

use crate::compiler::Language;

#[derive(Debug, thiserror::Error)]
pub enum GraderCoreError {
    #[error("Nix errno: {0}")]
    NixErrno(#[from] Errno),
    #[error("IO error: {0}")]
    IOError(#[from] io::Error),
    #[error("Serde json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Serde yaml error: {0}")]
    SerdeYamlError(#[from] serde_yaml::Error),
    #[error("Toolchain `{program}` for language {language} is not available")]
    ToolchainMissing { language: Language, program: String },
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("Failed to spawn `{program}`: {source}")]
    SpawnError {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    #[error("Execution cancelled")]
    Cancelled,
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
}

impl GraderCoreError {
    /// Errors that say nothing about the submission but about this host:
    /// the job has to be handed back to the server instead of being graded.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NixErrno(_) | Self::IOError(_) | Self::SandboxUnavailable(_) => true,
            Self::SpawnError { source, .. } => {
                source.kind() != io::ErrorKind::NotFound && !self.is_unrunnable_program()
            }
            Self::SerdeJsonError(_)
            | Self::SerdeYamlError(_)
            | Self::ToolchainMissing { .. }
            | Self::InvalidJob(_)
            | Self::Cancelled
            | Self::AnyhowError(_) => false,
        }
    }
}

impl GraderCoreError {
    /// The kernel refused to execute the file: no exec permission or not
    /// a format it can load.
    pub fn is_unrunnable_program(&self) -> bool {
        match self {
            Self::SpawnError { source, .. } => {
                matches!(source.raw_os_error(), Some(libc::EACCES) | Some(libc::ENOEXEC))
            }
            _ => false,
        }
    }
}

pub fn path_not_exist(path: &Path) -> GraderCoreError {
    GraderCoreError::AnyhowError(anyhow::anyhow!("Path not exist: {:?}", path))
}
