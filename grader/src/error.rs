use grader_core::error::GraderCoreError;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Internal Error: {0}")]
    InternalError(anyhow::Error),
    #[error("Executor is not registered on the server")]
    RegistrationRequired,
    /// The server assigned a job this executor cannot read.
    #[error("Picked job {job_id:?} could not be decoded: {reason}")]
    UndecodableJob {
        job_id: Option<String>,
        reason: String,
    },
    #[error("{context} failed with status {status}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Reqwest Error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Serde json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Grader Core Error: {0}")]
    GraderError(#[from] GraderCoreError),
}

impl ClientError {
    /// Transient failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::ReqwestError(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.status().map_or(false, |s| s.is_server_error())
            }
            _ => false,
        }
    }
}
