use std::time::Duration;

use base64::Engine;
use grader_core::{
    compiler::Language,
    judge::{result::JobReport, Job},
};
use reqwest::StatusCode;
use uuid::Uuid;

use super::hostinfo::HostInfo;
use super::http::HttpClient;
use crate::error::ClientError;

const PICK_URL: &str = "api/v1/executor/jobs/pick";
const REGISTER_URL: &str = "api/v1/executor/machines";
const JOBS_SEGMENTS: [&str; 4] = ["api", "v1", "executor", "jobs"];

fn job_url<'a>(job_id: &'a str, action: &'a str) -> Vec<&'a str> {
    JOBS_SEGMENTS
        .iter()
        .copied()
        .chain([job_id, action])
        .collect()
}

/// One submission file as shipped by the server.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SubmissionFile {
    pub path: String,
    /// Base64 encoded file content.
    pub content: String,
}

impl SubmissionFile {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.content)
    }
}

/// A pulled job: the core job plus the submission files to materialize.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    #[serde(flatten)]
    pub job: Job,
    #[serde(default)]
    pub files: Vec<SubmissionFile>,
}

#[derive(Serialize, Debug)]
struct ExecutorInfo<'a> {
    uuid: Uuid,
    hostname: &'a str,
    languages: &'a [Language],
    free_slots: usize,
}

#[derive(Serialize, Debug)]
struct PickJobBody<'a> {
    executor: ExecutorInfo<'a>,
}

/// Decode the `job` of a pick answer, keeping its id when the rest is
/// unreadable so the job can still be answered for.
fn decode_picked(body: serde_json::Value) -> Result<JobDescriptor, ClientError> {
    let job = body.get("job").cloned().unwrap_or_default();
    let job_id = match job.get("id") {
        Some(serde_json::Value::String(id)) => Some(id.clone()),
        Some(serde_json::Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    serde_json::from_value(job).map_err(|e| ClientError::UndecodableJob {
        job_id,
        reason: e.to_string(),
    })
}

#[derive(Serialize, Debug)]
struct ReportJobBody<'a> {
    executor_uuid: Uuid,
    report: &'a JobReport,
}

#[derive(Serialize, Debug)]
struct ReleaseJobBody<'a> {
    executor_uuid: Uuid,
    reason: &'a str,
}

pub struct PlatformClient {
    client: HttpClient,
    executor_uuid: Uuid,
    hostname: String,
}

async fn status_error(context: &'static str, response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ClientError::HttpStatus {
        context,
        status,
        body,
    }
}

impl PlatformClient {
    pub fn new(
        base_url: &str,
        secret: &str,
        timeout: Duration,
        executor_uuid: Uuid,
        hostname: String,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: HttpClient::new(base_url, secret, timeout)?,
            executor_uuid,
            hostname,
        })
    }

    pub fn executor_uuid(&self) -> Uuid {
        self.executor_uuid
    }

    /// Ask for the next pending job. `Ok(None)` means there is no work.
    pub async fn pick_job(
        &self,
        languages: &[Language],
        free_slots: usize,
    ) -> Result<Option<JobDescriptor>, ClientError> {
        let body = PickJobBody {
            executor: ExecutorInfo {
                uuid: self.executor_uuid,
                hostname: &self.hostname,
                languages,
                free_slots,
            },
        };
        let response = self.client.post(PICK_URL)?.json(&body).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.json::<serde_json::Value>().await?;
                Ok(Some(decode_picked(body)?))
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::PRECONDITION_FAILED => Err(ClientError::RegistrationRequired),
            _ => Err(status_error("Pick", response).await),
        }
    }

    /// Push a report. The server answering 409 already has it, which is an ack.
    pub async fn report_job(&self, report: &JobReport) -> Result<(), ClientError> {
        let body = ReportJobBody {
            executor_uuid: self.executor_uuid,
            report,
        };
        let response = self
            .client
            .post_segments(&job_url(&report.job_id, "result"))?
            .header("Idempotency-Key", report.job_id.as_str())
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::CONFLICT => {
                log::info!("Report for job {} was already recorded", report.job_id);
                Ok(())
            }
            _ => Err(status_error("Report", response).await),
        }
    }

    /// Hand a job back so another executor can pick it up.
    pub async fn release_job(&self, job_id: &str, reason: &str) -> Result<(), ClientError> {
        let body = ReleaseJobBody {
            executor_uuid: self.executor_uuid,
            reason,
        };
        let response = self
            .client
            .post_segments(&job_url(job_id, "release"))?
            .json(&body)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            _ => Err(status_error("Release", response).await),
        }
    }

    pub async fn register(&self, host: &HostInfo) -> Result<(), ClientError> {
        let response = self.client.post(REGISTER_URL)?.json(host).send().await?;
        match response.status() {
            status if status.is_success() => {
                log::info!("Registered executor {} ({})", host.uuid, host.hostname);
                Ok(())
            }
            _ => Err(status_error("Register", response).await),
        }
    }
}
