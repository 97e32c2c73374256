pub mod spool;

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use grader_core::judge::result::JobReport;

use crate::agent::platform::PlatformClient;
use crate::error::ClientError;
use spool::Spool;

const ACKED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed try, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Recently acknowledged job ids, oldest evicted first.
#[derive(Debug, Default)]
struct AckedJobs {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl AckedJobs {
    fn contains(&self, job_id: &str) -> bool {
        self.ids.contains(job_id)
    }

    fn insert(&mut self, job_id: &str) {
        if !self.ids.insert(job_id.to_string()) {
            return;
        }
        self.order.push_back(job_id.to_string());
        if self.order.len() > ACKED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Acked,
    AlreadyAcked,
    Spooled,
}

pub struct Reporter {
    platform: Arc<PlatformClient>,
    spool: Spool,
    policy: RetryPolicy,
    message_size: usize,
    acked: Mutex<AckedJobs>,
}

impl Reporter {
    pub fn new(
        platform: Arc<PlatformClient>,
        spool: Spool,
        policy: RetryPolicy,
        message_size: usize,
    ) -> Self {
        Self {
            platform,
            spool,
            policy,
            message_size,
            acked: Mutex::new(AckedJobs::default()),
        }
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    fn is_acked(&self, job_id: &str) -> bool {
        self.acked
            .lock()
            .map(|acked| acked.contains(job_id))
            .unwrap_or(false)
    }

    fn mark_acked(&self, job_id: &str) {
        if let Ok(mut acked) = self.acked.lock() {
            acked.insert(job_id);
        }
    }

    /// Push `report`, retrying transient failures. When the server stays out
    /// of reach, or rejects the report, it is spooled for a later flush.
    pub async fn report(&self, mut report: JobReport) -> Result<ReportOutcome, ClientError> {
        if self.is_acked(&report.job_id) {
            log::info!("Job {} already reported, skipping", report.job_id);
            return Ok(ReportOutcome::AlreadyAcked);
        }
        report.truncate_messages(self.message_size);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.platform.report_job(&report).await {
                Ok(()) => {
                    log::info!("Job {} reported: {}", report.job_id, report.verdict.status);
                    self.mark_acked(&report.job_id);
                    self.spool.remove(&report.job_id)?;
                    return Ok(ReportOutcome::Acked);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.attempts => {
                    let delay = self.policy.delay(attempt);
                    log::warn!(
                        "Report of job {} failed (attempt {}), retrying in {:?}: {}",
                        report.job_id,
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    log::error!("Report of job {} failed: {}", report.job_id, e);
                    self.spool.store(&report, attempt)?;
                    return Ok(ReportOutcome::Spooled);
                }
            }
        }
    }

    /// Try once to deliver every spooled report. Stops at the first transient
    /// failure, since the server is likely still down. Returns how many were
    /// delivered.
    pub async fn flush(&self) -> Result<usize, ClientError> {
        let mut delivered = 0;
        for record in self.spool.load_all()? {
            if self.is_acked(&record.job_id) {
                self.spool.remove(&record.job_id)?;
                continue;
            }
            match self.platform.report_job(&record.report).await {
                Ok(()) => {
                    log::info!("Delivered spooled report of job {}", record.job_id);
                    self.mark_acked(&record.job_id);
                    self.spool.remove(&record.job_id)?;
                    delivered += 1;
                }
                Err(e) if e.is_retryable() => {
                    log::warn!("Spool flush interrupted: {}", e);
                    self.spool.store(&record.report, record.attempts + 1)?;
                    break;
                }
                Err(e) => {
                    log::error!(
                        "Spooled report of job {} rejected, keeping it: {}",
                        record.job_id,
                        e
                    );
                    self.spool.store(&record.report, record.attempts + 1)?;
                }
            }
        }
        Ok(delivered)
    }
}
