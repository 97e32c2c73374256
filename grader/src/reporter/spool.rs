use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use base64::Engine;
use chrono::{DateTime, Utc};
use grader_core::judge::result::JobReport;

use crate::error::ClientError;

const RECORD_EXTENSION: &str = "json";

/// An undelivered report, one file per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub job_id: String,
    pub report: JobReport,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Directory of reports waiting for the server to come back.
///
/// Writers are serialized and every record lands atomically via a temporary
/// file and a rename, so a crash never leaves a half-written record behind.
pub struct Spool {
    folder_path: PathBuf,
    lock: Mutex<()>,
}

impl Spool {
    pub fn open(folder_path: PathBuf) -> Result<Self, ClientError> {
        fs::create_dir_all(&folder_path)?;
        Ok(Self {
            folder_path,
            lock: Mutex::new(()),
        })
    }

    pub fn folder_path(&self) -> &Path {
        &self.folder_path
    }

    /// Job ids are arbitrary strings; URL-safe base64 keeps the file name
    /// unique per id and free of separators.
    fn record_path(&self, job_id: &str) -> PathBuf {
        let name = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(job_id);
        self.folder_path.join(format!("{}.{}", name, RECORD_EXTENSION))
    }

    /// Store `report`, replacing any earlier record of the same job.
    pub fn store(&self, report: &JobReport, attempts: u32) -> Result<(), ClientError> {
        let record = SpoolRecord {
            job_id: report.job_id.clone(),
            report: report.clone(),
            created_at: Utc::now(),
            attempts,
        };
        let content = serde_json::to_string_pretty(&record)?;
        let path = self.record_path(&report.job_id);
        let temp_path = path.with_extension("tmp");

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;
        log::warn!("Spooled report of job {} to {:?}", report.job_id, path);
        Ok(())
    }

    pub fn remove(&self, job_id: &str) -> Result<(), ClientError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(self.record_path(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable records, oldest first. Unreadable files are skipped.
    pub fn load_all(&self) -> Result<Vec<SpoolRecord>, ClientError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut records = vec![];
        for entry in fs::read_dir(&self.folder_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(ClientError::from)
                .and_then(|content| Ok(serde_json::from_str::<SpoolRecord>(&content)?));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => log::error!("Skipping unreadable spool record {:?}: {}", path, e),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    pub fn depth(&self) -> usize {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::read_dir(&self.folder_path)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| {
                        entry.path().extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}
