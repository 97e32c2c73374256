use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use super::archive;
use crate::agent::platform::SubmissionFile;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The submission cannot be graded as sent; the student gets a fail.
    #[error("{0}")]
    Rejected(String),
    /// The server sent something this executor cannot decode.
    #[error("Malformed submission file `{path}`: {reason}")]
    Malformed { path: String, reason: String },
    #[error("IO Error: {0}")]
    IOError(#[from] io::Error),
}

/// Keep only characters that are safe in a single path segment.
pub fn sanitize_segment(raw: &str) -> String {
    let segment: String = raw
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    match segment.trim_matches('.') {
        "" => "job".to_string(),
        _ => segment,
    }
}

pub(crate) fn checked_relative_path(raw: &str) -> Result<PathBuf, WorkspaceError> {
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(WorkspaceError::Rejected(format!(
                    "The submission contains the path `{}`, which leaves the submission directory.",
                    raw
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(WorkspaceError::Rejected(format!(
            "The submission contains the invalid file name `{}`.",
            raw
        )));
    }
    Ok(clean)
}

/// Private directory one job is graded in: `<work_dir>/<job-id>-<uuid>`.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    source_dir: PathBuf,
    cleanup: bool,
}

impl Workspace {
    pub fn create(work_dir: &Path, job_id: &str, cleanup: bool) -> Result<Self, WorkspaceError> {
        let root = work_dir.join(format!(
            "{}-{}",
            sanitize_segment(job_id),
            uuid::Uuid::new_v4()
        ));
        fs::create_dir_all(&root)?;
        log::debug!("Created workspace {:?}", root);
        Ok(Self {
            source_dir: root.clone(),
            root,
            cleanup,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where grading happens; differs from `root` when the submission is a
    /// single top-level directory.
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn write_files(&mut self, files: &[SubmissionFile]) -> Result<(), WorkspaceError> {
        for file in files {
            let relative = checked_relative_path(&file.path)?;
            let content = file.decode().map_err(|e| WorkspaceError::Malformed {
                path: file.path.clone(),
                reason: e.to_string(),
            })?;
            let target = self.root.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, content)?;
        }
        self.unpack_archives()
    }

    /// Unpack every top-level archive in place, then settle on the
    /// directory to grade from.
    pub fn unpack_archives(&mut self) -> Result<(), WorkspaceError> {
        let entries = fs::read_dir(&self.root)?.collect::<Result<Vec<_>, _>>()?;
        for entry in entries {
            if entry.file_type()?.is_file() && archive::unpack_if_archive(&entry.path())? {
                log::info!("Unpacked submission archive {:?}", entry.file_name());
            }
        }
        self.descend_single_directory()
    }

    /// A submission packed as one folder is graded from inside that folder.
    fn descend_single_directory(&mut self) -> Result<(), WorkspaceError> {
        let mut entries = fs::read_dir(&self.root)?.collect::<Result<Vec<_>, _>>()?;
        if entries.len() == 1 && entries[0].file_type()?.is_dir() {
            if let Some(entry) = entries.pop() {
                log::debug!("Descending into single directory {:?}", entry.file_name());
                self.source_dir = entry.path();
            }
        }
        Ok(())
    }

    pub fn purge(self) {
        if !self.cleanup {
            log::info!("Keeping workspace {:?}", self.root);
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            log::warn!("Failed to remove workspace {:?}: {}", self.root, e);
        }
    }
}
