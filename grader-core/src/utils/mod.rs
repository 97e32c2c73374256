use anyhow::anyhow;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::error::GraderCoreError;

pub mod io;

pub fn copy_recursively(src: &Path, dest: &Path) -> std::io::Result<()> {
    log::debug!("copying {:?} to {:?}", src, dest);
    if fs::metadata(src)?.is_file() {
        fs::copy(src, dest)?;
    } else {
        if !dest.exists() || !fs::metadata(dest)?.is_dir() {
            log::debug!("creating dir: {:?}", dest);
            fs::create_dir_all(dest)?;
        }
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let src_path = entry.path();
            copy_recursively(&src_path, &dest.join(entry.file_name()))?;
        }
    }

    Ok(())
}

pub fn get_pathbuf_str(path: &Path) -> Result<String, GraderCoreError> {
    match path.to_str() {
        Some(path_str) => Ok(path_str.to_owned()),
        None => Err(GraderCoreError::AnyhowError(anyhow!(
            "PathBuf to str failed: {:?}",
            path
        ))),
    }
}

/// Look `program` up the way `execvp` would.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Lossy UTF-8 rendering of captured bytes, cut to at most `limit` bytes.
/// A marker is appended when something was cut; `limit == 0` disables the cut.
pub fn truncate_log(bytes: &[u8], limit: usize) -> String {
    if limit == 0 || bytes.len() <= limit {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    text.push_str(&format!(
        "\n[... {} more bytes truncated]",
        bytes.len() - limit
    ));
    text
}
