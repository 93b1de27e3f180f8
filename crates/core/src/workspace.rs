//! Per-job scratch storage: the temporary frame directory and the status
//! file, both inside the job's work directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::progress::ProgressChannel;

pub const TEMP_DIR_NAME: &str = "qscale_temp";

#[derive(Debug, Clone)]
pub struct Workspace {
    work_dir: PathBuf,
}

impl Workspace {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.work_dir.join(TEMP_DIR_NAME)
    }

    pub fn status_channel(&self) -> ProgressChannel {
        ProgressChannel::in_dir(&self.work_dir)
    }

    /// Empty temporary directory, created fresh for each video.
    pub fn prepare_temp_dir(&self) -> Result<PathBuf> {
        let dir = self.temp_dir();
        remove_dir_if_present(&dir)?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create temp dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Delete the temporary directory and the status file. Absent entries are
    /// not an error.
    pub fn purge(&self) -> Result<()> {
        remove_dir_if_present(&self.temp_dir())?;
        self.status_channel().remove()?;
        debug!(work_dir = %self.work_dir.display(), "Job artifacts purged");
        Ok(())
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove temp dir: {}", dir.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;

    #[test]
    fn prepare_clears_previous_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(dir.path());

        let temp = workspace.prepare_temp_dir().expect("prepare");
        fs::write(temp.join("frame_00000001.png"), b"stale").expect("write");

        let temp = workspace.prepare_temp_dir().expect("prepare again");
        assert_eq!(temp, dir.path().join(TEMP_DIR_NAME));
        assert_eq!(fs::read_dir(&temp).expect("list").count(), 0);
    }

    #[test]
    fn purge_removes_temp_dir_and_status_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(dir.path());
        let temp = workspace.prepare_temp_dir().expect("prepare");
        fs::write(temp.join("audio.mp3"), b"x").expect("write");
        workspace
            .status_channel()
            .write(&ProgressEvent::Cancelled)
            .expect("status");

        workspace.purge().expect("purge");

        assert!(!temp.exists());
        assert!(!workspace.status_channel().path().exists());
        workspace.purge().expect("second purge is a no-op");
    }

    #[test]
    fn purge_removes_staging_file_of_killed_writer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = Workspace::new(dir.path());
        let staging = dir.path().join(".qscale.status.4242.tmp");
        fs::write(&staging, b"Upscaling tile 2/4").expect("staging");
        fs::write(dir.path().join("notes.tmp"), b"keep").expect("unrelated");

        workspace.purge().expect("purge");

        assert!(!staging.exists());
        assert!(dir.path().join("notes.tmp").exists());
    }
}
