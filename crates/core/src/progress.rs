//! Job status events and the single-slot, file-backed channel that carries
//! them from the worker process to its supervisor.
//!
//! The slot holds only the latest event. Writers replace it atomically (write
//! to a sibling temp file, then rename) so a reader sees either the previous
//! event or the new one, never a torn write. Readers may miss intermediate
//! events.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

pub const STATUS_FILE_NAME: &str = "qscale.status";

const COMPLETED_PREFIX: &str = "All files completed";
const FAILED_PREFIX: &str = "Error while upscaling";
const CANCELLED_MARKER: &str = "Stopped upscaling";

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Stage(String),
    Completed { elapsed: Duration },
    Failed(String),
    Cancelled,
}

impl ProgressEvent {
    pub fn stage(text: impl Into<String>) -> Self {
        Self::Stage(text.into())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Stage(_))
    }

    /// Inverse of the `Display` rendering. Unknown text is a stage.
    pub fn parse(text: &str) -> Self {
        if let Some(rest) = text.strip_prefix(FAILED_PREFIX) {
            return Self::Failed(rest.trim_start_matches(['\r', '\n']).to_string());
        }
        if text.trim_end() == CANCELLED_MARKER {
            return Self::Cancelled;
        }
        if let Some(rest) = text.strip_prefix(COMPLETED_PREFIX) {
            let secs = rest
                .trim()
                .trim_start_matches('(')
                .trim_end_matches(')')
                .trim_end_matches("sec.")
                .trim()
                .parse::<u64>()
                .unwrap_or(0);
            return Self::Completed {
                elapsed: Duration::from_secs(secs),
            };
        }
        Self::Stage(text.trim_end().to_string())
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(text) => f.write_str(text),
            Self::Completed { elapsed } => write!(
                f,
                "{COMPLETED_PREFIX} ({} sec.)",
                elapsed.as_secs_f64().round() as u64
            ),
            Self::Failed(reason) => write!(f, "{FAILED_PREFIX}\n\n{reason}"),
            Self::Cancelled => f.write_str(CANCELLED_MARKER),
        }
    }
}

/// Destination for status updates.
pub trait StatusSink {
    fn publish(&mut self, event: &ProgressEvent) -> Result<()>;
}

impl StatusSink for Vec<ProgressEvent> {
    fn publish(&mut self, event: &ProgressEvent) -> Result<()> {
        self.push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProgressChannel {
    path: PathBuf,
}

impl ProgressChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The channel file inside a job's work directory.
    pub fn in_dir(work_dir: &Path) -> Self {
        Self::new(work_dir.join(STATUS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_name(&self) -> Result<String> {
        Ok(self
            .path
            .file_name()
            .context("status path has no file name")?
            .to_string_lossy()
            .into_owned())
    }

    /// Replace the slot's content with `event`.
    pub fn write(&self, event: &ProgressEvent) -> Result<()> {
        let file_name = self.file_name()?;
        let staging = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

        fs::write(&staging, event.to_string())
            .with_context(|| format!("failed to write status file: {}", staging.display()))?;
        fs::rename(&staging, &self.path).with_context(|| {
            format!("failed to publish status file: {}", self.path.display())
        })?;
        Ok(())
    }

    /// Latest event. Fails when the slot does not exist.
    pub fn read(&self) -> Result<ProgressEvent> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read status file: {}", self.path.display()))?;
        Ok(ProgressEvent::parse(&text))
    }

    /// Delete the slot and any staging file a killed writer left behind.
    pub fn remove(&self) -> Result<()> {
        remove_if_present(&self.path)?;
        for staging in self.staging_files()? {
            remove_if_present(&staging)?;
        }
        Ok(())
    }

    /// `.<name>.<pid>.tmp` siblings of the slot.
    fn staging_files(&self) -> Result<Vec<PathBuf>> {
        let prefix = format!(".{}.", self.file_name()?);
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", dir.display()))
            }
        };
        Ok(entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".tmp"))
                    && path.is_file()
            })
            .collect())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove status file: {}", path.display()))
        }
    }
}

impl StatusSink for ProgressChannel {
    fn publish(&mut self, event: &ProgressEvent) -> Result<()> {
        self.write(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_status_strings() {
        assert_eq!(
            ProgressEvent::stage("2. Upscaling tiles 3/4").to_string(),
            "2. Upscaling tiles 3/4"
        );
        assert_eq!(
            ProgressEvent::Completed {
                elapsed: Duration::from_millis(12_600)
            }
            .to_string(),
            "All files completed (13 sec.)"
        );
        assert_eq!(
            ProgressEvent::Failed("CUDA out of memory".into()).to_string(),
            "Error while upscaling\n\nCUDA out of memory"
        );
        assert_eq!(ProgressEvent::Cancelled.to_string(), "Stopped upscaling");
    }

    #[test]
    fn parses_terminal_markers() {
        assert_eq!(
            ProgressEvent::parse("All files completed (42 sec.)"),
            ProgressEvent::Completed {
                elapsed: Duration::from_secs(42)
            }
        );
        assert_eq!(
            ProgressEvent::parse("Error while upscaling\n\nmodel file not found: x.onnx\ncaused by"),
            ProgressEvent::Failed("model file not found: x.onnx\ncaused by".into())
        );
        assert_eq!(
            ProgressEvent::parse("Stopped upscaling\n"),
            ProgressEvent::Cancelled
        );
        assert_eq!(
            ProgressEvent::parse("Loading"),
            ProgressEvent::stage("Loading")
        );
        assert!(!ProgressEvent::parse("Upscaling 1/3").is_terminal());
    }

    #[test]
    fn channel_keeps_only_latest_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut channel = ProgressChannel::in_dir(dir.path());

        channel.publish(&ProgressEvent::stage("Loading")).expect("write");
        channel
            .publish(&ProgressEvent::stage("Upscaling 1/2"))
            .expect("write");

        assert_eq!(
            channel.read().expect("read"),
            ProgressEvent::stage("Upscaling 1/2")
        );
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("list dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from(STATUS_FILE_NAME)]);
    }

    #[test]
    fn missing_slot_is_a_read_error_and_removal_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = ProgressChannel::in_dir(dir.path());

        assert!(channel.read().is_err());
        channel.remove().expect("remove absent file");

        channel.write(&ProgressEvent::Cancelled).expect("write");
        channel.remove().expect("remove");
        assert!(!channel.path().exists());
    }
}
