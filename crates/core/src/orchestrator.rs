//! Runs one job's batch inside the worker process.
//!
//! The model is loaded once, every input is dispatched to the image or video
//! pipeline in order, and exactly one terminal event (`Completed` or `Failed`)
//! is published at the end. The first failure aborts the batch; outputs of
//! files that already finished stay on disk.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::error::UpscaleError;
use crate::inference::ModelLoader;
use crate::job::Job;
use crate::media::MediaKind;
use crate::pipeline::{image::upscale_image, video::upscale_video};
use crate::progress::{ProgressChannel, ProgressEvent, StatusSink};
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Loading,
    Dispatching { file_number: usize, total: usize },
    ImageUpscale { file_number: usize },
    VideoUpscale { file_number: usize },
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Dispatching { file_number, total } => {
                write!(f, "dispatching {file_number}/{total}")
            }
            Self::ImageUpscale { file_number } => write!(f, "image {file_number}"),
            Self::VideoUpscale { file_number } => write!(f, "video {file_number}"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of a finished batch, mirrored by the terminal status event.
#[derive(Debug)]
pub struct BatchReport {
    pub outputs: Vec<PathBuf>,
    pub event: ProgressEvent,
}

pub struct Orchestrator<'a> {
    job: &'a Job,
    loader: &'a dyn ModelLoader,
    sink: &'a mut dyn StatusSink,
    workspace: Workspace,
    state: JobState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(job: &'a Job, loader: &'a dyn ModelLoader, sink: &'a mut dyn StatusSink) -> Self {
        Self {
            job,
            loader,
            sink,
            workspace: Workspace::new(&job.paths.work_dir),
            state: JobState::Idle,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Process the whole batch. Failures are reported through the sink and
    /// the returned [`BatchReport`]; `Err` means the sink itself failed.
    pub fn run(mut self) -> Result<BatchReport> {
        let started = Instant::now();
        let mut outputs = Vec::with_capacity(self.job.inputs.len());

        let event = match self.process(&mut outputs) {
            Ok(()) => {
                self.transition(JobState::Completed);
                let elapsed = started.elapsed();
                info!(
                    job_id = %self.job.id,
                    files = outputs.len(),
                    elapsed_secs = elapsed.as_secs_f64(),
                    "All files completed"
                );
                ProgressEvent::Completed { elapsed }
            }
            Err(err) => {
                self.transition(JobState::Failed);
                let kind = err
                    .downcast_ref::<UpscaleError>()
                    .map_or("unclassified", UpscaleError::kind);
                error!(job_id = %self.job.id, kind, "Upscaling failed: {err:#}");
                ProgressEvent::Failed(format!("{err:#}"))
            }
        };

        self.sink.publish(&event)?;
        Ok(BatchReport { outputs, event })
    }

    fn process(&mut self, outputs: &mut Vec<PathBuf>) -> Result<()> {
        let job = self.job;
        self.transition(JobState::Loading);
        self.stage("Loading")?;
        let mut model = self.loader.load(&job.model_id, job.device, job.precision)?;

        let total = job.inputs.len();
        for (index, path) in job.inputs.iter().enumerate() {
            let file_number = index + 1;
            self.transition(JobState::Dispatching { file_number, total });
            self.stage(format!("Upscaling {file_number}/{total}"))?;

            let output = match MediaKind::classify(path) {
                MediaKind::Video => {
                    self.transition(JobState::VideoUpscale { file_number });
                    upscale_video(
                        path,
                        file_number,
                        job,
                        model.as_mut(),
                        &mut *self.sink,
                        &self.workspace,
                    )?
                }
                MediaKind::Image => {
                    self.transition(JobState::ImageUpscale { file_number });
                    upscale_image(path, file_number, job, model.as_mut(), &mut *self.sink)?
                }
                MediaKind::Unsupported => {
                    warn!(path = %path.display(), "Skipping unsupported file");
                    continue;
                }
            };
            outputs.push(output);
        }
        Ok(())
    }

    fn stage(&mut self, text: impl Into<String>) -> Result<()> {
        self.sink.publish(&ProgressEvent::stage(text))
    }

    fn transition(&mut self, next: JobState) {
        debug!(from = %self.state, to = %next, "Job state change");
        self.state = next;
    }
}

/// Decode the job handed to a worker process on its stdin.
pub fn read_job(mut input: impl Read) -> Result<Job> {
    let mut payload = String::new();
    input
        .read_to_string(&mut payload)
        .context("failed to read job from stdin")?;
    serde_json::from_str(&payload).context("failed to parse job")
}

/// Worker process body: runs the batch and reports through the status file
/// in the job's work directory.
pub fn run_worker(job: &Job, loader: &dyn ModelLoader) -> Result<BatchReport> {
    let mut channel = ProgressChannel::in_dir(&job.paths.work_dir);
    info!(
        job_id = %job.id,
        files = job.inputs.len(),
        status_file = %channel.path().display(),
        "Worker started"
    );
    Orchestrator::new(job, loader, &mut channel).run()
}
