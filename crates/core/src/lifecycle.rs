//! Supervising side of a job: launches the worker process, polls its status
//! file, reacts to stop requests and cleans up when the job ends.
//!
//! Only one job runs at a time. [`LifecycleController::start`] rejects a new
//! job with [`UpscaleError::JobAlreadyRunning`] until the previous worker has
//! been reaped and its artifacts purged.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::UpscaleError;
use crate::job::Job;
use crate::progress::ProgressEvent;
use crate::workspace::Workspace;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(3000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

const PURGE_ATTEMPTS: u32 = 3;
const PURGE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Wait before the first poll.
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// How the worker process is started. The job is written to its stdin as
/// JSON.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self) -> Command;
}

/// Runs `program args...`, typically the application's own executable with
/// its hidden worker subcommand.
#[derive(Debug, Clone)]
pub struct ExecutableLauncher {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl ExecutableLauncher {
    pub fn current_exe<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let program = std::env::current_exe().context("failed to locate current executable")?;
        Ok(Self {
            program,
            args: args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
        })
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerLauncher for ExecutableLauncher {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.envs.iter().map(|(k, v)| (k, v)));
        command
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { elapsed: Duration },
    Failed(String),
    Cancelled,
    /// The status file disappeared; the supervisor stopped polling and only
    /// waited for the worker to exit.
    Detached,
}

pub struct JobHandle {
    pub id: Uuid,
    cancel: CancellationToken,
    status: watch::Receiver<ProgressEvent>,
    task: JoinHandle<Result<JobOutcome>>,
}

impl JobHandle {
    /// Kill the worker. The supervisor records `Cancelled` and cleans up.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Latest status observed by the poller.
    pub fn status(&self) -> watch::Receiver<ProgressEvent> {
        self.status.clone()
    }

    pub async fn wait(self) -> Result<JobOutcome> {
        self.task.await.context("job supervisor task failed")?
    }
}

pub struct LifecycleController<L> {
    launcher: Arc<L>,
    settings: LifecycleSettings,
    slot: Arc<Semaphore>,
}

impl<L: WorkerLauncher + 'static> LifecycleController<L> {
    pub fn new(launcher: L, settings: LifecycleSettings) -> Self {
        Self {
            launcher: Arc::new(launcher),
            settings,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Launch `job` in a worker process and start supervising it.
    pub async fn start(&self, job: Job) -> Result<JobHandle> {
        let permit = self
            .slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| UpscaleError::JobAlreadyRunning)?;

        let workspace = Workspace::new(&job.paths.work_dir);
        workspace.purge()?;
        let loading = ProgressEvent::stage("Loading");
        workspace.status_channel().write(&loading)?;

        let payload = serde_json::to_vec(&job).context("failed to serialize job")?;
        let mut command = self.launcher.command();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Worker and the ffmpeg processes it spawns share one group.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                workspace.purge()?;
                return Err(err).context("failed to launch upscaling process");
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(&payload).await {
                warn!(error = %err, "Failed to hand job to upscaling process");
            }
        }

        info!(
            job_id = %job.id,
            pid = child.id(),
            files = job.inputs.len(),
            model = %job.model_id,
            device = %job.device,
            "Upscaling process started"
        );

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(loading);
        let task = tokio::spawn(supervise(
            child,
            workspace,
            self.settings,
            cancel.clone(),
            status_tx,
            permit,
        ));

        Ok(JobHandle {
            id: job.id,
            cancel,
            status: status_rx,
            task,
        })
    }
}

async fn supervise(
    mut child: Child,
    workspace: Workspace,
    settings: LifecycleSettings,
    cancel: CancellationToken,
    status_tx: watch::Sender<ProgressEvent>,
    _permit: OwnedSemaphorePermit,
) -> Result<JobOutcome> {
    let channel = workspace.status_channel();

    tokio::select! {
        _ = tokio::time::sleep(settings.grace_period) => {}
        _ = cancel.cancelled() => {}
    }

    let mut stop_handled = false;
    let outcome = loop {
        if cancel.is_cancelled() && !stop_handled {
            stop_handled = true;
            info!("Stop requested, terminating upscaling process");
            kill_worker(&mut child).await;
            if let Err(err) = channel.write(&ProgressEvent::Cancelled) {
                warn!(error = %format!("{err:#}"), "Failed to record stop in status file");
                publish(&status_tx, &ProgressEvent::Cancelled);
                break JobOutcome::Cancelled;
            }
        }

        let event = match channel.read() {
            Ok(event) => event,
            Err(err) => {
                debug!(error = %format!("{err:#}"), "Status file unreadable, polling stops");
                tokio::select! {
                    _ = child.wait() => {}
                    _ = cancel.cancelled() => kill_worker(&mut child).await,
                }
                break JobOutcome::Detached;
            }
        };
        publish(&status_tx, &event);

        if event.is_terminal() {
            kill_worker(&mut child).await;
            break match event {
                ProgressEvent::Completed { elapsed } => JobOutcome::Completed { elapsed },
                ProgressEvent::Failed(reason) => JobOutcome::Failed(reason),
                _ => JobOutcome::Cancelled,
            };
        }

        let exit = match child.try_wait() {
            Ok(exit) => exit,
            Err(err) => {
                warn!(error = %err, "Failed to poll upscaling process");
                kill_worker(&mut child).await;
                break JobOutcome::Detached;
            }
        };
        if let Some(status) = exit {
            // A terminal event written right before exit wins.
            if channel.read().map(|event| event.is_terminal()).unwrap_or(false) {
                continue;
            }
            let reason = format!("upscaling process exited unexpectedly ({status})");
            warn!(%status, "Upscaling process exited without a final status");
            let failed = ProgressEvent::Failed(reason.clone());
            if let Err(err) = channel.write(&failed) {
                warn!(error = %format!("{err:#}"), "Failed to record failure in status file");
                publish(&status_tx, &failed);
                break JobOutcome::Failed(reason);
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.poll_interval) => {}
            _ = cancel.cancelled(), if !stop_handled => {}
        }
    };

    purge(&workspace).await;
    info!(outcome = ?outcome, "Upscaling job finished");
    Ok(outcome)
}

fn publish(status_tx: &watch::Sender<ProgressEvent>, event: &ProgressEvent) {
    let changed = status_tx.send_if_modified(|current| {
        if current == event {
            false
        } else {
            *current = event.clone();
            true
        }
    });
    if changed {
        info!(status = %event, "Job status");
    }
}

async fn kill_worker(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signals the process group created for this worker.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "Upscaling process already gone");
    }
}

/// Children killed with the worker may still be releasing files in the
/// temporary directory, so removal is retried briefly.
async fn purge(workspace: &Workspace) {
    for attempt in 1..=PURGE_ATTEMPTS {
        match workspace.purge() {
            Ok(()) => return,
            Err(err) if attempt < PURGE_ATTEMPTS => {
                debug!(attempt, error = %format!("{err:#}"), "Purge failed, retrying");
                tokio::time::sleep(PURGE_RETRY_DELAY).await;
            }
            Err(err) => warn!(error = %format!("{err:#}"), "Failed to remove job artifacts"),
        }
    }
}
