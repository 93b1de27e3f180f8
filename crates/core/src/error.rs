//! Classified failures of an upscaling job.
//!
//! Plumbing code works with `anyhow::Result` and attaches context freely; the
//! boundaries that must tell the user *what kind* of thing went wrong (input
//! validation, model loading, enhancement, encoding) wrap the chain into one of
//! these variants. Each variant renders the wrapped chain itself, so a
//! `{:#}` rendering of an outer `anyhow::Error` never repeats it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpscaleError {
    #[error("input error: {0}")]
    Input(String),

    #[error("invalid setting: {0}")]
    Config(String),

    #[error("failed to load model: {0:#}")]
    ModelLoad(anyhow::Error),

    #[error("enhancement failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("video encoding failed: {0:#}")]
    Encode(anyhow::Error),

    #[error("another upscaling job is still running")]
    JobAlreadyRunning,
}

impl UpscaleError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Config(_) => "config",
            Self::ModelLoad(_) => "model_load",
            Self::Inference(_) => "inference",
            Self::Encode(_) => "encode",
            Self::JobAlreadyRunning => "job_already_running",
        }
    }

    /// Errors raised before a worker process exists.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Input(_) | Self::Config(_) | Self::JobAlreadyRunning
        )
    }
}
