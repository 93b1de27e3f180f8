//! ONNX Runtime session construction for each inference backend.

use std::fmt;
use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Execution provider family.
///
/// `Tensorrt` needs the TensorRT runtime libraries; when they are missing the
/// session falls back to the CUDA EP, and ORT itself falls back to CPU when
/// CUDA is unavailable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub device_index: u32,
    /// Build TensorRT engines in fp16.
    pub fp16: bool,
    pub trt_cache_dir: &'a Path,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let device_id = i32::try_from(config.device_index).context("device index out of range")?;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config.trt_cache_dir;
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            let cache_path = cache_dir.to_string_lossy().to_string();

            info!(
                cache_dir = %cache_dir.display(),
                device_id,
                fp16 = config.fp16,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let started = Instant::now();
            let (stop_tx, stop_rx) = channel::<()>();
            let ticker = thread::spawn(move || {
                let tick = Duration::from_secs(15);
                let mut elapsed = 15_u64;
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            info!(elapsed_secs = elapsed, "TensorRT engine build still in progress");
                            elapsed += 15;
                        }
                    }
                }
            });

            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(config.fp16)
                        .with_device_id(device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                });

            let _ = stop_tx.send(());
            let _ = ticker.join();

            let elapsed_secs = started.elapsed().as_secs_f64();
            match result {
                Ok(session) => {
                    info!(elapsed_secs, "TensorRT session ready");
                    session
                }
                Err(err) => {
                    error!(elapsed_secs, error = %err, "TensorRT session initialization failed");
                    return Err(err);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default().with_device_id(device_id);
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", device_id, "Building session with CUDA EP");

            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with CPU EP");
            builder
                .with_execution_providers([CPUExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
    };

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_default_is_cuda() {
        assert_eq!(InferenceBackend::default(), InferenceBackend::Cuda);
    }

    #[test]
    fn backend_display() {
        assert_eq!(InferenceBackend::Cpu.to_string(), "cpu");
        assert_eq!(InferenceBackend::Cuda.to_string(), "cuda");
        assert_eq!(InferenceBackend::Tensorrt.to_string(), "tensorrt");
    }

    #[test]
    fn backend_serializes_lowercase() {
        let encoded = serde_json::to_string(&InferenceBackend::Tensorrt).expect("encode");
        assert_eq!(encoded, "\"tensorrt\"");
    }
}
