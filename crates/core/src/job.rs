//! The immutable description of one batch run and its validation.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{Device, DeviceId};
use crate::error::UpscaleError;
use crate::media::{filter_supported, ImageFormat, VideoContainer};

/// Model identifiers shipped with the application. Each maps to
/// `<models_dir>/<id>.onnx`.
pub const KNOWN_MODELS: [&str; 8] = [
    "BSRGANx4",
    "BSRNetx4",
    "RealSR_JPEGx4",
    "RealSR_DPEDx4",
    "RRDBx4",
    "ESRGANx4",
    "FSSR_JPEGx4",
    "FSSR_DPEDx4",
];

/// Every model upscales by this factor.
pub const UPSCALE_FACTOR: u32 = 4;

const VRAM_MULTIPLIER: f64 = 0.9;
const FULL_PRECISION_TILE_RATIO: f64 = 0.6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Half,
    Full,
}

impl Precision {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "half" | "fp16" | "half precision" => Some(Self::Half),
            "full" | "fp32" | "full precision" => Some(Self::Full),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Half => write!(f, "half"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Directories a job reads from and writes scratch data into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPaths {
    /// Parent of the temporary directory and the status file.
    pub work_dir: PathBuf,
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub inputs: Vec<PathBuf>,
    pub model_id: String,
    pub device: DeviceId,
    pub precision: Precision,
    /// Maximum tile edge in pixels.
    pub tile_budget: u32,
    pub resize_percent: u32,
    pub image_format: ImageFormat,
    pub video_container: VideoContainer,
    pub interpolate: bool,
    pub encoder_threads: u32,
    pub paths: JobPaths,
}

impl Job {
    pub fn resize_factor(&self) -> f64 {
        f64::from(self.resize_percent) / 100.0
    }
}

/// Raw, unvalidated job settings as a user interface collects them.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub inputs: Vec<PathBuf>,
    pub model_id: String,
    pub device: String,
    pub precision: String,
    pub vram_gb: String,
    pub resize_percent: String,
    pub cpu_threads: String,
    pub image_extension: String,
    pub video_extension: String,
    pub interpolate: bool,
    pub paths: JobPaths,
}

impl JobRequest {
    /// Check every setting against `devices` and build the [`Job`].
    ///
    /// Nothing is started when this fails.
    pub fn validate(self, devices: &[Device]) -> Result<Job, UpscaleError> {
        let inputs = filter_supported(&self.inputs);
        if inputs.is_empty() {
            return Err(UpscaleError::Input("no files selected".to_string()));
        }
        if let Some(missing) = inputs.iter().find(|path| !path.is_file()) {
            return Err(UpscaleError::Input(format!(
                "cannot read {}",
                missing.display()
            )));
        }

        let model_id = self.model_id.trim().to_string();
        if model_id.is_empty() {
            return Err(UpscaleError::Config("no model selected".to_string()));
        }

        let device = DeviceId::parse(&self.device).ok_or_else(|| {
            UpscaleError::Config(format!("unknown device '{}'", self.device.trim()))
        })?;
        if !devices.iter().any(|candidate| candidate.id == device) {
            let available = devices
                .iter()
                .map(|d| d.id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(UpscaleError::Config(format!(
                "device {device} is not available (available: {available})"
            )));
        }

        let precision = Precision::parse(&self.precision).ok_or_else(|| {
            UpscaleError::Config(format!("unknown precision '{}'", self.precision.trim()))
        })?;
        let resize_percent = parse_positive("resize", &self.resize_percent)?;
        let vram_gb = parse_positive("VRAM", &self.vram_gb)?;
        let encoder_threads = parse_positive("CPU threads", &self.cpu_threads)?;

        let image_format = ImageFormat::parse(&self.image_extension).ok_or_else(|| {
            UpscaleError::Config(format!(
                "unsupported image extension '{}'",
                self.image_extension.trim()
            ))
        })?;
        let video_container = VideoContainer::parse(&self.video_extension).ok_or_else(|| {
            UpscaleError::Config(format!(
                "unsupported video extension '{}'",
                self.video_extension.trim()
            ))
        })?;

        Ok(Job {
            id: Uuid::new_v4(),
            inputs,
            model_id,
            device,
            precision,
            tile_budget: tile_budget(vram_gb, precision),
            resize_percent,
            image_format,
            video_container,
            interpolate: self.interpolate,
            encoder_threads,
            paths: self.paths,
        })
    }
}

/// Largest tile edge that fits in `vram_gb` of device memory.
pub fn tile_budget(vram_gb: u32, precision: Precision) -> u32 {
    let base = VRAM_MULTIPLIER * f64::from(vram_gb) * 100.0;
    let budget = match precision {
        Precision::Half => base,
        Precision::Full => base * FULL_PRECISION_TILE_RATIO,
    };
    (budget as u32).max(1)
}

/// Numeric text truncated toward zero; must end up `> 0`.
fn parse_positive(field: &str, raw: &str) -> Result<u32, UpscaleError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| UpscaleError::Config(format!("{field} must be a number, got '{}'", raw.trim())))?;
    if !value.is_finite() {
        return Err(UpscaleError::Config(format!("{field} must be a finite number")));
    }
    let truncated = value.trunc();
    if truncated < 1.0 {
        return Err(UpscaleError::Config(format!("{field} must be greater than 0")));
    }
    if truncated > f64::from(u32::MAX) {
        return Err(UpscaleError::Config(format!("{field} is too large")));
    }
    Ok(truncated as u32)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::Path;

    /// A validated-looking job on the CPU device writing PNG/MP4 outputs.
    pub(crate) fn job_for(inputs: Vec<PathBuf>, work_dir: &Path, tile_budget: u32) -> Job {
        Job {
            id: Uuid::new_v4(),
            inputs,
            model_id: "BSRGANx4".to_string(),
            device: DeviceId::CPU,
            precision: Precision::Full,
            tile_budget,
            resize_percent: 100,
            image_format: ImageFormat::Png,
            video_container: VideoContainer::Mp4,
            interpolate: false,
            encoder_threads: 1,
            paths: JobPaths {
                work_dir: work_dir.to_path_buf(),
                models_dir: work_dir.join("models"),
                trt_cache_dir: work_dir.join("trt"),
            },
        }
    }
}
