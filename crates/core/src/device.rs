//! Device enumeration.
//!
//! The device list is built once at startup by [`enumerate_devices`] and passed
//! to job validation as an immutable slice.

use std::fmt;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::inference::backend::InferenceBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    pub backend: InferenceBackend,
    pub index: u32,
}

impl DeviceId {
    pub const CPU: DeviceId = DeviceId {
        backend: InferenceBackend::Cpu,
        index: 0,
    };

    /// `cpu`, `cuda`, `cuda:1`, `tensorrt:0`, `trt:0`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        let (backend, index) = match value.split_once(':') {
            Some((backend, index)) => (backend.to_string(), index.parse::<u32>().ok()?),
            None => (value, 0),
        };
        let backend = match backend.as_str() {
            "cpu" => return (index == 0).then_some(Self::CPU),
            "cuda" | "gpu" => InferenceBackend::Cuda,
            "tensorrt" | "trt" => InferenceBackend::Tensorrt,
            _ => return None,
        };
        Some(Self { backend, index })
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backend {
            InferenceBackend::Cpu => write!(f, "cpu"),
            backend => write!(f, "{backend}:{}", self.index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
}

/// Query the GPUs visible to the NVIDIA driver, then append the CPU.
pub fn enumerate_devices() -> Vec<Device> {
    let gpus = match query_nvidia_smi() {
        Some(stdout) => parse_gpu_list(&stdout),
        None => Vec::new(),
    };
    let devices = build_device_list(&gpus);
    info!(
        devices = %devices.iter().map(|d| d.id.to_string()).collect::<Vec<_>>().join(","),
        "Enumerated inference devices"
    );
    devices
}

fn query_nvidia_smi() -> Option<String> {
    let output = crate::runtime::command_for("nvidia-smi")
        .args(["--query-gpu=index,name", "--format=csv,noheader"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();

    match output {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            debug!(status = %output.status, "nvidia-smi reported no usable GPU");
            None
        }
        Err(error) => {
            debug!(error = %error, "nvidia-smi not available; CPU only");
            None
        }
    }
}

fn parse_gpu_list(stdout: &str) -> Vec<(u32, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (index, name) = line.split_once(',')?;
            Some((index.trim().parse().ok()?, name.trim().to_string()))
        })
        .collect()
}

fn build_device_list(gpus: &[(u32, String)]) -> Vec<Device> {
    let mut devices = Vec::with_capacity(gpus.len() * 2 + 1);
    for (index, name) in gpus {
        devices.push(Device {
            id: DeviceId {
                backend: InferenceBackend::Cuda,
                index: *index,
            },
            name: name.clone(),
        });
    }
    for (index, name) in gpus {
        devices.push(Device {
            id: DeviceId {
                backend: InferenceBackend::Tensorrt,
                index: *index,
            },
            name: format!("{name} (TensorRT)"),
        });
    }
    devices.push(Device {
        id: DeviceId::CPU,
        name: "CPU".to_string(),
    });
    devices
}
