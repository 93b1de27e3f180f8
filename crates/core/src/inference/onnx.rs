//! ONNX Runtime implementation of [`ModelLoader`] / [`SuperResolution`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info, warn};

use super::backend::{build_session, SessionConfig};
use super::{ModelLoader, SuperResolution};
use crate::device::DeviceId;
use crate::error::UpscaleError;
use crate::job::Precision;

/// Loads `<models_dir>/<model_id>.onnx`.
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

impl OnnxModelLoader {
    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(format!("{model_id}.onnx"))
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(
        &self,
        model_id: &str,
        device: DeviceId,
        precision: Precision,
    ) -> Result<Box<dyn SuperResolution>, UpscaleError> {
        let model_path = self.model_path(model_id);
        if !model_path.is_file() {
            return Err(UpscaleError::ModelLoad(anyhow!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        debug!(
            model = %model_path.display(),
            %device,
            %precision,
            "Loading ONNX super-resolution model"
        );

        let config = SessionConfig {
            model_path: &model_path,
            backend: device.backend,
            device_index: device.index,
            fp16: precision == Precision::Half,
            trt_cache_dir: &self.trt_cache_dir,
        };
        let session = build_session(&config).map_err(UpscaleError::ModelLoad)?;
        let model = OnnxModel::new(session).map_err(UpscaleError::ModelLoad)?;

        if precision == Precision::Full && model.fp16_input {
            warn!(model = model_id, "Model only accepts fp16 input; running in half precision");
        }
        info!(model = model_id, %device, fp16_input = model.fp16_input, "Model loaded");

        Ok(Box::new(model))
    }
}

pub struct OnnxModel {
    session: Session,
    input_name: String,
    output_name: String,
    fp16_input: bool,
}

impl OnnxModel {
    fn new(session: Session) -> Result<Self> {
        let input = session
            .inputs()
            .first()
            .context("model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("model declares no outputs")?;

        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let fp16_input = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, fp16_input, "Detected model IO");

        Ok(Self {
            session,
            input_name,
            output_name,
            fp16_input,
        })
    }
}

impl SuperResolution for OnnxModel {
    fn upscale(&mut self, input: Array4<f32>) -> Result<Array4<f32>> {
        let output = if self.fp16_input {
            run_fp16(&mut self.session, input, &self.input_name, &self.output_name)?
        } else {
            let tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            view.to_owned()
        };

        output
            .into_dimensionality::<Ix4>()
            .context("model output is not a 4-D tensor")
    }
}

fn run_fp16(
    session: &mut Session,
    input: Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let shape = input.shape().to_vec();
    let contiguous = input.as_standard_layout();
    let f32_slice = contiguous
        .as_slice()
        .context("input tensor is not contiguous")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, fp16_data)?)?;
    let outputs = session.run(ort::inputs![input_name => &tensor])?;
    let view = outputs[output_name].try_extract_array::<f16>()?;

    let owned = view.as_standard_layout().into_owned();
    let fp16_slice = owned
        .as_slice()
        .context("output tensor is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(owned.shape().to_vec(), f32_data)?)
}
