use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ndarray::Array4;
use ort::{
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::Value,
};
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

/// Execution device for the ONNX backend, chosen explicitly in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    OpenVino,
}

/// A deterministic feed-forward network mapping a `[1, 1, 128, 128]`
/// normalized image to a raw (not yet normalized) feature vector.
pub trait Encoder: Send + Sync {
    fn encode(&self, input: Array4<f32>) -> Result<Vec<f32>, ExtractError>;
}

pub fn session_builder(device: Device) -> Result<SessionBuilder> {
    // One intra-op thread keeps reduction order, and therefore output bits, fixed.
    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(1)?;

    match device {
        Device::Cpu => {}
        Device::Cuda => register_cuda(&mut builder)?,
        Device::OpenVino => register_openvino(&mut builder)?,
    }

    Ok(builder)
}

#[cfg(feature = "cuda")]
fn register_cuda(builder: &mut SessionBuilder) -> Result<()> {
    use ort::ep::{self, ExecutionProvider};

    let ep = ep::CUDA::default();
    if ep.is_available()? {
        ep.register(builder)?;
    } else {
        log::warn!("cuda requested, onnx runtime not compiled with cuda; running on cpu")
    }
    Ok(())
}

#[cfg(not(feature = "cuda"))]
fn register_cuda(_builder: &mut SessionBuilder) -> Result<()> {
    log::warn!("cuda requested but the cuda feature is disabled; running on cpu");
    Ok(())
}

#[cfg(feature = "openvino")]
fn register_openvino(builder: &mut SessionBuilder) -> Result<()> {
    use ort::ep::{self, ExecutionProvider};

    let ep = ep::OpenVINO::default();
    if ep.is_available()? {
        ep.register(builder)?;
    } else {
        log::warn!("openvino requested, onnx runtime not compiled with openvino; running on cpu")
    }
    Ok(())
}

#[cfg(not(feature = "openvino"))]
fn register_openvino(_builder: &mut SessionBuilder) -> Result<()> {
    log::warn!("openvino requested but the openvino feature is disabled; running on cpu");
    Ok(())
}

pub fn onnx_session(path: &Path, device: Device) -> Result<Session> {
    session_builder(device)?
        .commit_from_file(path)
        .with_context(|| format!("load fingerprint model {}", path.display()))
}

/// ONNX Runtime backed encoder.
///
/// `Session::run` needs exclusive access, so inference calls are serialized
/// through a mutex.
pub struct OnnxEncoder {
    session: Mutex<Session>,
}

impl OnnxEncoder {
    pub fn load(path: &Path, device: Device) -> Result<Self, ExtractError> {
        if !path.exists() {
            return Err(ExtractError::ModelLoad(format!(
                "model file {} not found",
                path.display()
            )));
        }
        let session =
            onnx_session(path, device).map_err(|e| ExtractError::ModelLoad(format!("{e:#}")))?;
        log::info!("loaded onnx model {} on {:?}", path.display(), device);
        Ok(Self::from_session(session))
    }

    pub fn from_session(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }
}

impl Encoder for OnnxEncoder {
    fn encode(&self, input: Array4<f32>) -> Result<Vec<f32>, ExtractError> {
        let input_tensor =
            Value::from_array(input).map_err(|e| ExtractError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ExtractError::Inference("model session poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| ExtractError::Inference(e.to_string()))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::Inference(e.to_string()))?;

        // Expecting shape [1, D]
        let embedding_size = if shape.len() == 2 {
            shape[1] as usize
        } else {
            data.len()
        };
        data.get(0..embedding_size)
            .map(|d| d.to_vec())
            .ok_or_else(|| ExtractError::Inference("model output shorter than declared".into()))
    }
}
