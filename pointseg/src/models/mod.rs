//! Model seams, ONNX Runtime backends and model provisioning

pub mod decoder;
pub mod encoder;
pub mod manager;
pub mod schema;

pub use decoder::{BinaryMask, DecoderPrompt, MaskBundle, MaskDecoder, OnnxDecoder};
pub use encoder::{EmbeddingBundle, ImageEncoder, OnnxEncoder};
pub use manager::ModelManager;
pub use schema::{DecoderSchema, EncoderSchema, TensorInfo, SCHEMA_VERSION};

use crate::config::{ExecutionProviderKind, SegmentConfig};
use crate::error::SegmentError;
use ndarray::Array4;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProviderDispatch,
    NNAPIExecutionProvider, XNNPACKExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionOutputs};
use ort::value::ValueType;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Encoder and decoder ready for inference
pub struct LoadedModels {
    pub encoder: Box<dyn ImageEncoder>,
    pub decoder: Box<dyn MaskDecoder>,
}

/// Produces the model pair on the inference worker
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<LoadedModels, SegmentError>;
}

/// Provisions model files, then opens ONNX Runtime sessions for them
pub struct OnnxModelLoader {
    config: Arc<SegmentConfig>,
}

impl OnnxModelLoader {
    pub fn new(config: Arc<SegmentConfig>) -> Self {
        Self { config }
    }

    /// Load both models without wrapping them, for schema inspection
    pub fn load_onnx(&self) -> Result<(OnnxEncoder, OnnxDecoder), SegmentError> {
        let manager = ModelManager::new(self.config.clone());
        let paths = manager.ensure_models()?;

        let options = SessionOptions::from_config(&self.config);
        let encoder = OnnxEncoder::new(&paths.encoder, &options)?;
        let decoder = OnnxDecoder::new(&paths.decoder, &options)?;
        info!("Encoder and decoder sessions ready");
        Ok((encoder, decoder))
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self) -> Result<LoadedModels, SegmentError> {
        let (encoder, decoder) = self.load_onnx()?;
        Ok(LoadedModels {
            encoder: Box::new(encoder),
            decoder: Box::new(decoder),
        })
    }
}

/// Runtime settings shared by both sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub intra_threads: usize,
    pub execution_providers: Vec<ExecutionProviderKind>,
}

impl SessionOptions {
    pub fn from_config(config: &SegmentConfig) -> Self {
        Self {
            intra_threads: config.intra_threads,
            execution_providers: config.execution_providers.clone(),
        }
    }
}

fn provider_dispatch(kind: ExecutionProviderKind) -> ExecutionProviderDispatch {
    match kind {
        ExecutionProviderKind::Cpu => CPUExecutionProvider::default().build(),
        ExecutionProviderKind::Xnnpack => XNNPACKExecutionProvider::default().build(),
        ExecutionProviderKind::Nnapi => NNAPIExecutionProvider::default().build(),
        ExecutionProviderKind::NnapiFp16 => NNAPIExecutionProvider::default().with_fp16(true).build(),
        ExecutionProviderKind::CoreMl => CoreMLExecutionProvider::default().build(),
        ExecutionProviderKind::Cuda => CUDAExecutionProvider::default().build(),
    }
}

pub(crate) fn build_session(
    model_path: &Path,
    options: &SessionOptions,
    role: &str,
) -> Result<Session, SegmentError> {
    if !model_path.is_file() {
        return Err(SegmentError::Initialization(format!(
            "{} model not found at {:?}",
            role, model_path
        )));
    }

    let mut builder = Session::builder()
        .map_err(init_err(role))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(init_err(role))?;
    if options.intra_threads > 0 {
        builder = builder
            .with_intra_threads(options.intra_threads)
            .map_err(init_err(role))?;
    }
    if !options.execution_providers.is_empty() {
        info!("{} execution providers: {:?}", role, options.execution_providers);
        let providers: Vec<ExecutionProviderDispatch> = options
            .execution_providers
            .iter()
            .map(|&kind| provider_dispatch(kind))
            .collect();
        builder = builder
            .with_execution_providers(providers)
            .map_err(init_err(role))?;
    }

    builder.commit_from_file(model_path).map_err(|e| {
        SegmentError::Initialization(format!("Failed to load {} model {:?}: {}", role, model_path, e))
    })
}

fn init_err<E: std::fmt::Display>(role: &str) -> impl Fn(E) -> SegmentError + '_ {
    move |e| SegmentError::Initialization(format!("Failed to create {} session: {}", role, e))
}

/// Declared inputs and outputs, with tensor dimensions where the model has them
pub(crate) fn session_io(session: &Session) -> (Vec<TensorInfo>, Vec<TensorInfo>) {
    let inputs = session
        .inputs
        .iter()
        .map(|i| tensor_info(&i.name, &i.input_type))
        .collect();
    let outputs = session
        .outputs
        .iter()
        .map(|o| tensor_info(&o.name, &o.output_type))
        .collect();
    (inputs, outputs)
}

fn tensor_info(name: &str, value_type: &ValueType) -> TensorInfo {
    match value_type {
        ValueType::Tensor { shape, .. } => TensorInfo::new(name, shape.iter().copied().collect()),
        _ => TensorInfo::named(name),
    }
}

/// Copy a named f32 output out of the session
pub(crate) fn output_tensor(
    outputs: &SessionOutputs,
    name: &str,
) -> Result<(Vec<usize>, Vec<f32>), SegmentError> {
    let value = outputs
        .get(name)
        .ok_or_else(|| SegmentError::Inference(format!("Model output '{}' is missing", name)))?;
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| SegmentError::Inference(format!("Failed to extract '{}': {}", name, e)))?;
    let dims = shape.iter().map(|&d| usize::try_from(d).unwrap_or(0)).collect();
    Ok((dims, data.to_vec()))
}

pub(crate) fn output_array4(
    outputs: &SessionOutputs,
    name: &str,
    expected: [usize; 4],
) -> Result<Array4<f32>, SegmentError> {
    let (dims, data) = output_tensor(outputs, name)?;
    if dims != expected {
        return Err(SegmentError::Inference(format!(
            "Output '{}' has shape {:?}, expected {:?}",
            name, dims, expected
        )));
    }
    Array4::from_shape_vec(expected, data)
        .map_err(|e| SegmentError::Inference(format!("Failed to reshape '{}': {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_options_from_config() {
        let config = SegmentConfig {
            intra_threads: 2,
            execution_providers: vec![ExecutionProviderKind::Xnnpack, ExecutionProviderKind::Cpu],
            ..Default::default()
        };
        let options = SessionOptions::from_config(&config);
        assert_eq!(options.intra_threads, 2);
        assert_eq!(
            options.execution_providers,
            vec![ExecutionProviderKind::Xnnpack, ExecutionProviderKind::Cpu]
        );
        assert_eq!(SessionOptions::from_config(&SegmentConfig::default()), SessionOptions::default());
    }

    #[test]
    fn test_build_session_with_providers_checks_file_first() {
        let options = SessionOptions {
            intra_threads: 0,
            execution_providers: vec![ExecutionProviderKind::NnapiFp16, ExecutionProviderKind::CoreMl],
        };
        let result = build_session(Path::new("missing_model.onnx"), &options, "encoder");
        assert!(matches!(result, Err(SegmentError::Initialization(msg)) if msg.contains("not found")));
    }
}
