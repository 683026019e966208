//! Model manager: provisions model files from the read-only bundle

use crate::config::SegmentConfig;
use crate::error::SegmentError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Resolved on-disk locations of both models
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub encoder: PathBuf,
    pub decoder: PathBuf,
}

/// Copies packaged models into the writable model directory
pub struct ModelManager {
    config: Arc<SegmentConfig>,
}

impl ModelManager {
    pub fn new(config: Arc<SegmentConfig>) -> Self {
        Self { config }
    }

    /// Ensure model directory exists
    pub fn ensure_model_dir(&self) -> Result<PathBuf, SegmentError> {
        let model_dir = &self.config.model_dir;
        if !model_dir.exists() {
            fs::create_dir_all(model_dir).map_err(|e| {
                SegmentError::Initialization(format!(
                    "Failed to create model directory {:?}: {}",
                    model_dir, e
                ))
            })?;
            info!("Created model directory: {:?}", model_dir);
        }
        Ok(model_dir.clone())
    }

    /// Both models present in `model_dir`, copying them out of the bundle if needed
    pub fn ensure_models(&self) -> Result<ModelPaths, SegmentError> {
        let encoder = self.ensure_model(
            &self.config.encoder_file,
            self.config.encoder_checksum.as_deref(),
        )?;
        let decoder = self.ensure_model(
            &self.config.decoder_file,
            self.config.decoder_checksum.as_deref(),
        )?;
        Ok(ModelPaths { encoder, decoder })
    }

    /// Provision a single model file. Files already in place are only re-verified.
    pub fn ensure_model(&self, model_name: &str, checksum: Option<&str>) -> Result<PathBuf, SegmentError> {
        validate_model_name(model_name)?;
        self.ensure_model_dir()?;

        let model_path = self.config.model_dir.join(model_name);
        if model_path.is_file() {
            info!("Model {} already present at {:?}", model_name, model_path);
            if let Some(expected) = checksum {
                verify_checksum(model_name, &fs::read(&model_path)?, expected)?;
            }
            return Ok(model_path);
        }

        let bundle_dir = self.config.bundle_dir.as_ref().ok_or_else(|| {
            SegmentError::Initialization(format!(
                "Model {} not found in {:?} and no bundle directory is configured",
                model_name, self.config.model_dir
            ))
        })?;

        let source = bundle_dir.join(model_name);
        if !source.is_file() {
            return Err(SegmentError::Initialization(format!(
                "Model {} not found in bundle {:?}",
                model_name, bundle_dir
            )));
        }

        info!("Copying model {} from {:?}", model_name, bundle_dir);
        let bytes = fs::read(&source).map_err(|e| {
            SegmentError::Initialization(format!("Failed to read bundled model {:?}: {}", source, e))
        })?;

        if bytes.is_empty() {
            return Err(SegmentError::Initialization(format!(
                "Bundled model {} is empty",
                model_name
            )));
        }

        match checksum {
            Some(expected) => verify_checksum(model_name, &bytes, expected)?,
            None => info!("Checksum verification skipped for model {}", model_name),
        }

        write_atomic(&model_path, &bytes)?;
        info!("Model {} ({} bytes) saved to {:?}", model_name, bytes.len(), model_path);
        Ok(model_path)
    }
}

fn validate_model_name(model_name: &str) -> Result<(), SegmentError> {
    if model_name.is_empty() || model_name.len() > 255 {
        return Err(SegmentError::Initialization("Invalid model name".to_string()));
    }
    if model_name.contains("..") || model_name.contains('/') || model_name.contains('\\') {
        return Err(SegmentError::Initialization(format!(
            "Model name {:?} contains invalid characters",
            model_name
        )));
    }
    Ok(())
}

fn verify_checksum(model_name: &str, bytes: &[u8], expected: &str) -> Result<(), SegmentError> {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let computed = hex::encode(hasher.finalize());

    if !computed.eq_ignore_ascii_case(expected) {
        return Err(SegmentError::Initialization(format!(
            "Checksum mismatch for model {}: expected {}, got {}",
            model_name, expected, computed
        )));
    }
    info!("Verified checksum for model {}", model_name);
    Ok(())
}

/// Temp file then rename, so a crash never leaves a truncated model behind
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SegmentError> {
    let temp_path = path.with_extension("onnx.tmp");
    fs::write(&temp_path, bytes)?;

    if let Err(e) = fs::rename(&temp_path, path) {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            warn!("Failed to remove temp file {:?}: {}", temp_path, cleanup);
        }
        return Err(SegmentError::Io(e));
    }
    Ok(())
}
