//! Configuration for pointseg

use crate::error::SegmentError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_ENCODER_FILE: &str = "tiny_encoder.onnx";
pub const DEFAULT_DECODER_FILE: &str = "tiny_decoder.onnx";

/// How the decoder's candidate masks collapse into one label mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskPolicy {
    /// A pixel is set if any candidate exceeds the threshold
    Union,
    /// Only the highest-scoring candidate is thresholded
    BestScore,
}

/// Hardware backend offered to ONNX Runtime, in preference order.
///
/// Providers the runtime cannot register are skipped and the session falls
/// back to CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionProviderKind {
    Cpu,
    Xnnpack,
    Nnapi,
    /// NNAPI with FP16 relaxation
    NnapiFp16,
    #[serde(rename = "coreml")]
    CoreMl,
    Cuda,
}

/// Segmentation session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Writable directory the models are loaded from
    pub model_dir: PathBuf,
    /// Read-only directory holding the packaged models, copied into `model_dir` once
    pub bundle_dir: Option<PathBuf>,
    pub encoder_file: String,
    pub decoder_file: String,
    /// Optional SHA-256 (hex) of the encoder file
    pub encoder_checksum: Option<String>,
    /// Optional SHA-256 (hex) of the decoder file
    pub decoder_checksum: Option<String>,
    /// ONNX Runtime intra-op threads (0 = runtime default)
    pub intra_threads: usize,
    /// Empty means the runtime default (CPU)
    pub execution_providers: Vec<ExecutionProviderKind>,
    /// Raw mask values strictly above this are foreground
    pub mask_threshold: f32,
    pub mask_policy: MaskPolicy,
    /// Alpha of every label color when blended (0-255)
    pub overlay_alpha: u8,
    /// Hue increment per label id, in degrees
    pub hue_step: f32,
    /// Keep a label's previous mask when its decode fails
    pub stale_mask_on_failure: bool,
    /// Pending requests the worker queue holds before callers wait
    pub queue_depth: usize,
    /// Caller-side timeout applied by the service handle
    pub request_timeout_ms: Option<u64>,
    /// Maximum prompt points per label
    pub max_points: usize,
    /// Maximum decoded image size in pixels
    pub max_image_pixels: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        let model_dir = dirs::home_dir()
            .map(|mut p| {
                p.push(".pointseg");
                p.push("models");
                p
            })
            .unwrap_or_else(|| PathBuf::from("./models"));

        Self {
            model_dir,
            bundle_dir: None,
            encoder_file: DEFAULT_ENCODER_FILE.to_string(),
            decoder_file: DEFAULT_DECODER_FILE.to_string(),
            encoder_checksum: None,
            decoder_checksum: None,
            intra_threads: 0,
            execution_providers: Vec::new(),
            mask_threshold: 0.1,
            mask_policy: MaskPolicy::Union,
            overlay_alpha: 128,
            hue_step: 137.5,
            stale_mask_on_failure: true,
            queue_depth: 16,
            request_timeout_ms: None,
            max_points: 64,
            max_image_pixels: 64_000_000,
        }
    }
}

impl SegmentConfig {
    /// Load configuration from a TOML file; missing keys take defaults
    pub fn from_file(path: &Path) -> Result<Self, SegmentError> {
        let text = std::fs::read_to_string(path)?;
        let config: SegmentConfig = toml::from_str(&text)?;
        config.validate().map_err(SegmentError::Config)?;
        Ok(config)
    }

    pub fn encoder_path(&self) -> PathBuf {
        self.model_dir.join(&self.encoder_file)
    }

    pub fn decoder_path(&self) -> PathBuf {
        self.model_dir.join(&self.decoder_file)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.encoder_file.is_empty() || self.decoder_file.is_empty() {
            return Err("Model file names must be non-empty".to_string());
        }

        if self.encoder_file == self.decoder_file {
            return Err("Encoder and decoder must use different files".to_string());
        }

        if !self.mask_threshold.is_finite() {
            return Err("Mask threshold must be finite".to_string());
        }

        if !self.hue_step.is_finite() {
            return Err("Hue step must be finite".to_string());
        }

        if self.queue_depth == 0 || self.queue_depth > 1024 {
            return Err("Queue depth must be between 1 and 1024".to_string());
        }

        if self.max_points == 0 {
            return Err("max_points must be at least 1".to_string());
        }

        if self.max_image_pixels == 0 {
            return Err("max_image_pixels must be non-zero".to_string());
        }

        if let Some(0) = self.request_timeout_ms {
            return Err("Request timeout must be non-zero when set".to_string());
        }

        for checksum in [&self.encoder_checksum, &self.decoder_checksum].into_iter().flatten() {
            if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(format!("Invalid SHA-256 checksum: {}", checksum));
            }
        }

        Ok(())
    }
}
