//! Error types for pointseg

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmentError {
    /// Model files missing or corrupt, session creation or schema resolution failed.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Request rejected before any inference ran.
    #[error("Invalid decode input: {0}")]
    DecodeInput(String),

    /// Runtime failure inside the encoder or decoder.
    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Models are not initialized; call initialize_models first")]
    NotInitialized,

    #[error("Inference worker is not running")]
    WorkerUnavailable,

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<toml::de::Error> for SegmentError {
    fn from(err: toml::de::Error) -> Self {
        SegmentError::Config(err.to_string())
    }
}

impl SegmentError {
    /// True for errors that only affect the request that raised them.
    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            SegmentError::DecodeInput(_) | SegmentError::Inference(_) | SegmentError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SegmentError>;
