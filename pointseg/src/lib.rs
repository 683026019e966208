//! pointseg: interactive point-prompted segmentation with SAM2
//!
//! An image is encoded once; every tap on it re-runs only the light mask
//! decoder for the touched label. Each label's latest mask is blended over
//! the image in its own color and handed back as a PNG.
//!
//! [`SegmentService`] is the entry point. It owns a single inference worker
//! and exposes `initialize_models`, `process_image`, `clear_points` and
//! `remove_label` as async calls.

pub mod config;
pub mod error;
pub mod models;
pub mod processing;
pub mod service;
pub mod session;
mod utils;

pub use config::{ExecutionProviderKind, MaskPolicy, SegmentConfig};
pub use error::SegmentError;
pub use models::{LoadedModels, ModelLoader, ModelManager, OnnxModelLoader, SessionOptions};
pub use processing::labels::{LabelId, PointType, PromptPoint};
pub use service::{NormalizedPoint, SegmentService};
pub use session::SegmentSession;
pub use utils::decode_image;
