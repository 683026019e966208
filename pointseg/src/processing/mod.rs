//! Pure processing stages between the boundary API and the models

pub mod cache;
pub mod compositor;
pub mod coords;
pub mod labels;

pub use cache::{CacheStats, EmbeddingCache, ImageId};
pub use compositor::{composite, encode_png, overlay, Palette};
pub use coords::{Point2, Size, MODEL_INPUT_SIZE};
pub use labels::{LabelId, LabelStore, PointType, PromptPoint};
