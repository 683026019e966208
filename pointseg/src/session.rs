//! Segmentation session: one image, its cached embedding and every label's mask
//!
//! The session is plain state. It never owns the models; the caller lends an
//! encoder and decoder for each request so the same state machine runs against
//! ONNX Runtime in production and against mocks in tests.

use crate::config::SegmentConfig;
use crate::error::SegmentError;
use crate::models::{BinaryMask, DecoderPrompt, ImageEncoder, MaskBundle, MaskDecoder};
use crate::processing::cache::{CacheStats, EmbeddingCache, ImageId};
use crate::processing::compositor::{self, Palette};
use crate::processing::labels::{LabelId, LabelStore, PromptPoint};
use crate::utils::decode_image;
use image::RgbaImage;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

struct LoadedImage {
    id: ImageId,
    pixels: RgbaImage,
}

/// Latest decoder output for a label and its thresholded mask
#[derive(Debug, Clone)]
pub struct LabelMask {
    pub bundle: MaskBundle,
    pub mask: BinaryMask,
}

pub struct SegmentSession {
    config: Arc<SegmentConfig>,
    palette: Palette,
    image: Option<LoadedImage>,
    cache: EmbeddingCache,
    labels: LabelStore,
    masks: IndexMap<LabelId, LabelMask>,
}

impl SegmentSession {
    pub fn new(config: Arc<SegmentConfig>) -> Self {
        let palette = Palette::new(config.overlay_alpha, config.hue_step);
        Self {
            config,
            palette,
            image: None,
            cache: EmbeddingCache::new(),
            labels: LabelStore::new(),
            masks: IndexMap::new(),
        }
    }

    /// Replace `label`'s points, decode its mask and return the new composite.
    ///
    /// A different image resets all state first. The encoder only runs when
    /// the embedding for this image is not cached.
    pub fn process_image(
        &mut self,
        encoder: &mut dyn ImageEncoder,
        decoder: &mut dyn MaskDecoder,
        image_bytes: &[u8],
        points: &[PromptPoint],
        label: LabelId,
    ) -> Result<RgbaImage, SegmentError> {
        if points.len() > self.config.max_points {
            return Err(SegmentError::DecodeInput(format!(
                "Label {} has {} points, limit is {}",
                label,
                points.len(),
                self.config.max_points
            )));
        }
        let prompt = DecoderPrompt::from_points(points)?;

        self.select_image(image_bytes)?;
        let (id, width, height) = match &self.image {
            Some(image) => (image.id.clone(), image.pixels.width(), image.pixels.height()),
            None => return Err(SegmentError::DecodeInput("No image loaded".to_string())),
        };

        let embedding = match self.cache.get(&id) {
            Some(embedding) => embedding,
            None => {
                let image = self.image_pixels()?;
                let start = Instant::now();
                let embedding = Arc::new(encoder.encode(image)?);
                info!(
                    "Encoded image {} ({}x{}) in {:.1}ms",
                    id,
                    width,
                    height,
                    start.elapsed().as_secs_f64() * 1000.0
                );
                self.cache.set(id.clone(), embedding.clone());
                embedding
            }
        };

        self.labels.replace_points(label, points.to_vec());

        let decoded = decoder
            .decode(&embedding, &prompt, height, width)
            .and_then(|bundle| check_mask_size(bundle, width, height));

        let bundle = match decoded {
            Ok(bundle) => bundle,
            Err(e) => {
                if self.config.stale_mask_on_failure {
                    warn!("Decode failed for label {}, keeping previous mask: {}", label, e);
                } else {
                    warn!("Decode failed for label {}, clearing its mask: {}", label, e);
                    self.masks.shift_remove(&label);
                }
                return Err(e);
            }
        };

        let mask = bundle.binarize(self.config.mask_policy, self.config.mask_threshold);
        debug!(
            "Label {}: {} points, {} candidates, {} foreground pixels",
            label,
            points.len(),
            bundle.num_candidates(),
            mask.count()
        );
        self.masks.insert(label, LabelMask { bundle, mask });

        self.composite()
            .ok_or_else(|| SegmentError::DecodeInput("No image loaded".to_string()))
    }

    /// Drop a label's points and mask. `None` when no image is loaded.
    pub fn remove_label(&mut self, label: LabelId) -> Option<RgbaImage> {
        let removed = self.labels.remove_label(label);
        self.masks.shift_remove(&label);
        if removed {
            debug!("Removed label {}", label);
        }
        self.composite()
    }

    /// Forget the image, its embedding, every label and every mask
    pub fn clear(&mut self) {
        self.image = None;
        self.cache.invalidate();
        self.labels.clear();
        self.masks.clear();
        debug!("Session cleared");
    }

    /// Base image with every current mask blended in, in label order
    pub fn composite(&self) -> Option<RgbaImage> {
        let image = self.image.as_ref()?;
        Some(compositor::composite(&image.pixels, self.ordered_masks(), self.palette))
    }

    /// Label colors only, on a transparent background
    pub fn overlay(&self) -> Option<RgbaImage> {
        let image = self.image.as_ref()?;
        Some(compositor::overlay(
            image.pixels.width(),
            image.pixels.height(),
            self.ordered_masks(),
            self.palette,
        ))
    }

    pub fn label_mask(&self, label: LabelId) -> Option<&LabelMask> {
        self.masks.get(&label)
    }

    pub fn labels(&self) -> &LabelStore {
        &self.labels
    }

    pub fn image_id(&self) -> Option<&ImageId> {
        self.image.as_ref().map(|image| &image.id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn ordered_masks(&self) -> impl Iterator<Item = (LabelId, &BinaryMask)> + '_ {
        self.labels
            .labels()
            .filter_map(move |label| self.masks.get(&label).map(|m| (label, &m.mask)))
    }

    fn image_pixels(&self) -> Result<&RgbaImage, SegmentError> {
        self.image
            .as_ref()
            .map(|image| &image.pixels)
            .ok_or_else(|| SegmentError::DecodeInput("No image loaded".to_string()))
    }

    /// Make `bytes` the current image, resetting everything if it changed
    fn select_image(&mut self, bytes: &[u8]) -> Result<(), SegmentError> {
        let id = ImageId::from_bytes(bytes);
        if self.image.as_ref().map(|image| &image.id) == Some(&id) {
            return Ok(());
        }

        // Decode before resetting so a bad image leaves the old session intact
        let pixels = decode_image(bytes, self.config.max_image_pixels)?;
        self.clear();
        info!("New image {} ({}x{})", id, pixels.width(), pixels.height());
        self.image = Some(LoadedImage { id, pixels });
        Ok(())
    }
}

fn check_mask_size(bundle: MaskBundle, width: u32, height: u32) -> Result<MaskBundle, SegmentError> {
    if bundle.width() != width || bundle.height() != height {
        return Err(SegmentError::Inference(format!(
            "Decoder returned {}x{} masks for a {}x{} image",
            bundle.width(),
            bundle.height(),
            width,
            height
        )));
    }
    Ok(bundle)
}
