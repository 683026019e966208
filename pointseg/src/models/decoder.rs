//! Point-prompted mask decoder: light, run once per label update

use crate::config::MaskPolicy;
use crate::error::SegmentError;
use crate::models::encoder::EmbeddingBundle;
use crate::models::schema::{DecoderSchema, MASK_INPUT_SIDE};
use crate::models::{build_session, output_tensor, session_io, SessionOptions};
use crate::processing::coords::MODEL_INPUT_SIZE;
use crate::processing::labels::PromptPoint;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, Axis};
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Prompt tensors for a single prompt group, in model pixel space
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderPrompt {
    coords: Vec<f32>,
    labels: Vec<f32>,
}

impl DecoderPrompt {
    /// Flatten points in prompt order. Rejects empty or out-of-range input.
    pub fn from_points(points: &[PromptPoint]) -> Result<Self, SegmentError> {
        if points.is_empty() {
            return Err(SegmentError::DecodeInput("Label has no prompt points".to_string()));
        }

        let limit = MODEL_INPUT_SIZE as f32;
        let mut coords = Vec::with_capacity(points.len() * 2);
        let mut labels = Vec::with_capacity(points.len());

        for (i, point) in points.iter().enumerate() {
            let (x, y) = (point.position.x, point.position.y);
            if !x.is_finite() || !y.is_finite() {
                return Err(SegmentError::DecodeInput(format!(
                    "Point {} has non-finite coordinates ({}, {})",
                    i, x, y
                )));
            }
            if !(0.0..limit).contains(&x) || !(0.0..limit).contains(&y) {
                return Err(SegmentError::DecodeInput(format!(
                    "Point {} at ({}, {}) is outside model space [0, {})",
                    i, x, y, limit
                )));
            }
            coords.push(x);
            coords.push(y);
            labels.push(point.kind.as_model_label());
        }

        Ok(Self { coords, labels })
    }

    pub fn num_points(&self) -> usize {
        self.labels.len()
    }

    /// `[1, num_points, 2]`
    pub fn coords_array(&self) -> Array3<f32> {
        Array3::from_shape_fn((1, self.num_points(), 2), |(_, i, axis)| self.coords[i * 2 + axis])
    }

    /// `[1, num_points]`
    pub fn labels_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((1, self.num_points()), |(_, i)| self.labels[i])
    }
}

/// Raw decoder output for one label at original-image resolution
#[derive(Debug, Clone, PartialEq)]
pub struct MaskBundle {
    /// `[candidates, height, width]`
    masks: Array3<f32>,
    scores: Vec<f32>,
}

impl MaskBundle {
    pub fn new(masks: Array3<f32>, scores: Vec<f32>) -> Result<Self, SegmentError> {
        if masks.shape()[0] == 0 {
            return Err(SegmentError::Inference("Decoder returned no mask candidates".to_string()));
        }
        if masks.shape()[0] != scores.len() {
            return Err(SegmentError::Inference(format!(
                "Decoder returned {} masks but {} scores",
                masks.shape()[0],
                scores.len()
            )));
        }
        Ok(Self { masks, scores })
    }

    pub fn num_candidates(&self) -> usize {
        self.masks.shape()[0]
    }

    pub fn height(&self) -> u32 {
        self.masks.shape()[1] as u32
    }

    pub fn width(&self) -> u32 {
        self.masks.shape()[2] as u32
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn masks(&self) -> &Array3<f32> {
        &self.masks
    }

    /// Index of the highest finite score (first wins ties)
    pub fn best_candidate(&self) -> usize {
        let mut best: Option<(usize, f32)> = None;
        for (i, &score) in self.scores.iter().enumerate() {
            if !score.is_finite() {
                continue;
            }
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((i, score));
            }
        }
        best.map(|(i, _)| i).unwrap_or(0)
    }

    /// Collapse candidates into one mask. Values strictly above `threshold` count.
    pub fn binarize(&self, policy: MaskPolicy, threshold: f32) -> BinaryMask {
        let mut bits = vec![false; self.masks.shape()[1] * self.masks.shape()[2]];

        match policy {
            MaskPolicy::Union => {
                for candidate in self.masks.outer_iter() {
                    mark_above(&mut bits, candidate, threshold);
                }
            }
            MaskPolicy::BestScore => {
                let best = self.masks.index_axis(Axis(0), self.best_candidate());
                mark_above(&mut bits, best, threshold);
            }
        }

        BinaryMask {
            width: self.width(),
            height: self.height(),
            bits,
        }
    }
}

fn mark_above(bits: &mut [bool], candidate: ArrayView2<f32>, threshold: f32) {
    for (bit, &value) in bits.iter_mut().zip(candidate.iter()) {
        if value > threshold {
            *bit = true;
        }
    }
}

/// Per-pixel label membership, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl BinaryMask {
    pub fn new(width: u32, height: u32, bits: Vec<bool>) -> Result<Self, SegmentError> {
        if bits.len() != width as usize * height as usize {
            return Err(SegmentError::Inference(format!(
                "Mask has {} pixels, expected {}x{}",
                bits.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, bits })
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.bits[y as usize * self.width as usize + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        if x < self.width && y < self.height {
            self.bits[y as usize * self.width as usize + x as usize] = value;
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|&b| b)
    }
}

/// (embedding, prompt, original size) -> raw candidate masks and scores
#[cfg_attr(test, mockall::automock)]
pub trait MaskDecoder: Send {
    fn decode(
        &mut self,
        embedding: &EmbeddingBundle,
        prompt: &DecoderPrompt,
        orig_height: u32,
        orig_width: u32,
    ) -> Result<MaskBundle, SegmentError>;
}

/// SAM2 mask decoder backed by ONNX Runtime
pub struct OnnxDecoder {
    session: Session,
    schema: DecoderSchema,
}

impl OnnxDecoder {
    pub fn new(model_path: &Path, options: &SessionOptions) -> Result<Self, SegmentError> {
        let session = build_session(model_path, options, "decoder")?;
        let (inputs, outputs) = session_io(&session);
        let schema = DecoderSchema::resolve(&inputs, &outputs)?;

        info!("Decoder model loaded from {:?} with schema {:?}", model_path, schema);

        Ok(Self { session, schema })
    }

    pub fn schema(&self) -> &DecoderSchema {
        &self.schema
    }
}

fn tensor_err<E: std::fmt::Display>(what: &str) -> impl Fn(E) -> SegmentError + '_ {
    move |e| SegmentError::Inference(format!("Failed to create {} tensor: {}", what, e))
}

impl MaskDecoder for OnnxDecoder {
    fn decode(
        &mut self,
        embedding: &EmbeddingBundle,
        prompt: &DecoderPrompt,
        orig_height: u32,
        orig_width: u32,
    ) -> Result<MaskBundle, SegmentError> {
        let start = Instant::now();
        let (h, w) = (orig_height as usize, orig_width as usize);

        let image_embedding =
            Tensor::from_array(embedding.image_embedding.clone()).map_err(tensor_err("embedding"))?;
        let feature0 =
            Tensor::from_array(embedding.high_res_feature0.clone()).map_err(tensor_err("feature 0"))?;
        let feature1 =
            Tensor::from_array(embedding.high_res_feature1.clone()).map_err(tensor_err("feature 1"))?;
        let coords = Tensor::from_array(prompt.coords_array()).map_err(tensor_err("point coords"))?;
        let labels = Tensor::from_array(prompt.labels_array()).map_err(tensor_err("point labels"))?;
        // Never seeded from a previous mask: every decode starts unconditioned
        let mask_input =
            Tensor::from_array(Array4::<f32>::zeros((1, 1, MASK_INPUT_SIDE, MASK_INPUT_SIDE)))
                .map_err(tensor_err("mask input"))?;
        let has_mask =
            Tensor::from_array(Array1::from_vec(vec![0.0f32])).map_err(tensor_err("has-mask"))?;
        let orig_size = Tensor::from_array(Array1::from_vec(vec![orig_height as i32, orig_width as i32]))
            .map_err(tensor_err("original size"))?;

        let schema = &self.schema;
        let outputs = self
            .session
            .run(ort::inputs![
                schema.image_embedding.as_str() => image_embedding,
                schema.high_res_feature0.as_str() => feature0,
                schema.high_res_feature1.as_str() => feature1,
                schema.point_coords.as_str() => coords,
                schema.point_labels.as_str() => labels,
                schema.mask_input.as_str() => mask_input,
                schema.has_mask_input.as_str() => has_mask,
                schema.orig_im_size.as_str() => orig_size,
            ])
            .map_err(|e| SegmentError::Inference(format!("Decoder inference failed: {}", e)))?;

        let (mask_dims, mask_data) = output_tensor(&outputs, &schema.masks)?;
        if mask_dims.len() != 4 || mask_dims[0] != 1 || mask_dims[2] != h || mask_dims[3] != w {
            return Err(SegmentError::Inference(format!(
                "Decoder masks have shape {:?}, expected [1, C, {}, {}]",
                mask_dims, h, w
            )));
        }
        let candidates = mask_dims[1];
        let masks = Array3::from_shape_vec((candidates, h, w), mask_data)
            .map_err(|e| SegmentError::Inference(format!("Failed to reshape masks: {}", e)))?;

        let (_, scores) = output_tensor(&outputs, &schema.scores)?;

        debug!(
            "Decoded {} points into {} candidates in {:.1}ms",
            prompt.num_points(),
            candidates,
            start.elapsed().as_secs_f64() * 1000.0
        );

        MaskBundle::new(masks, scores)
    }
}
