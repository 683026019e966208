//! Named tensor roles for the encoder and decoder models
//!
//! Exported SAM2 graphs do not agree on tensor names. Each role is looked up
//! by its known aliases first and then by its position in the model metadata.
//! A role that resolves to nothing, two roles that resolve to the same
//! tensor, or a tensor whose declared shape disagrees with its role all fail
//! initialization.

use crate::error::SegmentError;
use serde::Serialize;
use std::collections::HashSet;

/// Bumped whenever a role is added, removed or changes meaning
pub const SCHEMA_VERSION: u32 = 1;

/// NCHW layout of the preprocessed image
pub const ENCODER_INPUT_SHAPE: [usize; 4] = [1, 3, 1024, 1024];
pub const IMAGE_EMBEDDING_SHAPE: [usize; 4] = [1, 256, 64, 64];
pub const HIGH_RES_FEATURE0_SHAPE: [usize; 4] = [1, 32, 256, 256];
pub const HIGH_RES_FEATURE1_SHAPE: [usize; 4] = [1, 64, 128, 128];
/// Side of the low-resolution previous-mask input
pub const MASK_INPUT_SIDE: usize = 256;

/// Any extent is accepted in this position
const ANY: i64 = -1;

/// Name and declared dimensions of one model input or output.
///
/// `dims` is `None` when the model does not declare a tensor shape. Negative
/// extents are dynamic and match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Option<Vec<i64>>,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, dims: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dims: Some(dims),
        }
    }

    /// Tensor with no declared shape
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dims: None,
        }
    }
}

struct Role {
    name: &'static str,
    aliases: &'static [&'static str],
    position: usize,
    shape: &'static [i64],
}

const ENCODER_INPUT_ROLES: &[Role] = &[Role {
    name: "image",
    aliases: &["image", "input", "pixel_values"],
    position: 0,
    shape: &[1, 3, 1024, 1024],
}];

const ENCODER_OUTPUT_ROLES: &[Role] = &[
    Role {
        name: "high_res_feature0",
        aliases: &["high_res_feats_0", "high_res_features_0"],
        position: 0,
        shape: &[ANY, 32, 256, 256],
    },
    Role {
        name: "high_res_feature1",
        aliases: &["high_res_feats_1", "high_res_features_1"],
        position: 1,
        shape: &[ANY, 64, 128, 128],
    },
    Role {
        name: "image_embedding",
        aliases: &["image_embed", "image_embeddings"],
        position: 2,
        shape: &[ANY, 256, 64, 64],
    },
];

const DECODER_INPUT_ROLES: &[Role] = &[
    Role {
        name: "image_embedding",
        aliases: &["image_embed", "image_embeddings"],
        position: 0,
        shape: &[ANY, 256, 64, 64],
    },
    Role {
        name: "high_res_feature0",
        aliases: &["high_res_feats_0", "high_res_features_0"],
        position: 1,
        shape: &[ANY, 32, 256, 256],
    },
    Role {
        name: "high_res_feature1",
        aliases: &["high_res_feats_1", "high_res_features_1"],
        position: 2,
        shape: &[ANY, 64, 128, 128],
    },
    Role {
        name: "point_coords",
        aliases: &["point_coords"],
        position: 3,
        shape: &[ANY, ANY, 2],
    },
    Role {
        name: "point_labels",
        aliases: &["point_labels"],
        position: 4,
        shape: &[ANY, ANY],
    },
    Role {
        name: "mask_input",
        aliases: &["mask_input"],
        position: 5,
        shape: &[ANY, 1, MASK_INPUT_SIDE as i64, MASK_INPUT_SIDE as i64],
    },
    Role {
        name: "has_mask_input",
        aliases: &["has_mask_input"],
        position: 6,
        shape: &[1],
    },
    Role {
        name: "orig_im_size",
        aliases: &["orig_im_size"],
        position: 7,
        shape: &[2],
    },
];

const DECODER_OUTPUT_ROLES: &[Role] = &[
    Role {
        name: "masks",
        aliases: &["masks"],
        position: 0,
        shape: &[ANY, ANY, ANY, ANY],
    },
    Role {
        name: "scores",
        aliases: &["iou_predictions", "scores"],
        position: 1,
        shape: &[ANY, ANY],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderSchema {
    pub version: u32,
    pub image: String,
    pub high_res_feature0: String,
    pub high_res_feature1: String,
    pub image_embedding: String,
}

impl EncoderSchema {
    pub fn resolve(inputs: &[TensorInfo], outputs: &[TensorInfo]) -> Result<Self, SegmentError> {
        let ins = resolve_roles("encoder input", ENCODER_INPUT_ROLES, inputs)?;
        let outs = resolve_roles("encoder output", ENCODER_OUTPUT_ROLES, outputs)?;
        let mut outs = outs.into_iter();
        Ok(Self {
            version: SCHEMA_VERSION,
            image: ins.into_iter().next().unwrap_or_default(),
            high_res_feature0: outs.next().unwrap_or_default(),
            high_res_feature1: outs.next().unwrap_or_default(),
            image_embedding: outs.next().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecoderSchema {
    pub version: u32,
    pub image_embedding: String,
    pub high_res_feature0: String,
    pub high_res_feature1: String,
    pub point_coords: String,
    pub point_labels: String,
    pub mask_input: String,
    pub has_mask_input: String,
    pub orig_im_size: String,
    pub masks: String,
    pub scores: String,
}

impl DecoderSchema {
    pub fn resolve(inputs: &[TensorInfo], outputs: &[TensorInfo]) -> Result<Self, SegmentError> {
        let mut ins = resolve_roles("decoder input", DECODER_INPUT_ROLES, inputs)?.into_iter();
        let mut outs = resolve_roles("decoder output", DECODER_OUTPUT_ROLES, outputs)?.into_iter();
        let mut next_in = || ins.next().unwrap_or_default();
        Ok(Self {
            version: SCHEMA_VERSION,
            image_embedding: next_in(),
            high_res_feature0: next_in(),
            high_res_feature1: next_in(),
            point_coords: next_in(),
            point_labels: next_in(),
            mask_input: next_in(),
            has_mask_input: next_in(),
            orig_im_size: next_in(),
            masks: outs.next().unwrap_or_default(),
            scores: outs.next().unwrap_or_default(),
        })
    }
}

/// Resolve every role to a tensor name, in role order
fn resolve_roles(
    side: &str,
    roles: &[Role],
    tensors: &[TensorInfo],
) -> Result<Vec<String>, SegmentError> {
    let mut resolved = Vec::with_capacity(roles.len());
    let mut seen = HashSet::new();

    for role in roles {
        let by_alias = role
            .aliases
            .iter()
            .find_map(|alias| tensors.iter().find(|t| t.name == *alias));

        let tensor = match by_alias {
            Some(tensor) => tensor,
            None => tensors.get(role.position).ok_or_else(|| {
                let declared: Vec<&str> = tensors.iter().map(|t| t.name.as_str()).collect();
                SegmentError::Initialization(format!(
                    "Model has no {} for role '{}' (expected one of {:?} or position {}, model declares {:?})",
                    side, role.name, role.aliases, role.position, declared
                ))
            })?,
        };

        if let Some(dims) = &tensor.dims {
            if !shape_matches(dims, role.shape) {
                return Err(SegmentError::Initialization(format!(
                    "{} '{}' for role '{}' has shape {:?}, expected {:?} (-1 = any)",
                    side, tensor.name, role.name, dims, role.shape
                )));
            }
        }

        if !seen.insert(tensor.name.clone()) {
            return Err(SegmentError::Initialization(format!(
                "Tensor '{}' resolved to more than one {} role (second: '{}')",
                tensor.name, side, role.name
            )));
        }
        resolved.push(tensor.name.clone());
    }

    Ok(resolved)
}

/// Same rank, and every fixed extent agrees unless either side is dynamic
fn shape_matches(declared: &[i64], expected: &[i64]) -> bool {
    declared.len() == expected.len()
        && declared
            .iter()
            .zip(expected)
            .all(|(&d, &e)| d < 0 || e < 0 || d == e)
}
