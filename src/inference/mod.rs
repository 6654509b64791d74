//! Detector and embedder capabilities.
//!
//! Every model sits behind the [`Capability`] trait: it receives one
//! pre-scaled [`Variant`] of a decoded photo and returns typed
//! [`Detection`]s in that variant's coordinates. The [`DetectorPool`] owns the
//! loaded capabilities, loads the optional ones on first use and maps results
//! back to original-image coordinates.

pub mod alignment;
pub mod caption;
pub mod clip;
pub mod face;
pub mod models;
pub mod object;
pub mod pool;
pub mod scene;
pub mod tokenizer;

use std::fmt;
use thiserror::Error;

use crate::db::BoundingBox;
use crate::imaging::{Variant, VariantKind};

pub use pool::{DetectorPool, PoolBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapabilityKind {
    Face,
    Object,
    Scene,
    Tagging,
    Caption,
    ImageEmbedding,
    TextEmbedding,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 7] = [
        CapabilityKind::Face,
        CapabilityKind::Object,
        CapabilityKind::Scene,
        CapabilityKind::Tagging,
        CapabilityKind::Caption,
        CapabilityKind::ImageEmbedding,
        CapabilityKind::TextEmbedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Face => "face",
            CapabilityKind::Object => "object",
            CapabilityKind::Scene => "scene",
            CapabilityKind::Tagging => "tagging",
            CapabilityKind::Caption => "caption",
            CapabilityKind::ImageEmbedding => "image-embedding",
            CapabilityKind::TextEmbedding => "text-embedding",
        }
    }

    /// Loaded when the pool is built rather than on first use
    pub fn is_eager(&self) -> bool {
        matches!(self, CapabilityKind::Face | CapabilityKind::Object)
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    /// The capability could not be loaded or is not configured; applies to
    /// every photo for the rest of the process
    #[error("{kind} capability unavailable: {reason}")]
    Unavailable { kind: CapabilityKind, reason: String },
    /// A single inference call failed
    #[error("{kind} inference failed: {message}")]
    Inference { kind: CapabilityKind, message: String },
}

impl CapabilityError {
    pub fn inference(kind: CapabilityKind, err: impl fmt::Display) -> Self {
        CapabilityError::Inference {
            kind,
            message: err.to_string(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, CapabilityError::Unavailable { .. })
    }
}

/// Landmarks in SCRFD order: left eye, right eye, nose, left mouth, right mouth
pub type Landmarks = [(f32, f32); 5];

/// One typed output of a capability for one photo
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Face {
        bbox: BoundingBox,
        confidence: f32,
        landmarks: Option<Landmarks>,
        embedding: Option<Vec<f32>>,
    },
    Object {
        /// Namespaced `group:detail`, e.g. `animal:dog`
        label: String,
        confidence: f32,
        bbox: BoundingBox,
        embedding: Option<Vec<f32>>,
    },
    Scene {
        label: String,
        confidence: f32,
    },
    Tag {
        label: String,
        confidence: f32,
    },
    Caption {
        text: String,
        confidence: f32,
    },
    ImageEmbedding {
        vector: Vec<f32>,
    },
}

impl Detection {
    pub fn label(&self) -> Option<&str> {
        match self {
            Detection::Object { label, .. }
            | Detection::Scene { label, .. }
            | Detection::Tag { label, .. } => Some(label),
            Detection::Caption { text, .. } => Some(text),
            Detection::Face { .. } | Detection::ImageEmbedding { .. } => None,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            Detection::Face { confidence, .. }
            | Detection::Object { confidence, .. }
            | Detection::Scene { confidence, .. }
            | Detection::Tag { confidence, .. }
            | Detection::Caption { confidence, .. } => *confidence,
            Detection::ImageEmbedding { .. } => 1.0,
        }
    }

    pub fn bbox(&self) -> Option<&BoundingBox> {
        match self {
            Detection::Face { bbox, .. } | Detection::Object { bbox, .. } => Some(bbox),
            _ => None,
        }
    }

    pub fn embedding(&self) -> Option<&[f32]> {
        match self {
            Detection::Face { embedding, .. } | Detection::Object { embedding, .. } => {
                embedding.as_deref()
            }
            Detection::ImageEmbedding { vector } => Some(vector),
            _ => None,
        }
    }

    /// Rescale boxes and landmarks from variant to original coordinates
    pub fn to_original(self, variant: &Variant) -> Detection {
        match self {
            Detection::Face {
                bbox,
                confidence,
                landmarks,
                embedding,
            } => Detection::Face {
                bbox: variant.map_box_to_original(&bbox),
                confidence,
                landmarks: landmarks.map(|lms| lms.map(|p| variant.map_point_to_original(p))),
                embedding,
            },
            Detection::Object {
                label,
                confidence,
                bbox,
                embedding,
            } => Detection::Object {
                label,
                confidence,
                bbox: variant.map_box_to_original(&bbox),
                embedding,
            },
            other => other,
        }
    }
}

/// A loaded model that turns one image variant into detections.
///
/// Implementations typically wrap a single-threaded inference session, so
/// `detect` takes `&mut self`; the pool serializes calls per instance.
pub trait Capability: Send {
    fn kind(&self) -> CapabilityKind;

    /// Which pre-scaled variant this capability wants
    fn variant(&self) -> VariantKind;

    /// Boxes in the returned detections are in `variant` coordinates
    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError>;
}

/// Embeds free text into the whole-image embedding space
pub trait TextEmbedder: Send {
    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

/// L2-normalize in place; zero vectors are left as-is
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

/// Non-maximum suppression over (box, score, payload) triples
pub(crate) fn nms<T: Clone>(mut boxes: Vec<(BoundingBox, f32, T)>, threshold: f32) -> Vec<(BoundingBox, f32, T)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32, T)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| k.0.iou(&candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Softmax over logits
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        exps.iter().map(|e| e / sum).collect()
    } else {
        exps
    }
}
