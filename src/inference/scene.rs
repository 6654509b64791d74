//! Scene classification with a Places365 ONNX export.

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use ort::session::Session;

use super::models::{nchw_tensor, ModelStore};
use super::{softmax, Capability, CapabilityError, CapabilityKind, Detection};
use crate::config::ModelsConfig;
use crate::imaging::{Variant, VariantKind};

const RESIZE: u32 = 256;
const CROP: u32 = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub struct OnnxSceneCapability {
    session: Session,
    labels: Vec<String>,
    min_confidence: f32,
    top_k: usize,
}

impl OnnxSceneCapability {
    pub fn load(store: &ModelStore, models: &ModelsConfig) -> Result<Self> {
        let labels_path = store.ensure(&models.scene_labels)?;
        let raw = std::fs::read_to_string(&labels_path)
            .with_context(|| format!("Failed to read {}", labels_path.display()))?;
        let labels = parse_labels(&raw);
        if labels.is_empty() {
            return Err(anyhow!("no scene labels in {}", labels_path.display()));
        }

        Ok(Self {
            session: store.session(&models.scene_classifier)?,
            labels,
            min_confidence: models.scene_confidence,
            top_k: models.tag_top_k.max(1),
        })
    }

    fn classify(&mut self, variant: &Variant) -> Result<Vec<Detection>> {
        let cropped = variant
            .image
            .resize_exact(RESIZE, RESIZE, FilterType::Triangle)
            .crop_imm((RESIZE - CROP) / 2, (RESIZE - CROP) / 2, CROP, CROP)
            .to_rgb8();
        let input_tensor = nchw_tensor(&cropped, IMAGENET_MEAN, IMAGENET_STD)?;

        let outputs = self.session.run(ort::inputs![input_tensor])?;
        let (_, logits) = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No scene output"))?;
        let (_, logits) = logits.try_extract_tensor::<f32>()?;

        Ok(top_scenes(&softmax(logits), &self.labels, self.top_k, self.min_confidence))
    }
}

impl Capability for OnnxSceneCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Scene
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Detector
    }

    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        self.classify(variant)
            .map_err(|e| CapabilityError::inference(CapabilityKind::Scene, e))
    }
}

/// `categories_places365.txt` lines look like `/a/airfield 0` or
/// `/b/beach_house 23`; keep what follows the letter bucket
fn parse_labels(raw: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|label| match label.strip_prefix('/') {
            Some(rest) => rest.split_once('/').map(|(_, l)| l).unwrap_or(rest),
            None => label,
        })
        .map(|label| label.to_string())
        .collect()
}

/// Highest-probability labels at or above `min_confidence`, namespaced
/// `scene:<label>`
fn top_scenes(probs: &[f32], labels: &[String], top_k: usize, min_confidence: f32) -> Vec<Detection> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    ranked
        .into_iter()
        .take(top_k)
        .filter(|(_, p)| *p >= min_confidence)
        .filter_map(|(idx, p)| {
            labels.get(idx).map(|label| Detection::Scene {
                label: format!("scene:{}", label),
                confidence: p,
            })
        })
        .collect()
}
