//! CLIP ViT-B/32 encoders (ONNX): whole-image embeddings, zero-shot scene
//! tags and text embeddings for free-text search.
//!
//! The visual and text sessions are loaded once and shared between the
//! capabilities that need them.

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use ort::session::Session;
use ort::value::Tensor;
use std::sync::{Arc, Mutex, OnceLock};

use super::models::{nchw_tensor, ModelStore};
use super::tokenizer::{ClipTokenizer, CONTEXT_LENGTH};
use super::{
    l2_normalize, softmax, Capability, CapabilityError, CapabilityKind, Detection, TextEmbedder,
};
use crate::config::ModelsConfig;
use crate::imaging::{Variant, VariantKind};

/// CLIP embedding (512-dimensional vector for ViT-B/32)
pub type ClipEmbedding = Vec<f32>;

const INPUT_SIZE: u32 = 224;
const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];
/// CLIP's learned logit scale
const LOGIT_SCALE: f32 = 100.0;

const VOCAB_FILE: &str = "clip-vocab.json";
const MERGES_FILE: &str = "clip-merges.txt";

/// Zero-shot prompt bank: (prompt subject, tag it maps to)
const SCENE_PROMPTS: &[(&str, &str)] = &[
    ("sunset", "sunset"),
    ("sunrise", "sunrise"),
    ("beach", "beach"),
    ("ocean", "beach"),
    ("seashore", "beach"),
    ("mountain", "mountain"),
    ("mountains", "mountain"),
    ("hill", "mountain"),
    ("forest", "forest"),
    ("woods", "forest"),
    ("jungle", "forest"),
    ("trees", "tree"),
    ("garden", "garden"),
    ("botanical garden", "garden"),
    ("flower garden", "flowers"),
    ("flowers", "flowers"),
    ("blooming flowers", "flowers"),
    ("nature", "nature"),
    ("natural landscape", "nature"),
    ("wilderness", "nature"),
    ("park", "park"),
    ("public park", "park"),
    ("playground", "park"),
    ("lake", "water"),
    ("river", "water"),
    ("waterfall", "water"),
    ("pond", "water"),
    ("water", "water"),
    ("city", "city"),
    ("urban", "city"),
    ("cityscape", "city"),
    ("street", "city"),
    ("building", "building"),
    ("architecture", "building"),
    ("skyscraper", "building"),
    ("indoor", "indoor"),
    ("interior", "indoor"),
    ("room", "indoor"),
    ("outdoor", "outdoor"),
    ("outside", "outdoor"),
    ("exterior", "outdoor"),
    ("sky", "sky"),
    ("clouds", "sky"),
    ("blue sky", "sky"),
    ("night", "night"),
    ("nighttime", "night"),
    ("evening", "night"),
    ("snow", "snow"),
    ("snowy", "snow"),
    ("winter", "snow"),
    ("desert", "landscape"),
    ("sand", "landscape"),
    ("dunes", "landscape"),
    ("field", "nature"),
    ("meadow", "nature"),
    ("grassland", "nature"),
];

type Shared<T> = OnceLock<Result<Arc<Mutex<T>>, String>>;

struct TextEncoder {
    session: Session,
    tokenizer: ClipTokenizer,
    with_mask: bool,
}

struct ClipInner {
    store: Arc<ModelStore>,
    visual_file: String,
    text_file: String,
    visual: Shared<Session>,
    text: Shared<TextEncoder>,
}

/// Lazily loaded CLIP sessions shared by the embedder, the tagger and the
/// text embedder
#[derive(Clone)]
pub struct SharedClip {
    inner: Arc<ClipInner>,
}

impl SharedClip {
    pub fn new(store: Arc<ModelStore>, models: &ModelsConfig) -> Self {
        Self {
            inner: Arc::new(ClipInner {
                store,
                visual_file: models.clip_visual.clone(),
                text_file: models.clip_text.clone(),
                visual: OnceLock::new(),
                text: OnceLock::new(),
            }),
        }
    }

    fn visual(&self) -> Result<Arc<Mutex<Session>>> {
        let inner = &self.inner;
        inner
            .visual
            .get_or_init(|| {
                inner
                    .store
                    .session(&inner.visual_file)
                    .map(|s| Arc::new(Mutex::new(s)))
                    .map_err(|e| format!("{:#}", e))
            })
            .clone()
            .map_err(|e| anyhow!(e))
    }

    fn text(&self) -> Result<Arc<Mutex<TextEncoder>>> {
        let inner = &self.inner;
        inner
            .text
            .get_or_init(|| {
                let load = || -> Result<TextEncoder> {
                    let session = inner.store.session(&inner.text_file)?;
                    let with_mask = session
                        .inputs()
                        .iter()
                        .any(|input| input.name() == "attention_mask");
                    let tokenizer = ClipTokenizer::load(
                        &inner.store.ensure(VOCAB_FILE)?,
                        &inner.store.ensure(MERGES_FILE)?,
                    )?;
                    Ok(TextEncoder {
                        session,
                        tokenizer,
                        with_mask,
                    })
                };
                load()
                    .map(|t| Arc::new(Mutex::new(t)))
                    .map_err(|e| format!("{:#}", e))
            })
            .clone()
            .map_err(|e| anyhow!(e))
    }
}

fn run_visual_encoder(session: &Mutex<Session>, img: &DynamicImage) -> Result<ClipEmbedding> {
    let mut model = session
        .lock()
        .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

    let resized = img
        .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
        .to_rgb8();
    let input_tensor = nchw_tensor(&resized, CLIP_MEAN, CLIP_STD)?;

    let outputs = model.run(ort::inputs!["pixel_values" => input_tensor])?;
    let (_, embedding_output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.try_extract_tensor::<f32>()?;

    let mut embedding = embedding_data.to_vec();
    l2_normalize(&mut embedding);
    Ok(embedding)
}

fn run_text_encoder(encoder: &Mutex<TextEncoder>, text: &str) -> Result<ClipEmbedding> {
    let mut encoder = encoder
        .lock()
        .map_err(|e| anyhow!("Failed to lock model: {}", e))?;
    let (ids, mask) = encoder.tokenizer.encode(text);

    let ids = Tensor::from_array(([1usize, CONTEXT_LENGTH], ids.into_boxed_slice()))?;
    let outputs = if encoder.with_mask {
        let mask = Tensor::from_array(([1usize, CONTEXT_LENGTH], mask.into_boxed_slice()))?;
        encoder
            .session
            .run(ort::inputs!["input_ids" => ids, "attention_mask" => mask])?
    } else {
        encoder.session.run(ort::inputs!["input_ids" => ids])?
    };

    let (_, embedding_output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.try_extract_tensor::<f32>()?;

    let mut embedding = embedding_data.to_vec();
    l2_normalize(&mut embedding);
    Ok(embedding)
}

/// Whole-image embedding for the image index and pet crops
pub struct ClipImageEmbedder {
    visual: Arc<Mutex<Session>>,
}

impl ClipImageEmbedder {
    pub fn load(shared: &SharedClip) -> Result<Self> {
        Ok(Self {
            visual: shared.visual()?,
        })
    }
}

impl Capability for ClipImageEmbedder {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::ImageEmbedding
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Detector
    }

    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        let vector = run_visual_encoder(&self.visual, &variant.image)
            .map_err(|e| CapabilityError::inference(CapabilityKind::ImageEmbedding, e))?;
        Ok(vec![Detection::ImageEmbedding { vector }])
    }
}

/// Zero-shot scene tags against the prompt bank
pub struct ClipTagger {
    visual: Arc<Mutex<Session>>,
    prompts: Vec<(&'static str, ClipEmbedding)>,
    top_k: usize,
    min_confidence: f32,
}

impl ClipTagger {
    pub fn load(shared: &SharedClip, models: &ModelsConfig) -> Result<Self> {
        let visual = shared.visual()?;
        let text = shared.text()?;

        let prompts = SCENE_PROMPTS
            .iter()
            .map(|(subject, tag)| {
                run_text_encoder(&text, &format!("a photo of {}", subject)).map(|e| (*tag, e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            visual,
            prompts,
            top_k: models.tag_top_k.max(1),
            min_confidence: models.tag_confidence,
        })
    }
}

impl Capability for ClipTagger {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Tagging
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Detector
    }

    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        let image = run_visual_encoder(&self.visual, &variant.image)
            .map_err(|e| CapabilityError::inference(CapabilityKind::Tagging, e))?;

        let logits: Vec<f32> = self
            .prompts
            .iter()
            .map(|(_, prompt)| LOGIT_SCALE * prompt.iter().zip(&image).map(|(a, b)| a * b).sum::<f32>())
            .collect();
        let tags: Vec<&str> = self.prompts.iter().map(|(tag, _)| *tag).collect();

        Ok(rank_tags(&softmax(&logits), &tags, self.top_k, self.min_confidence))
    }
}

/// Best prompts at or above the threshold, one detection per distinct tag
fn rank_tags(probs: &[f32], tags: &[&str], top_k: usize, min_confidence: f32) -> Vec<Detection> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut seen: Vec<&str> = Vec::new();
    let mut detections = Vec::new();
    for (idx, confidence) in ranked.into_iter().take(top_k * 2) {
        if detections.len() >= top_k {
            break;
        }
        if confidence < min_confidence {
            continue;
        }
        let Some(&tag) = tags.get(idx) else {
            continue;
        };
        if seen.contains(&tag) {
            continue;
        }
        seen.push(tag);
        detections.push(Detection::Tag {
            label: format!("tag:{}", tag),
            confidence,
        });
    }
    detections
}

pub struct ClipTextEmbedder {
    text: Arc<Mutex<TextEncoder>>,
}

impl ClipTextEmbedder {
    pub fn load(shared: &SharedClip) -> Result<Self> {
        Ok(Self {
            text: shared.text()?,
        })
    }
}

impl TextEmbedder for ClipTextEmbedder {
    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        run_text_encoder(&self.text, text)
            .map_err(|e| CapabilityError::inference(CapabilityKind::TextEmbedding, e))
    }
}
