//! Face detection (SCRFD, or UltraFace when configured) and ArcFace
//! embeddings over aligned crops.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use ort::session::Session;
use std::borrow::Cow;
use tracing::{debug, warn};

use super::alignment::{align_face, ALIGNED_SIZE};
use super::models::{nchw_tensor, ModelStore};
use super::{l2_normalize, nms, Capability, CapabilityError, CapabilityKind, Detection, Landmarks};
use crate::config::ModelsConfig;
use crate::db::BoundingBox;
use crate::imaging::{Variant, VariantKind};

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;

const ULTRAFACE_WIDTH: u32 = 320;
const ULTRAFACE_HEIGHT: u32 = 240;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;

/// Output tensor indices for one stride: (score, bbox, kps)
type StrideOutputIndices = (usize, usize, usize);

enum FaceDetectorModel {
    Scrfd {
        session: Session,
        stride_indices: [StrideOutputIndices; 3],
    },
    UltraFace {
        session: Session,
    },
}

/// Face capability: boxes, landmarks when the detector provides them, and
/// one L2-normalized ArcFace embedding per face
pub struct OnnxFaceCapability {
    detector: FaceDetectorModel,
    embedder: Session,
    min_confidence: f32,
}

impl OnnxFaceCapability {
    pub fn load(store: &ModelStore, models: &ModelsConfig) -> Result<Self> {
        let detector = if models.face_detector.to_lowercase().contains("ultraface") {
            FaceDetectorModel::UltraFace {
                session: store.session(&models.face_detector)?,
            }
        } else {
            let session = store.session(&models.face_detector)?;
            let output_names: Vec<String> = session
                .outputs()
                .iter()
                .map(|o| o.name().to_string())
                .collect();
            if output_names.len() < 9 {
                return Err(anyhow!(
                    "SCRFD model needs 9 outputs (score/bbox/kps per stride), got {}",
                    output_names.len()
                ));
            }
            let stride_indices = discover_output_indices(&output_names);
            debug!(?stride_indices, "SCRFD output mapping");
            FaceDetectorModel::Scrfd {
                session,
                stride_indices,
            }
        };

        Ok(Self {
            detector,
            embedder: store.session(&models.face_embedder)?,
            min_confidence: models.face_confidence,
        })
    }

    fn detect_boxes(&mut self, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32, Option<Landmarks>)>> {
        match &mut self.detector {
            FaceDetectorModel::Scrfd {
                session,
                stride_indices,
            } => run_scrfd(session, stride_indices, img, self.min_confidence),
            FaceDetectorModel::UltraFace { session } => {
                run_ultraface(session, img, self.min_confidence)
            }
        }
    }
}

impl Capability for OnnxFaceCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Face
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Face
    }

    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        let kind = CapabilityKind::Face;
        let img = variant.image.as_ref();
        let boxes = self
            .detect_boxes(img)
            .map_err(|e| CapabilityError::inference(kind, e))?;

        let rgb: Cow<'_, RgbImage> = match img.as_rgb8() {
            Some(rgb) => Cow::Borrowed(rgb),
            None => Cow::Owned(img.to_rgb8()),
        };

        let mut faces = Vec::with_capacity(boxes.len());
        for (bbox, confidence, landmarks) in boxes {
            if bbox.width <= 0 || bbox.height <= 0 {
                continue;
            }

            let aligned = match &landmarks {
                Some(lms) => align_face(&rgb, lms),
                None => crop_face(img, &bbox)
                    .resize_exact(ALIGNED_SIZE, ALIGNED_SIZE, image::imageops::FilterType::Triangle)
                    .to_rgb8(),
            };

            let embedding = match run_arcface_embedding(&mut self.embedder, &aligned) {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    // Keep the face; it can still be shown and assigned by hand
                    warn!(error = %e, "Face embedding failed");
                    None
                }
            };

            faces.push(Detection::Face {
                bbox,
                confidence,
                landmarks,
                embedding,
            });
        }

        Ok(faces)
    }
}

/// Letterbox placement of the source frame inside the square detector input
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

fn letterbox(img: &DynamicImage, size: u32) -> (RgbImage, Letterbox) {
    let (width, height) = img.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = img
        .resize_exact(new_w, new_h, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([128, 128, 128]));
    image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

fn run_scrfd(
    session: &mut Session,
    stride_indices: &[StrideOutputIndices; 3],
    img: &DynamicImage,
    threshold: f32,
) -> Result<Vec<(BoundingBox, f32, Option<Landmarks>)>> {
    let (input, lb) = letterbox(img, SCRFD_INPUT_SIZE);
    let input_tensor = nchw_tensor(&input, [0.5; 3], [128.0 / 255.0; 3])?;

    let outputs = session.run(ort::inputs![input_tensor])?;

    let mut candidates = Vec::new();
    for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
        let (score_idx, bbox_idx, kps_idx) = stride_indices[pos];
        let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>()?;
        let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>()?;
        let (_, kps) = outputs[kps_idx].try_extract_tensor::<f32>()?;

        candidates.extend(decode_stride(scores, bboxes, kps, stride, &lb, threshold));
    }

    Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
}

/// Decode one SCRFD stride level into boxes in source-frame coordinates
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    lb: &Letterbox,
    threshold: f32,
) -> Vec<(BoundingBox, f32, Option<Landmarks>)> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let unmap = |x: f32, y: f32| ((x - lb.pad_x) / lb.scale, (y - lb.pad_y) / lb.scale);
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * s;
        let anchor_y = (cell / grid) as f32 * s;

        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let (x1, y1) = unmap(anchor_x - bboxes[off] * s, anchor_y - bboxes[off + 1] * s);
        let (x2, y2) = unmap(anchor_x + bboxes[off + 2] * s, anchor_y + bboxes[off + 3] * s);

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| {
                unmap(
                    anchor_x + kps[kps_off + i * 2] * s,
                    anchor_y + kps[kps_off + i * 2 + 1] * s,
                )
            })
        });

        let bbox = BoundingBox {
            x: x1.round().max(0.0) as i32,
            y: y1.round().max(0.0) as i32,
            width: (x2 - x1.max(0.0)).round().max(1.0) as i32,
            height: (y2 - y1.max(0.0)).round().max(1.0) as i32,
        };
        detections.push((bbox, score, landmarks));
    }

    detections
}

/// SCRFD exports name their outputs `score_8`, `bbox_16`, ... or just number
/// them; numbered outputs follow scores, boxes, keypoints per stride.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => [indices[0], indices[1], indices[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

fn run_ultraface(
    session: &mut Session,
    img: &DynamicImage,
    threshold: f32,
) -> Result<Vec<(BoundingBox, f32, Option<Landmarks>)>> {
    let (orig_width, orig_height) = img.dimensions();

    let resized = img
        .resize_exact(ULTRAFACE_WIDTH, ULTRAFACE_HEIGHT, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let input_tensor = nchw_tensor(&resized, [127.0 / 255.0; 3], [128.0 / 255.0; 3])?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let (scores_shape, scores) = outputs
        .get("scores")
        .ok_or_else(|| anyhow!("No scores output"))?
        .try_extract_tensor::<f32>()?;
    let (_, boxes) = outputs
        .get("boxes")
        .ok_or_else(|| anyhow!("No boxes output"))?
        .try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized corners
    let num_anchors = scores_shape[1] as usize;
    let mut faces = Vec::new();
    for i in 0..num_anchors {
        let confidence = scores[i * 2 + 1];
        if confidence < threshold {
            continue;
        }

        let x1 = (boxes[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes[i * 4 + 3] * orig_height as f32) as i32;

        let bbox = BoundingBox {
            x: x1.max(0),
            y: y1.max(0),
            width: (x2 - x1.max(0)).max(1),
            height: (y2 - y1.max(0)).max(1),
        };
        faces.push((bbox, confidence, None));
    }

    Ok(nms(faces, ULTRAFACE_NMS_THRESHOLD))
}

/// Crop face region from image with 20% padding
fn crop_face(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (img_width, img_height) = img.dimensions();
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = ((bbox.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width + padding_x * 2) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// ArcFace over a 112×112 crop; the model's input is named "data"
fn run_arcface_embedding(session: &mut Session, face: &RgbImage) -> Result<Vec<f32>> {
    let input_tensor = nchw_tensor(face, [0.5; 3], [0.5; 3])?;
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let (_, embedding_output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.try_extract_tensor::<f32>()?;

    let mut embedding = embedding_data.to_vec();
    l2_normalize(&mut embedding);
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16",
            "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);

        let shuffled: Vec<String> = [
            "kps_8", "bbox_8", "score_8", "kps_16", "bbox_16", "score_16", "kps_32", "bbox_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&shuffled), [(2, 1, 0), (5, 4, 3), (8, 7, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i| format!("{}", 400 + i)).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_letterbox_coordinate_roundtrip() {
        let img = DynamicImage::new_rgb8(1280, 720);
        let (canvas, lb) = letterbox(&img, SCRFD_INPUT_SIZE);
        assert_eq!(canvas.dimensions(), (640, 640));
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);

        // One anchor at stride 32, cell (5, 7), box offsets of one stride each way
        let grid = 640 / 32;
        let mut scores = vec![0.0f32; grid * grid * 2];
        let mut bboxes = vec![0.0f32; grid * grid * 2 * 4];
        let kps = vec![0.0f32; grid * grid * 2 * 10];
        let idx = (7 * grid + 5) * 2;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let detections = decode_stride(&scores, &bboxes, &kps, 32, &lb, 0.5);
        assert_eq!(detections.len(), 1);

        let (bbox, score, landmarks) = &detections[0];
        assert!((score - 0.9).abs() < 1e-6);
        // Anchor (160, 224) in input space → (320, 168) in the frame; box spans ±64
        assert_eq!(*bbox, BoundingBox { x: 256, y: 104, width: 128, height: 128 });
        let lms = landmarks.unwrap();
        assert_eq!(lms[0], (320.0, 168.0));
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let grid = 640 / 32;
        let mut scores = vec![0.0f32; grid * grid * 2];
        scores[0] = 0.49;
        let bboxes = vec![1.0f32; grid * grid * 2 * 4];
        assert!(decode_stride(&scores, &bboxes, &[], 32, &lb, 0.5).is_empty());
    }

    #[test]
    fn test_crop_face_stays_in_frame() {
        let img = DynamicImage::new_rgb8(100, 100);
        let crop = crop_face(&img, &BoundingBox { x: 90, y: 90, width: 30, height: 30 });
        assert!(crop.width() >= 1 && crop.width() <= 16);
        assert!(crop.height() >= 1 && crop.height() <= 16);
    }
}
