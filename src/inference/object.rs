//! General object detection with a YOLOv8 ONNX export.

use anyhow::{anyhow, Result};
use image::GenericImageView;
use ort::session::Session;

use super::models::{nchw_tensor, ModelStore};
use super::{nms, Capability, CapabilityError, CapabilityKind, Detection};
use crate::config::ModelsConfig;
use crate::db::BoundingBox;
use crate::imaging::{Variant, VariantKind};

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_NMS_THRESHOLD: f32 = 0.45;

/// COCO class names in YOLOv8 output order
const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Group for a COCO class. People are left to face detection.
pub fn category_group(class_name: &str) -> Option<&'static str> {
    let group = match class_name {
        "bicycle" | "car" | "motorcycle" | "airplane" | "bus" | "train" | "truck" | "boat" => {
            "vehicle"
        }
        "traffic light" | "fire hydrant" | "stop sign" | "parking meter" => "street",
        "bird" | "cat" | "dog" | "horse" | "sheep" | "cow" | "elephant" | "bear" | "zebra"
        | "giraffe" => "animal",
        "backpack" | "umbrella" | "handbag" | "tie" | "suitcase" => "accessory",
        "frisbee" | "skis" | "snowboard" | "sports ball" | "kite" | "baseball bat"
        | "baseball glove" | "skateboard" | "surfboard" | "tennis racket" => "sports",
        "bottle" | "wine glass" | "cup" | "fork" | "knife" | "spoon" | "bowl" | "banana"
        | "apple" | "sandwich" | "orange" | "broccoli" | "carrot" | "hot dog" | "pizza"
        | "donut" | "cake" => "food",
        "bench" | "chair" | "couch" | "bed" | "dining table" => "furniture",
        "potted plant" => "plant",
        "toilet" => "bathroom",
        "tv" | "laptop" | "mouse" | "remote" | "keyboard" | "cell phone" => "electronics",
        "microwave" | "oven" | "toaster" | "sink" | "refrigerator" => "appliance",
        "book" | "clock" | "hair drier" | "toothbrush" => "item",
        "vase" => "decoration",
        "scissors" => "tool",
        "teddy bear" => "toy",
        _ => return None,
    };
    Some(group)
}

/// Namespaced label, e.g. `plant:potted plant`
pub fn category_label(class_name: &str) -> Option<String> {
    category_group(class_name).map(|group| format!("{}:{}", group, class_name))
}

/// Animals get a crop embedding and go into the pet index
pub fn is_pet_label(label: &str) -> bool {
    label.starts_with("animal:")
}

pub struct OnnxObjectCapability {
    session: Session,
    min_confidence: f32,
}

impl OnnxObjectCapability {
    pub fn load(store: &ModelStore, models: &ModelsConfig) -> Result<Self> {
        Ok(Self {
            session: store.session(&models.object_detector)?,
            min_confidence: models.object_confidence,
        })
    }
}

impl Capability for OnnxObjectCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Object
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Detector
    }

    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        run_yolo(&mut self.session, variant, self.min_confidence)
            .map_err(|e| CapabilityError::inference(CapabilityKind::Object, e))
    }
}

fn run_yolo(session: &mut Session, variant: &Variant, threshold: f32) -> Result<Vec<Detection>> {
    let (width, height) = variant.image.dimensions();
    let resized = variant
        .image
        .resize_exact(YOLO_INPUT_SIZE, YOLO_INPUT_SIZE, image::imageops::FilterType::Triangle)
        .to_rgb8();
    let input_tensor = nchw_tensor(&resized, [0.0; 3], [1.0; 3])?;

    let outputs = session.run(ort::inputs![input_tensor])?;
    let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No detection output"))?;
    let (shape, data) = output.try_extract_tensor::<f32>()?;

    // [1, 4 + classes, anchors]
    if shape.len() != 3 || shape[1] < 5 {
        return Err(anyhow!("unexpected YOLO output shape {:?}", &shape[..]));
    }
    let rows = shape[1] as usize;
    let anchors = shape[2] as usize;

    let candidates = decode_yolo(
        data,
        rows,
        anchors,
        width as f32 / YOLO_INPUT_SIZE as f32,
        height as f32 / YOLO_INPUT_SIZE as f32,
        threshold,
    );

    Ok(candidates
        .into_iter()
        .map(|(bbox, confidence, label)| Detection::Object {
            label,
            confidence,
            bbox,
            embedding: None,
        })
        .collect())
}

/// Decode a column-major YOLOv8 head into labelled boxes in variant
/// coordinates, suppressing overlaps per label
fn decode_yolo(
    data: &[f32],
    rows: usize,
    anchors: usize,
    scale_x: f32,
    scale_y: f32,
    threshold: f32,
) -> Vec<(BoundingBox, f32, String)> {
    let at = |row: usize, col: usize| data.get(row * anchors + col).copied().unwrap_or(0.0);

    let mut by_label: std::collections::BTreeMap<String, Vec<(BoundingBox, f32, String)>> =
        std::collections::BTreeMap::new();

    for col in 0..anchors {
        let (class_id, score) = (4..rows)
            .map(|row| (row - 4, at(row, col)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < threshold {
            continue;
        }

        let Some(label) = COCO_CLASSES.get(class_id).and_then(|name| category_label(name)) else {
            continue;
        };

        let (cx, cy, w, h) = (at(0, col), at(1, col), at(2, col), at(3, col));
        let x1 = ((cx - w / 2.0) * scale_x).max(0.0);
        let y1 = ((cy - h / 2.0) * scale_y).max(0.0);
        let bbox = BoundingBox {
            x: x1.round() as i32,
            y: y1.round() as i32,
            width: ((cx + w / 2.0) * scale_x - x1).round().max(1.0) as i32,
            height: ((cy + h / 2.0) * scale_y - y1).round().max(1.0) as i32,
        };

        by_label
            .entry(label.clone())
            .or_default()
            .push((bbox, score, label));
    }

    by_label
        .into_values()
        .flat_map(|boxes| nms(boxes, YOLO_NMS_THRESHOLD))
        .collect()
}
