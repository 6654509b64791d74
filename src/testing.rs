//! Fixtures and fake capabilities shared by the unit tests.

use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use std::path::Path;

use crate::db::{BoundingBox, NewPhoto};
use crate::imaging::{Variant, VariantKind};
use crate::inference::{Capability, CapabilityError, CapabilityKind, Detection, TextEmbedder};

pub const RED: [u8; 3] = [220, 30, 30];
pub const GREEN: [u8; 3] = [30, 220, 30];
pub const BLUE: [u8; 3] = [30, 30, 220];

/// Dimension of the fake face embeddings
pub const FAKE_FACE_DIM: usize = 8;

/// Photo row for a path, with plausible metadata
pub fn new_photo(path: &str) -> NewPhoto {
    let p = Path::new(path);
    NewPhoto {
        path: path.to_string(),
        filename: p
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default(),
        directory: p
            .parent()
            .map(|d| d.to_string_lossy().to_string())
            .unwrap_or_default(),
        size_bytes: 1024,
        width: Some(640),
        height: Some(480),
        ..Default::default()
    }
}

/// Black frame with one coloured square per "face", laid out left to right
/// on a grid of `height / 4`
pub fn face_frame(width: u32, height: u32, colors: &[[u8; 3]]) -> DynamicImage {
    let side = height / 4;
    let mut img = RgbImage::new(width, height);
    for (i, color) in colors.iter().enumerate() {
        let x0 = (2 * i as u32 + 1) * side;
        for y in side..2 * side {
            for x in x0..(x0 + side).min(width) {
                img.put_pixel(x, y, Rgb(*color));
            }
        }
    }
    DynamicImage::ImageRgb8(img)
}

/// 640×480 JPEG with up to two face squares
pub fn write_face_jpeg(path: &Path, colors: &[[u8; 3]]) {
    face_frame(640, 480, colors).to_rgb8().save(path).unwrap();
}

pub fn write_corrupt_jpeg(path: &Path) {
    std::fs::write(path, b"\xff\xd8\xff\xe0 truncated").unwrap();
}

fn is_lit(p: &Rgb<u8>) -> bool {
    p.0.iter().any(|&c| c > 100)
}

/// Treats every coloured square as a face; the dominant channel decides who
/// it is, so the same colour always yields the same embedding
#[derive(Debug, Default)]
pub struct FakeFaceCapability;

impl FakeFaceCapability {
    fn find_squares(img: &RgbImage) -> Vec<(BoundingBox, [u8; 3])> {
        let (w, h) = img.dimensions();
        let row = h * 3 / 8;
        let mut found = Vec::new();

        let mut x = 0;
        while x < w {
            if !is_lit(img.get_pixel(x, row)) {
                x += 1;
                continue;
            }
            let start = x;
            while x < w && is_lit(img.get_pixel(x, row)) {
                x += 1;
            }

            let cx = (start + x) / 2;
            let mut y0 = row;
            while y0 > 0 && is_lit(img.get_pixel(cx, y0 - 1)) {
                y0 -= 1;
            }
            let mut y1 = row;
            while y1 < h && is_lit(img.get_pixel(cx, y1)) {
                y1 += 1;
            }

            let bbox = BoundingBox {
                x: start as i32,
                y: y0 as i32,
                width: (x - start) as i32,
                height: (y1 - y0) as i32,
            };
            found.push((bbox, img.get_pixel(cx, row).0));
        }
        found
    }
}

impl Capability for FakeFaceCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Face
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Face
    }

    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        let rgb = variant.image.to_rgb8();
        Ok(Self::find_squares(&rgb)
            .into_iter()
            .map(|(bbox, color)| {
                let dominant = (0..3).max_by_key(|&c| color[c]).unwrap_or(0);
                let mut embedding = vec![0.0; FAKE_FACE_DIM];
                embedding[dominant] = 1.0;
                Detection::Face {
                    bbox,
                    confidence: 0.9,
                    landmarks: None,
                    embedding: Some(embedding),
                }
            })
            .collect())
    }
}

/// Returns the same detections for every photo
pub struct StaticCapability {
    kind: CapabilityKind,
    variant: VariantKind,
    detections: Vec<Detection>,
}

impl StaticCapability {
    pub fn new(kind: CapabilityKind, detections: Vec<Detection>) -> Self {
        Self {
            kind,
            variant: VariantKind::Detector,
            detections,
        }
    }

    pub fn scene(label: &str, confidence: f32) -> Self {
        Self::new(
            CapabilityKind::Scene,
            vec![Detection::Scene {
                label: label.to_string(),
                confidence,
            }],
        )
    }

    pub fn objects(detections: Vec<Detection>) -> Self {
        Self::new(CapabilityKind::Object, detections)
    }

    pub fn tags(label: &str, confidence: f32) -> Self {
        Self::new(
            CapabilityKind::Tagging,
            vec![Detection::Tag {
                label: label.to_string(),
                confidence,
            }],
        )
    }

    pub fn caption(text: &str) -> Self {
        Self {
            variant: VariantKind::Caption,
            ..Self::new(
                CapabilityKind::Caption,
                vec![Detection::Caption {
                    text: text.to_string(),
                    confidence: 1.0,
                }],
            )
        }
    }
}

impl Capability for StaticCapability {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn variant(&self) -> VariantKind {
        self.variant
    }

    fn detect(&mut self, _variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        Ok(self.detections.clone())
    }
}

/// Fails every call
pub struct FailingCapability(pub CapabilityKind);

impl Capability for FailingCapability {
    fn kind(&self) -> CapabilityKind {
        self.0
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Detector
    }

    fn detect(&mut self, _variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        Err(CapabilityError::inference(self.0, "synthetic failure"))
    }
}

/// Panics on every call
pub struct PanickingCapability(pub CapabilityKind);

impl Capability for PanickingCapability {
    fn kind(&self) -> CapabilityKind {
        self.0
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Detector
    }

    fn detect(&mut self, _variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        panic!("{} model crashed", self.0)
    }
}

/// Embeds an image as `[width, height, mean r, mean g, mean b]`
pub struct FakeImageEmbedder;

impl Capability for FakeImageEmbedder {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::ImageEmbedding
    }

    fn variant(&self) -> VariantKind {
        VariantKind::Detector
    }

    fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
        let (w, h) = variant.image.dimensions();
        let rgb = variant.image.to_rgb8();
        let n = (w as f32 * h as f32).max(1.0);
        let mut mean = [0.0f32; 3];
        for p in rgb.pixels() {
            for c in 0..3 {
                mean[c] += p[c] as f32 / 255.0 / n;
            }
        }
        Ok(vec![Detection::ImageEmbedding {
            vector: vec![w as f32, h as f32, mean[0], mean[1], mean[2]],
        }])
    }
}

/// Text embedder that returns a fixed vector
pub struct FakeTextEmbedder(pub Vec<f32>);

impl TextEmbedder for FakeTextEmbedder {
    fn embed_text(&mut self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
        Ok(self.0.clone())
    }
}

#[test]
fn test_fake_face_capability_finds_squares() {
    let decoded = crate::imaging::DecodedImage::from_image(
        Path::new("a.jpg"),
        face_frame(640, 480, &[RED, GREEN]),
    );
    let faces = FakeFaceCapability.detect(decoded.full()).unwrap();
    assert_eq!(faces.len(), 2);
    assert_eq!(
        faces[0].bbox(),
        Some(&BoundingBox { x: 120, y: 120, width: 120, height: 120 })
    );
    assert_eq!(faces[0].embedding().unwrap()[0], 1.0);
    assert_eq!(faces[1].embedding().unwrap()[1], 1.0);
}
