use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::metadata::read_rotation;
use super::DecodeError;
use crate::db::BoundingBox;

/// Downstream consumer a variant is sized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariantKind {
    Face,
    Detector,
    Caption,
    Full,
}

impl VariantKind {
    pub const ALL: [VariantKind; 4] = [
        VariantKind::Face,
        VariantKind::Detector,
        VariantKind::Caption,
        VariantKind::Full,
    ];

    /// Longest side of the variant, `None` for the unscaled frame
    pub fn max_side(&self) -> Option<u32> {
        match self {
            VariantKind::Face => Some(1024),
            VariantKind::Detector => Some(768),
            VariantKind::Caption => Some(1024),
            VariantKind::Full => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantKind::Face => "face",
            VariantKind::Detector => "detector",
            VariantKind::Caption => "caption",
            VariantKind::Full => "full",
        }
    }
}

/// A pre-scaled RGB copy of a decoded photo
#[derive(Debug, Clone)]
pub struct Variant {
    pub kind: VariantKind,
    pub image: Arc<DynamicImage>,
    /// variant side / original side; 1.0 when no resize happened
    pub scale: f32,
    pub original_width: u32,
    pub original_height: u32,
}

impl Variant {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Map a box found on this variant back to full-resolution coordinates,
    /// clamped to the frame
    pub fn map_box_to_original(&self, bbox: &BoundingBox) -> BoundingBox {
        let max_x = self.original_width as f32;
        let max_y = self.original_height as f32;

        let x0 = (bbox.x as f32 / self.scale).round().clamp(0.0, max_x - 1.0);
        let y0 = (bbox.y as f32 / self.scale).round().clamp(0.0, max_y - 1.0);
        let x1 = ((bbox.x + bbox.width) as f32 / self.scale)
            .round()
            .clamp(x0 + 1.0, max_x);
        let y1 = ((bbox.y + bbox.height) as f32 / self.scale)
            .round()
            .clamp(y0 + 1.0, max_y);

        BoundingBox {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as i32,
            height: (y1 - y0) as i32,
        }
    }

    pub fn map_point_to_original(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            (x / self.scale).clamp(0.0, self.original_width as f32),
            (y / self.scale).clamp(0.0, self.original_height as f32),
        )
    }
}

/// One decoded photo and all of its variants
#[derive(Debug)]
pub struct DecodedImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    variants: Vec<Variant>,
}

impl DecodedImage {
    /// Decode a file, apply EXIF orientation and build every variant
    pub fn decode(path: &Path) -> Result<Self, DecodeError> {
        let img = image::open(path).map_err(|e| DecodeError::from_image(path, e))?;

        let img = match read_rotation(path) {
            90 => img.rotate90(),
            180 => img.rotate180(),
            270 => img.rotate270(),
            _ => img,
        };

        Ok(Self::from_image(path, img))
    }

    /// Build variants for an already decoded frame
    pub fn from_image(path: &Path, img: DynamicImage) -> Self {
        let (width, height) = img.dimensions();
        let full = Arc::new(DynamicImage::ImageRgb8(img.to_rgb8()));
        let max_dim = width.max(height).max(1);

        // Variants with the same target size share one buffer
        let mut by_side: HashMap<u32, (Arc<DynamicImage>, f32)> = HashMap::new();
        let mut variants = Vec::with_capacity(VariantKind::ALL.len());

        for kind in VariantKind::ALL {
            let (image, scale) = match kind.max_side() {
                Some(side) if side < max_dim => by_side
                    .entry(side)
                    .or_insert_with(|| {
                        let scale = side as f32 / max_dim as f32;
                        let w = ((width as f32 * scale).round() as u32).max(1);
                        let h = ((height as f32 * scale).round() as u32).max(1);
                        (Arc::new(full.resize_exact(w, h, FilterType::Triangle)), scale)
                    })
                    .clone(),
                _ => (Arc::clone(&full), 1.0),
            };

            variants.push(Variant {
                kind,
                image,
                scale,
                original_width: width,
                original_height: height,
            });
        }

        Self {
            path: path.to_path_buf(),
            width,
            height,
            variants,
        }
    }

    pub fn variant(&self, kind: VariantKind) -> &Variant {
        // Built in VariantKind::ALL order
        &self.variants[kind as usize]
    }

    pub fn full(&self) -> &Variant {
        self.variant(VariantKind::Full)
    }
}

/// Per-worker decode cache. Each photo is decoded at most once while it is
/// held; release it once every stage for the photo has run.
#[derive(Debug, Default)]
pub struct ImageCache {
    entries: HashMap<PathBuf, Arc<DecodedImage>>,
    decodes: usize,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_decode(&mut self, path: &Path) -> Result<Arc<DecodedImage>, DecodeError> {
        if let Some(decoded) = self.entries.get(path) {
            return Ok(Arc::clone(decoded));
        }

        let decoded = Arc::new(DecodedImage::decode(path)?);
        self.decodes += 1;
        self.entries.insert(path.to_path_buf(), Arc::clone(&decoded));
        Ok(decoded)
    }

    /// Drop a photo's frames. Returns false if it was not cached.
    pub fn release(&mut self, path: &Path) -> bool {
        self.entries.remove(path).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of decodes performed over the cache's lifetime
    pub fn decode_count(&self) -> usize {
        self.decodes
    }
}
