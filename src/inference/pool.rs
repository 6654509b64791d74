//! Owns every capability instance for the lifetime of the engine.

use image::{DynamicImage, GenericImageView};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

use super::{Capability, CapabilityError, CapabilityKind, Detection, TextEmbedder};
use crate::config::Config;
use crate::db::BoundingBox;
use crate::imaging::{DecodedImage, Variant, VariantKind};

pub type CapabilityLoader<T> = Box<dyn FnOnce() -> anyhow::Result<Box<T>> + Send>;

/// A capability that is loaded at most once. Load failures are remembered so
/// a missing model is reported once, not once per photo.
struct Slot<T: ?Sized> {
    kind: CapabilityKind,
    loader: Mutex<Option<CapabilityLoader<T>>>,
    loaded: OnceLock<Result<Mutex<Box<T>>, String>>,
}

impl<T: ?Sized> Slot<T> {
    fn new(kind: CapabilityKind, loader: CapabilityLoader<T>) -> Self {
        Self {
            kind,
            loader: Mutex::new(Some(loader)),
            loaded: OnceLock::new(),
        }
    }

    fn get(&self) -> Result<&Mutex<Box<T>>, CapabilityError> {
        let state = self.loaded.get_or_init(|| {
            let loader = self.loader.lock().ok().and_then(|mut l| l.take());
            let Some(load) = loader else {
                return Err("loader already consumed".to_string());
            };

            match load() {
                Ok(instance) => {
                    info!(capability = %self.kind, "Capability loaded");
                    Ok(Mutex::new(instance))
                }
                Err(e) => {
                    warn!(capability = %self.kind, error = %e, "Capability unavailable");
                    Err(format!("{:#}", e))
                }
            }
        });

        state.as_ref().map_err(|reason| CapabilityError::Unavailable {
            kind: self.kind,
            reason: reason.clone(),
        })
    }

    fn load_failure(&self) -> Option<&str> {
        match self.loaded.get() {
            Some(Err(reason)) => Some(reason),
            _ => None,
        }
    }
}

pub struct PoolBuilder {
    capabilities: BTreeMap<CapabilityKind, CapabilityLoader<dyn Capability>>,
    text: Option<CapabilityLoader<dyn TextEmbedder>>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self {
            capabilities: BTreeMap::new(),
            text: None,
        }
    }

    pub fn with<F>(mut self, kind: CapabilityKind, loader: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Box<dyn Capability>> + Send + 'static,
    {
        self.capabilities.insert(kind, Box::new(loader));
        self
    }

    /// Register an already loaded capability
    pub fn with_instance(self, capability: Box<dyn Capability>) -> Self {
        let kind = capability.kind();
        self.with(kind, move || Ok(capability))
    }

    pub fn with_text<F>(mut self, loader: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Box<dyn TextEmbedder>> + Send + 'static,
    {
        self.text = Some(Box::new(loader));
        self
    }

    /// Build the pool, loading face and object detection immediately
    pub fn build(self) -> DetectorPool {
        let slots: BTreeMap<_, _> = self
            .capabilities
            .into_iter()
            .map(|(kind, loader)| (kind, Slot::new(kind, loader)))
            .collect();

        for (kind, slot) in &slots {
            if kind.is_eager() {
                let _ = slot.get();
            }
        }

        DetectorPool {
            slots,
            text: self
                .text
                .map(|loader| Slot::new(CapabilityKind::TextEmbedding, loader)),
        }
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of capabilities available to a running engine. Each capability is
/// a single instance behind its own lock, so calls to one capability are
/// serialized while different capabilities run concurrently.
pub struct DetectorPool {
    slots: BTreeMap<CapabilityKind, Slot<dyn Capability>>,
    text: Option<Slot<dyn TextEmbedder>>,
}

impl DetectorPool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// A pool with nothing registered
    pub fn empty() -> Self {
        PoolBuilder::new().build()
    }

    /// ONNX-backed pool for the models named in the configuration. Disabled
    /// stages are left unregistered.
    pub fn from_config(config: &Config) -> Self {
        use super::{caption, clip, face, models::ModelStore, object, scene};

        let store = Arc::new(ModelStore::from_config(&config.models));
        let models = config.models.clone();
        let clip_shared = clip::SharedClip::new(Arc::clone(&store), &models);

        let mut builder = PoolBuilder::new();

        {
            let (store, models) = (Arc::clone(&store), models.clone());
            builder = builder.with(CapabilityKind::Face, move || {
                Ok(Box::new(face::OnnxFaceCapability::load(&store, &models)?))
            });
        }
        {
            let (store, models) = (Arc::clone(&store), models.clone());
            builder = builder.with(CapabilityKind::Object, move || {
                Ok(Box::new(object::OnnxObjectCapability::load(&store, &models)?))
            });
        }
        if models.enable_scene {
            let (store, models) = (Arc::clone(&store), models.clone());
            builder = builder.with(CapabilityKind::Scene, move || {
                Ok(Box::new(scene::OnnxSceneCapability::load(&store, &models)?))
            });
        }
        if models.enable_tagging {
            let shared = clip_shared.clone();
            let models = models.clone();
            builder = builder.with(CapabilityKind::Tagging, move || {
                Ok(Box::new(clip::ClipTagger::load(&shared, &models)?))
            });
        }
        if models.enable_image_embedding {
            let shared = clip_shared.clone();
            builder = builder.with(CapabilityKind::ImageEmbedding, move || {
                Ok(Box::new(clip::ClipImageEmbedder::load(&shared)?))
            });
            let shared = clip_shared.clone();
            builder = builder.with_text(move || Ok(Box::new(clip::ClipTextEmbedder::load(&shared)?)));
        }
        if config.caption.enabled {
            let caption_config = config.caption.clone();
            builder = builder.with(CapabilityKind::Caption, move || {
                Ok(Box::new(caption::ChatCaptioner::new(&caption_config)?))
            });
        }

        builder.build()
    }

    /// Capabilities registered with this pool, in run order
    pub fn enabled(&self) -> Vec<CapabilityKind> {
        self.slots.keys().copied().collect()
    }

    pub fn is_enabled(&self, kind: CapabilityKind) -> bool {
        match kind {
            CapabilityKind::TextEmbedding => self.text.is_some(),
            _ => self.slots.contains_key(&kind),
        }
    }

    /// Load a capability if needed and report whether it is usable
    pub fn ensure_loaded(&self, kind: CapabilityKind) -> Result<(), CapabilityError> {
        match kind {
            CapabilityKind::TextEmbedding => self.text_slot()?.get().map(|_| ()),
            _ => self.slot(kind)?.get().map(|_| ()),
        }
    }

    pub fn is_available(&self, kind: CapabilityKind) -> bool {
        self.ensure_loaded(kind).is_ok()
    }

    /// One line per capability that failed to load
    pub fn warnings(&self) -> Vec<String> {
        self.unavailable()
            .into_iter()
            .map(|(kind, reason)| format!("{} unavailable: {}", kind, reason))
            .collect()
    }

    /// Capabilities that were tried and failed to load
    pub fn unavailable(&self) -> Vec<(CapabilityKind, String)> {
        let mut failures: Vec<(CapabilityKind, String)> = self
            .slots
            .values()
            .filter_map(|slot| slot.load_failure().map(|r| (slot.kind, r.to_string())))
            .collect();
        if let Some(reason) = self.text.as_ref().and_then(|slot| slot.load_failure()) {
            failures.push((CapabilityKind::TextEmbedding, reason.to_string()));
        }
        failures
    }

    /// Run one capability over the variant it asks for. Returned boxes and
    /// landmarks are in original-image coordinates.
    pub fn run(
        &self,
        kind: CapabilityKind,
        image: &DecodedImage,
    ) -> Result<Vec<Detection>, CapabilityError> {
        let capability = self.slot(kind)?.get()?;
        let mut capability = capability
            .lock()
            .map_err(|_| CapabilityError::inference(kind, "capability lock poisoned"))?;

        let variant = image.variant(capability.variant());
        let detections = capability.detect(variant)?;
        debug!(capability = %kind, count = detections.len(), path = %image.path.display(), "Detections");

        Ok(detections
            .into_iter()
            .map(|d| d.to_original(variant))
            .collect())
    }

    /// Embed a region of the full-resolution frame with the whole-image
    /// embedder. Used for pet crops.
    pub fn embed_region(
        &self,
        image: &DecodedImage,
        bbox: &BoundingBox,
    ) -> Result<Vec<f32>, CapabilityError> {
        let kind = CapabilityKind::ImageEmbedding;
        let crop = crop_variant(image.full(), bbox)
            .ok_or_else(|| CapabilityError::inference(kind, "empty crop"))?;

        let capability = self.slot(kind)?.get()?;
        let mut capability = capability
            .lock()
            .map_err(|_| CapabilityError::inference(kind, "capability lock poisoned"))?;

        capability
            .detect(&crop)?
            .into_iter()
            .find_map(|d| match d {
                Detection::ImageEmbedding { vector } => Some(vector),
                _ => None,
            })
            .ok_or_else(|| CapabilityError::inference(kind, "no embedding produced"))
    }

    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let embedder = self.text_slot()?.get()?;
        let mut embedder = embedder.lock().map_err(|_| {
            CapabilityError::inference(CapabilityKind::TextEmbedding, "capability lock poisoned")
        })?;
        embedder.embed_text(text)
    }

    fn slot(&self, kind: CapabilityKind) -> Result<&Slot<dyn Capability>, CapabilityError> {
        self.slots.get(&kind).ok_or(CapabilityError::Unavailable {
            kind,
            reason: "not enabled".to_string(),
        })
    }

    fn text_slot(&self) -> Result<&Slot<dyn TextEmbedder>, CapabilityError> {
        self.text.as_ref().ok_or(CapabilityError::Unavailable {
            kind: CapabilityKind::TextEmbedding,
            reason: "not enabled".to_string(),
        })
    }
}

fn crop_variant(full: &Variant, bbox: &BoundingBox) -> Option<Variant> {
    let (w, h) = full.image.dimensions();
    let x = bbox.x.clamp(0, w as i32) as u32;
    let y = bbox.y.clamp(0, h as i32) as u32;
    let cw = (bbox.width.max(0) as u32).min(w - x);
    let ch = (bbox.height.max(0) as u32).min(h - y);
    if cw == 0 || ch == 0 {
        return None;
    }

    let crop: DynamicImage = full.image.crop_imm(x, y, cw, ch);
    Some(Variant {
        kind: VariantKind::Full,
        image: Arc::new(crop),
        scale: 1.0,
        original_width: cw,
        original_height: ch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFaceCapability, FakeImageEmbedder, StaticCapability};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_optional_capability_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);

        let pool = PoolBuilder::new()
            .with(CapabilityKind::Scene, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(StaticCapability::scene("scene:beach", 0.8)))
            })
            .build();

        // Lazy: nothing loaded yet
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        let image = DecodedImage::from_image(Path::new("a.jpg"), DynamicImage::new_rgb8(64, 64));
        for _ in 0..3 {
            let detections = pool.run(CapabilityKind::Scene, &image).unwrap();
            assert_eq!(detections.len(), 1);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eager_capability_loads_at_build() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);

        let _pool = PoolBuilder::new()
            .with(CapabilityKind::Face, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FakeFaceCapability::default()))
            })
            .build();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_failure_is_remembered() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);

        let pool = PoolBuilder::new()
            .with(CapabilityKind::Caption, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("model file missing")
            })
            .build();

        let image = DecodedImage::from_image(Path::new("a.jpg"), DynamicImage::new_rgb8(8, 8));
        for _ in 0..2 {
            let err = pool.run(CapabilityKind::Caption, &image).unwrap_err();
            assert!(err.is_unavailable());
            assert!(err.to_string().contains("model file missing"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let unavailable = pool.unavailable();
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable[0].0, CapabilityKind::Caption);
    }

    #[test]
    fn test_unregistered_capability_is_unavailable() {
        let pool = DetectorPool::empty();
        assert!(!pool.is_enabled(CapabilityKind::Face));
        assert!(pool.enabled().is_empty());
        assert!(pool.embed_text("dog").unwrap_err().is_unavailable());
        // Never attempted, so not reported as a load failure
        assert!(pool.unavailable().is_empty());
    }

    #[test]
    fn test_run_maps_boxes_to_original() {
        let pool = PoolBuilder::new()
            .with_instance(Box::new(FakeFaceCapability::default()))
            .build();

        // Two bright faces on a 2048 wide frame, so the face variant is half size
        let image = DecodedImage::from_image(
            Path::new("a.jpg"),
            crate::testing::face_frame(2048, 1024, &[[220, 30, 30], [30, 220, 30]]),
        );
        let detections = pool.run(CapabilityKind::Face, &image).unwrap();
        assert_eq!(detections.len(), 2);

        let direct = FakeFaceCapability::default()
            .detect(image.full())
            .unwrap();
        for (mapped, direct) in detections.iter().zip(direct.iter()) {
            let (a, b) = (mapped.bbox().unwrap(), direct.bbox().unwrap());
            assert!((a.x - b.x).abs() <= 3, "{:?} vs {:?}", a, b);
            assert!((a.width - b.width).abs() <= 6, "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn test_embed_region_uses_full_frame_crop() {
        let pool = PoolBuilder::new()
            .with_instance(Box::new(FakeImageEmbedder))
            .build();

        let image = DecodedImage::from_image(Path::new("a.jpg"), DynamicImage::new_rgb8(100, 80));
        let vector = pool
            .embed_region(&image, &BoundingBox { x: 10, y: 10, width: 30, height: 20 })
            .unwrap();
        // The fake encodes the crop dimensions
        assert_eq!(&vector[..2], &[30.0, 20.0]);

        let outside = BoundingBox { x: 200, y: 200, width: 10, height: 10 };
        assert!(pool.embed_region(&image, &outside).is_err());
    }
}
