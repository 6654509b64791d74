//! Per-photo analysis: decode once, run every usable capability, write the
//! results in one transaction, then queue the vectors for the index.

use std::path::Path;
use tracing::{debug, warn};

use crate::db::{
    AnalysisRecord, CaptionRow, Database, DetectedFaceRow, DetectedObjectRow, ImageEmbeddingRow,
    PendingPhoto, ProcessingStage, SavedIds, SceneRow,
};
use crate::error::PipelineResult;
use crate::imaging::{DecodedImage, ImageCache};
use crate::index::{IndexClass, VectorIndexStore};
use crate::inference::object::is_pet_label;
use crate::inference::{CapabilityKind, Detection, DetectorPool};

/// What happened to one photo
#[derive(Debug, Clone, PartialEq)]
pub enum PhotoOutcome {
    Analyzed { faces: usize, stage: ProcessingStage },
    /// Saved with whatever the working stages produced. The failed stages
    /// are recorded against the photo.
    StagesFailed {
        faces: usize,
        stage: ProcessingStage,
        errors: Vec<String>,
    },
    /// Recorded against the photo, which later scans skip
    DecodeFailed(String),
    /// Face rescan only. The previous faces are kept.
    FacesFailed(String),
}

impl PhotoOutcome {
    /// The failure to report for this photo, if any
    pub fn failure(&self) -> Option<String> {
        match self {
            PhotoOutcome::Analyzed { .. } => None,
            PhotoOutcome::StagesFailed { errors, .. } => Some(errors.join("; ")),
            PhotoOutcome::DecodeFailed(reason) | PhotoOutcome::FacesFailed(reason) => {
                Some(reason.clone())
            }
        }
    }
}

/// Shared, read-only view of everything a worker needs. `Sync`, so one
/// instance serves the whole worker pool.
pub struct Analyzer<'a> {
    pub db: &'a Database,
    pub index: &'a VectorIndexStore,
    pub pool: &'a DetectorPool,
    /// Stored next to captions and image embeddings
    pub caption_model: &'a str,
    pub embedding_model: &'a str,
}

impl Analyzer<'_> {
    /// Full analysis of a pending photo
    pub fn analyze(&self, photo: &PendingPhoto) -> PipelineResult<PhotoOutcome> {
        let path = Path::new(&photo.path);
        let mut cache = ImageCache::new();
        let image = match cache.get_or_decode(path) {
            Ok(image) => image,
            Err(e) => return self.decode_failed(photo, e.to_string()),
        };

        let (record, pet_crops) = self.run_stages(photo, &image);
        let faces = record.faces.as_ref().map_or(0, |f| f.len());
        let stage = record.stage.unwrap_or(ProcessingStage::Basic);
        let errors = record.errors.clone();
        let saved = self.db.save_analysis(photo.id, &record)?;
        cache.release(path);

        self.index_faces(&record, &saved)?;
        for id in &saved.removed_pet_object_ids {
            self.index.remove(IndexClass::Pet, *id)?;
        }
        for (id, vector) in saved.pet_object_ids.iter().zip(pet_crops) {
            self.index.insert(IndexClass::Pet, *id, vector)?;
        }
        if let Some(image_embedding) = record.image_embedding {
            self.index
                .insert(IndexClass::Image, photo.id, image_embedding.embedding)?;
        }

        debug!(photo_id = photo.id, faces, stage = ?stage, "Analyzed photo");
        if errors.is_empty() {
            Ok(PhotoOutcome::Analyzed { faces, stage })
        } else {
            Ok(PhotoOutcome::StagesFailed { faces, stage, errors })
        }
    }

    /// Face detection only. Other detections and the stage are left alone.
    pub fn rescan_faces(&self, photo: &PendingPhoto) -> PipelineResult<PhotoOutcome> {
        let path = Path::new(&photo.path);
        let mut cache = ImageCache::new();
        let image = match cache.get_or_decode(path) {
            Ok(image) => image,
            Err(e) => return self.decode_failed(photo, e.to_string()),
        };

        let faces = match self.pool.run(CapabilityKind::Face, &image) {
            Ok(detections) => face_rows(detections),
            Err(e) => {
                warn!(photo_id = photo.id, error = %e, "Face rescan failed on photo");
                let reason = e.to_string();
                self.db.record_analysis_error(photo.id, &reason)?;
                return Ok(PhotoOutcome::FacesFailed(reason));
            }
        };
        cache.release(path);

        let record = AnalysisRecord {
            faces: Some(faces),
            ..Default::default()
        };
        let saved = self.db.save_analysis(photo.id, &record)?;
        self.index_faces(&record, &saved)?;

        Ok(PhotoOutcome::Analyzed {
            faces: saved.face_ids.len(),
            stage: ProcessingStage::Full,
        })
    }

    fn decode_failed(&self, photo: &PendingPhoto, reason: String) -> PipelineResult<PhotoOutcome> {
        warn!(photo_id = photo.id, path = %photo.path, error = %reason, "Could not decode photo");
        self.db.record_decode_error(photo.id, &reason)?;
        Ok(PhotoOutcome::DecodeFailed(reason))
    }

    /// Replace the index entries of a photo's faces after its rows changed
    fn index_faces(&self, record: &AnalysisRecord, saved: &SavedIds) -> PipelineResult<()> {
        for id in &saved.removed_face_ids {
            self.index.remove(IndexClass::Face, *id)?;
        }
        let embeddings = record
            .faces
            .iter()
            .flatten()
            .filter_map(|f| f.embedding.clone());
        for (id, embedding) in saved.face_ids.iter().zip(embeddings) {
            self.index.insert(IndexClass::Face, *id, embedding)?;
        }
        Ok(())
    }

    /// Run each enabled capability. Returns the record to save plus the pet
    /// crop embeddings, in the order their objects appear in the record.
    fn run_stages(&self, photo: &PendingPhoto, image: &DecodedImage) -> (AnalysisRecord, Vec<Vec<f32>>) {
        let mut record = AnalysisRecord::default();
        let mut pet_crops = Vec::new();
        let mut complete = true;

        for kind in self.pool.enabled() {
            let detections = match self.pool.run(kind, image) {
                Ok(detections) => detections,
                Err(e) if e.is_unavailable() => {
                    complete = false;
                    continue;
                }
                Err(e) => {
                    warn!(photo_id = photo.id, capability = %kind, error = %e, "Stage failed");
                    record.errors.push(e.to_string());
                    complete = false;
                    continue;
                }
            };

            match kind {
                CapabilityKind::Face => record.faces = Some(face_rows(detections)),
                CapabilityKind::Object => {
                    let objects = self.object_rows(image, detections);
                    pet_crops = objects.iter().filter_map(|o| o.embedding.clone()).collect();
                    record.objects = Some(objects);
                }
                CapabilityKind::Scene => record.scenes = Some(scene_rows(detections)),
                CapabilityKind::Tagging => record.scene_tags = Some(scene_rows(detections)),
                CapabilityKind::Caption => {
                    let caption = detections.into_iter().find_map(|d| match d {
                        Detection::Caption { text, .. } => Some(CaptionRow {
                            text,
                            model: self.caption_model.to_string(),
                        }),
                        _ => None,
                    });
                    record.caption = Some(caption);
                }
                CapabilityKind::ImageEmbedding => {
                    record.image_embedding = detections.into_iter().find_map(|d| match d {
                        Detection::ImageEmbedding { vector } => Some(ImageEmbeddingRow {
                            embedding: vector,
                            model: self.embedding_model.to_string(),
                        }),
                        _ => None,
                    });
                }
                CapabilityKind::TextEmbedding => {}
            }
        }

        record.stage = Some(if complete {
            ProcessingStage::Full
        } else {
            ProcessingStage::Basic
        });
        (record, pet_crops)
    }

    /// Object rows, with a crop embedding for animals when an embedder is
    /// available
    fn object_rows(&self, image: &DecodedImage, detections: Vec<Detection>) -> Vec<DetectedObjectRow> {
        let embed_pets = self.pool.is_enabled(CapabilityKind::ImageEmbedding)
            && self.pool.is_available(CapabilityKind::ImageEmbedding);

        detections
            .into_iter()
            .filter_map(|d| match d {
                Detection::Object {
                    label,
                    confidence,
                    bbox,
                    embedding,
                } => {
                    let embedding = embedding.or_else(|| {
                        if !(embed_pets && is_pet_label(&label)) {
                            return None;
                        }
                        self.pool
                            .embed_region(image, &bbox)
                            .map_err(|e| debug!(label = %label, error = %e, "Pet crop not embedded"))
                            .ok()
                    });
                    Some(DetectedObjectRow {
                        category: label,
                        confidence,
                        bbox,
                        embedding,
                    })
                }
                _ => None,
            })
            .collect()
    }
}

fn face_rows(detections: Vec<Detection>) -> Vec<DetectedFaceRow> {
    detections
        .into_iter()
        .filter_map(|d| match d {
            Detection::Face {
                bbox,
                confidence,
                embedding,
                ..
            } => Some(DetectedFaceRow {
                bbox,
                confidence,
                embedding,
            }),
            _ => None,
        })
        .collect()
}

fn scene_rows(detections: Vec<Detection>) -> Vec<SceneRow> {
    detections
        .into_iter()
        .filter_map(|d| match d {
            Detection::Scene { label, confidence } | Detection::Tag { label, confidence } => {
                Some(SceneRow { label, confidence })
            }
            _ => None,
        })
        .collect()
}
