//! Per-photo analysis results: faces, objects, scenes, captions and
//! whole-image embeddings, written in a single transaction per photo.

use anyhow::Result;
use rusqlite::{params, Transaction};

use super::faces::Assignment;
use super::{bytes_to_embedding, embedding_to_bytes, BoundingBox, Database, ProcessingStage};

/// Minimum overlap for a re-detected face to inherit the old face's person
const CARRY_IOU: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct DetectedFaceRow {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct DetectedObjectRow {
    pub category: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct SceneRow {
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct CaptionRow {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct ImageEmbeddingRow {
    pub embedding: Vec<f32>,
    pub model: String,
}

/// Everything one analysis pass produced for a photo. `None` means the stage
/// did not run and existing rows stay; `Some` replaces them.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRecord {
    pub faces: Option<Vec<DetectedFaceRow>>,
    pub objects: Option<Vec<DetectedObjectRow>>,
    pub scenes: Option<Vec<SceneRow>>,
    pub scene_tags: Option<Vec<SceneRow>>,
    pub caption: Option<Option<CaptionRow>>,
    pub image_embedding: Option<ImageEmbeddingRow>,
    pub stage: Option<ProcessingStage>,
    /// Stages that failed. Written to the photo along with `stage`.
    pub errors: Vec<String>,
}

/// Row ids touched by `save_analysis`, in insertion order. Only rows that
/// carry an embedding are listed, since these are what the vector index holds.
#[derive(Debug, Clone, Default)]
pub struct SavedIds {
    pub face_ids: Vec<i64>,
    pub pet_object_ids: Vec<i64>,
    pub removed_face_ids: Vec<i64>,
    pub removed_pet_object_ids: Vec<i64>,
}

/// Object row as stored
#[derive(Debug, Clone)]
pub struct ObjectDetection {
    pub id: i64,
    pub photo_id: i64,
    pub category: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// A scene label across the library
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSummary {
    pub label: String,
    pub photo_count: i64,
    pub avg_confidence: f32,
}

/// Scene or tag row as stored
#[derive(Debug, Clone)]
pub struct SceneLabel {
    pub label: String,
    pub confidence: f32,
    pub source: String,
}

pub const SCENE_SOURCE_CLASSIFIER: &str = "classifier";
pub const SCENE_SOURCE_ZERO_SHOT: &str = "zero-shot";

struct PriorFace {
    bbox: BoundingBox,
    person_id: Option<i64>,
    assignment: Option<String>,
}

impl Database {
    /// Write one photo's analysis atomically
    pub fn save_analysis(&self, photo_id: i64, record: &AnalysisRecord) -> Result<SavedIds> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut saved = SavedIds::default();

        if let Some(faces) = &record.faces {
            replace_faces(&tx, photo_id, faces, &mut saved)?;
        }

        if let Some(objects) = &record.objects {
            replace_objects(&tx, photo_id, objects, &mut saved)?;
        }

        if let Some(scenes) = &record.scenes {
            replace_scenes(&tx, photo_id, SCENE_SOURCE_CLASSIFIER, scenes)?;
        }

        if let Some(tags) = &record.scene_tags {
            replace_scenes(&tx, photo_id, SCENE_SOURCE_ZERO_SHOT, tags)?;
        }

        if let Some(caption) = &record.caption {
            tx.execute("DELETE FROM captions WHERE photo_id = ?", [photo_id])?;
            if let Some(caption) = caption {
                tx.execute(
                    "INSERT INTO captions (photo_id, text, model) VALUES (?, ?, ?)",
                    params![photo_id, caption.text, caption.model],
                )?;
            }
        }

        if let Some(image) = &record.image_embedding {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO image_embeddings (photo_id, embedding, embedding_dim, model, created_at)
                VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
                "#,
                params![
                    photo_id,
                    embedding_to_bytes(&image.embedding),
                    image.embedding.len() as i64,
                    image.model,
                ],
            )?;
        }

        if let Some(stage) = record.stage {
            let errors = (!record.errors.is_empty()).then(|| record.errors.join("\n"));
            tx.execute(
                "UPDATE photos SET stage = MAX(stage, ?), analysis_error = ?, analyzed_at = ? WHERE id = ?",
                params![stage.as_i64(), errors, super::now_timestamp(), photo_id],
            )?;
        }

        tx.commit()?;
        Ok(saved)
    }

    pub fn objects_for_photo(&self, photo_id: i64) -> Result<Vec<ObjectDetection>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, photo_id, category, confidence, bbox_x, bbox_y, bbox_w, bbox_h
            FROM objects WHERE photo_id = ? ORDER BY confidence DESC, id
            "#,
        )?;
        let objects = stmt
            .query_map([photo_id], object_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(objects)
    }

    /// Objects of a category. A bare group such as `animal` matches every
    /// `animal:*` category.
    pub fn objects_by_category(&self, category: &str) -> Result<Vec<ObjectDetection>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, photo_id, category, confidence, bbox_x, bbox_y, bbox_w, bbox_h
            FROM objects
            WHERE category = ?1 OR (instr(?1, ':') = 0 AND category LIKE ?1 || ':%')
            ORDER BY photo_id, confidence DESC
            "#,
        )?;
        let objects = stmt
            .query_map([category], object_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(objects)
    }

    /// Every object category with the number of photos it appears in
    pub fn object_categories(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT category, COUNT(DISTINCT photo_id) FROM objects
            GROUP BY category ORDER BY COUNT(DISTINCT photo_id) DESC, category
            "#,
        )?;
        let categories = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(categories)
    }

    /// Scene labels and zero-shot tags with their photo counts
    pub fn scene_summary(&self) -> Result<Vec<SceneSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT label, COUNT(DISTINCT photo_id), AVG(confidence) FROM scenes
            GROUP BY label ORDER BY COUNT(DISTINCT photo_id) DESC, label
            "#,
        )?;
        let summary = stmt
            .query_map([], |row| {
                Ok(SceneSummary {
                    label: row.get(0)?,
                    photo_count: row.get(1)?,
                    avg_confidence: row.get::<_, f64>(2)? as f32,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(summary)
    }

    pub fn photos_with_scene(&self, label: &str) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT photo_id FROM scenes WHERE label = ? ORDER BY photo_id",
        )?;
        let ids = stmt
            .query_map([label], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn scenes_for_photo(&self, photo_id: i64) -> Result<Vec<SceneLabel>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT label, confidence, source FROM scenes
            WHERE photo_id = ? ORDER BY confidence DESC, id
            "#,
        )?;
        let scenes = stmt
            .query_map([photo_id], |row| {
                Ok(SceneLabel {
                    label: row.get(0)?,
                    confidence: row.get(1)?,
                    source: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(scenes)
    }

    pub fn caption_for_photo(&self, photo_id: i64) -> Result<Option<String>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT text FROM captions WHERE photo_id = ?",
            [photo_id],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(text) => Ok(Some(text)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn image_embedding(&self, photo_id: i64) -> Result<Option<Vec<f32>>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT embedding FROM image_embeddings WHERE photo_id = ?",
            [photo_id],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(bytes) => Ok(Some(bytes_to_embedding(&bytes))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// (photo id, embedding) for every whole-image embedding
    pub fn image_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        self.id_embedding_pairs("SELECT photo_id, embedding FROM image_embeddings ORDER BY photo_id")
    }

    /// (object id, embedding) for every animal object with a crop embedding
    pub fn pet_embeddings(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        self.id_embedding_pairs(
            "SELECT id, embedding FROM objects WHERE embedding IS NOT NULL ORDER BY id",
        )
    }

    pub fn pet_embedding(&self, object_id: i64) -> Result<Option<Vec<f32>>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT embedding FROM objects WHERE id = ? AND embedding IS NOT NULL",
            [object_id],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(bytes) => Ok(Some(bytes_to_embedding(&bytes))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// (face id, embedding) for every face with an embedding
    pub fn face_embedding_pairs(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        self.id_embedding_pairs("SELECT id, embedding FROM faces WHERE embedding IS NOT NULL ORDER BY id")
    }

    fn id_embedding_pairs(&self, sql: &str) -> Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let pairs = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get(0)?, bytes_to_embedding(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(pairs)
    }
}

fn replace_faces(
    tx: &Transaction,
    photo_id: i64,
    faces: &[DetectedFaceRow],
    saved: &mut SavedIds,
) -> Result<()> {
    let prior: Vec<(i64, bool, PriorFace)> = {
        let mut stmt = tx.prepare(
            r#"
            SELECT id, embedding IS NOT NULL, bbox_x, bbox_y, bbox_w, bbox_h, person_id, assignment
            FROM faces WHERE photo_id = ? ORDER BY id
            "#,
        )?;
        let rows = stmt
            .query_map([photo_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    PriorFace {
                        bbox: BoundingBox {
                            x: row.get(2)?,
                            y: row.get(3)?,
                            width: row.get(4)?,
                            height: row.get(5)?,
                        },
                        person_id: row.get(6)?,
                        assignment: row.get(7)?,
                    },
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };

    saved.removed_face_ids = prior
        .iter()
        .filter(|(_, has_embedding, _)| *has_embedding)
        .map(|(id, _, _)| *id)
        .collect();
    tx.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;

    for face in faces {
        // A re-detected face keeps the person of the old face it overlaps most
        let carried = prior
            .iter()
            .map(|(_, _, p)| (p, p.bbox.iou(&face.bbox)))
            .filter(|(p, iou)| *iou > CARRY_IOU && (p.person_id.is_some() || p.assignment.is_some()))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(p, _)| p);

        let (person_id, assignment) = match carried {
            Some(p) => (p.person_id, p.assignment.clone()),
            None => (None, None),
        };

        tx.execute(
            r#"
            INSERT INTO faces (photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence,
                               embedding, embedding_dim, person_id, assignment)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                photo_id,
                face.bbox.x,
                face.bbox.y,
                face.bbox.width,
                face.bbox.height,
                face.confidence,
                face.embedding.as_deref().map(embedding_to_bytes),
                face.embedding.as_ref().map(|e| e.len() as i64),
                person_id,
                assignment
                    .as_deref()
                    .and_then(Assignment::from_str)
                    .map(|a| a.as_str()),
            ],
        )?;
        if face.embedding.is_some() {
            saved.face_ids.push(tx.last_insert_rowid());
        }
    }

    Ok(())
}

fn replace_objects(
    tx: &Transaction,
    photo_id: i64,
    objects: &[DetectedObjectRow],
    saved: &mut SavedIds,
) -> Result<()> {
    saved.removed_pet_object_ids = {
        let mut stmt = tx.prepare(
            "SELECT id FROM objects WHERE photo_id = ? AND embedding IS NOT NULL ORDER BY id",
        )?;
        let ids = stmt
            .query_map([photo_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        ids
    };
    tx.execute("DELETE FROM objects WHERE photo_id = ?", [photo_id])?;

    for object in objects {
        tx.execute(
            r#"
            INSERT INTO objects (photo_id, category, confidence, bbox_x, bbox_y, bbox_w, bbox_h,
                                 embedding, embedding_dim)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                photo_id,
                object.category,
                object.confidence,
                object.bbox.x,
                object.bbox.y,
                object.bbox.width,
                object.bbox.height,
                object.embedding.as_deref().map(embedding_to_bytes),
                object.embedding.as_ref().map(|e| e.len() as i64),
            ],
        )?;
        if object.embedding.is_some() {
            saved.pet_object_ids.push(tx.last_insert_rowid());
        }
    }

    Ok(())
}

fn replace_scenes(tx: &Transaction, photo_id: i64, source: &str, scenes: &[SceneRow]) -> Result<()> {
    tx.execute(
        "DELETE FROM scenes WHERE photo_id = ? AND source = ?",
        params![photo_id, source],
    )?;
    for scene in scenes {
        tx.execute(
            "INSERT INTO scenes (photo_id, label, confidence, source) VALUES (?, ?, ?, ?)",
            params![photo_id, scene.label, scene.confidence, source],
        )?;
    }
    Ok(())
}

fn object_from_row(row: &rusqlite::Row) -> rusqlite::Result<ObjectDetection> {
    Ok(ObjectDetection {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        category: row.get(2)?,
        confidence: row.get(3)?,
        bbox: BoundingBox {
            x: row.get(4)?,
            y: row.get(5)?,
            width: row.get(6)?,
            height: row.get(7)?,
        },
    })
}
