mod schema;
pub mod cleanup;
pub mod detections;
pub mod faces;
pub mod jobs;
pub mod places;
pub mod tags;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub use cleanup::{OrphanPerson, OrphanRows};
pub use detections::{
    AnalysisRecord, CaptionRow, DetectedFaceRow, DetectedObjectRow, ImageEmbeddingRow,
    ObjectDetection, SavedIds, SceneLabel, SceneRow, SceneSummary,
};
pub use faces::{Assignment, Face, FaceEmbedding, MergeOutcome, Person, PersonRef};
pub use jobs::JobRecord;
pub use places::{PlaceRecord, PlaceSummary};
pub use schema::{MIGRATIONS, SCHEMA};

/// Bounding box in original-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Intersection over union with another box
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = ((x2 - x1).max(0) as i64 * (y2 - y1).max(0) as i64) as f32;
        let union = (self.area() + other.area()) as f32 - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// How far the pipeline has taken a photo. Only moves forward unless a
/// re-scan explicitly resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessingStage {
    Unprocessed = 0,
    /// Required stages ran, one or more optional stages were unavailable or failed
    Basic = 1,
    Full = 2,
}

impl ProcessingStage {
    pub fn from_i64(value: i64) -> Self {
        match value {
            2 => ProcessingStage::Full,
            1 => ProcessingStage::Basic,
            _ => ProcessingStage::Unprocessed,
        }
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }
}

/// A photo row
#[derive(Debug, Clone)]
pub struct Photo {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub size_bytes: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub captured_at: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub imported_at: String,
    pub stage: ProcessingStage,
    pub decode_error: Option<String>,
    pub analysis_error: Option<String>,
}

/// Fields written when a photo is discovered
#[derive(Debug, Clone, Default)]
pub struct NewPhoto {
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub size_bytes: i64,
    pub modified_at: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub captured_at: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    /// Set when the image header could not be read at import time
    pub decode_error: Option<String>,
}

/// Photo queued for analysis
#[derive(Debug, Clone)]
pub struct PendingPhoto {
    pub id: i64,
    pub path: String,
}

/// Row counts across the store
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub photos: i64,
    pub pending_photos: i64,
    pub failed_photos: i64,
    pub faces: i64,
    pub unassigned_faces: i64,
    pub persons: i64,
    pub objects: i64,
    pub scenes: i64,
    pub tags: i64,
    pub places: i64,
}

/// Ids removed together with a photo, needed to drop index vectors
#[derive(Debug, Clone, Default)]
pub struct DeletedPhoto {
    pub photo_id: i64,
    pub face_ids: Vec<i64>,
    pub pet_object_ids: Vec<i64>,
    pub had_image_embedding: bool,
}

const PHOTO_COLUMNS: &str = r#"
    id, path, filename, directory, size_bytes, width, height,
    camera_make, camera_model, captured_at, gps_latitude, gps_longitude,
    imported_at, stage, decode_error, analysis_error
"#;

fn photo_from_row(row: &rusqlite::Row) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get(0)?,
        path: row.get(1)?,
        filename: row.get(2)?,
        directory: row.get(3)?,
        size_bytes: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        camera_make: row.get(7)?,
        camera_model: row.get(8)?,
        captured_at: row.get(9)?,
        gps_latitude: row.get(10)?,
        gps_longitude: row.get(11)?,
        imported_at: row.get(12)?,
        stage: ProcessingStage::from_i64(row.get(13)?),
        decode_error: row.get(14)?,
        analysis_error: row.get(15)?,
    })
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            // Fails with "duplicate column" once applied
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database connection lock poisoned: {}", e))
    }

    // ========================================================================
    // Photo operations
    // ========================================================================

    /// Insert a discovered photo, or refresh file metadata on an existing row.
    /// Returns the photo id and whether a new row was created. The stage and
    /// any recorded decode error of an existing row are left alone.
    pub fn upsert_photo(&self, photo: &NewPhoto) -> Result<(i64, bool)> {
        let conn = self.conn()?;

        let existing = conn.query_row(
            "SELECT id FROM photos WHERE path = ?",
            [&photo.path],
            |row| row.get::<_, i64>(0),
        );

        match existing {
            Ok(id) => {
                conn.execute(
                    r#"
                    UPDATE photos SET
                        size_bytes = ?, modified_at = ?,
                        width = COALESCE(?, width), height = COALESCE(?, height),
                        camera_make = COALESCE(?, camera_make),
                        camera_model = COALESCE(?, camera_model),
                        captured_at = COALESCE(?, captured_at),
                        gps_latitude = COALESCE(?, gps_latitude),
                        gps_longitude = COALESCE(?, gps_longitude)
                    WHERE id = ?
                    "#,
                    params![
                        photo.size_bytes,
                        photo.modified_at,
                        photo.width,
                        photo.height,
                        photo.camera_make,
                        photo.camera_model,
                        photo.captured_at,
                        photo.gps_latitude,
                        photo.gps_longitude,
                        id,
                    ],
                )?;
                Ok((id, false))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                conn.execute(
                    r#"
                    INSERT INTO photos (
                        path, filename, directory, size_bytes, modified_at,
                        width, height, camera_make, camera_model, captured_at,
                        gps_latitude, gps_longitude, imported_at, decode_error
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                    params![
                        photo.path,
                        photo.filename,
                        photo.directory,
                        photo.size_bytes,
                        photo.modified_at,
                        photo.width,
                        photo.height,
                        photo.camera_make,
                        photo.camera_model,
                        photo.captured_at,
                        photo.gps_latitude,
                        photo.gps_longitude,
                        now_timestamp(),
                        photo.decode_error,
                    ],
                )?;
                Ok((conn.last_insert_rowid(), true))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Option<Photo>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS);
        match conn.query_row(&sql, [photo_id], photo_from_row) {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_photo_by_path(&self, path: &Path) -> Result<Option<Photo>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM photos WHERE path = ?", PHOTO_COLUMNS);
        let path_str = path.to_string_lossy();
        match conn.query_row(&sql, [path_str], photo_from_row) {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_photos(&self) -> Result<Vec<Photo>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM photos ORDER BY id", PHOTO_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let photos = stmt
            .query_map([], photo_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(photos)
    }

    /// Of the given photos, those still unprocessed and without a recorded
    /// decode failure, in id order
    pub fn pending_analysis(&self, photo_ids: &[i64]) -> Result<Vec<PendingPhoto>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, path FROM photos WHERE id = ? AND stage = 0 AND decode_error IS NULL",
        )?;

        let mut pending = Vec::new();
        for &id in photo_ids {
            match stmt.query_row([id], |row| {
                Ok(PendingPhoto {
                    id: row.get(0)?,
                    path: row.get(1)?,
                })
            }) {
                Ok(photo) => pending.push(photo),
                Err(rusqlite::Error::QueryReturnedNoRows) => {}
                Err(e) => return Err(e.into()),
            }
        }
        pending.sort_by_key(|p| p.id);
        Ok(pending)
    }

    /// Every imported photo that decoded successfully, for face-only rescans
    pub fn analyzable_photos(&self) -> Result<Vec<PendingPhoto>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, path FROM photos WHERE decode_error IS NULL ORDER BY id")?;
        let photos = stmt
            .query_map([], |row| {
                Ok(PendingPhoto {
                    id: row.get(0)?,
                    path: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(photos)
    }

    pub fn record_decode_error(&self, photo_id: i64, error: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE photos SET decode_error = ? WHERE id = ?",
            params![error, photo_id],
        )?;
        Ok(())
    }

    /// Record a failed stage without touching the rows of the stages that
    /// worked
    pub fn record_analysis_error(&self, photo_id: i64, error: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE photos SET analysis_error = ? WHERE id = ?",
            params![error, photo_id],
        )?;
        Ok(())
    }

    /// Advance the processing stage. A lower stage never overwrites a higher one.
    pub fn advance_stage(&self, photo_id: i64, stage: ProcessingStage) -> Result<()> {
        self.conn()?.execute(
            r#"
            UPDATE photos SET stage = MAX(stage, ?), analyzed_at = ?
            WHERE id = ?
            "#,
            params![stage.as_i64(), now_timestamp(), photo_id],
        )?;
        Ok(())
    }

    /// Explicit re-scan: send photos back to the unprocessed stage
    pub fn reset_stage(&self, photo_ids: &[i64]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for id in photo_ids {
            tx.execute(
                "UPDATE photos SET stage = 0, decode_error = NULL WHERE id = ?",
                [id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a photo and everything that hangs off it.
    /// Returns `None` when the photo does not exist.
    pub fn delete_photo(&self, photo_id: i64) -> Result<Option<DeletedPhoto>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM photos WHERE id = ?",
            [photo_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Ok(None);
        }

        let face_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM faces WHERE photo_id = ? AND embedding IS NOT NULL ORDER BY id",
            )?;
            let ids = stmt
                .query_map([photo_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let pet_object_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM objects WHERE photo_id = ? AND embedding IS NOT NULL ORDER BY id",
            )?;
            let ids = stmt
                .query_map([photo_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let had_image_embedding: i64 = tx.query_row(
            "SELECT COUNT(*) FROM image_embeddings WHERE photo_id = ?",
            [photo_id],
            |row| row.get(0),
        )?;

        // Dependent rows go through ON DELETE CASCADE
        tx.execute("DELETE FROM photos WHERE id = ?", [photo_id])?;
        tx.commit()?;

        Ok(Some(DeletedPhoto {
            photo_id,
            face_ids,
            pet_object_ids,
            had_image_embedding: had_image_embedding > 0,
        }))
    }

    pub fn statistics(&self) -> Result<Statistics> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

        Ok(Statistics {
            photos: count("SELECT COUNT(*) FROM photos")?,
            pending_photos: count(
                "SELECT COUNT(*) FROM photos WHERE stage = 0 AND decode_error IS NULL",
            )?,
            failed_photos: count("SELECT COUNT(*) FROM photos WHERE decode_error IS NOT NULL")?,
            faces: count("SELECT COUNT(*) FROM faces")?,
            unassigned_faces: count("SELECT COUNT(*) FROM faces WHERE person_id IS NULL")?,
            persons: count("SELECT COUNT(*) FROM persons")?,
            objects: count("SELECT COUNT(*) FROM objects")?,
            scenes: count("SELECT COUNT(*) FROM scenes")?,
            tags: count("SELECT COUNT(DISTINCT tag) FROM tags")?,
            places: count("SELECT COUNT(*) FROM places WHERE resolved = 1")?,
        })
    }
}

pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Convert f32 slice to bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::new_photo;

    #[test]
    fn test_upsert_photo_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let (id, inserted) = db.upsert_photo(&new_photo("/photos/a.jpg")).unwrap();
        assert!(inserted);

        let (again, inserted) = db.upsert_photo(&new_photo("/photos/a.jpg")).unwrap();
        assert_eq!(id, again);
        assert!(!inserted);
        assert_eq!(db.statistics().unwrap().photos, 1);
    }

    #[test]
    fn test_stage_never_regresses() {
        let db = Database::open_in_memory().unwrap();
        let (id, _) = db.upsert_photo(&new_photo("/photos/a.jpg")).unwrap();

        db.advance_stage(id, ProcessingStage::Full).unwrap();
        db.advance_stage(id, ProcessingStage::Basic).unwrap();
        assert_eq!(db.get_photo(id).unwrap().unwrap().stage, ProcessingStage::Full);

        // Re-import does not touch the stage either
        db.upsert_photo(&new_photo("/photos/a.jpg")).unwrap();
        assert_eq!(db.get_photo(id).unwrap().unwrap().stage, ProcessingStage::Full);

        db.reset_stage(&[id]).unwrap();
        assert_eq!(
            db.get_photo(id).unwrap().unwrap().stage,
            ProcessingStage::Unprocessed
        );
    }

    #[test]
    fn test_pending_analysis_skips_failed_and_processed() {
        let db = Database::open_in_memory().unwrap();
        let (a, _) = db.upsert_photo(&new_photo("/photos/a.jpg")).unwrap();
        let (b, _) = db.upsert_photo(&new_photo("/photos/b.jpg")).unwrap();
        let (c, _) = db.upsert_photo(&new_photo("/photos/c.jpg")).unwrap();

        db.record_decode_error(b, "corrupt").unwrap();
        db.advance_stage(c, ProcessingStage::Basic).unwrap();

        let pending = db.pending_analysis(&[c, b, a]).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a);

        let stats = db.statistics().unwrap();
        assert_eq!(stats.failed_photos, 1);
        assert_eq!(stats.pending_photos, 1);
    }

    #[test]
    fn test_bbox_iou() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        assert!((a.iou(&a) - 1.0).abs() < 0.001);

        let c = BoundingBox { x: 20, y: 20, width: 10, height: 10 };
        assert!(a.iou(&c).abs() < 0.001);
    }

    #[test]
    fn test_embedding_conversion() {
        let original = vec![1.5, -2.3, 0.0, 100.0];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes_to_embedding(&bytes), original);
    }
}
