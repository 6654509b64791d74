//! Orphan queries used by the periodic cleanup pass.

use anyhow::Result;
use std::path::Path;

use super::Database;

#[derive(Debug, Clone, PartialEq)]
pub struct OrphanPerson {
    pub id: i64,
    pub name: Option<String>,
}

/// Rows removed by `delete_orphan_rows`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanRows {
    pub faces: usize,
    pub objects: usize,
    pub scenes: usize,
    pub places: usize,
}

impl Database {
    /// Persons no face points at
    pub fn orphan_persons(&self) -> Result<Vec<OrphanPerson>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id, p.name FROM persons p
            WHERE NOT EXISTS (SELECT 1 FROM faces f WHERE f.person_id = p.id)
            ORDER BY p.id
            "#,
        )?;
        let persons = stmt
            .query_map([], |row| {
                Ok(OrphanPerson {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(persons)
    }

    pub fn delete_orphan_persons(&self) -> Result<Vec<i64>> {
        let orphans: Vec<i64> = self.orphan_persons()?.into_iter().map(|p| p.id).collect();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for id in &orphans {
            // Recheck inside the transaction in case a face was assigned meanwhile
            tx.execute(
                r#"
                DELETE FROM persons WHERE id = ?
                AND NOT EXISTS (SELECT 1 FROM faces f WHERE f.person_id = persons.id)
                "#,
                [id],
            )?;
        }
        tx.commit()?;
        Ok(orphans)
    }

    /// Remove dependent rows whose photo is gone. Only finds anything on
    /// databases written without foreign key enforcement.
    pub fn delete_orphan_rows(&self) -> Result<OrphanRows> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let orphans = OrphanRows {
            faces: tx.execute(
                "DELETE FROM faces WHERE photo_id NOT IN (SELECT id FROM photos)",
                [],
            )?,
            objects: tx.execute(
                "DELETE FROM objects WHERE photo_id NOT IN (SELECT id FROM photos)",
                [],
            )?,
            scenes: tx.execute(
                "DELETE FROM scenes WHERE photo_id NOT IN (SELECT id FROM photos)",
                [],
            )?,
            places: tx.execute(
                "DELETE FROM places WHERE photo_id NOT IN (SELECT id FROM photos)",
                [],
            )?,
        };
        tx.execute(
            "DELETE FROM captions WHERE photo_id NOT IN (SELECT id FROM photos)",
            [],
        )?;
        tx.execute(
            "DELETE FROM image_embeddings WHERE photo_id NOT IN (SELECT id FROM photos)",
            [],
        )?;
        tx.execute(
            "DELETE FROM tags WHERE photo_id NOT IN (SELECT id FROM photos)",
            [],
        )?;
        tx.commit()?;
        Ok(orphans)
    }

    /// Photos whose file is no longer on disk
    pub fn missing_photo_files(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, path FROM photos ORDER BY id")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows
            .into_iter()
            .filter(|(_, path)| !Path::new(path).exists())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::faces::PersonRef;
    use crate::db::{AnalysisRecord, BoundingBox, DetectedFaceRow};
    use crate::testing::new_photo;

    #[test]
    fn test_orphan_person_after_photo_delete() {
        let db = Database::open_in_memory().unwrap();
        let (photo_id, _) = db.upsert_photo(&new_photo("/photos/solo.jpg")).unwrap();
        let saved = db
            .save_analysis(
                photo_id,
                &AnalysisRecord {
                    faces: Some(vec![DetectedFaceRow {
                        bbox: BoundingBox { x: 0, y: 0, width: 20, height: 20 },
                        confidence: 0.9,
                        embedding: Some(vec![1.0, 0.0]),
                    }]),
                    ..Default::default()
                },
            )
            .unwrap();
        let created = db
            .apply_assignments(1, &[(saved.face_ids[0], Some(PersonRef::New(0)))])
            .unwrap();
        assert!(db.orphan_persons().unwrap().is_empty());

        let deleted = db.delete_photo(photo_id).unwrap().unwrap();
        assert_eq!(deleted.face_ids, saved.face_ids);

        let orphans = db.orphan_persons().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, created[0]);

        assert_eq!(db.delete_orphan_persons().unwrap(), created);
        assert_eq!(db.statistics().unwrap().persons, 0);
    }

    #[test]
    fn test_missing_photo_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.jpg");
        std::fs::write(&present, b"x").unwrap();

        let db = Database::open_in_memory().unwrap();
        db.upsert_photo(&new_photo(present.to_str().unwrap())).unwrap();
        let (gone, _) = db
            .upsert_photo(&new_photo(dir.path().join("gone.jpg").to_str().unwrap()))
            .unwrap();

        let missing = db.missing_photo_files().unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, gone);
    }
}
