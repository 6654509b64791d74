//! Faces and the persons they are grouped into.

use anyhow::{anyhow, Result};
use rusqlite::params;

use super::{bytes_to_embedding, photo_from_row, BoundingBox, Database, Photo, PHOTO_COLUMNS};

/// Who set a face's person reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Cluster,
    /// Set by a merge or manual (un)assign; clustering leaves it alone
    User,
}

impl Assignment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Assignment::Cluster => "cluster",
            Assignment::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cluster" => Some(Assignment::Cluster),
            "user" => Some(Assignment::User),
            _ => None,
        }
    }
}

/// A detected face in a photo
#[derive(Debug, Clone)]
pub struct Face {
    pub id: i64,
    pub photo_id: i64,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub person_id: Option<i64>,
    pub assignment: Option<Assignment>,
}

/// The clustering view of a face
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub face_id: i64,
    pub photo_id: i64,
    pub confidence: f32,
    pub embedding: Vec<f32>,
    pub person_id: Option<i64>,
    pub locked: bool,
}

/// A person (cluster identity)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub id: i64,
    pub name: Option<String>,
    pub face_count: i64,
}

/// Target of a clustering assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonRef {
    Existing(i64),
    /// Index into the persons created by the same clustering pass
    New(usize),
}

/// Result of `merge_persons`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub moved_faces: usize,
    pub removed_persons: Vec<i64>,
}

fn face_from_row(row: &rusqlite::Row) -> rusqlite::Result<Face> {
    let assignment: Option<String> = row.get(8)?;
    Ok(Face {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        },
        confidence: row.get(6)?,
        person_id: row.get(7)?,
        assignment: assignment.as_deref().and_then(Assignment::from_str),
    })
}

impl Database {
    // ========================================================================
    // Faces
    // ========================================================================

    pub fn faces_for_photo(&self, photo_id: i64) -> Result<Vec<Face>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, person_id, assignment
            FROM faces WHERE photo_id = ? ORDER BY id
            "#,
        )?;
        let faces = stmt
            .query_map([photo_id], face_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    pub fn faces_for_person(&self, person_id: i64) -> Result<Vec<Face>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, person_id, assignment
            FROM faces WHERE person_id = ? ORDER BY id
            "#,
        )?;
        let faces = stmt
            .query_map([person_id], face_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    /// All faces with an embedding, ordered by id
    pub fn face_embeddings(&self) -> Result<Vec<FaceEmbedding>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, photo_id, confidence, embedding, person_id, assignment
            FROM faces WHERE embedding IS NOT NULL ORDER BY id
            "#,
        )?;
        let faces = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(3)?;
                let assignment: Option<String> = row.get(5)?;
                Ok(FaceEmbedding {
                    face_id: row.get(0)?,
                    photo_id: row.get(1)?,
                    confidence: row.get(2)?,
                    embedding: bytes_to_embedding(&bytes),
                    person_id: row.get(4)?,
                    locked: assignment.as_deref() == Some(Assignment::User.as_str()),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    pub fn face_embedding(&self, face_id: i64) -> Result<Option<Vec<f32>>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT embedding FROM faces WHERE id = ? AND embedding IS NOT NULL",
            [face_id],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(bytes) => Ok(Some(bytes_to_embedding(&bytes))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_face(&self, face_id: i64) -> Result<Option<Face>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            r#"
            SELECT id, photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence, person_id, assignment
            FROM faces WHERE id = ?
            "#,
            [face_id],
            face_from_row,
        );
        match result {
            Ok(face) => Ok(Some(face)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a wrong detection. Its person stays, even if now empty,
    /// until cleanup.
    pub fn delete_face(&self, face_id: i64) -> Result<bool> {
        let deleted = self.conn()?.execute("DELETE FROM faces WHERE id = ?", [face_id])?;
        Ok(deleted > 0)
    }

    /// Photos showing a person, in id order
    pub fn photos_of_person(&self, person_id: i64) -> Result<Vec<Photo>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM photos WHERE id IN (SELECT photo_id FROM faces WHERE person_id = ?) ORDER BY id",
            PHOTO_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let photos = stmt
            .query_map([person_id], photo_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(photos)
    }

    /// Manually assign a face to a person, or detach it with `None`.
    /// Either way the face is locked against clustering.
    pub fn assign_face(&self, face_id: i64, person_id: Option<i64>) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE faces SET person_id = ?, assignment = ? WHERE id = ?",
            params![person_id, Assignment::User.as_str(), face_id],
        )?;
        Ok(updated > 0)
    }

    /// Apply one clustering pass atomically. Creates `new_persons` unnamed
    /// persons and points each listed face at its target. Locked faces are
    /// skipped. Returns the ids of the created persons.
    pub fn apply_assignments(
        &self,
        new_persons: usize,
        assignments: &[(i64, Option<PersonRef>)],
    ) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut created = Vec::with_capacity(new_persons);
        for _ in 0..new_persons {
            tx.execute(
                "INSERT INTO persons (name, created_at) VALUES (NULL, ?)",
                [super::now_timestamp()],
            )?;
            created.push(tx.last_insert_rowid());
        }

        {
            let mut stmt = tx.prepare(
                r#"
                UPDATE faces SET person_id = ?, assignment = ?
                WHERE id = ? AND (assignment IS NULL OR assignment != 'user')
                "#,
            )?;
            for (face_id, target) in assignments {
                let person_id = match target {
                    Some(PersonRef::Existing(id)) => Some(*id),
                    Some(PersonRef::New(idx)) => Some(
                        *created
                            .get(*idx)
                            .ok_or_else(|| anyhow!("Unknown new person index {}", idx))?,
                    ),
                    None => None,
                };
                let assignment = person_id.map(|_| Assignment::Cluster.as_str());
                stmt.execute(params![person_id, assignment, face_id])?;
            }
        }

        tx.commit()?;
        Ok(created)
    }

    // ========================================================================
    // People management
    // ========================================================================

    pub fn create_person(&self, name: Option<&str>) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO persons (name, created_at) VALUES (?, ?)",
            params![name, super::now_timestamp()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_person(&self, person_id: i64) -> Result<Option<Person>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            r#"
            SELECT p.id, p.name, COUNT(f.id)
            FROM persons p
            LEFT JOIN faces f ON f.person_id = p.id
            WHERE p.id = ?
            GROUP BY p.id
            "#,
            [person_id],
            |row| {
                Ok(Person {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    face_count: row.get(2)?,
                })
            },
        );
        match result {
            Ok(person) => Ok(Some(person)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All persons with their derived face counts, largest first
    pub fn list_persons(&self) -> Result<Vec<Person>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id, p.name, COUNT(f.id) as face_count
            FROM persons p
            LEFT JOIN faces f ON f.person_id = p.id
            GROUP BY p.id
            ORDER BY face_count DESC, p.id
            "#,
        )?;
        let persons = stmt
            .query_map([], |row| {
                Ok(Person {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    face_count: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(persons)
    }

    /// Set the display name. A blank name clears it. Returns false if the
    /// person does not exist.
    pub fn rename_person(&self, person_id: i64, name: &str) -> Result<bool> {
        let trimmed = name.trim();
        let name = if trimmed.is_empty() { None } else { Some(trimmed) };
        let updated = self.conn()?.execute(
            "UPDATE persons SET name = ? WHERE id = ?",
            params![name, person_id],
        )?;
        Ok(updated > 0)
    }

    /// Repoint every face of each source person to `target`, then remove the
    /// sources. Sources that no longer exist are ignored, so repeating a merge
    /// is a no-op.
    pub fn merge_persons(&self, source_ids: &[i64], target_id: i64) -> Result<MergeOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let target_exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM persons WHERE id = ?",
            [target_id],
            |row| row.get(0),
        )?;
        if target_exists == 0 {
            return Err(anyhow!("Person {} does not exist", target_id));
        }

        let mut outcome = MergeOutcome::default();
        for &source_id in source_ids {
            if source_id == target_id {
                continue;
            }

            let moved = tx.execute(
                "UPDATE faces SET person_id = ?, assignment = 'user' WHERE person_id = ?",
                params![target_id, source_id],
            )?;
            let removed = tx.execute("DELETE FROM persons WHERE id = ?", [source_id])?;

            outcome.moved_faces += moved;
            if removed > 0 {
                outcome.removed_persons.push(source_id);
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Delete a person. Its faces are unassigned, or deleted outright when
    /// `with_faces` is set. Returns the ids of deleted faces that carried an
    /// embedding, or `None` if the person does not exist.
    pub fn delete_person(&self, person_id: i64, with_faces: bool) -> Result<Option<Vec<i64>>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM persons WHERE id = ?",
            [person_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Ok(None);
        }

        let mut deleted_faces = Vec::new();
        if with_faces {
            {
                let mut stmt = tx.prepare(
                    "SELECT id FROM faces WHERE person_id = ? AND embedding IS NOT NULL ORDER BY id",
                )?;
                deleted_faces = stmt
                    .query_map([person_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
            }
            tx.execute("DELETE FROM faces WHERE person_id = ?", [person_id])?;
        } else {
            tx.execute(
                "UPDATE faces SET person_id = NULL, assignment = NULL WHERE person_id = ?",
                [person_id],
            )?;
        }

        tx.execute("DELETE FROM persons WHERE id = ?", [person_id])?;
        tx.commit()?;
        Ok(Some(deleted_faces))
    }
}
