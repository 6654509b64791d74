//! User tags. Only explicit user actions write here.

use anyhow::{anyhow, Result};
use rusqlite::params;

use super::Database;

fn normalize_tag(tag: &str) -> Result<String> {
    let tag = tag.trim().to_lowercase();
    if tag.is_empty() {
        return Err(anyhow!("Tag must not be empty"));
    }
    Ok(tag)
}

impl Database {
    /// Attach a tag to a photo. Returns false if it was already attached.
    pub fn add_tag(&self, photo_id: i64, tag: &str) -> Result<bool> {
        let tag = normalize_tag(tag)?;
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO tags (photo_id, tag) VALUES (?, ?)",
            params![photo_id, tag],
        )?;
        Ok(inserted > 0)
    }

    pub fn remove_tag(&self, photo_id: i64, tag: &str) -> Result<bool> {
        let tag = normalize_tag(tag)?;
        let removed = self.conn()?.execute(
            "DELETE FROM tags WHERE photo_id = ? AND tag = ?",
            params![photo_id, tag],
        )?;
        Ok(removed > 0)
    }

    pub fn tags_for_photo(&self, photo_id: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT tag FROM tags WHERE photo_id = ? ORDER BY tag")?;
        let tags = stmt
            .query_map([photo_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }

    pub fn photos_with_tag(&self, tag: &str) -> Result<Vec<i64>> {
        let tag = normalize_tag(tag)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT photo_id FROM tags WHERE tag = ? ORDER BY photo_id")?;
        let ids = stmt
            .query_map([tag], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Every tag with the number of photos carrying it
    pub fn all_tags(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT tag, COUNT(*) FROM tags GROUP BY tag ORDER BY COUNT(*) DESC, tag")?;
        let tags = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }
}
