//! Reverse-geocoded places attached to photos.

use anyhow::Result;
use rusqlite::params;

use super::Database;

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceRecord {
    pub photo_id: i64,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub resolved: bool,
}

/// A resolved place with the number of photos taken there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceSummary {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub photo_count: i64,
}

impl Database {
    /// Photos with GPS coordinates that have not been geocoded yet
    pub fn photos_needing_geocode(&self, limit: usize) -> Result<Vec<(i64, f64, f64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id, p.gps_latitude, p.gps_longitude
            FROM photos p
            LEFT JOIN places pl ON pl.photo_id = p.id
            WHERE p.gps_latitude IS NOT NULL AND p.gps_longitude IS NOT NULL
              AND pl.photo_id IS NULL
            ORDER BY p.id
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn save_place(&self, place: &PlaceRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT OR REPLACE INTO places (photo_id, city, region, country, resolved, geocoded_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            "#,
            params![
                place.photo_id,
                place.city,
                place.region,
                place.country,
                place.resolved,
            ],
        )?;
        Ok(())
    }

    pub fn place_for_photo(&self, photo_id: i64) -> Result<Option<PlaceRecord>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT photo_id, city, region, country, resolved FROM places WHERE photo_id = ?",
            [photo_id],
            |row| {
                Ok(PlaceRecord {
                    photo_id: row.get(0)?,
                    city: row.get(1)?,
                    region: row.get(2)?,
                    country: row.get(3)?,
                    resolved: row.get(4)?,
                })
            },
        );
        match result {
            Ok(place) => Ok(Some(place)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolved places, most photographed first
    pub fn top_places(&self, limit: usize) -> Result<Vec<PlaceSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT city, region, country, COUNT(*) FROM places
            WHERE resolved = 1
            GROUP BY city, region, country
            ORDER BY COUNT(*) DESC, country, region, city
            LIMIT ?
            "#,
        )?;
        let places = stmt
            .query_map([limit as i64], |row| {
                Ok(PlaceSummary {
                    city: row.get(0)?,
                    region: row.get(1)?,
                    country: row.get(2)?,
                    photo_count: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(places)
    }

    /// Photos whose city, region or country is `name`, ignoring case
    pub fn photos_at_place(&self, name: &str) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT photo_id FROM places
            WHERE resolved = 1
              AND (city = ?1 COLLATE NOCASE OR region = ?1 COLLATE NOCASE OR country = ?1 COLLATE NOCASE)
            ORDER BY photo_id
            "#,
        )?;
        let ids = stmt
            .query_map([name.trim()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Photos with no usable location: no GPS, or GPS that did not resolve.
    /// Photos still waiting for geocoding are not included.
    pub fn photos_without_place(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id FROM photos p
            LEFT JOIN places pl ON pl.photo_id = p.id
            WHERE p.gps_latitude IS NULL OR p.gps_longitude IS NULL OR pl.resolved = 0
            ORDER BY p.id
            "#,
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }
}
