//! Scan job history, mirrored from the in-memory job tracker.

use anyhow::Result;
use rusqlite::params;

use super::Database;

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub kind: String,
    pub folder: Option<String>,
    pub status: String,
    pub phase: String,
    pub progress: f64,
    pub message: String,
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl Database {
    pub fn save_job(&self, job: &JobRecord) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO scan_jobs (id, kind, folder, status, phase, progress, message,
                                   total, processed, failed, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                phase = excluded.phase,
                progress = excluded.progress,
                message = excluded.message,
                total = excluded.total,
                processed = excluded.processed,
                failed = excluded.failed,
                finished_at = excluded.finished_at
            "#,
            params![
                job.id,
                job.kind,
                job.folder,
                job.status,
                job.phase,
                job.progress,
                job.message,
                job.total,
                job.processed,
                job.failed,
                job.started_at,
                job.finished_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        self.query_job("WHERE id = ?", Some(id))
    }

    pub fn latest_job(&self) -> Result<Option<JobRecord>> {
        self.query_job("ORDER BY started_at DESC, rowid DESC LIMIT 1", None)
    }

    fn query_job(&self, clause: &str, id: Option<&str>) -> Result<Option<JobRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            r#"
            SELECT id, kind, folder, status, phase, progress, message,
                   total, processed, failed, started_at, finished_at
            FROM scan_jobs {}
            "#,
            clause
        );
        let map = |row: &rusqlite::Row| {
            Ok(JobRecord {
                id: row.get(0)?,
                kind: row.get(1)?,
                folder: row.get(2)?,
                status: row.get(3)?,
                phase: row.get(4)?,
                progress: row.get(5)?,
                message: row.get(6)?,
                total: row.get(7)?,
                processed: row.get(8)?,
                failed: row.get(9)?,
                started_at: row.get(10)?,
                finished_at: row.get(11)?,
            })
        };
        let result = match id {
            Some(id) => conn.query_row(&sql, [id], map),
            None => conn.query_row(&sql, [], map),
        };
        match result {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
