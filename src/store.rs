#![forbid(unsafe_code)]

//! Durable job records.
//!
//! When `DATABASE_URL` points at a local SQLite file the registry writes
//! every job transition here so the job list survives restarts.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};

use crate::jobs::{Job, JobStatus};

async fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode answers with the resulting mode, so it cannot go through
    // `execute`.
    let mut rows = conn.query("PRAGMA journal_mode=WAL", params![]).await?;
    while rows.next().await?.is_some() {}
    conn.execute("PRAGMA synchronous=NORMAL", params![]).await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS download_jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            url TEXT NOT NULL,
            metadata_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            progress REAL,
            message TEXT NOT NULL DEFAULT '',
            file_path TEXT,
            error_details TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_download_jobs_created ON download_jobs(created_at);
        "#,
    )
    .await?;
    Ok(())
}

#[derive(Clone)]
pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    /// Opens (and if necessary creates) the job database.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating job store directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening job store {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn upsert_job(&self, job: &Job) -> Result<()> {
        let metadata_json = job
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serializing job metadata")?;

        self.conn
            .execute(
                r#"
                INSERT INTO download_jobs (
                    id, status, url, metadata_json, created_at, updated_at,
                    progress, message, file_path, error_details
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    metadata_json = excluded.metadata_json,
                    updated_at = excluded.updated_at,
                    progress = excluded.progress,
                    message = excluded.message,
                    file_path = excluded.file_path,
                    error_details = excluded.error_details
                "#,
                params![
                    job.id.as_str(),
                    job.status.as_str(),
                    job.url.as_str(),
                    metadata_json,
                    format_timestamp(&job.created_at),
                    format_timestamp(&job.updated_at),
                    job.progress,
                    job.message.as_str(),
                    job.file_path.as_deref(),
                    job.error_details.as_deref(),
                ],
            )
            .await
            .with_context(|| format!("persisting job {}", job.id))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, status, url, metadata_json, created_at, updated_at,
                       progress, message, file_path, error_details
                FROM download_jobs
                WHERE id = ?1
                "#,
            )
            .await?;
        let mut rows = stmt.query([id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Every stored job, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT id, status, url, metadata_json, created_at, updated_at,
                       progress, message, file_path, error_details
                FROM download_jobs
                ORDER BY created_at ASC, rowid ASC
                "#,
            )
            .await?;
        let mut rows = stmt.query(params![]).await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// Column order must match the SELECT statements above.
fn row_to_job(row: &Row) -> Result<Job> {
    let status: String = row.get(1)?;
    let metadata_json: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Job {
        id: row.get(0)?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("unknown job status {status}"))?,
        url: row.get(2)?,
        metadata: metadata_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .context("decoding job metadata")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        progress: row.get(6)?,
        message: row.get(7)?,
        file_path: row.get(8)?,
        error_details: row.get(9)?,
    })
}

// Fixed-width so text ordering matches chronological ordering.
fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp {value}"))?
        .with_timezone(&Utc))
}
