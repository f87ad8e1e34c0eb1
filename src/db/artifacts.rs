//! Artifact registry: files a job produced, plus its receipt.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::Result;
use crate::model::{Artifact, JobId};

/// Fields for registering a finished artifact.
pub(crate) struct ArtifactInsert<'a> {
    pub job_id: &'a JobId,
    pub name: &'a str,
    pub path: &'a str,
    pub artifact_type: &'a str,
    pub size_bytes: Option<i64>,
    pub sha256: Option<&'a str>,
}

impl super::Db {
    /// All artifacts registered for a job, in registration order.
    pub async fn artifacts(&self, job_id: &JobId) -> Result<Vec<Artifact>> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(
            "SELECT id, job_id, name, path, artifact_type, size_bytes, sha256, status,
                    created_at, verified_at
             FROM artifacts WHERE job_id = ?1 ORDER BY id ASC",
        )
        .bind(job_id.as_str())
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(ArtifactRow::into_artifact).collect())
    }
}

/// Register an artifact whose bytes are already on disk and hashed.
pub(crate) async fn register_artifact_on(
    conn: &mut SqliteConnection,
    artifact: ArtifactInsert<'_>,
    at: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO artifacts (
            job_id, name, path, artifact_type, size_bytes, sha256, status, created_at, verified_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'complete', ?7, ?7)",
    )
    .bind(artifact.job_id.as_str())
    .bind(artifact.name)
    .bind(artifact.path)
    .bind(artifact.artifact_type)
    .bind(artifact.size_bytes)
    .bind(artifact.sha256)
    .bind(at)
    .execute(conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: i64,
    job_id: String,
    name: String,
    path: String,
    artifact_type: String,
    size_bytes: Option<i64>,
    sha256: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    verified_at: Option<DateTime<Utc>>,
}

impl ArtifactRow {
    fn into_artifact(self) -> Artifact {
        Artifact {
            id: self.id,
            job_id: JobId::from(self.job_id),
            name: self.name,
            path: self.path,
            artifact_type: self.artifact_type,
            size_bytes: self.size_bytes,
            sha256: self.sha256,
            status: self.status,
            created_at: self.created_at,
            verified_at: self.verified_at,
        }
    }
}
