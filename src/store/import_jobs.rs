//! Discogs (or other provider) wantlist/collection import jobs. Single-flight
//! admission is enforced by `uq_import_jobs_active_scope` — at most one
//! pending/running job per (user, provider, scope).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ImportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Pending => "pending",
            ImportJobStatus::Running => "running",
            ImportJobStatus::Completed => "completed",
            ImportJobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => ImportJobStatus::Running,
            "completed" => ImportJobStatus::Completed,
            "failed" => ImportJobStatus::Failed,
            _ => ImportJobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportScope {
    Wantlist,
    Collection,
    Both,
}

impl ImportScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportScope::Wantlist => "wantlist",
            ImportScope::Collection => "collection",
            ImportScope::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "collection" => ImportScope::Collection,
            "both" => ImportScope::Both,
            _ => ImportScope::Wantlist,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_account_link_id: Option<Uuid>,
    pub provider: String,
    pub import_scope: ImportScope,
    pub status: ImportJobStatus,
    pub cursor: Option<String>,
    pub page: i64,
    pub processed_count: i64,
    pub imported_count: i64,
    pub created_count: i64,
    pub updated_count: i64,
    pub error_count: i64,
    pub errors: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, user_id, external_account_link_id, provider, import_scope, status,
    cursor, page, processed_count, imported_count, created_count, updated_count, error_count,
    errors, started_at, completed_at, created_at, updated_at";

fn parse_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| v.parse().ok())
}

fn row_to_job(row: &Row) -> rusqlite::Result<ImportJob> {
    let errors_raw: Option<String> = row.get(13)?;
    Ok(ImportJob {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        external_account_link_id: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        provider: row.get(3)?,
        import_scope: ImportScope::from_str(&row.get::<_, String>(4)?),
        status: ImportJobStatus::from_str(&row.get::<_, String>(5)?),
        cursor: row.get(6)?,
        page: row.get(7)?,
        processed_count: row.get(8)?,
        imported_count: row.get(9)?,
        created_count: row.get(10)?,
        updated_count: row.get(11)?,
        error_count: row.get(12)?,
        errors: errors_raw.and_then(|s| serde_json::from_str(&s).ok()),
        started_at: parse_dt(row.get(14)?),
        completed_at: parse_dt(row.get(15)?),
        created_at: row.get::<_, String>(16)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(17)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    pub fn get_import_job(&self, id: Uuid) -> anyhow::Result<Option<ImportJob>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM import_jobs WHERE id = ?1"),
                params![id.to_string()],
                row_to_job,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_active_import_job(
        &self,
        user_id: Uuid,
        provider: &str,
        import_scope: ImportScope,
    ) -> anyhow::Result<Option<ImportJob>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM import_jobs
                     WHERE user_id = ?1 AND provider = ?2 AND import_scope = ?3
                       AND status IN ('pending', 'running')"
                ),
                params![user_id.to_string(), provider, import_scope.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(row)
    }

    /// Find a recently completed job within `cooldown_seconds`, used to
    /// short-circuit re-running an import that just finished.
    pub fn find_recent_completed_import_job(
        &self,
        user_id: Uuid,
        provider: &str,
        import_scope: ImportScope,
        cooldown_seconds: i64,
    ) -> anyhow::Result<Option<ImportJob>> {
        let conn = self.conn()?;
        let cutoff = (Utc::now() - chrono::Duration::seconds(cooldown_seconds)).to_rfc3339();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM import_jobs
                     WHERE user_id = ?1 AND provider = ?2 AND import_scope = ?3
                       AND status = 'completed' AND completed_at >= ?4
                     ORDER BY completed_at DESC LIMIT 1"
                ),
                params![user_id.to_string(), provider, import_scope.as_str(), cutoff],
                row_to_job,
            )
            .optional()?;
        Ok(row)
    }

    /// Create a new pending job. Relies on `uq_import_jobs_active_scope` to
    /// reject concurrent creation for the same (user, provider, scope); the
    /// caller should treat a unique-constraint error as "already admitted"
    /// and re-query [`find_active_import_job`].
    pub fn insert_import_job(
        &self,
        user_id: Uuid,
        external_account_link_id: Option<Uuid>,
        provider: &str,
        import_scope: ImportScope,
    ) -> anyhow::Result<Uuid> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO import_jobs (id, user_id, external_account_link_id, provider,
                import_scope, status, page, processed_count, imported_count, created_count,
                updated_count, error_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,'pending',1,0,0,0,0,0,?6,?6)",
            params![
                id.to_string(),
                user_id.to_string(),
                external_account_link_id.map(|u| u.to_string()),
                provider,
                import_scope.as_str(),
                now,
            ],
        )?;
        Ok(id)
    }

    pub fn mark_import_job_running(&self, id: Uuid) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE import_jobs SET status = 'running', started_at = ?2, updated_at = ?2
             WHERE id = ?1",
            params![id.to_string(), now],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_import_job_progress(
        &self,
        id: Uuid,
        page: i64,
        processed_count: i64,
        imported_count: i64,
        created_count: i64,
        updated_count: i64,
        error_count: i64,
        cursor: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE import_jobs SET page = ?2, processed_count = ?3, imported_count = ?4,
                created_count = ?5, updated_count = ?6, error_count = ?7, cursor = ?8,
                updated_at = ?9
             WHERE id = ?1",
            params![
                id.to_string(),
                page,
                processed_count,
                imported_count,
                created_count,
                updated_count,
                error_count,
                cursor,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn complete_import_job(
        &self,
        id: Uuid,
        errors: Option<&serde_json::Value>,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE import_jobs SET status = 'completed', completed_at = ?2, errors = ?3,
                updated_at = ?2
             WHERE id = ?1",
            params![id.to_string(), now, errors.map(|v| v.to_string())],
        )?;
        Ok(())
    }

    pub fn fail_import_job(&self, id: Uuid, error_message: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let errors = serde_json::json!([{"message": error_message}]);
        conn.execute(
            "UPDATE import_jobs SET status = 'failed', completed_at = ?2, errors = ?3,
                updated_at = ?2
             WHERE id = ?1",
            params![id.to_string(), now, errors.to_string()],
        )?;
        Ok(())
    }

    pub fn list_import_jobs_for_user(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<ImportJob>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM import_jobs WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string(), limit], row_to_job)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
