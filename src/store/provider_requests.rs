//! Audit trail of outbound provider HTTP calls — one row per attempt.

use chrono::Utc;
use rusqlite::{params, Row};
use uuid::Uuid;

use super::Store;
use crate::providers::ProviderRequestLog;

fn row_to_log(row: &Row) -> rusqlite::Result<ProviderRequestLog> {
    Ok(ProviderRequestLog {
        provider: row.get(0)?,
        endpoint: row.get(1)?,
        method: row.get(2)?,
        status_code: row.get(3)?,
        duration_ms: row.get(4)?,
        error: row.get(5)?,
        attempt: 0,
        total_attempts: 0,
        retry_after_seconds: None,
        rate_limit_remaining: None,
        upstream_request_id: None,
    })
}

impl Store {
    pub fn record_provider_request(
        &self,
        user_id: Option<Uuid>,
        log: &ProviderRequestLog,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let meta = serde_json::json!({
            "attempt": log.attempt,
            "total_attempts": log.total_attempts,
            "retry_after_seconds": log.retry_after_seconds,
            "rate_limit_remaining": log.rate_limit_remaining,
            "upstream_request_id": log.upstream_request_id,
        });
        conn.execute(
            "INSERT INTO provider_requests (id, user_id, provider, endpoint, method,
                status_code, duration_ms, error, meta, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                Uuid::new_v4().to_string(),
                user_id.map(|u| u.to_string()),
                log.provider,
                log.endpoint,
                log.method,
                log.status_code,
                log.duration_ms,
                log.error,
                meta.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_recent_provider_requests(
        &self,
        provider: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<ProviderRequestLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT provider, endpoint, method, status_code, duration_ms, error
             FROM provider_requests WHERE provider = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![provider, limit], row_to_log)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
