//! Watch matches: the join between a rule and a listing it satisfied.
//! Uniqueness on (rule_id, listing_id) is the idempotency key match
//! creation depends on.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use super::Store;

impl Store {
    pub fn find_match(&self, rule_id: Uuid, listing_id: Uuid) -> anyhow::Result<Option<Uuid>> {
        let conn = self.conn()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM watch_matches WHERE rule_id = ?1 AND listing_id = ?2",
                params![rule_id.to_string(), listing_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
    }

    /// Insert a match row. Returns `false` (no-op) if the unique constraint
    /// on (rule_id, listing_id) rejects it — a concurrent creation won; the
    /// caller treats that as "already done".
    pub fn insert_match_if_absent(
        &self,
        rule_id: Uuid,
        listing_id: Uuid,
        matched_at: DateTime<Utc>,
        match_context: Option<&Value>,
    ) -> anyhow::Result<Option<Uuid>> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let result = conn.execute(
            "INSERT OR IGNORE INTO watch_matches (id, rule_id, listing_id, matched_at, match_context)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                id.to_string(),
                rule_id.to_string(),
                listing_id.to_string(),
                matched_at.to_rfc3339(),
                match_context.map(|v| v.to_string()),
            ],
        )?;
        if result == 0 {
            Ok(None)
        } else {
            Ok(Some(id))
        }
    }

    pub fn count_matches_for_rule(&self, rule_id: Uuid) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM watch_matches WHERE rule_id = ?1",
            params![rule_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
