//! Watch rules (persistent saved searches) and the due-rule claim query.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;

/// The structured shape of `WatchRule.query`. Stored as JSON on disk but
/// validated at the boundary (see [`crate::rules::validation`]) rather than
/// passed around as a schemaless map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleQuery {
    pub keywords: Vec<String>,
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub query: RuleQuery,
    pub is_active: bool,
    pub poll_interval_seconds: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, user_id, name, query, is_active, poll_interval_seconds,
    last_run_at, next_run_at, created_at, updated_at";

fn parse_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| v.parse().ok())
}

fn row_to_rule(row: &Row) -> rusqlite::Result<WatchRule> {
    let query_raw: String = row.get(3)?;
    let query: RuleQuery = serde_json::from_str(&query_raw).unwrap_or(RuleQuery {
        keywords: vec![],
        sources: vec![],
        max_price: None,
        min_condition: None,
        currency: None,
    });
    Ok(WatchRule {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        name: row.get(2)?,
        query,
        is_active: row.get::<_, i64>(4)? != 0,
        poll_interval_seconds: row.get(5)?,
        last_run_at: parse_dt(row.get(6)?),
        next_run_at: parse_dt(row.get(7)?),
        created_at: row.get::<_, String>(8)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(9)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    pub fn insert_rule(&self, rule: &WatchRule) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO watch_search_rules (id, user_id, name, query, is_active,
                poll_interval_seconds, last_run_at, next_run_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                rule.id.to_string(),
                rule.user_id.to_string(),
                rule.name,
                serde_json::to_string(&rule.query)?,
                rule.is_active as i64,
                rule.poll_interval_seconds,
                rule.last_run_at.map(|d| d.to_rfc3339()),
                rule.next_run_at.map(|d| d.to_rfc3339()),
                rule.created_at.to_rfc3339(),
                rule.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_rule(&self, id: Uuid) -> anyhow::Result<Option<WatchRule>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM watch_search_rules WHERE id = ?1"),
                params![id.to_string()],
                row_to_rule,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_rule_for_user(&self, user_id: Uuid, id: Uuid) -> anyhow::Result<Option<WatchRule>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM watch_search_rules WHERE id = ?1 AND user_id = ?2"),
                params![id.to_string(), user_id.to_string()],
                row_to_rule,
            )
            .optional()?;
        Ok(row)
    }

    /// Claim up to `batch_size` due rules by stamping a one-shot claim token
    /// in a single statement, then selecting exactly the rows that carry it.
    /// SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`; its single-writer
    /// WAL model makes this single-statement UPDATE the best-effort
    /// equivalent for backends without skip-locked support.
    pub fn claim_due_rules(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> anyhow::Result<Vec<WatchRule>> {
        let conn = self.conn()?;
        let claim_token = Uuid::new_v4().to_string();
        let now_s = now.to_rfc3339();

        conn.execute(
            "UPDATE watch_search_rules
             SET claim_token = ?1
             WHERE id IN (
                 SELECT id FROM watch_search_rules
                 WHERE is_active = 1
                   AND claim_token IS NULL
                   AND (next_run_at IS NULL OR next_run_at <= ?2)
                 ORDER BY next_run_at ASC, created_at ASC
                 LIMIT ?3
             )",
            params![claim_token, now_s, batch_size],
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM watch_search_rules WHERE claim_token = ?1
             ORDER BY next_run_at ASC, created_at ASC"
        ))?;
        let rows = stmt.query_map(params![claim_token], row_to_rule)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Release a rule's claim and record the scheduler's run outcome.
    pub fn complete_rule_claim(
        &self,
        rule_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
        touch_last_run: bool,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        if touch_last_run {
            conn.execute(
                "UPDATE watch_search_rules
                 SET claim_token = NULL, last_run_at = ?2, next_run_at = ?3, updated_at = ?2
                 WHERE id = ?1",
                params![rule_id.to_string(), last_run_at.to_rfc3339(), next_run_at.to_rfc3339()],
            )?;
        } else {
            conn.execute(
                "UPDATE watch_search_rules
                 SET claim_token = NULL, next_run_at = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![rule_id.to_string(), next_run_at.to_rfc3339(), last_run_at.to_rfc3339()],
            )?;
        }
        Ok(())
    }

    pub fn set_rule_active(&self, id: Uuid, is_active: bool) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE watch_search_rules SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), is_active as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_active_rules_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<WatchRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM watch_search_rules WHERE user_id = ?1 AND is_active = 1"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], row_to_rule)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_active_rules_for_all_users(&self) -> anyhow::Result<Vec<WatchRule>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM watch_search_rules WHERE is_active = 1"))?;
        let rows = stmt.query_map([], row_to_rule)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Disable every active rule owned by a user, e.g. as a side effect of
    /// deactivating the user.
    pub fn disable_all_rules_for_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE watch_search_rules SET is_active = 0, updated_at = ?2
             WHERE user_id = ?1 AND is_active = 1",
            params![user_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::users::insert_test_user;

    fn sample_rule(user_id: Uuid) -> WatchRule {
        let now = Utc::now();
        WatchRule {
            id: Uuid::new_v4(),
            user_id,
            name: "Primus vinyl".into(),
            query: RuleQuery {
                keywords: vec!["primus".into(), "vinyl".into()],
                sources: vec!["discogs".into()],
                max_price: Some(70.0),
                min_condition: None,
                currency: Some("USD".into()),
            },
            is_active: true,
            poll_interval_seconds: 600,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn claim_marks_due_rules_and_excludes_claimed() {
        let store = Store::open_in_memory().unwrap();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        let rule = sample_rule(user_id);
        store.insert_rule(&rule).unwrap();

        let claimed = store.claim_due_rules(Utc::now(), 10).unwrap();
        assert_eq!(claimed.len(), 1);

        // still claimed: a second claim attempt sees nothing until released
        let claimed_again = store.claim_due_rules(Utc::now(), 10).unwrap();
        assert_eq!(claimed_again.len(), 0);

        store
            .complete_rule_claim(rule.id, Utc::now(), Utc::now() + chrono::Duration::seconds(600), true)
            .unwrap();
        let reloaded = store.get_rule(rule.id).unwrap().unwrap();
        assert!(reloaded.last_run_at.is_some());
        assert!(reloaded.next_run_at.unwrap() > reloaded.last_run_at.unwrap());
    }
}
