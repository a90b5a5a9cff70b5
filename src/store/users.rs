//! User accounts.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub timezone: Option<String>,
    pub currency: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        email: row.get(1)?,
        display_name: row.get(2)?,
        timezone: row.get(3)?,
        currency: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        created_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const USER_COLUMNS: &str =
    "id, email, display_name, timezone, currency, is_active, created_at, updated_at";

impl Store {
    pub fn get_user(&self, user_id: Uuid) -> anyhow::Result<Option<User>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id.to_string()],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    /// Case-insensitive lookup by email, matching the unique-email invariant.
    pub fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1 COLLATE NOCASE"),
                params![email],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_active_users(&self) -> anyhow::Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE is_active = 1"))?;
        let rows = stmt.query_map([], row_to_user)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Deactivate a user and, as a side effect, disable every rule they own
    /// that's still active. Returns the number of rules disabled. A user
    /// that's already inactive is a no-op (zero rules touched).
    pub fn deactivate_user(&self, user_id: Uuid) -> anyhow::Result<u64> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE users SET is_active = 0, updated_at = ?2 WHERE id = ?1 AND is_active = 1",
            params![user_id.to_string(), now],
        )?;
        if updated == 0 {
            return Ok(0);
        }
        self.disable_all_rules_for_user(user_id)
    }
}

#[cfg(test)]
pub(crate) fn insert_test_user(store: &Store, email: &str) -> anyhow::Result<Uuid> {
    let conn = store.conn()?;
    let id = Uuid::new_v4();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO users (id, email, hashed_password, is_active, created_at, updated_at)
         VALUES (?1, ?2, 'x', 1, ?3, ?3)",
        params![id.to_string(), email, now],
    )?;
    Ok(id)
}
