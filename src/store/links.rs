//! External account links (OAuth/static-token credentials a user has
//! connected for a provider). Access/refresh tokens are stored as opaque,
//! already-vault-encrypted strings — this module never sees plaintext.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAccountLink {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub external_user_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub token_type: Option<String>,
    pub scopes: Option<String>,
    pub token_metadata: Option<serde_json::Value>,
    pub connected_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, user_id, provider, external_user_id, access_token, refresh_token,
    access_token_expires_at, token_type, scopes, token_metadata, connected_at, created_at, updated_at";

fn parse_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| v.parse().ok())
}

fn row_to_link(row: &Row) -> rusqlite::Result<ExternalAccountLink> {
    let metadata_raw: Option<String> = row.get(9)?;
    Ok(ExternalAccountLink {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        provider: row.get(2)?,
        external_user_id: row.get(3)?,
        access_token: row.get(4)?,
        refresh_token: row.get(5)?,
        access_token_expires_at: parse_dt(row.get(6)?),
        token_type: row.get(7)?,
        scopes: row.get(8)?,
        token_metadata: metadata_raw.and_then(|s| serde_json::from_str(&s).ok()),
        connected_at: row.get::<_, String>(10)?.parse().unwrap_or_else(|_| Utc::now()),
        created_at: row.get::<_, String>(11)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(12)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    pub fn get_link(&self, id: Uuid) -> anyhow::Result<Option<ExternalAccountLink>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM external_account_links WHERE id = ?1"),
                params![id.to_string()],
                row_to_link,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_link(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> anyhow::Result<Option<ExternalAccountLink>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM external_account_links WHERE user_id = ?1 AND provider = ?2"
                ),
                params![user_id.to_string(), provider],
                row_to_link,
            )
            .optional()?;
        Ok(row)
    }

    /// Create or replace a user's link for a provider — reconnecting
    /// overwrites the previous credentials for that (user, provider) pair.
    /// `token_metadata` is merged in verbatim (not deep-merged with any
    /// existing value) matching `DiscogsImportService.connect_account`'s
    /// plain assignment in the source.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_link(
        &self,
        user_id: Uuid,
        provider: &str,
        external_user_id: &str,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        access_token_expires_at: Option<DateTime<Utc>>,
        token_type: Option<&str>,
        scopes: Option<&str>,
        token_metadata: Option<&serde_json::Value>,
    ) -> anyhow::Result<Uuid> {
        let conn = self.conn()?;
        let existing = self.find_link(user_id, provider)?;
        let now = Utc::now();
        let id = existing.as_ref().map(|l| l.id).unwrap_or_else(Uuid::new_v4);

        conn.execute(
            "INSERT INTO external_account_links (id, user_id, provider, external_user_id,
                access_token, refresh_token, access_token_expires_at, token_type, scopes,
                token_metadata, connected_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?11,?11)
             ON CONFLICT (user_id, provider) DO UPDATE SET
                external_user_id = excluded.external_user_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                access_token_expires_at = excluded.access_token_expires_at,
                token_type = excluded.token_type,
                scopes = excluded.scopes,
                token_metadata = excluded.token_metadata,
                connected_at = excluded.connected_at,
                updated_at = excluded.updated_at",
            params![
                id.to_string(),
                user_id.to_string(),
                provider,
                external_user_id,
                access_token,
                refresh_token,
                access_token_expires_at.map(|d| d.to_rfc3339()),
                token_type,
                scopes,
                token_metadata.map(|v| v.to_string()),
                now.to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Rewrite a link's stored access token in place, used to persist a
    /// lazy re-encryption after `TokenVault::decrypt` flags
    /// `requires_migration` (legacy plaintext or a retired key id).
    pub fn update_link_access_token(&self, id: Uuid, access_token: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE external_account_links SET access_token = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), access_token, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_link(&self, user_id: Uuid, provider: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM external_account_links WHERE user_id = ?1 AND provider = ?2",
            params![user_id.to_string(), provider],
        )?;
        Ok(())
    }
}
