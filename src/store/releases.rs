//! Watch releases: specific Discogs records a user wants to track.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    ExactRelease,
    MasterRelease,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::ExactRelease => "exact_release",
            MatchMode::MasterRelease => "master_release",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "master_release" => MatchMode::MasterRelease,
            _ => MatchMode::ExactRelease,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchRelease {
    pub id: Uuid,
    pub user_id: Uuid,
    pub discogs_release_id: i64,
    pub discogs_master_id: Option<i64>,
    pub match_mode: MatchMode,
    pub title: String,
    pub artist: Option<String>,
    pub year: Option<i64>,
    pub target_price: Option<f64>,
    pub currency: String,
    pub min_condition: Option<String>,
    pub is_active: bool,
    pub imported_from_wantlist: bool,
    pub imported_from_collection: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, user_id, discogs_release_id, discogs_master_id, match_mode, title,
    artist, year, target_price, currency, min_condition, is_active, imported_from_wantlist,
    imported_from_collection, created_at, updated_at";

fn row_to_release(row: &Row) -> rusqlite::Result<WatchRelease> {
    Ok(WatchRelease {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        discogs_release_id: row.get(2)?,
        discogs_master_id: row.get(3)?,
        match_mode: MatchMode::from_str(&row.get::<_, String>(4)?),
        title: row.get(5)?,
        artist: row.get(6)?,
        year: row.get(7)?,
        target_price: row.get(8)?,
        currency: row.get(9)?,
        min_condition: row.get(10)?,
        is_active: row.get::<_, i64>(11)? != 0,
        imported_from_wantlist: row.get::<_, i64>(12)? != 0,
        imported_from_collection: row.get::<_, i64>(13)? != 0,
        created_at: row.get::<_, String>(14)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(15)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    pub fn get_release(&self, id: Uuid) -> anyhow::Result<Option<WatchRelease>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM watch_releases WHERE id = ?1"),
                params![id.to_string()],
                row_to_release,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_release_by_discogs_release_id(
        &self,
        user_id: Uuid,
        discogs_release_id: i64,
    ) -> anyhow::Result<Option<WatchRelease>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM watch_releases
                     WHERE user_id = ?1 AND discogs_release_id = ?2"
                ),
                params![user_id.to_string(), discogs_release_id],
                row_to_release,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_active_releases_for_user(&self, user_id: Uuid) -> anyhow::Result<Vec<WatchRelease>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM watch_releases WHERE user_id = ?1 AND is_active = 1"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], row_to_release)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_imported_releases_for_user(
        &self,
        user_id: Uuid,
        from_wantlist: bool,
    ) -> anyhow::Result<Vec<WatchRelease>> {
        let conn = self.conn()?;
        let column = if from_wantlist {
            "imported_from_wantlist"
        } else {
            "imported_from_collection"
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM watch_releases
             WHERE user_id = ?1 AND is_active = 1 AND {column} = 1
             ORDER BY updated_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], row_to_release)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn insert_release(&self, release: &WatchRelease) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO watch_releases (id, user_id, discogs_release_id, discogs_master_id,
                match_mode, title, artist, year, target_price, currency, min_condition,
                is_active, imported_from_wantlist, imported_from_collection, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            params![
                release.id.to_string(),
                release.user_id.to_string(),
                release.discogs_release_id,
                release.discogs_master_id,
                release.match_mode.as_str(),
                release.title,
                release.artist,
                release.year,
                release.target_price,
                release.currency,
                release.min_condition,
                release.is_active as i64,
                release.imported_from_wantlist as i64,
                release.imported_from_collection as i64,
                release.created_at.to_rfc3339(),
                release.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Update the cached display fields + monotonic import-source flags.
    /// Flags are OR'd with the stored value: once set, never cleared.
    pub fn update_release_from_import(
        &self,
        release: &WatchRelease,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE watch_releases SET discogs_master_id = ?2, match_mode = ?3, title = ?4,
                artist = ?5, year = ?6, is_active = 1,
                imported_from_wantlist = imported_from_wantlist OR ?7,
                imported_from_collection = imported_from_collection OR ?8,
                updated_at = ?9
             WHERE id = ?1",
            params![
                release.id.to_string(),
                release.discogs_master_id,
                release.match_mode.as_str(),
                release.title,
                release.artist,
                release.year,
                release.imported_from_wantlist as i64,
                release.imported_from_collection as i64,
                release.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_release_active(&self, id: Uuid, is_active: bool) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE watch_releases SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), is_active as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}
