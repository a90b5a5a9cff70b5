//! Normalized marketplace listings. Uniqueness is (provider, external_id).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub provider: String,
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub normalized_title: Option<String>,
    pub price: f64,
    pub currency: String,
    pub condition: Option<String>,
    pub seller: Option<String>,
    pub location: Option<String>,
    pub status: String,
    pub discogs_release_id: Option<i64>,
    pub discogs_master_id: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub raw: Option<Value>,
}

const COLUMNS: &str = "id, provider, external_id, url, title, normalized_title, price, currency,
    condition, seller, location, status, discogs_release_id, discogs_master_id, first_seen_at,
    last_seen_at, raw";

fn row_to_listing(row: &Row) -> rusqlite::Result<Listing> {
    let raw: Option<String> = row.get(16)?;
    Ok(Listing {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        provider: row.get(1)?,
        external_id: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        normalized_title: row.get(5)?,
        price: row.get(6)?,
        currency: row.get(7)?,
        condition: row.get(8)?,
        seller: row.get(9)?,
        location: row.get(10)?,
        status: row.get(11)?,
        discogs_release_id: row.get(12)?,
        discogs_master_id: row.get(13)?,
        first_seen_at: row.get::<_, String>(14)?.parse().unwrap_or_else(|_| Utc::now()),
        last_seen_at: row.get::<_, String>(15)?.parse().unwrap_or_else(|_| Utc::now()),
        raw: raw.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

impl Store {
    pub fn find_listing_by_provider_external(
        &self,
        provider: &str,
        external_id: &str,
    ) -> anyhow::Result<Option<Listing>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM listings WHERE provider = ?1 AND external_id = ?2"
                ),
                params![provider, external_id],
                row_to_listing,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_listing(&self, id: Uuid) -> anyhow::Result<Option<Listing>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM listings WHERE id = ?1"),
                params![id.to_string()],
                row_to_listing,
            )
            .optional()?;
        Ok(row)
    }

    pub fn insert_listing(&self, listing: &Listing) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO listings (id, provider, external_id, url, title, normalized_title,
                price, currency, condition, seller, location, status, discogs_release_id,
                discogs_master_id, first_seen_at, last_seen_at, raw)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                listing.id.to_string(),
                listing.provider,
                listing.external_id,
                listing.url,
                listing.title,
                listing.normalized_title,
                listing.price,
                listing.currency,
                listing.condition,
                listing.seller,
                listing.location,
                listing.status,
                listing.discogs_release_id,
                listing.discogs_master_id,
                listing.first_seen_at.to_rfc3339(),
                listing.last_seen_at.to_rfc3339(),
                listing.raw.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn update_listing(&self, listing: &Listing) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE listings SET url = ?2, title = ?3, normalized_title = ?4, price = ?5,
                currency = ?6, condition = ?7, seller = ?8, location = ?9, status = ?10,
                discogs_release_id = ?11, discogs_master_id = ?12, last_seen_at = ?13, raw = ?14
             WHERE id = ?1",
            params![
                listing.id.to_string(),
                listing.url,
                listing.title,
                listing.normalized_title,
                listing.price,
                listing.currency,
                listing.condition,
                listing.seller,
                listing.location,
                listing.status,
                listing.discogs_release_id,
                listing.discogs_master_id,
                listing.last_seen_at.to_rfc3339(),
                listing.raw.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }
}
