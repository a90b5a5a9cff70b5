//! Outbound-click tracking for affiliate redirect links, backed by the
//! `outbound_clicks` table in `schema.rs`.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone)]
pub struct OutboundClick {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

fn row_to_click(row: &Row) -> rusqlite::Result<OutboundClick> {
    Ok(OutboundClick {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        listing_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        user_id: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// Record a click-through before issuing the redirect. Fire-and-forget
    /// from the handler's perspective: a failure here must never block the
    /// redirect itself.
    pub fn insert_outbound_click(
        &self,
        listing_id: Uuid,
        user_id: Option<Uuid>,
    ) -> anyhow::Result<Uuid> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO outbound_clicks (id, listing_id, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                listing_id.to_string(),
                user_id.map(|u| u.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    pub fn get_outbound_click(&self, id: Uuid) -> anyhow::Result<Option<OutboundClick>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, listing_id, user_id, created_at FROM outbound_clicks WHERE id = ?1",
                params![id.to_string()],
                row_to_click,
            )
            .optional()?;
        Ok(row)
    }

    pub fn count_outbound_clicks_for_listing(&self, listing_id: Uuid) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbound_clicks WHERE listing_id = ?1",
            params![listing_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::listings::Listing;

    fn make_listing(store: &Store) -> Uuid {
        let listing = Listing {
            id: Uuid::new_v4(),
            provider: "ebay".into(),
            external_id: "v1|1|0".into(),
            url: "https://ebay.com/itm/1".into(),
            title: "Primus - Frizzle Fry".into(),
            normalized_title: Some("primus frizzle fry".into()),
            price: 19.99,
            currency: "USD".into(),
            condition: Some("VG+".into()),
            seller: None,
            location: None,
            status: "active".into(),
            discogs_release_id: None,
            discogs_master_id: None,
            first_seen_at: Utc::now(),
            last_seen_at: Utc::now(),
            raw: None,
        };
        store.insert_listing(&listing).unwrap();
        listing.id
    }

    #[test]
    fn records_and_counts_clicks() {
        let store = Store::open_in_memory().unwrap();
        let listing_id = make_listing(&store);
        store.insert_outbound_click(listing_id, None).unwrap();
        store.insert_outbound_click(listing_id, None).unwrap();
        assert_eq!(store.count_outbound_clicks_for_listing(listing_id).unwrap(), 2);
    }
}
