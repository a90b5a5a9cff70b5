//! Price history, one row per recorded observation.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use super::Store;

impl Store {
    pub fn insert_price_snapshot(
        &self,
        listing_id: Uuid,
        price: f64,
        currency: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO price_snapshots (id, listing_id, price, currency, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                listing_id.to_string(),
                price,
                currency,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn count_price_snapshots(&self, listing_id: Uuid) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM price_snapshots WHERE listing_id = ?1",
            params![listing_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
