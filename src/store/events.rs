//! Durable, append-only event log persistence.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::Store;
use crate::events::{Event, EventType, NewEvent};

const COLUMNS: &str =
    "id, user_id, type, watch_release_id, rule_id, listing_id, payload, created_at";

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let type_raw: String = row.get(2)?;
    let payload: Option<String> = row.get(6)?;
    Ok(Event {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        event_type: EventType::from_str(&type_raw).unwrap_or(EventType::RuleUpdated),
        watch_release_id: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        rule_id: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        listing_id: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        payload: payload.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// Insert a new event. For `NEW_MATCH` events with both
    /// `watch_release_id` and `listing_id` set, a partial unique index
    /// enforces idempotency; a conflict there is treated as
    /// already-emitted and yields `Ok(None)`.
    pub fn insert_event(&self, new_event: &NewEvent) -> anyhow::Result<Option<Event>> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO events (id, user_id, type, watch_release_id, rule_id,
                listing_id, payload, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                id.to_string(),
                new_event.user_id.to_string(),
                new_event.event_type.as_str(),
                new_event.watch_release_id.map(|u| u.to_string()),
                new_event.rule_id.map(|u| u.to_string()),
                new_event.listing_id.map(|u| u.to_string()),
                new_event.payload.as_ref().map(|v| v.to_string()),
                created_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            return Ok(None);
        }

        Ok(Some(Event {
            id,
            user_id: new_event.user_id,
            event_type: new_event.event_type,
            watch_release_id: new_event.watch_release_id,
            rule_id: new_event.rule_id,
            listing_id: new_event.listing_id,
            payload: new_event.payload.clone(),
            created_at,
        }))
    }

    pub fn get_event(&self, id: Uuid) -> anyhow::Result<Option<Event>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM events WHERE id = ?1"),
                params![id.to_string()],
                row_to_event,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_events_for_user(&self, user_id: Uuid, limit: i64) -> anyhow::Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM events WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string(), limit], row_to_event)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
