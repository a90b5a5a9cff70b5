//! Per-channel notification fan-out rows. One row per (event, channel);
//! uniqueness on that pair is the idempotency boundary the fan-out step
//! relies on.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;
use crate::events::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Realtime,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Realtime => "realtime",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "email" => Some(NotificationChannel::Email),
            "realtime" => Some(NotificationChannel::Realtime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "sent" => NotificationStatus::Sent,
            "failed" => NotificationStatus::Failed,
            _ => NotificationStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_id: Uuid,
    pub event_type: EventType,
    pub channel: NotificationChannel,
    pub status: NotificationStatus,
    pub is_read: bool,
    pub attempts: i64,
    pub defer_until: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, user_id, event_id, event_type, channel, status, is_read, attempts,
    defer_until, delivered_at, failed_at, read_at, created_at, updated_at";

fn parse_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| v.parse().ok())
}

fn row_to_notification(row: &Row) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        user_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap_or_default(),
        event_id: Uuid::parse_str(&row.get::<_, String>(2)?).unwrap_or_default(),
        event_type: EventType::from_str(&row.get::<_, String>(3)?).unwrap_or(EventType::RuleUpdated),
        channel: NotificationChannel::from_str(&row.get::<_, String>(4)?)
            .unwrap_or(NotificationChannel::Realtime),
        status: NotificationStatus::from_str(&row.get::<_, String>(5)?),
        is_read: row.get::<_, i64>(6)? != 0,
        attempts: row.get(7)?,
        defer_until: parse_dt(row.get(8)?),
        delivered_at: parse_dt(row.get(9)?),
        failed_at: parse_dt(row.get(10)?),
        read_at: parse_dt(row.get(11)?),
        created_at: row.get::<_, String>(12)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(13)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// Insert a (event, channel) notification if it doesn't already exist.
    /// Returns `None` on conflict — this channel was already fanned out for
    /// this event.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_notification_if_absent(
        &self,
        user_id: Uuid,
        event_id: Uuid,
        event_type: EventType,
        channel: NotificationChannel,
        defer_until: DateTime<Utc>,
    ) -> anyhow::Result<Option<Uuid>> {
        let conn = self.conn()?;
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO notifications (id, user_id, event_id, event_type, channel,
                status, is_read, attempts, defer_until, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,'pending',0,0,?6,?7,?7)",
            params![
                id.to_string(),
                user_id.to_string(),
                event_id.to_string(),
                event_type.as_str(),
                channel.as_str(),
                defer_until.to_rfc3339(),
                now,
            ],
        )?;
        if inserted == 0 {
            Ok(None)
        } else {
            Ok(Some(id))
        }
    }

    pub fn get_notification(&self, id: Uuid) -> anyhow::Result<Option<Notification>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"),
                params![id.to_string()],
                row_to_notification,
            )
            .optional()?;
        Ok(row)
    }

    /// Claim pending notifications that are due (`defer_until <= now`, or
    /// null) for delivery. Mirrors the single-statement claim pattern used
    /// for rule scheduling — stamp then select.
    pub fn claim_due_notifications(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> anyhow::Result<Vec<Notification>> {
        let conn = self.conn()?;
        let claim_status = "claiming";
        let now_s = now.to_rfc3339();
        conn.execute(
            "UPDATE notifications SET status = ?1, updated_at = ?2
             WHERE id IN (
                 SELECT id FROM notifications
                 WHERE status = 'pending' AND (defer_until IS NULL OR defer_until <= ?2)
                 ORDER BY created_at ASC
                 LIMIT ?3
             )",
            params![claim_status, now_s, batch_size],
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM notifications WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![claim_status], row_to_notification)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn mark_notification_sent(&self, id: Uuid) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE notifications SET status = 'sent', delivered_at = ?2, attempts = attempts + 1,
                updated_at = ?2
             WHERE id = ?1",
            params![id.to_string(), now],
        )?;
        Ok(())
    }

    /// Bump attempts and push the notification back to `pending` with a new
    /// `defer_until`, for a retryable transport failure. The
    /// caller is responsible for giving up and calling
    /// [`Store::mark_notification_failed`] once `attempts` hits the configured max.
    pub fn schedule_notification_retry(&self, id: Uuid, defer_until: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE notifications SET status = 'pending', defer_until = ?2, attempts = attempts + 1,
                failed_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id.to_string(), defer_until.to_rfc3339(), now],
        )?;
        Ok(())
    }

    pub fn mark_notification_failed(&self, id: Uuid, retry_as_pending: bool) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let status = if retry_as_pending { "pending" } else { "failed" };
        conn.execute(
            "UPDATE notifications SET status = ?2, failed_at = ?3, attempts = attempts + 1,
                updated_at = ?3
             WHERE id = ?1",
            params![id.to_string(), status, now],
        )?;
        Ok(())
    }

    pub fn mark_notification_read(&self, id: Uuid) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE notifications SET is_read = 1, read_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), now],
        )?;
        Ok(())
    }

    pub fn list_notifications_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> anyhow::Result<Vec<Notification>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM notifications WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user_id.to_string(), limit], row_to_notification)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventType, NewEvent};
    use crate::store::users::insert_test_user;

    fn make_event(store: &Store, user_id: Uuid) -> Event {
        let new_event = NewEvent::new(user_id, EventType::NewMatch);
        store.insert_event(&new_event).unwrap().unwrap()
    }

    #[test]
    fn duplicate_channel_insert_is_ignored() {
        let store = Store::open_in_memory().unwrap();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        let event = make_event(&store, user_id);

        let first = store
            .insert_notification_if_absent(
                user_id,
                event.id,
                EventType::NewMatch,
                NotificationChannel::Realtime,
                Utc::now(),
            )
            .unwrap();
        assert!(first.is_some());

        let second = store
            .insert_notification_if_absent(
                user_id,
                event.id,
                EventType::NewMatch,
                NotificationChannel::Realtime,
                Utc::now(),
            )
            .unwrap();
        assert!(second.is_none());
    }
}
