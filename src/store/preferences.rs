//! Per-user notification preferences. Lazily created with all-enabled
//! defaults the first time they're read.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;
use crate::events::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFrequency {
    Instant,
    Hourly,
    Daily,
}

impl DeliveryFrequency {
    fn as_str(&self) -> &'static str {
        match self {
            DeliveryFrequency::Instant => "instant",
            DeliveryFrequency::Hourly => "hourly",
            DeliveryFrequency::Daily => "daily",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "hourly" => DeliveryFrequency::Hourly,
            "daily" => DeliveryFrequency::Daily,
            _ => DeliveryFrequency::Instant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotificationPreference {
    pub user_id: Uuid,
    pub email_enabled: bool,
    pub realtime_enabled: bool,
    pub quiet_hours_start: Option<i64>,
    pub quiet_hours_end: Option<i64>,
    pub timezone_override: Option<String>,
    pub delivery_frequency: DeliveryFrequency,
    pub event_toggles: HashMap<String, bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserNotificationPreference {
    pub fn allows(&self, event_type: EventType) -> bool {
        *self.event_toggles.get(event_type.as_str()).unwrap_or(&true)
    }

    fn defaults(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            email_enabled: true,
            realtime_enabled: true,
            quiet_hours_start: None,
            quiet_hours_end: None,
            timezone_override: None,
            delivery_frequency: DeliveryFrequency::Instant,
            event_toggles: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

const COLUMNS: &str = "user_id, email_enabled, realtime_enabled, quiet_hours_start,
    quiet_hours_end, timezone_override, delivery_frequency, event_toggles, created_at, updated_at";

fn row_to_pref(row: &Row) -> rusqlite::Result<UserNotificationPreference> {
    let toggles_raw: Option<String> = row.get(7)?;
    Ok(UserNotificationPreference {
        user_id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        email_enabled: row.get::<_, i64>(1)? != 0,
        realtime_enabled: row.get::<_, i64>(2)? != 0,
        quiet_hours_start: row.get(3)?,
        quiet_hours_end: row.get(4)?,
        timezone_override: row.get(5)?,
        delivery_frequency: DeliveryFrequency::from_str(&row.get::<_, String>(6)?),
        event_toggles: toggles_raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        created_at: row.get::<_, String>(8)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(9)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    pub fn get_or_create_preferences(
        &self,
        user_id: Uuid,
    ) -> anyhow::Result<UserNotificationPreference> {
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM user_notification_preferences WHERE user_id = ?1"
                ),
                params![user_id.to_string()],
                row_to_pref,
            )
            .optional()?;
        if let Some(pref) = existing {
            return Ok(pref);
        }

        let pref = UserNotificationPreference::defaults(user_id);
        conn.execute(
            "INSERT INTO user_notification_preferences (id, user_id, email_enabled,
                realtime_enabled, quiet_hours_start, quiet_hours_end, timezone_override,
                delivery_frequency, event_toggles, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                Uuid::new_v4().to_string(),
                pref.user_id.to_string(),
                pref.email_enabled as i64,
                pref.realtime_enabled as i64,
                pref.quiet_hours_start,
                pref.quiet_hours_end,
                pref.timezone_override,
                pref.delivery_frequency.as_str(),
                serde_json::to_string(&pref.event_toggles)?,
                pref.created_at.to_rfc3339(),
                pref.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(pref)
    }

    /// Overwrite the stored preferences for `user_id` wholesale. Callers
    /// read the current row (via [`Store::get_or_create_preferences`]),
    /// mutate the fields they want to change, and pass the result back in.
    pub fn update_preferences(
        &self,
        user_id: Uuid,
        pref: &UserNotificationPreference,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let now = Utc::now();
        conn.execute(
            "UPDATE user_notification_preferences SET
                email_enabled = ?2, realtime_enabled = ?3, quiet_hours_start = ?4,
                quiet_hours_end = ?5, timezone_override = ?6, delivery_frequency = ?7,
                event_toggles = ?8, updated_at = ?9
             WHERE user_id = ?1",
            params![
                user_id.to_string(),
                pref.email_enabled as i64,
                pref.realtime_enabled as i64,
                pref.quiet_hours_start,
                pref.quiet_hours_end,
                pref.timezone_override,
                pref.delivery_frequency.as_str(),
                serde_json::to_string(&pref.event_toggles)?,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
