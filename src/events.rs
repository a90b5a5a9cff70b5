//! Durable event log shared by every component.
//! Mission: power the activity feed and feed the notification fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    RuleCreated,
    RuleUpdated,
    RuleDisabled,
    RuleEnabled,
    RuleDeleted,

    WatchReleaseCreated,
    WatchReleaseUpdated,
    WatchReleaseDisabled,
    WatchReleaseEnabled,

    ListingFirstSeen,
    ListingPriceDrop,
    ListingPriceRise,
    ListingEnded,

    NewMatch,

    ImportStarted,
    ImportCompleted,
    ImportFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RuleCreated => "RULE_CREATED",
            EventType::RuleUpdated => "RULE_UPDATED",
            EventType::RuleDisabled => "RULE_DISABLED",
            EventType::RuleEnabled => "RULE_ENABLED",
            EventType::RuleDeleted => "RULE_DELETED",
            EventType::WatchReleaseCreated => "WATCH_RELEASE_CREATED",
            EventType::WatchReleaseUpdated => "WATCH_RELEASE_UPDATED",
            EventType::WatchReleaseDisabled => "WATCH_RELEASE_DISABLED",
            EventType::WatchReleaseEnabled => "WATCH_RELEASE_ENABLED",
            EventType::ListingFirstSeen => "LISTING_FIRST_SEEN",
            EventType::ListingPriceDrop => "LISTING_PRICE_DROP",
            EventType::ListingPriceRise => "LISTING_PRICE_RISE",
            EventType::ListingEnded => "LISTING_ENDED",
            EventType::NewMatch => "NEW_MATCH",
            EventType::ImportStarted => "IMPORT_STARTED",
            EventType::ImportCompleted => "IMPORT_COMPLETED",
            EventType::ImportFailed => "IMPORT_FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "RULE_CREATED" => EventType::RuleCreated,
            "RULE_UPDATED" => EventType::RuleUpdated,
            "RULE_DISABLED" => EventType::RuleDisabled,
            "RULE_ENABLED" => EventType::RuleEnabled,
            "RULE_DELETED" => EventType::RuleDeleted,
            "WATCH_RELEASE_CREATED" => EventType::WatchReleaseCreated,
            "WATCH_RELEASE_UPDATED" => EventType::WatchReleaseUpdated,
            "WATCH_RELEASE_DISABLED" => EventType::WatchReleaseDisabled,
            "WATCH_RELEASE_ENABLED" => EventType::WatchReleaseEnabled,
            "LISTING_FIRST_SEEN" => EventType::ListingFirstSeen,
            "LISTING_PRICE_DROP" => EventType::ListingPriceDrop,
            "LISTING_PRICE_RISE" => EventType::ListingPriceRise,
            "LISTING_ENDED" => EventType::ListingEnded,
            "NEW_MATCH" => EventType::NewMatch,
            "IMPORT_STARTED" => EventType::ImportStarted,
            "IMPORT_COMPLETED" => EventType::ImportCompleted,
            "IMPORT_FAILED" => EventType::ImportFailed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub watch_release_id: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub listing_id: Option<Uuid>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// New event awaiting insertion; `id`/`created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub user_id: Uuid,
    pub event_type: EventType,
    pub watch_release_id: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub listing_id: Option<Uuid>,
    pub payload: Option<Value>,
}

impl NewEvent {
    pub fn new(user_id: Uuid, event_type: EventType) -> Self {
        Self {
            user_id,
            event_type,
            watch_release_id: None,
            rule_id: None,
            listing_id: None,
            payload: None,
        }
    }

    pub fn with_rule(mut self, rule_id: Uuid) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    pub fn with_listing(mut self, listing_id: Uuid) -> Self {
        self.listing_id = Some(listing_id);
        self
    }

    pub fn with_watch_release(mut self, watch_release_id: Uuid) -> Self {
        self.watch_release_id = Some(watch_release_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
