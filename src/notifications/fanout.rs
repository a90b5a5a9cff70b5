//! Turns one logged [`Event`] into zero or more per-channel [`Notification`]
//! rows.

use tracing::debug;

use crate::events::Event;
use crate::notifications::delivery::compute_defer_seconds;
use crate::store::notifications::NotificationChannel;
use crate::store::Store;

/// Fan `event` out to the user's enabled channels, gated by their
/// preferences. Each (event, channel) pair is idempotent at the storage
/// layer, so calling this twice for the same event is safe and simply
/// creates zero additional rows on the second call.
pub fn fan_out_event(store: &Store, event: &Event) -> anyhow::Result<u32> {
    let pref = store.get_or_create_preferences(event.user_id)?;
    if !pref.allows(event.event_type) {
        debug!(event_id = %event.id, event_type = %event.event_type, "event suppressed by user preference");
        return Ok(0);
    }

    let now = chrono::Utc::now();
    let defer_seconds = compute_defer_seconds(&pref, now);
    let defer_until = now + chrono::Duration::seconds(defer_seconds.max(0));

    let mut created = 0u32;

    if pref.realtime_enabled
        && store
            .insert_notification_if_absent(
                event.user_id,
                event.id,
                event.event_type,
                NotificationChannel::Realtime,
                defer_until,
            )?
            .is_some()
    {
        created += 1;
    }

    if pref.email_enabled
        && store
            .insert_notification_if_absent(
                event.user_id,
                event.id,
                event.event_type,
                NotificationChannel::Email,
                defer_until,
            )?
            .is_some()
    {
        created += 1;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventType, NewEvent};
    use crate::store::users::insert_test_user;

    #[test]
    fn fan_out_creates_one_notification_per_enabled_channel() {
        let store = Store::open_in_memory().unwrap();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        let event = store
            .insert_event(&NewEvent::new(user_id, EventType::NewMatch))
            .unwrap()
            .unwrap();

        let created = fan_out_event(&store, &event).unwrap();
        assert_eq!(created, 2);

        let notifications = store.list_notifications_for_user(user_id, 10).unwrap();
        assert_eq!(notifications.len(), 2);
    }

    #[test]
    fn fan_out_twice_for_the_same_event_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        let event = store
            .insert_event(&NewEvent::new(user_id, EventType::NewMatch))
            .unwrap()
            .unwrap();

        fan_out_event(&store, &event).unwrap();
        let second = fan_out_event(&store, &event).unwrap();
        assert_eq!(second, 0);

        let notifications = store.list_notifications_for_user(user_id, 10).unwrap();
        assert_eq!(notifications.len(), 2);
    }

    #[test]
    fn disabled_event_toggle_suppresses_fan_out() {
        let store = Store::open_in_memory().unwrap();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        let mut pref = store.get_or_create_preferences(user_id).unwrap();
        pref.event_toggles.insert(EventType::NewMatch.as_str().to_string(), false);
        store.update_preferences(user_id, &pref).unwrap();

        let event = store
            .insert_event(&NewEvent::new(user_id, EventType::NewMatch))
            .unwrap()
            .unwrap();
        let created = fan_out_event(&store, &event).unwrap();
        assert_eq!(created, 0);
    }
}
