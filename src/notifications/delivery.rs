//! Delivery worker: drains due notifications, dispatches by channel, and
//! retries transport failures with backoff.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::notifications::broker::StreamBroker;
use crate::store::notifications::Notification;
use crate::store::preferences::{DeliveryFrequency, UserNotificationPreference};
use crate::store::Store;

/// Outcome of one channel dispatch attempt.
pub enum DispatchError {
    Retryable(String),
    Permanent(String),
}

/// Abstraction over the concrete email transport (SES vs a stub is a
/// deployment choice); this crate only owns the interface and ships a
/// logging stub implementation.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, notification: &Notification, to_email: &str) -> Result<(), DispatchError>;
}

/// Default transport: logs and always succeeds. Production deploys wire a
/// real transport (e.g. SES) behind the same trait.
pub struct StubEmailTransport;

#[async_trait]
impl EmailTransport for StubEmailTransport {
    async fn send(&self, notification: &Notification, to_email: &str) -> Result<(), DispatchError> {
        info!(
            notification_id = %notification.id,
            to = to_email,
            event_type = %notification.event_type,
            "stub email transport: would send notification"
        );
        Ok(())
    }
}

/// Compute how many seconds to defer delivery, given the user's
/// preferences and the current instant. Quiet hours take priority over
/// `delivery_frequency` (see DESIGN.md for the reasoning behind this
/// ordering).
pub fn compute_defer_seconds(pref: &UserNotificationPreference, now: DateTime<Utc>) -> i64 {
    if let (Some(start), Some(end)) = (pref.quiet_hours_start, pref.quiet_hours_end) {
        let offset_hours = pref
            .timezone_override
            .as_deref()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(0);
        let local_now = now + chrono::Duration::hours(offset_hours);
        let hour = local_now.hour() as i64;

        let in_window = if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        };

        if in_window {
            let today_end = local_now
                .date_naive()
                .and_hms_opt(end.clamp(0, 23) as u32, 0, 0)
                .unwrap();
            let mut target = DateTime::<Utc>::from_naive_utc_and_offset(today_end, Utc);
            if target <= local_now {
                target += chrono::Duration::days(1);
            }
            return (target - local_now).num_seconds().max(0);
        }
    }

    match pref.delivery_frequency {
        DeliveryFrequency::Instant => 0,
        DeliveryFrequency::Hourly => seconds_until_next_hour_boundary(now),
        DeliveryFrequency::Daily => seconds_until_next_day_boundary(now),
    }
}

fn seconds_until_next_hour_boundary(now: DateTime<Utc>) -> i64 {
    let secs_into_hour = now.minute() as i64 * 60 + now.second() as i64;
    if secs_into_hour == 0 {
        0
    } else {
        3600 - secs_into_hour
    }
}

fn seconds_until_next_day_boundary(now: DateTime<Utc>) -> i64 {
    let secs_into_day = now.hour() as i64 * 3600 + now.minute() as i64 * 60 + now.second() as i64;
    if secs_into_day == 0 {
        0
    } else {
        86_400 - secs_into_day
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryTickOutcome {
    pub claimed: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Drain up to `config.delivery_batch_size` due notifications and dispatch
/// each by channel, run as a batch poll loop rather than a per-task queue
/// invocation since this crate has no external task queue.
pub async fn run_delivery_tick(
    store: &Store,
    config: &Config,
    broker: &StreamBroker,
    email: &dyn EmailTransport,
) -> anyhow::Result<DeliveryTickOutcome> {
    let now = Utc::now();
    let claimed = store.claim_due_notifications(now, config.delivery_batch_size)?;
    let mut outcome = DeliveryTickOutcome {
        claimed: claimed.len() as u64,
        ..Default::default()
    };

    for notification in &claimed {
        match dispatch(store, config, notification, broker, email).await {
            Ok(()) => {
                store.mark_notification_sent(notification.id)?;
                outcome.sent += 1;
            }
            Err(DispatchError::Permanent(reason)) => {
                warn!(notification_id = %notification.id, reason, "notification delivery failed permanently");
                store.mark_notification_failed(notification.id, false)?;
                outcome.failed += 1;
            }
            Err(DispatchError::Retryable(reason)) => {
                if notification.attempts + 1 >= config.delivery_max_retries as i64 {
                    warn!(
                        notification_id = %notification.id,
                        reason,
                        attempts = notification.attempts + 1,
                        "notification delivery exhausted retries"
                    );
                    store.mark_notification_failed(notification.id, false)?;
                    outcome.failed += 1;
                } else {
                    let backoff = exponential_backoff_seconds(
                        notification.attempts,
                        config.delivery_retry_backoff_seconds,
                    );
                    let defer_until = now + chrono::Duration::seconds(backoff);
                    store.schedule_notification_retry(notification.id, defer_until)?;
                    outcome.retried += 1;
                }
            }
        }
    }

    metrics::counter!("watchwax_delivery_notifications_sent_total").increment(outcome.sent);
    metrics::counter!("watchwax_delivery_notifications_retried_total").increment(outcome.retried);
    metrics::counter!("watchwax_delivery_notifications_failed_total").increment(outcome.failed);

    Ok(outcome)
}

fn exponential_backoff_seconds(attempts: i64, base_seconds: u64) -> i64 {
    let exp = attempts.max(0).min(10) as u32;
    (base_seconds as i64) * 2i64.pow(exp)
}

async fn dispatch(
    store: &Store,
    _config: &Config,
    notification: &Notification,
    broker: &StreamBroker,
    email: &dyn EmailTransport,
) -> Result<(), DispatchError> {
    use crate::store::notifications::NotificationChannel;

    match notification.channel {
        NotificationChannel::Email => {
            let user = store
                .get_user(notification.user_id)
                .map_err(|e| DispatchError::Permanent(e.to_string()))?
                .ok_or_else(|| DispatchError::Permanent("user not found".into()))?;
            email.send(notification, &user.email).await
        }
        NotificationChannel::Realtime => {
            let payload = json!({
                "notification_id": notification.id,
                "event_id": notification.event_id,
                "event_type": notification.event_type.as_str(),
                "created_at": notification.created_at,
            });
            broker.publish(notification.user_id, payload);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pref(
        quiet_hours_start: Option<i64>,
        quiet_hours_end: Option<i64>,
        delivery_frequency: DeliveryFrequency,
        timezone_override: Option<&str>,
    ) -> UserNotificationPreference {
        let now = Utc::now();
        UserNotificationPreference {
            user_id: uuid::Uuid::new_v4(),
            email_enabled: true,
            realtime_enabled: true,
            quiet_hours_start,
            quiet_hours_end,
            timezone_override: timezone_override.map(String::from),
            delivery_frequency,
            event_toggles: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn instant_with_no_quiet_hours_defers_zero() {
        let p = pref(None, None, DeliveryFrequency::Instant, None);
        assert_eq!(compute_defer_seconds(&p, Utc::now()), 0);
    }

    #[test]
    fn inside_quiet_window_defers_to_window_end() {
        let p = pref(Some(22), Some(7), DeliveryFrequency::Instant, None);
        let now = "2026-01-15T23:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let defer = compute_defer_seconds(&p, now);
        // window wraps past midnight; 23:30 -> 07:00 next day = 7.5h
        assert_eq!(defer, 7 * 3600 + 1800);
    }

    #[test]
    fn outside_quiet_window_falls_back_to_frequency() {
        let p = pref(Some(22), Some(7), DeliveryFrequency::Instant, None);
        let now = "2026-01-15T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(compute_defer_seconds(&p, now), 0);
    }

    #[test]
    fn hourly_defers_to_top_of_next_hour() {
        let p = pref(None, None, DeliveryFrequency::Hourly, None);
        let now = "2026-01-15T12:15:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(compute_defer_seconds(&p, now), 45 * 60);
    }

    #[test]
    fn daily_defers_to_next_midnight() {
        let p = pref(None, None, DeliveryFrequency::Daily, None);
        let now = "2026-01-15T20:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(compute_defer_seconds(&p, now), 4 * 3600);
    }

    #[test]
    fn backoff_grows_exponentially_and_caps_exponent() {
        assert_eq!(exponential_backoff_seconds(0, 30), 30);
        assert_eq!(exponential_backoff_seconds(1, 30), 60);
        assert_eq!(exponential_backoff_seconds(2, 30), 120);
    }
}
