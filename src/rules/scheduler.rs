//! Cooperative, concurrency-safe due-rule dispatcher. One tick: claim a
//! batch of due rules, run each, and reschedule its `next_run_at`.

use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use crate::config::Config;
use crate::rules::runner::run_rule;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    pub claimed: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Run a single scheduler tick: claim up to `config.scheduler_batch_size`
/// due rules and run each to completion. Never aborts mid-tick on a single
/// rule's failure — per-rule errors are logged and counted, and that rule's
/// `next_run_at` is pushed out by a short retry delay.
pub async fn run_tick(store: &Store, config: &Config) -> anyhow::Result<TickOutcome> {
    let now = Utc::now();
    let claimed = store.claim_due_rules(now, config.scheduler_batch_size)?;
    let mut outcome = TickOutcome {
        claimed: claimed.len() as u64,
        ..Default::default()
    };

    for rule in &claimed {
        if let Some(next_run_at) = rule.next_run_at {
            let lag = now.signed_duration_since(next_run_at);
            if lag.num_seconds() > 0 {
                info!(rule_id = %rule.id, lag_seconds = lag.num_seconds(), "processing overdue rule");
            }
        }

        match run_rule(store, config, rule).await {
            Ok(summary) => {
                let _ = summary; // counters are surfaced via metrics/logs, not returned here

                let jitter =
                    rand::thread_rng().gen_range(0..config.scheduler_next_run_jitter_seconds.max(1));
                let next_run_at =
                    now + chrono::Duration::seconds(rule.poll_interval_seconds + jitter);

                match store.complete_rule_claim(rule.id, now, next_run_at, true) {
                    Ok(()) => outcome.processed += 1,
                    Err(e) => {
                        warn!(rule_id = %rule.id, error = %e, "failed to record successful rule claim completion");
                        outcome.failed += 1;
                    }
                }
            }
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "rule run failed");
                if let Err(e) = reschedule_after_failure(store, config, rule.id) {
                    warn!(rule_id = %rule.id, error = %e, "failed to record failed rule claim completion");
                }
                outcome.failed += 1;
            }
        }
    }

    metrics::counter!("watchwax_scheduler_rules_claimed_total").increment(outcome.claimed);
    metrics::counter!("watchwax_scheduler_rules_processed_total").increment(outcome.processed);
    metrics::counter!("watchwax_scheduler_rules_failed_total").increment(outcome.failed);

    Ok(outcome)
}

/// Release a claimed rule back to the pool after an unexpected failure,
/// scheduling a short jittered retry rather than the rule's normal cadence.
pub fn reschedule_after_failure(store: &Store, config: &Config, rule_id: uuid::Uuid) -> anyhow::Result<()> {
    let now = Utc::now();
    let jitter = rand::thread_rng().gen_range(0..config.scheduler_failure_retry_jitter_seconds.max(1));
    let next_run_at =
        now + chrono::Duration::seconds(config.scheduler_failure_retry_seconds + jitter);
    store.complete_rule_claim(rule_id, now, next_run_at, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::rules::RuleQuery;
    use crate::store::rules::WatchRule;
    use crate::store::users::insert_test_user;
    use chrono::Utc;
    use uuid::Uuid;

    fn test_config() -> Config {
        Config {
            database_path: ":memory:".into(),
            port: 0,
            scheduler_tick_interval_seconds: 1,
            scheduler_batch_size: 10,
            scheduler_rule_limit: 10,
            scheduler_next_run_jitter_seconds: 5,
            scheduler_failure_retry_seconds: 10,
            scheduler_failure_retry_jitter_seconds: 5,
            delivery_max_retries: 1,
            delivery_retry_backoff_seconds: 1,
            delivery_batch_size: 10,
            rule_runner_fetch_limit: 10,
            discogs_user_agent: "test".into(),
            discogs_token: None,
            discogs_oauth_client_id: None,
            discogs_oauth_client_secret: None,
            discogs_oauth_redirect_uri: None,
            discogs_oauth_scopes: String::new(),
            discogs_oauth_state_ttl_seconds: 600,
            discogs_timeout_seconds: 10,
            ebay_client_id: None,
            ebay_client_secret: None,
            ebay_marketplace_id: "EBAY_US".into(),
            ebay_oauth_scope: String::new(),
            ebay_timeout_seconds: 10,
            ebay_max_attempts: 3,
            ebay_retry_base_delay_ms: 250,
            ebay_retry_max_delay_ms: 8000,
            ebay_campaign_id: None,
            ebay_custom_id: None,
            discogs_sync_enabled: false,
            discogs_sync_interval_seconds: 86400,
            discogs_sync_user_batch_size: 50,
            discogs_sync_jitter_seconds: 300,
            discogs_import_cooldown_seconds: 3600,
            token_crypto_key_id: "k1".into(),
            token_crypto_local_key: Some("secret".into()),
            log_level: "info".into(),
        }
    }

    fn sample_rule(user_id: Uuid) -> WatchRule {
        let now = Utc::now();
        WatchRule {
            id: Uuid::new_v4(),
            user_id,
            name: "mock rule".into(),
            query: RuleQuery {
                keywords: vec!["item".into()],
                sources: vec!["mock".into()],
                max_price: None,
                min_condition: None,
                currency: None,
            },
            is_active: true,
            poll_interval_seconds: 600,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn tick_processes_due_rules_and_advances_next_run() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        let rule = sample_rule(user_id);
        store.insert_rule(&rule).unwrap();

        let outcome = run_tick(&store, &config).await.unwrap();
        assert_eq!(outcome.claimed, 1);
        assert_eq!(outcome.processed, 1);

        let reloaded = store.get_rule(rule.id).unwrap().unwrap();
        assert!(reloaded.last_run_at.is_some());
        assert!(reloaded.next_run_at.unwrap() >= reloaded.last_run_at.unwrap() + chrono::Duration::seconds(rule.poll_interval_seconds));
    }

    #[tokio::test]
    async fn tick_with_no_due_rules_is_a_no_op() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let outcome = run_tick(&store, &config).await.unwrap();
        assert_eq!(outcome.claimed, 0);
    }

    #[tokio::test]
    async fn tick_reschedules_a_failed_rule_with_the_short_retry_delay_instead_of_cadence() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        // Deliberately orphaned: no user row for this rule's user_id, so
        // `run_rule` fails to load the owning user and the rule run itself
        // fails (distinct from a single source's provider error).
        let rule = sample_rule(Uuid::new_v4());
        store.insert_rule(&rule).unwrap();

        let outcome = run_tick(&store, &config).await.unwrap();
        assert_eq!(outcome.claimed, 1);
        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.failed, 1);

        let reloaded = store.get_rule(rule.id).unwrap().unwrap();
        assert!(reloaded.last_run_at.is_none(), "a failed run must not touch last_run_at");
        let next_run_at = reloaded.next_run_at.expect("failure path still reschedules");
        let max_expected = now_plus_retry_bound(&config);
        assert!(
            next_run_at <= max_expected,
            "failed rule should be retried soon, not on its normal poll cadence"
        );
    }

    fn now_plus_retry_bound(config: &Config) -> chrono::DateTime<Utc> {
        Utc::now()
            + chrono::Duration::seconds(
                config.scheduler_failure_retry_seconds + config.scheduler_failure_retry_jitter_seconds,
            )
            + chrono::Duration::seconds(5) // slack for test execution time
    }
}
