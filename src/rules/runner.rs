//! Single-rule runner: fetch from each of a rule's provider sources, ingest,
//! and match.

use tracing::warn;

use crate::config::Config;
use crate::listings::upsert_listing;
use crate::matching::enrich_listing_with_release_mapping;
use crate::providers::{build_client, CountingSink, ProviderQuery, ProviderRequestLog};
use crate::rules::matcher::create_match_if_needed;
use crate::store::rules::WatchRule;
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct RuleRunSummary {
    pub rule_id: uuid::Uuid,
    pub fetched: u64,
    pub listings_created: u64,
    pub snapshots_created: u64,
    pub matches_created: u64,
}

/// Run one rule end to end: iterate its (already-deduped, lower-cased)
/// provider sources, call each provider, and feed every returned listing
/// through ingest + match. A `ProviderError` or unexpected failure on one
/// source is recorded and that source is skipped; other sources continue.
///
/// Returns `Err` only for a rule-run-level failure distinct from a single
/// source's provider error (e.g. the rule's owning user can no longer be
/// loaded) — the scheduler reschedules those with a short retry delay
/// instead of the rule's normal cadence.
pub async fn run_rule(store: &Store, config: &Config, rule: &WatchRule) -> anyhow::Result<RuleRunSummary> {
    let mut summary = RuleRunSummary {
        rule_id: rule.id,
        ..Default::default()
    };

    if !rule.is_active {
        return Ok(summary);
    }

    let user = store
        .get_user(rule.user_id)?
        .ok_or_else(|| anyhow::anyhow!("owning user not found for rule {}", rule.id))?;
    let user_currency = user.currency;

    for source in &rule.query.sources {
        let Some(client) = build_client(source, config) else {
            warn!(rule_id = %rule.id, source, "no provider client registered for source");
            continue;
        };

        let query = ProviderQuery {
            keywords: rule.query.keywords.clone(),
            max_price: rule.query.max_price,
            seed: Some(rule.id.to_string()),
        };

        let store_ref = store;
        let user_id = rule.user_id;
        let sink = CountingSink::new(|entry: ProviderRequestLog| {
            if let Err(e) = store_ref.record_provider_request(Some(user_id), &entry) {
                warn!(rule_id = %rule.id, error = %e, "failed to record provider request log");
            }
        });

        match client.search(&query, config.rule_runner_fetch_limit, &sink).await {
            Ok(listings) => {
                summary.fetched += listings.len() as u64;
                for provider_listing in &listings {
                    match upsert_listing(store, provider_listing) {
                        Ok(mut result) => {
                            if matches!(result.outcome, crate::listings::UpsertOutcome::Created) {
                                summary.listings_created += 1;
                            }
                            if !matches!(result.outcome, crate::listings::UpsertOutcome::UpdatedNoPriceChange)
                            {
                                summary.snapshots_created += 1;
                            }
                            if let Err(e) = enrich_listing_with_release_mapping(
                                store,
                                rule.user_id,
                                &mut result.listing,
                            ) {
                                warn!(
                                    rule_id = %rule.id,
                                    listing_id = %result.listing.id,
                                    error = %e,
                                    "release enrichment failed"
                                );
                            }
                            match create_match_if_needed(
                                store,
                                rule,
                                &result.listing,
                                user_currency.as_deref(),
                            ) {
                                Ok(Some(_)) => summary.matches_created += 1,
                                Ok(None) => {}
                                Err(e) => warn!(
                                    rule_id = %rule.id,
                                    listing_id = %result.listing.id,
                                    error = %e,
                                    "match creation failed"
                                ),
                            }
                        }
                        Err(e) => {
                            warn!(rule_id = %rule.id, source, error = %e, "listing ingest failed");
                        }
                    }
                }
                if sink.count() == 0 {
                    let _ = store.record_provider_request(
                        Some(rule.user_id),
                        &ProviderRequestLog {
                            provider: source.clone(),
                            endpoint: "search".into(),
                            method: "GET".into(),
                            status_code: Some(200),
                            duration_ms: None,
                            error: None,
                            attempt: 1,
                            total_attempts: 1,
                            retry_after_seconds: None,
                            rate_limit_remaining: None,
                            upstream_request_id: None,
                        },
                    );
                }
            }
            Err(provider_error) => {
                warn!(rule_id = %rule.id, source, error = %provider_error, "provider search failed");
                if sink.count() == 0 {
                    let _ = store.record_provider_request(
                        Some(rule.user_id),
                        &ProviderRequestLog {
                            provider: source.clone(),
                            endpoint: provider_error.endpoint.clone().unwrap_or_default(),
                            method: provider_error.method.clone(),
                            status_code: provider_error.status_code,
                            duration_ms: provider_error.duration_ms,
                            error: Some(crate::providers::truncate_error(&provider_error.message)),
                            attempt: 1,
                            total_attempts: 1,
                            retry_after_seconds: None,
                            rate_limit_remaining: None,
                            upstream_request_id: None,
                        },
                    );
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::rules::RuleQuery;
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
            scheduler_next_run_jitter_seconds: 0,
            scheduler_failure_retry_seconds: 0,
            scheduler_failure_retry_jitter_seconds: 0,
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

    #[tokio::test]
    async fn mock_provider_produces_matches_for_matching_keywords() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        let now = Utc::now();
        let rule = WatchRule {
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
        };
        store.insert_rule(&rule).unwrap();

        let summary = run_rule(&store, &config, &rule).await.unwrap();
        assert!(summary.fetched > 0);
    }

    #[tokio::test]
    async fn inactive_rule_yields_zero_summary() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u2@example.com").unwrap();
        let now = Utc::now();
        let rule = WatchRule {
            id: Uuid::new_v4(),
            user_id,
            name: "disabled".into(),
            query: RuleQuery {
                keywords: vec!["item".into()],
                sources: vec!["mock".into()],
                max_price: None,
                min_condition: None,
                currency: None,
            },
            is_active: false,
            poll_interval_seconds: 600,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        let summary = run_rule(&store, &config, &rule).await.unwrap();
        assert_eq!(summary.fetched, 0);
    }

    #[tokio::test]
    async fn missing_owning_user_surfaces_as_a_rule_run_failure() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let now = Utc::now();
        let rule = WatchRule {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(), // no such user was ever inserted
            name: "orphaned rule".into(),
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
        };

        let result = run_rule(&store, &config, &rule).await;
        assert!(result.is_err());
    }
}
