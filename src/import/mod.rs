//! Discogs wantlist/collection import engine: single-flight job admission,
//! paginated ingestion, watch-release upsert, and lifecycle events.

pub mod oauth;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{EventType, NewEvent};
use crate::notifications::fanout::fan_out_event;
use crate::providers::discogs::{fetch_import_page, DiscogsListItem, ImportSource};
use crate::store::import_jobs::{ImportJob, ImportJobStatus, ImportScope};
use crate::store::releases::{MatchMode, WatchRelease};
use crate::store::Store;
use crate::vault::TokenVault;

/// Admit a single-flight import job for `(user_id, "discogs", scope)`.
/// Returns the job plus whether this call created it. Concurrent callers
/// race on `uq_import_jobs_active_scope`; the loser simply re-reads the
/// winner's row.
pub fn ensure_import_job(
    store: &Store,
    config: &Config,
    user_id: Uuid,
    scope: ImportScope,
) -> anyhow::Result<(ImportJob, bool)> {
    if let Some(existing) = store.find_active_import_job(user_id, "discogs", scope)? {
        return Ok((existing, false));
    }

    if config.discogs_import_cooldown_seconds > 0 {
        if let Some(recent) = store.find_recent_completed_import_job(
            user_id,
            "discogs",
            scope,
            config.discogs_import_cooldown_seconds,
        )? {
            return Ok((recent, false));
        }
    }

    let link = store.find_link(user_id, "discogs")?;
    let link_id = link.as_ref().map(|l| l.id);

    let inserted = store.insert_import_job(user_id, link_id, "discogs", scope);
    match inserted {
        Ok(job_id) => {
            let job = store
                .get_import_job(job_id)?
                .ok_or_else(|| anyhow::anyhow!("import job {job_id} vanished after insert"))?;
            let event = NewEvent::new(user_id, EventType::ImportStarted).with_payload(
                serde_json::json!({ "job_id": job.id, "provider": "discogs", "scope": scope.as_str() }),
            );
            if let Some(event) = store.insert_event(&event)? {
                fan_out_event(store, &event)?;
            }
            Ok((job, true))
        }
        Err(_) => {
            // Lost the race against a concurrent admitter; the unique
            // index rejected our insert. Re-read whichever job won.
            let winner = store
                .find_active_import_job(user_id, "discogs", scope)?
                .ok_or_else(|| anyhow::anyhow!("import job admission conflicted but no active job found"))?;
            Ok((winner, false))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportJobOutcome {
    pub processed: i64,
    pub imported: i64,
    pub created: i64,
    pub updated: i64,
    pub errors: i64,
}

/// Run a job to completion. No-op if the job is not currently `pending`
/// (i.e. someone else already moved it past `running`, or it's terminal).
pub async fn execute_import_job(store: &Store, config: &Config, job_id: Uuid) -> anyhow::Result<()> {
    let Some(job) = store.get_import_job(job_id)? else {
        warn!(job_id = %job_id, "execute_import_job: job not found");
        return Ok(());
    };
    if job.status != ImportJobStatus::Pending {
        return Ok(());
    }

    store.mark_import_job_running(job.id)?;

    let scopes: Vec<ImportScope> = match job.import_scope {
        ImportScope::Both => vec![ImportScope::Wantlist, ImportScope::Collection],
        other => vec![other],
    };

    let mut outcome = ImportJobOutcome::default();
    let run_result = run_import(store, config, &job, &scopes, &mut outcome).await;

    match run_result {
        Ok(()) => {
            store.update_import_job_progress(
                job.id,
                1,
                outcome.processed,
                outcome.imported,
                outcome.created,
                outcome.updated,
                outcome.errors,
                None,
            )?;
            store.complete_import_job(job.id, None)?;
            let event = NewEvent::new(job.user_id, EventType::ImportCompleted).with_payload(
                serde_json::json!({
                    "job_id": job.id,
                    "provider": "discogs",
                    "scope": job.import_scope.as_str(),
                    "processed": outcome.processed,
                    "imported": outcome.imported,
                    "created": outcome.created,
                    "updated": outcome.updated,
                }),
            );
            if let Some(event) = store.insert_event(&event)? {
                fan_out_event(store, &event)?;
            }
            info!(job_id = %job.id, user_id = %job.user_id, processed = outcome.processed, "import job completed");
        }
        Err(e) => {
            // Strip anything that could carry a token before it touches logs/storage.
            let redacted = redact(&e.to_string());
            store.fail_import_job(job.id, &redacted)?;
            let event = NewEvent::new(job.user_id, EventType::ImportFailed).with_payload(
                serde_json::json!({ "job_id": job.id, "provider": "discogs", "error": redacted }),
            );
            if let Some(event) = store.insert_event(&event)? {
                fan_out_event(store, &event)?;
            }
            warn!(job_id = %job.id, user_id = %job.user_id, error = redacted, "import job failed");
        }
    }

    Ok(())
}

async fn run_import(
    store: &Store,
    config: &Config,
    job: &ImportJob,
    scopes: &[ImportScope],
    outcome: &mut ImportJobOutcome,
) -> anyhow::Result<()> {
    let link = store
        .find_link(job.user_id, "discogs")?
        .ok_or_else(|| anyhow::anyhow!("no discogs account link for user"))?;
    let stored_token = link
        .access_token
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("discogs account link has no access token"))?;

    let vault = TokenVault::new(config)?;
    let decrypted = vault.decrypt(stored_token)?;
    if decrypted.requires_migration {
        let reencrypted = vault.encrypt(&decrypted.plaintext)?;
        store.update_link_access_token(link.id, &reencrypted)?;
    }
    let token = decrypted.plaintext;

    let external_user_id = link.external_user_id.clone();

    for scope in scopes {
        let source = match scope {
            ImportScope::Wantlist => ImportSource::Wantlist,
            ImportScope::Collection => ImportSource::Collection,
            ImportScope::Both => unreachable!("Both is split into Wantlist/Collection before fetching"),
        };

        let mut page = 1i64;
        loop {
            let releases = fetch_import_page(config, &token, &external_user_id, source, page).await?;

            for entry in &releases.items {
                outcome.processed += 1;
                match upsert_watch_release(store, job.user_id, entry, *scope) {
                    Ok(true) => outcome.created += 1,
                    Ok(false) => outcome.updated += 1,
                    Err(e) => {
                        outcome.errors += 1;
                        warn!(user_id = %job.user_id, error = %e, "watch release upsert failed during import");
                        continue;
                    }
                }
                outcome.imported += 1;
            }

            store.update_import_job_progress(
                job.id,
                page,
                outcome.processed,
                outcome.imported,
                outcome.created,
                outcome.updated,
                outcome.errors,
                Some(&format!("{}:{page}/{}", scope.as_str(), releases.total_pages)),
            )?;

            if page >= releases.total_pages || releases.items.is_empty() {
                break;
            }
            page += 1;
        }
    }

    Ok(())
}

/// Upsert keyed by `(user, discogs_release_id)`: update cached display
/// fields and OR the scope's `imported_from_*` flag in without clobbering
/// whichever flag the other source already set (flags are never cleared,
/// only OR'd in — see DESIGN.md). Returns `true` if a new row was created.
fn upsert_watch_release(
    store: &Store,
    user_id: Uuid,
    entry: &DiscogsListItem,
    scope: ImportScope,
) -> anyhow::Result<bool> {
    let now = Utc::now();
    match store.find_release_by_discogs_release_id(user_id, entry.release_id)? {
        Some(mut existing) => {
            existing.discogs_master_id = entry.master_id.or(existing.discogs_master_id);
            existing.title = entry.title.clone();
            existing.artist = entry.artist.clone().or(existing.artist);
            existing.year = entry.year.or(existing.year);
            existing.imported_from_wantlist =
                existing.imported_from_wantlist || scope == ImportScope::Wantlist;
            existing.imported_from_collection =
                existing.imported_from_collection || scope == ImportScope::Collection;
            existing.updated_at = now;
            store.update_release_from_import(&existing)?;
            Ok(false)
        }
        None => {
            let release = WatchRelease {
                id: Uuid::new_v4(),
                user_id,
                discogs_release_id: entry.release_id,
                discogs_master_id: entry.master_id,
                match_mode: MatchMode::ExactRelease,
                title: entry.title.clone(),
                artist: entry.artist.clone(),
                year: entry.year,
                target_price: None,
                currency: "USD".to_string(),
                min_condition: None,
                is_active: true,
                imported_from_wantlist: scope == ImportScope::Wantlist,
                imported_from_collection: scope == ImportScope::Collection,
                created_at: now,
                updated_at: now,
            };
            store.insert_release(&release)?;
            Ok(true)
        }
    }
}

/// One watch release as surfaced to a caller listing what's already been
/// imported from a user's wantlist or collection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportedItem {
    pub watch_release_id: Uuid,
    pub discogs_release_id: i64,
    pub discogs_master_id: Option<i64>,
    pub title: String,
    pub artist: Option<String>,
    pub year: Option<i64>,
    pub source: ImportScope,
    pub open_in_discogs_url: String,
}

/// List a user's active watch releases imported from `source` (wantlist or
/// collection), newest-updated first. `source` must be `Wantlist` or
/// `Collection` — `Both` has no single imported-from column to filter on.
pub fn list_imported_items(
    store: &Store,
    user_id: Uuid,
    source: ImportScope,
) -> anyhow::Result<Vec<ImportedItem>> {
    let from_wantlist = match source {
        ImportScope::Wantlist => true,
        ImportScope::Collection => false,
        ImportScope::Both => {
            anyhow::bail!("list_imported_items requires a single source (wantlist or collection)")
        }
    };

    let releases = store.list_imported_releases_for_user(user_id, from_wantlist)?;
    Ok(releases
        .into_iter()
        .map(|r| ImportedItem {
            watch_release_id: r.id,
            discogs_release_id: r.discogs_release_id,
            discogs_master_id: r.discogs_master_id,
            title: r.title,
            artist: r.artist,
            year: r.year,
            source,
            open_in_discogs_url: discogs_release_url(r.discogs_release_id),
        })
        .collect())
}

/// Resolve the "open in Discogs" link for one imported watch release,
/// scoped to both the owning user and the claimed import source so a
/// release only imported from the wantlist can't be looked up under
/// `source = collection`.
pub fn get_open_in_discogs_link(
    store: &Store,
    user_id: Uuid,
    watch_release_id: Uuid,
    source: ImportScope,
) -> anyhow::Result<ImportedItem> {
    let release = store
        .get_release(watch_release_id)?
        .filter(|r| r.user_id == user_id && r.is_active)
        .ok_or_else(|| anyhow::anyhow!("imported Discogs item not found for source"))?;

    let matches_source = match source {
        ImportScope::Wantlist => release.imported_from_wantlist,
        ImportScope::Collection => release.imported_from_collection,
        ImportScope::Both => anyhow::bail!("get_open_in_discogs_link requires a single source"),
    };
    if !matches_source {
        anyhow::bail!("imported Discogs item not found for source");
    }

    Ok(ImportedItem {
        watch_release_id: release.id,
        discogs_release_id: release.discogs_release_id,
        discogs_master_id: release.discogs_master_id,
        title: release.title,
        artist: release.artist,
        year: release.year,
        source,
        open_in_discogs_url: discogs_release_url(release.discogs_release_id),
    })
}

fn discogs_release_url(discogs_release_id: i64) -> String {
    format!("https://www.discogs.com/release/{discogs_release_id}")
}

/// Strip anything that looks like a bearer/OAuth token or Authorization
/// header before an error string is persisted or logged.
fn redact(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for line in message.split_inclusive('\n') {
        let lower = line.to_lowercase();
        if lower.contains("token=") || lower.contains("authorization") || lower.contains("bearer ") {
            out.push_str("[redacted: credential-bearing line omitted]");
            if !line.ends_with('\n') {
                out.push('\n');
            }
        } else {
            out.push_str(line);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::users::insert_test_user;

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

    #[test]
    fn ensure_import_job_is_single_flight() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();

        let (first, created_first) =
            ensure_import_job(&store, &config, user_id, ImportScope::Both).unwrap();
        assert!(created_first);

        let (second, created_second) =
            ensure_import_job(&store, &config, user_id, ImportScope::Both).unwrap();
        assert!(!created_second);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn ensure_import_job_emits_exactly_one_started_event() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();

        ensure_import_job(&store, &config, user_id, ImportScope::Wantlist).unwrap();
        ensure_import_job(&store, &config, user_id, ImportScope::Wantlist).unwrap();

        let events = store.list_events_for_user(user_id, 10).unwrap();
        let started = events
            .iter()
            .filter(|e| e.event_type == EventType::ImportStarted)
            .count();
        assert_eq!(started, 1);
    }

    #[test]
    fn execute_import_job_fails_cleanly_without_a_linked_account() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        let (job, _) = ensure_import_job(&store, &config, user_id, ImportScope::Wantlist).unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(execute_import_job(&store, &config, job.id)).unwrap();

        let reloaded = store.get_import_job(job.id).unwrap().unwrap();
        assert_eq!(reloaded.status, ImportJobStatus::Failed);
    }

    #[test]
    fn redact_strips_token_bearing_lines() {
        let msg = "request failed: Authorization: Discogs token=abc123 rejected";
        let redacted = redact(msg);
        assert!(!redacted.contains("abc123"));
    }

    #[test]
    fn watch_release_upsert_ors_import_flags_without_clearing() {
        let store = Store::open_in_memory().unwrap();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();

        let entry = DiscogsListItem {
            release_id: 555,
            master_id: None,
            title: "Frizzle Fry".into(),
            artist: Some("Primus".into()),
            year: Some(1990),
        };
        upsert_watch_release(&store, user_id, &entry, ImportScope::Wantlist).unwrap();
        upsert_watch_release(&store, user_id, &entry, ImportScope::Collection).unwrap();

        let release = store
            .find_release_by_discogs_release_id(user_id, 555)
            .unwrap()
            .unwrap();
        assert!(release.imported_from_wantlist);
        assert!(release.imported_from_collection);
    }

    #[test]
    fn list_imported_items_filters_by_source() {
        let store = Store::open_in_memory().unwrap();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();

        let wantlist_entry = DiscogsListItem {
            release_id: 111,
            master_id: None,
            title: "Sailing the Seas of Cheese".into(),
            artist: Some("Primus".into()),
            year: Some(1991),
        };
        let collection_entry = DiscogsListItem {
            release_id: 222,
            master_id: None,
            title: "Frizzle Fry".into(),
            artist: Some("Primus".into()),
            year: Some(1990),
        };
        upsert_watch_release(&store, user_id, &wantlist_entry, ImportScope::Wantlist).unwrap();
        upsert_watch_release(&store, user_id, &collection_entry, ImportScope::Collection).unwrap();

        let wantlist_items = list_imported_items(&store, user_id, ImportScope::Wantlist).unwrap();
        assert_eq!(wantlist_items.len(), 1);
        assert_eq!(wantlist_items[0].discogs_release_id, 111);
        assert!(wantlist_items[0].open_in_discogs_url.contains("111"));

        let collection_items = list_imported_items(&store, user_id, ImportScope::Collection).unwrap();
        assert_eq!(collection_items.len(), 1);
        assert_eq!(collection_items[0].discogs_release_id, 222);
    }

    #[test]
    fn get_open_in_discogs_link_rejects_wrong_source() {
        let store = Store::open_in_memory().unwrap();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();

        let entry = DiscogsListItem {
            release_id: 333,
            master_id: None,
            title: "Pork Soda".into(),
            artist: Some("Primus".into()),
            year: Some(1993),
        };
        upsert_watch_release(&store, user_id, &entry, ImportScope::Wantlist).unwrap();
        let release = store.find_release_by_discogs_release_id(user_id, 333).unwrap().unwrap();

        let ok = get_open_in_discogs_link(&store, user_id, release.id, ImportScope::Wantlist);
        assert!(ok.is_ok());

        let wrong = get_open_in_discogs_link(&store, user_id, release.id, ImportScope::Collection);
        assert!(wrong.is_err());
    }

    #[test]
    fn get_open_in_discogs_link_rejects_cross_user_access() {
        let store = Store::open_in_memory().unwrap();
        let owner = insert_test_user(&store, "owner@example.com").unwrap();
        let stranger = insert_test_user(&store, "stranger@example.com").unwrap();

        let entry = DiscogsListItem {
            release_id: 444,
            master_id: None,
            title: "Antipop".into(),
            artist: Some("Primus".into()),
            year: Some(1999),
        };
        upsert_watch_release(&store, owner, &entry, ImportScope::Wantlist).unwrap();
        let release = store.find_release_by_discogs_release_id(owner, 444).unwrap().unwrap();

        let result = get_open_in_discogs_link(&store, stranger, release.id, ImportScope::Wantlist);
        assert!(result.is_err());
    }
}
