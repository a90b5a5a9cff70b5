//! Discogs `/database/search` client, with the same retry/jitter shape
//! as the eBay client for consistency across providers.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde_json::Value;

use super::{
    truncate_error, ProviderClient, ProviderError, ProviderListing, ProviderQuery,
    ProviderRequestLog, RequestLogSink,
};
use crate::config::Config;

const BASE_URL: &str = "https://api.discogs.com";
const MAX_ATTEMPTS: u32 = 3;

pub struct DiscogsClient {
    client: Client,
    token: Option<String>,
    user_agent: String,
    timeout: Duration,
}

impl DiscogsClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            token: config.discogs_token.clone(),
            user_agent: config.discogs_user_agent.clone(),
            timeout: Duration::from_secs(config.discogs_timeout_seconds),
        }
    }

    fn backoff(attempt: u32, retry_after: Option<f64>) -> Duration {
        if let Some(secs) = retry_after {
            return Duration::from_secs_f64(secs.max(0.0));
        }
        let base_ms = 250u64;
        let max_ms = 8_000u64;
        let capped = (base_ms * 2u64.pow(attempt.saturating_sub(1))).min(max_ms);
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_secs_f64(capped as f64 / 1000.0 * jitter)
    }
}

#[async_trait]
impl ProviderClient for DiscogsClient {
    fn name(&self) -> &'static str {
        "discogs"
    }

    async fn search(
        &self,
        query: &ProviderQuery,
        limit: u32,
        sink: &dyn RequestLogSink,
    ) -> Result<Vec<ProviderListing>, ProviderError> {
        let endpoint = "/database/search";
        let url = format!("{BASE_URL}{endpoint}");
        let search_q = query.keywords.join(" ");
        let per_page = limit.min(50);

        let mut last_err: Option<ProviderError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let start = Instant::now();
            let mut req = self
                .client
                .get(&url)
                .timeout(self.timeout)
                .header("User-Agent", &self.user_agent)
                .query(&[
                    ("q", search_q.as_str()),
                    ("type", "release"),
                    ("per_page", &per_page.to_string()),
                ]);
            if let Some(token) = &self.token {
                req = req.header("Authorization", format!("Discogs token={token}"));
            }

            let response = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    let duration_ms = start.elapsed().as_millis() as i64;
                    let err = ProviderError::new(format!("Discogs network error: {e}"))
                        .with_endpoint(endpoint)
                        .with_duration_ms(duration_ms);
                    sink.log(ProviderRequestLog {
                        provider: "discogs".into(),
                        endpoint: endpoint.into(),
                        method: "GET".into(),
                        status_code: None,
                        duration_ms: Some(duration_ms),
                        error: Some(truncate_error(&err.message)),
                        attempt,
                        total_attempts: MAX_ATTEMPTS,
                        retry_after_seconds: None,
                        rate_limit_remaining: None,
                        upstream_request_id: None,
                    });
                    last_err = Some(err);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(Self::backoff(attempt, None)).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            let duration_ms = start.elapsed().as_millis() as i64;

            if status.is_success() {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::new(format!("Discogs decode error: {e}")))?;
                sink.log(ProviderRequestLog {
                    provider: "discogs".into(),
                    endpoint: endpoint.into(),
                    method: "GET".into(),
                    status_code: Some(status.as_u16()),
                    duration_ms: Some(duration_ms),
                    error: None,
                    attempt,
                    total_attempts: MAX_ATTEMPTS,
                    retry_after_seconds: retry_after,
                    rate_limit_remaining: None,
                    upstream_request_id: None,
                });
                return Ok(parse_results(&body));
            }

            let body_text = response.text().await.unwrap_or_default();
            let err = ProviderError::new(format!("Discogs error {}: {body_text}", status.as_u16()))
                .with_status(status.as_u16())
                .with_endpoint(endpoint)
                .with_duration_ms(duration_ms);
            sink.log(ProviderRequestLog {
                provider: "discogs".into(),
                endpoint: endpoint.into(),
                method: "GET".into(),
                status_code: Some(status.as_u16()),
                duration_ms: Some(duration_ms),
                error: Some(truncate_error(&err.message)),
                attempt,
                total_attempts: MAX_ATTEMPTS,
                retry_after_seconds: retry_after,
                rate_limit_remaining: None,
                upstream_request_id: None,
            });

            if err.is_retryable() && attempt < MAX_ATTEMPTS {
                tokio::time::sleep(Self::backoff(attempt, retry_after)).await;
                last_err = Some(err);
                continue;
            }

            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| ProviderError::new("Discogs request exhausted retries")))
    }
}

fn parse_results(body: &Value) -> Vec<ProviderListing> {
    let results = body.get("results").and_then(|v| v.as_array());
    let Some(results) = results else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|r| {
            let id = r.get("id")?;
            let external_id = id.to_string();
            let title = r.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let url = r
                .get("uri")
                .and_then(|v| v.as_str())
                .or_else(|| r.get("resource_url").and_then(|v| v.as_str()))
                .unwrap_or("")
                .to_string();
            let discogs_release_id = id.as_i64();

            Some(ProviderListing {
                provider: "discogs".into(),
                external_id,
                url,
                title,
                // Discogs search has no marketplace price.
                price: 0.0,
                currency: "USD".into(),
                condition: None,
                seller: None,
                location: None,
                discogs_release_id,
                raw: Some(r.clone()),
            })
        })
        .collect()
}

/// One entry from a Discogs wantlist/collection page, already narrowed to
/// the fields the import engine needs out of `basic_information`.
#[derive(Debug, Clone)]
pub struct DiscogsListItem {
    pub release_id: i64,
    pub master_id: Option<i64>,
    pub title: String,
    pub artist: Option<String>,
    pub year: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DiscogsListPage {
    pub items: Vec<DiscogsListItem>,
    pub total_pages: i64,
}

const IMPORT_PER_PAGE: u32 = 100;

/// A single Discogs list endpoint to page through. `ImportScope::Both`
/// expands into two `ImportSource` fetches at the call site (the job-level
/// scope can be "both"; no single page fetch ever is — mirrors
/// `_import_source` expanding `source == "both"` before calling
/// `_endpoint_for`/`_fetch_page` in `discogs_import.py`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSource {
    Wantlist,
    Collection,
}

/// Fetch one page of a user's wantlist or collection, authenticated with
/// their own (already-decrypted) OAuth token rather than the app-level
/// `discogs_token` the search client uses.
pub async fn fetch_import_page(
    config: &Config,
    access_token: &str,
    username: &str,
    source: ImportSource,
    page: i64,
) -> Result<DiscogsListPage, ProviderError> {
    let client = Client::new();
    let timeout = Duration::from_secs(config.discogs_timeout_seconds);
    let endpoint = match source {
        ImportSource::Wantlist => format!("/users/{username}/wants"),
        ImportSource::Collection => format!("/users/{username}/collection/folders/0/releases"),
    };
    let url = format!("{BASE_URL}{endpoint}");

    let response = client
        .get(&url)
        .timeout(timeout)
        .header("User-Agent", &config.discogs_user_agent)
        .header("Authorization", format!("Discogs token={access_token}"))
        .query(&[("page", page.to_string()), ("per_page", IMPORT_PER_PAGE.to_string())])
        .send()
        .await
        .map_err(|e| ProviderError::new(format!("Discogs network error: {e}")).with_endpoint(&endpoint))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(ProviderError::new(format!("Discogs error {}: {body_text}", status.as_u16()))
            .with_status(status.as_u16())
            .with_endpoint(&endpoint));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| ProviderError::new(format!("Discogs decode error: {e}")).with_endpoint(&endpoint))?;

    let total_pages = body
        .get("pagination")
        .and_then(|p| p.get("pages"))
        .and_then(|p| p.as_i64())
        .unwrap_or(1);

    let raw_items = match source {
        ImportSource::Wantlist => body.get("wants").and_then(|v| v.as_array()),
        ImportSource::Collection => body.get("releases").and_then(|v| v.as_array()),
    };

    let items = raw_items
        .map(|arr| arr.iter().filter_map(parse_list_item).collect())
        .unwrap_or_default();

    Ok(DiscogsListPage { items, total_pages })
}

fn parse_list_item(entry: &Value) -> Option<DiscogsListItem> {
    let info = entry.get("basic_information")?;
    let release_id = info.get("id").and_then(|v| v.as_i64())?;
    let master_id = info.get("master_id").and_then(|v| v.as_i64()).filter(|id| *id != 0);
    let title = info.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let artist = info
        .get("artists")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|a| a.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let year = info.get("year").and_then(|v| v.as_i64()).filter(|y| *y != 0);

    Some(DiscogsListItem {
        release_id,
        master_id,
        title,
        artist,
        year,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_item_from_basic_information() {
        let entry = serde_json::json!({
            "basic_information": {
                "id": 456,
                "master_id": 789,
                "title": "Frizzle Fry",
                "year": 1990,
                "artists": [{"name": "Primus"}],
            }
        });
        let item = parse_list_item(&entry).unwrap();
        assert_eq!(item.release_id, 456);
        assert_eq!(item.master_id, Some(789));
        assert_eq!(item.artist.as_deref(), Some("Primus"));
        assert_eq!(item.year, Some(1990));
    }

    #[test]
    fn parses_results_into_zero_price_listings() {
        let body = serde_json::json!({
            "pagination": {"pages": 1, "page": 1},
            "results": [
                {"id": 123, "title": "Primus - Frizzle Fry", "uri": "/release/123"},
            ]
        });
        let listings = parse_results(&body);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].price, 0.0);
        assert_eq!(listings[0].discogs_release_id, Some(123));
    }

    #[test]
    fn missing_results_key_yields_empty() {
        let body = serde_json::json!({});
        assert!(parse_results(&body).is_empty());
    }
}
