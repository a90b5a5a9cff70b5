//! eBay Browse API client: client-credentials OAuth followed by
//! `item_summary/search`, with per-attempt retry metadata recorded for
//! every call.

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

const OAUTH_TOKEN_ENDPOINT: &str = "/identity/v1/oauth2/token";
const SEARCH_ENDPOINT: &str = "/buy/browse/v1/item_summary/search";
const BASE_URL: &str = "https://api.ebay.com";

pub struct EbayClient {
    client: Client,
    client_id: Option<String>,
    client_secret: Option<String>,
    marketplace_id: String,
    oauth_scope: String,
    timeout: Duration,
    max_attempts: u32,
    retry_base_delay_ms: u64,
    retry_max_delay_ms: u64,
}

impl EbayClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            client_id: config.ebay_client_id.clone(),
            client_secret: config.ebay_client_secret.clone(),
            marketplace_id: config.ebay_marketplace_id.clone(),
            oauth_scope: config.ebay_oauth_scope.clone(),
            timeout: Duration::from_secs(config.ebay_timeout_seconds),
            max_attempts: config.ebay_max_attempts.max(1),
            retry_base_delay_ms: config.ebay_retry_base_delay_ms.max(1),
            retry_max_delay_ms: config.ebay_retry_max_delay_ms,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let max_ms = self.retry_max_delay_ms.max(self.retry_base_delay_ms);
        let capped = (self.retry_base_delay_ms * 2u64.pow(attempt.saturating_sub(1))).min(max_ms);
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_secs_f64(capped as f64 / 1000.0 * jitter)
    }

    fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<f64> {
        value
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v.max(0.0))
    }

    async fn auth_token(&self, sink: &dyn RequestLogSink) -> Result<String, ProviderError> {
        let (client_id, client_secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            _ => {
                return Err(ProviderError::new("eBay credentials missing")
                    .with_status(401)
                    .with_endpoint(OAUTH_TOKEN_ENDPOINT)
                    .with_method("POST"))
            }
        };

        let start = Instant::now();
        let response = self
            .client
            .post(format!("{BASE_URL}{OAUTH_TOKEN_ENDPOINT}"))
            .timeout(self.timeout)
            .basic_auth(client_id, Some(client_secret))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&[("grant_type", "client_credentials"), ("scope", &self.oauth_scope)])
            .send()
            .await
            .map_err(|e| {
                let duration_ms = start.elapsed().as_millis() as i64;
                let err = ProviderError::new(format!("eBay auth network error: {e}"))
                    .with_endpoint(OAUTH_TOKEN_ENDPOINT)
                    .with_method("POST")
                    .with_duration_ms(duration_ms);
                sink.log(ProviderRequestLog {
                    provider: "ebay".into(),
                    endpoint: OAUTH_TOKEN_ENDPOINT.into(),
                    method: "POST".into(),
                    status_code: None,
                    duration_ms: Some(duration_ms),
                    error: Some(truncate_error(&err.message)),
                    attempt: 1,
                    total_attempts: 1,
                    retry_after_seconds: None,
                    rate_limit_remaining: None,
                    upstream_request_id: None,
                });
                err
            })?;

        let duration_ms = start.elapsed().as_millis() as i64;
        let status = response.status();
        let request_id = response
            .headers()
            .get("x-ebay-c-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let rate_limit_remaining = response
            .headers()
            .get("x-ebay-c-remaining-request-limit")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let retry_after = Self::parse_retry_after(response.headers().get("Retry-After"));

        if !status.is_success() {
            let err = ProviderError::new(format!("eBay auth error {}", status.as_u16()))
                .with_status(status.as_u16())
                .with_endpoint(OAUTH_TOKEN_ENDPOINT)
                .with_method("POST")
                .with_duration_ms(duration_ms);
            sink.log(ProviderRequestLog {
                provider: "ebay".into(),
                endpoint: OAUTH_TOKEN_ENDPOINT.into(),
                method: "POST".into(),
                status_code: Some(status.as_u16()),
                duration_ms: Some(duration_ms),
                error: Some(truncate_error(&err.message)),
                attempt: 1,
                total_attempts: 1,
                retry_after_seconds: retry_after,
                rate_limit_remaining: rate_limit_remaining.clone(),
                upstream_request_id: request_id.clone(),
            });
            return Err(err);
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::new(format!("eBay auth decode error: {e}")))?;
        let token = payload.get("access_token").and_then(|v| v.as_str());
        let Some(token) = token else {
            let err = ProviderError::new("eBay auth missing access_token")
                .with_status(status.as_u16())
                .with_endpoint(OAUTH_TOKEN_ENDPOINT)
                .with_method("POST");
            sink.log(ProviderRequestLog {
                provider: "ebay".into(),
                endpoint: OAUTH_TOKEN_ENDPOINT.into(),
                method: "POST".into(),
                status_code: Some(status.as_u16()),
                duration_ms: Some(duration_ms),
                error: Some(err.message.clone()),
                attempt: 1,
                total_attempts: 1,
                retry_after_seconds: retry_after,
                rate_limit_remaining,
                upstream_request_id: request_id,
            });
            return Err(err);
        };

        sink.log(ProviderRequestLog {
            provider: "ebay".into(),
            endpoint: OAUTH_TOKEN_ENDPOINT.into(),
            method: "POST".into(),
            status_code: Some(status.as_u16()),
            duration_ms: Some(duration_ms),
            error: None,
            attempt: 1,
            total_attempts: 1,
            retry_after_seconds: retry_after,
            rate_limit_remaining,
            upstream_request_id: request_id,
        });

        Ok(token.to_string())
    }
}

#[async_trait]
impl ProviderClient for EbayClient {
    fn name(&self) -> &'static str {
        "ebay"
    }

    async fn search(
        &self,
        query: &ProviderQuery,
        limit: u32,
        sink: &dyn RequestLogSink,
    ) -> Result<Vec<ProviderListing>, ProviderError> {
        let access_token = self.auth_token(sink).await?;
        let q = query.keywords.join(" ");
        let per_page = limit.min(200);
        let url = format!("{BASE_URL}{SEARCH_ENDPOINT}");

        let mut last_err: Option<ProviderError> = None;

        for attempt in 1..=self.max_attempts {
            let start = Instant::now();
            let response = self
                .client
                .get(&url)
                .timeout(self.timeout)
                .header("Authorization", format!("Bearer {access_token}"))
                .header("X-EBAY-C-MARKETPLACE-ID", &self.marketplace_id)
                .query(&[("q", q.as_str()), ("limit", &per_page.to_string())])
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    let duration_ms = start.elapsed().as_millis() as i64;
                    let err = ProviderError::new(format!("eBay network error: {e}"))
                        .with_endpoint(SEARCH_ENDPOINT)
                        .with_duration_ms(duration_ms);
                    sink.log(ProviderRequestLog {
                        provider: "ebay".into(),
                        endpoint: SEARCH_ENDPOINT.into(),
                        method: "GET".into(),
                        status_code: None,
                        duration_ms: Some(duration_ms),
                        error: Some(truncate_error(&err.message)),
                        attempt,
                        total_attempts: self.max_attempts,
                        retry_after_seconds: None,
                        rate_limit_remaining: None,
                        upstream_request_id: None,
                    });
                    last_err = Some(err);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                        continue;
                    }
                    break;
                }
            };

            let status = response.status();
            let retry_after = Self::parse_retry_after(response.headers().get("Retry-After"));
            let request_id = response
                .headers()
                .get("x-ebay-c-request-id")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let rate_limit_remaining = response
                .headers()
                .get("x-ebay-c-remaining-request-limit")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let duration_ms = start.elapsed().as_millis() as i64;

            if status.is_success() {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::new(format!("eBay decode error: {e}")))?;
                sink.log(ProviderRequestLog {
                    provider: "ebay".into(),
                    endpoint: SEARCH_ENDPOINT.into(),
                    method: "GET".into(),
                    status_code: Some(status.as_u16()),
                    duration_ms: Some(duration_ms),
                    error: None,
                    attempt,
                    total_attempts: self.max_attempts,
                    retry_after_seconds: retry_after,
                    rate_limit_remaining,
                    upstream_request_id: request_id,
                });
                return Ok(parse_item_summaries(&body));
            }

            let err = ProviderError::new(format!("eBay error {}", status.as_u16()))
                .with_status(status.as_u16())
                .with_endpoint(SEARCH_ENDPOINT)
                .with_duration_ms(duration_ms);
            sink.log(ProviderRequestLog {
                provider: "ebay".into(),
                endpoint: SEARCH_ENDPOINT.into(),
                method: "GET".into(),
                status_code: Some(status.as_u16()),
                duration_ms: Some(duration_ms),
                error: Some(truncate_error(&err.message)),
                attempt,
                total_attempts: self.max_attempts,
                retry_after_seconds: retry_after,
                rate_limit_remaining,
                upstream_request_id: request_id,
            });

            if err.is_retryable() && attempt < self.max_attempts {
                let delay = retry_after
                    .map(Duration::from_secs_f64)
                    .unwrap_or_else(|| self.backoff(attempt));
                tokio::time::sleep(delay).await;
                last_err = Some(err);
                continue;
            }

            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| ProviderError::new("eBay request exhausted retries")))
    }
}

fn parse_item_summaries(body: &Value) -> Vec<ProviderListing> {
    let items = body.get("itemSummaries").and_then(|v| v.as_array());
    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let external_id = item.get("itemId").and_then(|v| v.as_str())?.trim().to_string();
            let title = item.get("title").and_then(|v| v.as_str())?.trim().to_string();
            let url = item.get("itemWebUrl").and_then(|v| v.as_str())?.trim().to_string();
            let price_value = item.get("price").and_then(|p| p.get("value"))?;
            let price: f64 = price_value
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| price_value.as_f64())?;

            if external_id.is_empty() || title.is_empty() || url.is_empty() {
                return None;
            }

            let currency = item
                .get("price")
                .and_then(|p| p.get("currency"))
                .and_then(|v| v.as_str())
                .unwrap_or("USD")
                .chars()
                .take(3)
                .collect();

            Some(ProviderListing {
                provider: "ebay".into(),
                external_id,
                url,
                title,
                price,
                currency,
                condition: item.get("condition").and_then(|v| v.as_str()).map(String::from),
                seller: item
                    .get("seller")
                    .and_then(|s| s.get("username"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                location: item
                    .get("itemLocation")
                    .and_then(|l| l.get("country"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                discogs_release_id: None,
                raw: Some(item.clone()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_items_missing_required_fields() {
        let body = serde_json::json!({
            "itemSummaries": [
                {"itemId": "v1|1|0", "title": "Primus LP", "itemWebUrl": "https://x", "price": {"value": "19.99", "currency": "USD"}},
                {"itemId": "", "title": "missing id"},
            ]
        });
        let out = parse_item_summaries(&body);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].price, 19.99);
    }
}
