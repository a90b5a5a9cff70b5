//! Provider client contract shared by every marketplace integration.

pub mod discogs;
pub mod ebay;
pub mod mock;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single external listing, normalized to the shape every downstream
/// component (ingest, matcher, mapper) consumes regardless of provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderListing {
    pub provider: String,
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub condition: Option<String>,
    pub seller: Option<String>,
    pub location: Option<String>,
    pub discogs_release_id: Option<i64>,
    pub raw: Option<Value>,
}

/// Raised when a provider request fails in a controlled way. Carries
/// enough context for the caller to decide retry/skip without re-deriving
/// it from a generic error string.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub status_code: Option<u16>,
    pub meta: Option<Value>,
    pub endpoint: Option<String>,
    pub method: String,
    pub duration_ms: Option<i64>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            meta: None,
            endpoint: None,
            method: "GET".to_string(),
            duration_ms: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// `429` and `5xx` are transient; everything else
    /// (4xx non-429, missing credentials) is permanent.
    pub fn is_retryable(&self) -> bool {
        match self.status_code {
            Some(code) => code == 429 || code >= 500,
            None => true, // network errors are retried too
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// One row per outbound attempt, delivered to a caller-supplied sink.
/// `error` is truncated to 500 chars before storing.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequestLog {
    pub provider: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub attempt: u32,
    pub total_attempts: u32,
    pub retry_after_seconds: Option<f64>,
    pub rate_limit_remaining: Option<String>,
    pub upstream_request_id: Option<String>,
}

pub const MAX_ERROR_LEN: usize = 500;

pub fn truncate_error(msg: &str) -> String {
    if msg.len() <= MAX_ERROR_LEN {
        msg.to_string()
    } else {
        msg.chars().take(MAX_ERROR_LEN).collect()
    }
}

/// Sink every provider attempt is reported to. The rule runner binds one
/// per (user, provider) invocation so request logs land with the right
/// `user_id`/`provider` without threading a database handle through the
/// client itself.
pub trait RequestLogSink: Send + Sync {
    fn log(&self, entry: ProviderRequestLog);
}

/// A sink that counts how many rows it received — the rule runner uses
/// this count to decide whether to emit its own synthetic fallback row:
/// a provider client that logs zero rows signals the caller to emit one.
pub struct CountingSink<F: Fn(ProviderRequestLog) + Send + Sync> {
    count: std::sync::atomic::AtomicU32,
    emit: F,
}

impl<F: Fn(ProviderRequestLog) + Send + Sync> CountingSink<F> {
    pub fn new(emit: F) -> Self {
        Self {
            count: std::sync::atomic::AtomicU32::new(0),
            emit,
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl<F: Fn(ProviderRequestLog) + Send + Sync> RequestLogSink for CountingSink<F> {
    fn log(&self, entry: ProviderRequestLog) {
        self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        (self.emit)(entry);
    }
}

/// Normalized shape of a rule's query, as the providers see it — a subset
/// of `crate::store::rules::RuleQuery` plus the `_seed` key the rule
/// runner adds for deterministic mock-provider output.
#[derive(Debug, Clone, Default)]
pub struct ProviderQuery {
    pub keywords: Vec<String>,
    pub max_price: Option<f64>,
    pub seed: Option<String>,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(
        &self,
        query: &ProviderQuery,
        limit: u32,
        sink: &dyn RequestLogSink,
    ) -> Result<Vec<ProviderListing>, ProviderError>;
}

/// Resolve a provider client by its wire name (`discogs`, `ebay`, `mock`).
pub fn build_client(name: &str, config: &crate::config::Config) -> Option<Box<dyn ProviderClient>> {
    match name {
        "discogs" => Some(Box::new(discogs::DiscogsClient::new(config))),
        "ebay" => Some(Box::new(ebay::EbayClient::new(config))),
        "mock" => Some(Box::new(mock::MockClient::new())),
        _ => None,
    }
}
