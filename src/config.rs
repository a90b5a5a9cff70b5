//! Process configuration.
//! Mission: Load every tunable knob from the environment with sane defaults.

use std::time::Duration;

/// All runtime configuration for the watch engine, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    // Scheduler
    pub scheduler_tick_interval_seconds: u64,
    pub scheduler_batch_size: i64,
    pub scheduler_rule_limit: i64,
    pub scheduler_next_run_jitter_seconds: i64,
    pub scheduler_failure_retry_seconds: i64,
    pub scheduler_failure_retry_jitter_seconds: i64,

    // Delivery worker
    pub delivery_max_retries: u32,
    pub delivery_retry_backoff_seconds: u64,
    pub delivery_batch_size: i64,

    // Rule runner
    pub rule_runner_fetch_limit: u32,

    // Provider clients
    pub discogs_user_agent: String,
    pub discogs_token: Option<String>,
    pub discogs_oauth_client_id: Option<String>,
    pub discogs_oauth_client_secret: Option<String>,
    pub discogs_oauth_redirect_uri: Option<String>,
    pub discogs_oauth_scopes: String,
    pub discogs_oauth_state_ttl_seconds: i64,
    pub discogs_timeout_seconds: u64,

    pub ebay_client_id: Option<String>,
    pub ebay_client_secret: Option<String>,
    pub ebay_marketplace_id: String,
    pub ebay_oauth_scope: String,
    pub ebay_timeout_seconds: u64,
    pub ebay_max_attempts: u32,
    pub ebay_retry_base_delay_ms: u64,
    pub ebay_retry_max_delay_ms: u64,

    // eBay Partner Network affiliate redirect
    pub ebay_campaign_id: Option<String>,
    pub ebay_custom_id: Option<String>,

    // Discogs periodic sync
    pub discogs_sync_enabled: bool,
    pub discogs_sync_interval_seconds: i64,
    pub discogs_sync_user_batch_size: i64,
    pub discogs_sync_jitter_seconds: i64,
    pub discogs_import_cooldown_seconds: i64,

    // Token vault
    pub token_crypto_key_id: String,
    pub token_crypto_local_key: Option<String>,

    pub log_level: String,
}

impl Config {
    /// Load configuration from `.env` + process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./watchwax.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        Ok(Self {
            database_path,
            port,

            scheduler_tick_interval_seconds: env_u64("SCHEDULER_TICK_INTERVAL_SECONDS", 15),
            scheduler_batch_size: env_i64("SCHEDULER_BATCH_SIZE", 100),
            scheduler_rule_limit: env_i64("SCHEDULER_RULE_LIMIT", 20),
            scheduler_next_run_jitter_seconds: env_i64("SCHEDULER_NEXT_RUN_JITTER_SECONDS", 30),
            scheduler_failure_retry_seconds: env_i64("SCHEDULER_FAILURE_RETRY_SECONDS", 30),
            scheduler_failure_retry_jitter_seconds: env_i64(
                "SCHEDULER_FAILURE_RETRY_JITTER_SECONDS",
                10,
            ),

            delivery_max_retries: env_u64("DELIVERY_MAX_RETRIES", 5) as u32,
            delivery_retry_backoff_seconds: env_u64("DELIVERY_RETRY_BACKOFF_SECONDS", 30),
            delivery_batch_size: env_i64("DELIVERY_BATCH_SIZE", 100),

            rule_runner_fetch_limit: env_u64("RULE_RUNNER_FETCH_LIMIT", 50) as u32,

            discogs_user_agent: std::env::var("DISCOGS_USER_AGENT")
                .unwrap_or_else(|_| "WatchWax/1.0".to_string()),
            discogs_token: std::env::var("DISCOGS_TOKEN").ok(),
            discogs_oauth_client_id: std::env::var("DISCOGS_OAUTH_CLIENT_ID").ok(),
            discogs_oauth_client_secret: std::env::var("DISCOGS_OAUTH_CLIENT_SECRET").ok(),
            discogs_oauth_redirect_uri: std::env::var("DISCOGS_OAUTH_REDIRECT_URI").ok(),
            discogs_oauth_scopes: std::env::var("DISCOGS_OAUTH_SCOPES")
                .unwrap_or_else(|_| String::new()),
            discogs_oauth_state_ttl_seconds: env_i64("DISCOGS_OAUTH_STATE_TTL_SECONDS", 600),
            discogs_timeout_seconds: env_u64("DISCOGS_TIMEOUT_SECONDS", 10),

            ebay_client_id: std::env::var("EBAY_CLIENT_ID").ok(),
            ebay_client_secret: std::env::var("EBAY_CLIENT_SECRET").ok(),
            ebay_marketplace_id: std::env::var("EBAY_MARKETPLACE_ID")
                .unwrap_or_else(|_| "EBAY_US".to_string()),
            ebay_oauth_scope: std::env::var("EBAY_OAUTH_SCOPE")
                .unwrap_or_else(|_| "https://api.ebay.com/oauth/api_scope".to_string()),
            ebay_timeout_seconds: env_u64("EBAY_TIMEOUT_SECONDS", 10),
            ebay_max_attempts: env_u64("EBAY_MAX_ATTEMPTS", 3) as u32,
            ebay_retry_base_delay_ms: env_u64("EBAY_RETRY_BASE_DELAY_MS", 250),
            ebay_retry_max_delay_ms: env_u64("EBAY_RETRY_MAX_DELAY_MS", 8_000),

            ebay_campaign_id: std::env::var("EBAY_CAMPAIGN_ID").ok(),
            ebay_custom_id: std::env::var("EBAY_CUSTOM_ID").ok(),

            discogs_sync_enabled: env_bool("DISCOGS_SYNC_ENABLED", false),
            discogs_sync_interval_seconds: env_i64("DISCOGS_SYNC_INTERVAL_SECONDS", 86_400),
            discogs_sync_user_batch_size: env_i64("DISCOGS_SYNC_USER_BATCH_SIZE", 50),
            discogs_sync_jitter_seconds: env_i64("DISCOGS_SYNC_JITTER_SECONDS", 300),
            discogs_import_cooldown_seconds: env_i64("DISCOGS_IMPORT_COOLDOWN_SECONDS", 3_600),

            token_crypto_key_id: std::env::var("TOKEN_CRYPTO_KEY_ID")
                .unwrap_or_else(|_| "local-dev".to_string()),
            token_crypto_local_key: std::env::var("TOKEN_CRYPTO_LOCAL_KEY").ok(),

            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn scheduler_tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_interval_seconds)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}
