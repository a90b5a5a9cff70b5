//! Discogs OAuth connect/disconnect lifecycle: `start_oauth` mints a CSRF
//! state and hands back the authorize URL; `complete_oauth` exchanges the
//! authorization code, looks up the connecting user's Discogs identity, and
//! persists the link; `disconnect_account` optionally revokes the token
//! upstream and deletes the link. The import job engine assumes a
//! connected `ExternalAccountLink` already exists — this is how that link
//! comes to exist.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use reqwest::Client;
use serde_json::Value;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::store::links::ExternalAccountLink;
use crate::store::Store;
use crate::vault::TokenVault;

const AUTHORIZE_URL: &str = "https://www.discogs.com/oauth/authorize";
const TOKEN_URL: &str = "https://api.discogs.com/oauth/access_token";
const REVOKE_URL: &str = "https://api.discogs.com/oauth/revoke";
const IDENTITY_URL: &str = "https://api.discogs.com/oauth/identity";

/// What a caller needs to redirect a user into the Discogs consent screen.
#[derive(Debug, Clone)]
pub struct OAuthStart {
    pub provider: &'static str,
    pub authorize_url: String,
    pub state: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// Begin a Discogs OAuth connect flow for `user_id`. Mints a CSRF state
/// token and stashes it, the requested scopes, and an `oauth_connected:
/// false` marker in the link's `token_metadata` under a placeholder
/// `external_user_id = "pending"` (mirrors `start_oauth` writing a
/// not-yet-real link row so `complete_oauth` has somewhere to read the
/// state back from).
pub fn start_oauth(
    store: &Store,
    config: &Config,
    user_id: Uuid,
    scopes: Option<Vec<String>>,
) -> CoreResult<OAuthStart> {
    store
        .get_user(user_id)?
        .ok_or_else(|| CoreError::NotFound(format!("user {user_id}")))?;

    let requested_scopes = scopes.unwrap_or_else(|| split_scope_string(&config.discogs_oauth_scopes));
    let state = random_state();
    let now = Utc::now();
    let expires_at = now + ChronoDuration::seconds(config.discogs_oauth_state_ttl_seconds);

    let metadata = serde_json::json!({
        "oauth_state": state,
        "oauth_state_expires_at": expires_at.to_rfc3339(),
        "oauth_scopes": requested_scopes,
        "oauth_connected": false,
    });

    store.upsert_link(
        user_id,
        "discogs",
        "pending",
        None,
        None,
        None,
        None,
        None,
        Some(&metadata),
    )?;

    let client_id = config.discogs_oauth_client_id.clone().unwrap_or_default();
    let redirect_uri = config.discogs_oauth_redirect_uri.clone().unwrap_or_default();
    let query = build_query(&[
        ("client_id", client_id.as_str()),
        ("response_type", "code"),
        ("redirect_uri", redirect_uri.as_str()),
        ("scope", &requested_scopes.join(" ")),
        ("state", &state),
    ]);

    Ok(OAuthStart {
        provider: "discogs",
        authorize_url: format!("{AUTHORIZE_URL}?{query}"),
        state,
        scopes: requested_scopes,
        expires_at,
    })
}

/// Exchange an authorization code for an access token, verify the `state`
/// matches what `start_oauth` stashed and hasn't expired, resolve the
/// connecting Discogs username via `/oauth/identity`, and persist the
/// link with the real (vault-encrypted) access token.
pub async fn complete_oauth(
    store: &Store,
    config: &Config,
    user_id: Uuid,
    state: &str,
    code: &str,
) -> CoreResult<ExternalAccountLink> {
    let link = store
        .find_link(user_id, "discogs")?
        .ok_or_else(|| CoreError::Validation("OAuth session not started".into()))?;

    let metadata = link.token_metadata.clone().unwrap_or_else(|| serde_json::json!({}));
    let expected_state = metadata.get("oauth_state").and_then(|v| v.as_str());
    if expected_state != Some(state) {
        return Err(CoreError::Validation("invalid OAuth state".into()));
    }
    let expires_at = metadata
        .get("oauth_state_expires_at")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());
    if expires_at.map(|exp| exp < Utc::now()).unwrap_or(true) {
        return Err(CoreError::Validation("OAuth state expired".into()));
    }

    let client = Client::new();
    let timeout = std::time::Duration::from_secs(config.discogs_timeout_seconds);

    let token_resp = client
        .post(TOKEN_URL)
        .timeout(timeout)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            (
                "redirect_uri",
                config.discogs_oauth_redirect_uri.as_deref().unwrap_or(""),
            ),
            (
                "client_id",
                config.discogs_oauth_client_id.as_deref().unwrap_or(""),
            ),
            (
                "client_secret",
                config.discogs_oauth_client_secret.as_deref().unwrap_or(""),
            ),
        ])
        .send()
        .await
        .map_err(|e| CoreError::Other(anyhow::anyhow!("Discogs token exchange request failed: {e}")))?;

    if !token_resp.status().is_success() {
        return Err(CoreError::Other(anyhow::anyhow!("Discogs token exchange failed")));
    }
    let token_payload: Value = token_resp
        .json()
        .await
        .map_err(|e| CoreError::Other(anyhow::anyhow!("Discogs token exchange decode failed: {e}")))?;
    let access_token = token_payload
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::Other(anyhow::anyhow!("Discogs token exchange missing access_token")))?
        .to_string();

    let identity_resp = client
        .get(IDENTITY_URL)
        .timeout(timeout)
        .header("User-Agent", &config.discogs_user_agent)
        .header("Authorization", format!("Discogs token={access_token}"))
        .send()
        .await
        .map_err(|e| CoreError::Other(anyhow::anyhow!("Discogs identity lookup failed: {e}")))?;
    if !identity_resp.status().is_success() {
        return Err(CoreError::Other(anyhow::anyhow!("Discogs identity lookup failed")));
    }
    let identity: Value = identity_resp
        .json()
        .await
        .map_err(|e| CoreError::Other(anyhow::anyhow!("Discogs identity decode failed: {e}")))?;
    let username = identity
        .get("username")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::Other(anyhow::anyhow!("Discogs identity missing username")))?
        .to_string();

    let normalized_scopes = metadata
        .get("oauth_scopes")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| {
            token_payload
                .get("scope")
                .and_then(|v| v.as_str())
                .map(split_scope_string)
                .unwrap_or_default()
        });
    let token_type = token_payload.get("token_type").and_then(|v| v.as_str()).map(str::to_string);
    let refresh_token = token_payload.get("refresh_token").and_then(|v| v.as_str()).map(str::to_string);
    let expires_in = token_payload.get("expires_in").and_then(|v| v.as_f64());
    let access_token_expires_at =
        expires_in.map(|secs| Utc::now() + ChronoDuration::milliseconds((secs * 1000.0) as i64));

    let vault = TokenVault::new(config)?;
    let encrypted = vault.encrypt(&access_token)?;

    let completed_metadata = serde_json::json!({
        "oauth_state": Value::Null,
        "oauth_state_expires_at": Value::Null,
        "oauth_connected": true,
        "oauth_scopes": normalized_scopes,
        "token_type": token_type,
        "refresh_token": refresh_token,
        "access_token_expires_at": access_token_expires_at.map(|d| d.to_rfc3339()),
    });

    let scopes_joined = normalized_scopes.join(" ");
    store.upsert_link(
        user_id,
        "discogs",
        &username,
        Some(&encrypted),
        refresh_token.as_deref(),
        access_token_expires_at,
        token_type.as_deref(),
        Some(&scopes_joined),
        Some(&completed_metadata),
    )?;

    store
        .find_link(user_id, "discogs")?
        .ok_or_else(|| CoreError::Other(anyhow::anyhow!("discogs link vanished after connect")))
}

/// Disconnect a user's Discogs account. Returns `false` if there was
/// nothing to disconnect. When `revoke` is set, attempts to revoke the
/// token upstream first — a failed revoke call never blocks the local
/// deletion (mirrors the source's bare `except Exception: pass`).
pub async fn disconnect_account(
    store: &Store,
    config: &Config,
    user_id: Uuid,
    revoke: bool,
) -> CoreResult<bool> {
    let Some(link) = store.find_link(user_id, "discogs")? else {
        return Ok(false);
    };

    if revoke {
        if let Some(stored_token) = &link.access_token {
            if let Ok(vault) = TokenVault::new(config) {
                if let Ok(decrypted) = vault.decrypt(stored_token) {
                    let client = Client::new();
                    let _ = client
                        .post(REVOKE_URL)
                        .timeout(std::time::Duration::from_secs(config.discogs_timeout_seconds))
                        .form(&[
                            ("token", decrypted.plaintext.as_str()),
                            (
                                "client_id",
                                config.discogs_oauth_client_id.as_deref().unwrap_or(""),
                            ),
                        ])
                        .send()
                        .await;
                }
            }
        }
    }

    store.delete_link(user_id, "discogs")?;
    Ok(true)
}

fn split_scope_string(scope: &str) -> Vec<String> {
    scope.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn random_state() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn build_query(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}={}", urlencode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn urlencode(value: &str) -> String {
    value
        .chars()
        .flat_map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                vec![c]
            } else {
                format!("%{:02X}", c as u32).chars().collect()
            }
        })
        .collect()
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
            discogs_oauth_client_id: Some("client-id".into()),
            discogs_oauth_client_secret: Some("client-secret".into()),
            discogs_oauth_redirect_uri: Some("https://app.example.com/oauth/callback".into()),
            discogs_oauth_scopes: "wants collection".into(),
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
    fn start_oauth_stashes_state_and_builds_authorize_url() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();

        let started = start_oauth(&store, &config, user_id, None).unwrap();
        assert!(started.authorize_url.starts_with(AUTHORIZE_URL));
        assert!(started.authorize_url.contains(&format!("state={}", started.state)));
        assert_eq!(started.scopes, vec!["wants".to_string(), "collection".to_string()]);

        let link = store.find_link(user_id, "discogs").unwrap().unwrap();
        assert_eq!(link.external_user_id, "pending");
        let metadata = link.token_metadata.unwrap();
        assert_eq!(metadata["oauth_state"], serde_json::json!(started.state));
        assert_eq!(metadata["oauth_connected"], serde_json::json!(false));
    }

    #[test]
    fn complete_oauth_rejects_mismatched_state() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        start_oauth(&store, &config, user_id, None).unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(complete_oauth(&store, &config, user_id, "wrong-state", "code"));
        assert!(result.is_err());
    }

    #[test]
    fn complete_oauth_without_a_started_session_fails() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(complete_oauth(&store, &config, user_id, "some-state", "code"));
        assert!(result.is_err());
    }

    #[test]
    fn disconnect_account_without_a_link_returns_false() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let disconnected = rt.block_on(disconnect_account(&store, &config, user_id, false)).unwrap();
        assert!(!disconnected);
    }

    #[test]
    fn disconnect_account_removes_an_existing_link() {
        let store = Store::open_in_memory().unwrap();
        let config = test_config();
        let user_id = insert_test_user(&store, "u@example.com").unwrap();
        start_oauth(&store, &config, user_id, None).unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let disconnected = rt.block_on(disconnect_account(&store, &config, user_id, false)).unwrap();
        assert!(disconnected);
        assert!(store.find_link(user_id, "discogs").unwrap().is_none());
    }
}
