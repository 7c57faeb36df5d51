//! Native Google API client.
//!
//! Direct HTTP via reqwest against Gmail API v1. Token format is compatible
//! with the JSON written by Python's google-auth library, so an existing
//! `token.json` can be dropped into `~/.response-tracker/google/`.
//!
//! Modules:
//! - gmail: thread listing/fetch (the tracker's thread source) and drafts
//! - token_store: token file persistence

pub mod gmail;
pub mod token_store;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Google OAuth2 scopes the tracker needs.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.compose",
];

/// Env vars for secrets-based bootstrap (no token file needed).
pub const CLIENT_ID_ENV: &str = "GOOGLE_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "GOOGLE_CLIENT_SECRET";
pub const REFRESH_TOKEN_ENV: &str = "GOOGLE_REFRESH_TOKEN";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 60;

// ============================================================================
// Token types, compatible with the google-auth token format
// ============================================================================

/// OAuth2 token payload.
///
/// Field names match what Python's `google.oauth2.credentials.Credentials.to_json()`
/// produces. Both `token` and `access_token` are accepted on read for compat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleToken {
    /// The access token (Python writes this as "token")
    #[serde(default, alias = "access_token")]
    pub token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Token expiry time (ISO 8601)
    #[serde(default)]
    pub expiry: Option<String>,
    /// Authenticated user email (Python stores in "account" field)
    #[serde(default, alias = "email")]
    pub account: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// Where a token came from. Env-sourced tokens are never written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    File,
    Env,
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token expired or revoked")]
    AuthExpired,
    #[error("Token not found at {0}")]
    TokenNotFound(PathBuf),
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid credentials format: {0}")]
    InvalidCredentials(String),
}

impl GoogleApiError {
    /// Credential problems the user has to fix before any scan can run.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            GoogleApiError::AuthExpired
                | GoogleApiError::TokenNotFound(_)
                | GoogleApiError::RefreshFailed(_)
                | GoogleApiError::InvalidCredentials(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    NonRetryable,
}

fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(value) = retry_after.and_then(|v| v.to_str().ok()) {
        if let Ok(secs) = value.parse::<u64>() {
            return Duration::from_secs(secs.min(30));
        }
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0))
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying rate limits, server errors and transport
/// timeouts with exponential backoff (honouring `Retry-After`).
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, GoogleApiError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(GoogleApiError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                let decision = retry_decision_for_status(status);
                if decision == RetryDecision::Retryable && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "google_api retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                let retryable_transport = err.is_timeout() || err.is_connect();
                if retryable_transport && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "google_api retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(GoogleApiError::Http(err));
            }
        }
    }

    Err(GoogleApiError::RefreshFailed(
        "request exhausted retries".to_string(),
    ))
}

/// Map a non-success response to an error, consuming the body.
pub(crate) async fn error_for_response(resp: reqwest::Response) -> GoogleApiError {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return GoogleApiError::AuthExpired;
    }
    let body = resp.text().await.unwrap_or_default();
    GoogleApiError::ApiError {
        status: status.as_u16(),
        message: body,
    }
}

// ============================================================================
// Token I/O
// ============================================================================

/// Token file path (`~/.response-tracker/google/token.json`).
pub fn token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".response-tracker")
        .join("google")
        .join("token.json")
}

/// Build a token from `GOOGLE_CLIENT_ID` / `GOOGLE_CLIENT_SECRET` /
/// `GOOGLE_REFRESH_TOKEN`. Returns `None` unless the refresh token and the
/// client id are both set.
pub fn token_from_env() -> Option<GoogleToken> {
    let refresh = std::env::var(REFRESH_TOKEN_ENV).ok().filter(|v| !v.trim().is_empty())?;
    let client_id = std::env::var(CLIENT_ID_ENV).ok().filter(|v| !v.trim().is_empty())?;
    let client_secret = std::env::var(CLIENT_SECRET_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty());
    Some(GoogleToken {
        token: String::new(),
        refresh_token: Some(refresh),
        token_uri: default_token_uri(),
        client_id,
        client_secret,
        scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
        expiry: None,
        account: None,
    })
}

/// Load a token: env secrets take precedence over the token file.
pub fn load_token() -> Result<(GoogleToken, TokenOrigin), GoogleApiError> {
    if let Some(token) = token_from_env() {
        return Ok((token, TokenOrigin::Env));
    }
    token_store::load_token().map(|t| (t, TokenOrigin::File))
}

// ============================================================================
// Token refresh
// ============================================================================

/// Global mutex to serialize concurrent token refreshes.
static TOKEN_REFRESH_MUTEX: std::sync::OnceLock<Mutex<()>> = std::sync::OnceLock::new();

fn refresh_mutex() -> &'static Mutex<()> {
    TOKEN_REFRESH_MUTEX.get_or_init(|| Mutex::new(()))
}

/// Parsed expiry of a token, `None` when absent or unparseable.
pub fn token_expiry(token: &GoogleToken) -> Option<DateTime<Utc>> {
    let raw = token.expiry.as_deref()?;
    // Python stores expiry as "2026-02-08T12:00:00.000000Z" or similar
    chrono::DateTime::parse_from_rfc3339(&raw.replace('Z', "+00:00"))
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn expires_within_margin(expiry: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expiry <= now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS)
}

/// Check if a token is expired based on its expiry field.
pub fn is_token_expired(token: &GoogleToken) -> bool {
    if token.token.is_empty() {
        return true;
    }
    // No or unparseable expiry = assume expired, try refresh
    token_expiry(token).map_or(true, |expiry| expires_within_margin(expiry, Utc::now()))
}

/// Refresh an access token using the refresh token.
///
/// File-backed tokens are persisted after a successful refresh; env-backed
/// tokens live only for this process.
pub async fn refresh_access_token(
    token: &GoogleToken,
    origin: TokenOrigin,
) -> Result<GoogleToken, GoogleApiError> {
    let _guard = refresh_mutex().lock().await;

    let refresh_token = token
        .refresh_token
        .as_ref()
        .ok_or(GoogleApiError::AuthExpired)?;

    let client = reqwest::Client::new();
    let mut form = vec![
        ("client_id", token.client_id.as_str()),
        ("refresh_token", refresh_token.as_str()),
        ("grant_type", "refresh_token"),
    ];
    if let Some(secret) = token.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }
    let resp = client.post(&token.token_uri).form(&form).send().await?;
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(map_refresh_error(status.as_u16(), &body_text));
    }
    let body: serde_json::Value = serde_json::from_str(&body_text)?;

    let access_token = body["access_token"]
        .as_str()
        .ok_or_else(|| GoogleApiError::RefreshFailed("No access_token in response".into()))?;

    let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
    let expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in as i64);

    let mut new_token = token.clone();
    new_token.token = access_token.to_string();
    new_token.expiry = Some(expiry.to_rfc3339());

    if origin == TokenOrigin::File {
        token_store::save_token(&new_token)?;
    }

    Ok(new_token)
}

fn map_refresh_error(status: u16, body: &str) -> GoogleApiError {
    let lowered = body.to_lowercase();
    if (status == 400 || status == 401)
        && (lowered.contains("invalid_grant") || lowered.contains("token has been expired"))
    {
        return GoogleApiError::AuthExpired;
    }
    GoogleApiError::RefreshFailed(format!("HTTP {}: {}", status, body))
}

/// Load the stored token, refreshing it if expired.
pub async fn get_valid_token() -> Result<GoogleToken, GoogleApiError> {
    let (token, origin) = load_token()?;

    if is_token_expired(&token) {
        refresh_access_token(&token, origin).await
    } else {
        Ok(token)
    }
}

// ============================================================================
// Access token cache for long-lived clients
// ============================================================================

/// A bearer token and when it stops being valid (`None` = unknown).
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Where a [`TokenCache`] gets fresh access tokens from.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, GoogleApiError>;
}

/// Token file or env secrets, refreshed through the OAuth endpoint.
pub struct StoredTokenProvider;

#[async_trait]
impl AccessTokenProvider for StoredTokenProvider {
    async fn fetch(&self) -> Result<AccessToken, GoogleApiError> {
        let token = get_valid_token().await?;
        Ok(AccessToken {
            expires_at: token_expiry(&token),
            value: token.token,
        })
    }
}

/// A caller-supplied access token. It is never refreshed.
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn fetch(&self) -> Result<AccessToken, GoogleApiError> {
        Ok(AccessToken {
            value: self.0.clone(),
            expires_at: None,
        })
    }
}

/// Holds the current access token and re-fetches it once it is within the
/// expiry margin or after [`TokenCache::invalidate`].
pub struct TokenCache {
    provider: Box<dyn AccessTokenProvider>,
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(provider: Box<dyn AccessTokenProvider>) -> Self {
        Self {
            provider,
            current: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String, GoogleApiError> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            let stale = token
                .expires_at
                .is_some_and(|at| expires_within_margin(at, Utc::now()));
            if !stale {
                return Ok(token.value.clone());
            }
            log::info!("google_api: access token near expiry, refreshing");
        }
        let fresh = self.provider.fetch().await?;
        let value = fresh.value.clone();
        *current = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token, e.g. after the API rejected it.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

// ============================================================================
// Tests
// ============================================================================
