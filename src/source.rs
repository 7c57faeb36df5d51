//! Thread source contract: paginated conversation listing plus per-conversation
//! message fetch.
//!
//! Message types mirror the Gmail API v1 `format=full` shape so the Gmail
//! adapter deserializes straight into them; other sources build them by hand.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::google_api::GoogleApiError;

// ============================================================================
// Message shape
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartBody {
    /// URL-safe base64 (Gmail omits padding).
    #[serde(default)]
    pub data: Option<String>,
}

/// A MIME node. The top-level payload carries the message headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

impl SourceMessage {
    pub fn headers(&self) -> &[MessageHeader] {
        self.payload
            .as_ref()
            .map(|p| &p.headers[..])
            .unwrap_or(&[])
    }
}

// ============================================================================
// Listing
// ============================================================================

/// Date predicate and page size for one listing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadQuery {
    /// Only conversations after this date; `None` lists all time.
    pub after: Option<NaiveDate>,
    pub page_size: u32,
}

impl ThreadQuery {
    /// Gmail search syntax for the date predicate (`after:YYYY/MM/DD`).
    pub fn search_query(&self) -> String {
        match self.after {
            Some(date) => format!("after:{}", date.format("%Y/%m/%d")),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRef {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadPage {
    pub threads: Vec<ThreadRef>,
    pub next_page_token: Option<String>,
    /// Source-side estimate of the total result size; 0 when unknown.
    pub estimated_total: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Transport: {0}")]
    Transport(String),
    #[error("Timed out after {0} seconds")]
    Timeout(u64),
    #[error("Malformed response: {0}")]
    Decode(String),
}

impl From<GoogleApiError> for SourceError {
    fn from(err: GoogleApiError) -> Self {
        match err {
            GoogleApiError::AuthExpired => SourceError::Auth(err.to_string()),
            GoogleApiError::TokenNotFound(_)
            | GoogleApiError::RefreshFailed(_)
            | GoogleApiError::InvalidCredentials(_) => SourceError::Auth(err.to_string()),
            GoogleApiError::ApiError { status, message } => SourceError::Api { status, message },
            GoogleApiError::Json(e) => SourceError::Decode(e.to_string()),
            other => SourceError::Transport(other.to_string()),
        }
    }
}

/// A paginated, remote conversation store.
///
/// Pagination is cursor based: callers keep requesting pages until
/// `next_page_token` comes back empty. Fetching one conversation can fail
/// independently of listing.
#[async_trait]
pub trait ThreadSource: Send + Sync {
    async fn list_threads(
        &self,
        query: &ThreadQuery,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, SourceError>;

    async fn fetch_thread(&self, thread_id: &str) -> Result<Vec<SourceMessage>, SourceError>;
}

/// Bound a remote call. A timeout is reported as [`SourceError::Timeout`] so
/// callers handle it exactly like any other failure of that call.
pub async fn with_timeout<T, F>(timeout_secs: u64, call: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    match tokio::time::timeout(Duration::from_secs(timeout_secs), call).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(timeout_secs)),
    }
}

#[cfg(test)]
impl SourceMessage {
    /// Single-part `text/plain` message with From/Date headers.
    pub(crate) fn fixture(from: &str, date: &str, body: &str) -> Self {
        use base64::Engine;
        let data = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(body.as_bytes());
        SourceMessage {
            id: format!("{}-{}", from, date),
            payload: Some(MessagePart {
                mime_type: "text/plain".to_string(),
                headers: vec![
                    MessageHeader {
                        name: "From".to_string(),
                        value: from.to_string(),
                    },
                    MessageHeader {
                        name: "Date".to_string(),
                        value: date.to_string(),
                    },
                ],
                body: Some(PartBody { data: Some(data) }),
                parts: Vec::new(),
            }),
        }
    }
}
