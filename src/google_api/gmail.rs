//! Gmail API v1: conversation listing and fetch for the tracker, plus drafts.
//!
//! Threads are listed with a search query (`after:YYYY/MM/DD`) and fetched
//! with `format=full` so message bodies are available for excerpts.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use super::{
    error_for_response, send_with_retry, GoogleApiError, RetryPolicy, StaticTokenProvider,
    StoredTokenProvider, TokenCache,
};
use crate::source::{SourceError, SourceMessage, ThreadPage, ThreadQuery, ThreadRef, ThreadSource};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListResponse {
    #[serde(default)]
    threads: Vec<ThreadStub>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    result_size_estimate: u64,
}

#[derive(Debug, Deserialize)]
struct ThreadStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ThreadDetail {
    #[serde(default)]
    messages: Vec<SourceMessage>,
}

#[derive(Debug, Deserialize)]
struct DraftResponse {
    #[serde(default)]
    id: String,
}

impl From<ThreadListResponse> for ThreadPage {
    fn from(list: ThreadListResponse) -> Self {
        ThreadPage {
            threads: list
                .threads
                .into_iter()
                .map(|t| ThreadRef { id: t.id })
                .collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
            estimated_total: list.result_size_estimate,
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Authenticated Gmail client for the mailbox owner (`users/me`).
///
/// The access token is refreshed when it nears expiry, and once more if the
/// API rejects it, so a scan may outlive any single token.
pub struct GmailThreadSource {
    client: reqwest::Client,
    tokens: TokenCache,
    retry: RetryPolicy,
}

impl GmailThreadSource {
    /// Resolve a valid access token (refreshing if needed) and build a client.
    ///
    /// Credential failures surface here, before any scan work starts.
    pub async fn connect() -> Result<Self, GoogleApiError> {
        let source = Self::with_tokens(TokenCache::new(Box::new(StoredTokenProvider)));
        source.tokens.access_token().await?;
        Ok(source)
    }

    /// Client for a caller-supplied token that is never refreshed.
    pub fn with_access_token(access_token: impl Into<String>) -> Self {
        Self::with_tokens(TokenCache::new(Box::new(StaticTokenProvider(
            access_token.into(),
        ))))
    }

    fn with_tokens(tokens: TokenCache) -> Self {
        Self {
            client: reqwest::Client::new(),
            tokens,
            retry: RetryPolicy::default(),
        }
    }

    /// Send an authorized request. A 401 drops the cached token and the
    /// request is sent once more with a fresh one.
    async fn send_authorized<F>(&self, build: F) -> Result<reqwest::Response, GoogleApiError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.tokens.access_token().await?;
        let mut resp = send_with_retry(build(&token), &self.retry).await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            log::info!("gmail: access token rejected, refreshing and retrying");
            self.tokens.invalidate().await;
            let token = self.tokens.access_token().await?;
            resp = send_with_retry(build(&token), &self.retry).await?;
        }
        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }
        Ok(resp)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, GoogleApiError> {
        let resp = self
            .send_authorized(|token| self.client.get(url).bearer_auth(token).query(query))
            .await?;
        Ok(resp.json().await?)
    }

    /// One page of threads matching `search`.
    async fn list_thread_page(
        &self,
        search: &str,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<ThreadListResponse, GoogleApiError> {
        let mut query: Vec<(&str, String)> = vec![("maxResults", max_results.to_string())];
        if !search.is_empty() {
            query.push(("q", search.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        self.get_json(&format!("{}/threads", GMAIL_API_BASE), &query)
            .await
    }

    /// All messages of one thread, bodies included.
    pub async fn get_thread(&self, thread_id: &str) -> Result<Vec<SourceMessage>, GoogleApiError> {
        let detail: ThreadDetail = self
            .get_json(
                &format!("{}/threads/{}", GMAIL_API_BASE, thread_id),
                &[("format", "full".to_string())],
            )
            .await?;
        Ok(detail.messages)
    }

    /// Save a plain-text draft. Returns the Gmail draft id.
    pub async fn create_draft(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<String, GoogleApiError> {
        let raw = build_raw_message(to, subject, body);
        let payload = serde_json::json!({ "message": { "raw": raw } });

        let url = format!("{}/drafts", GMAIL_API_BASE);
        let resp = self
            .send_authorized(|token| self.client.post(&url).bearer_auth(token).json(&payload))
            .await?;
        let draft: DraftResponse = resp.json().await?;
        Ok(draft.id)
    }

    /// Send a previously created draft.
    pub async fn send_draft(&self, draft_id: &str) -> Result<(), GoogleApiError> {
        let payload = serde_json::json!({ "id": draft_id });
        let url = format!("{}/drafts/send", GMAIL_API_BASE);
        self.send_authorized(|token| self.client.post(&url).bearer_auth(token).json(&payload))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ThreadSource for GmailThreadSource {
    async fn list_threads(
        &self,
        query: &ThreadQuery,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, SourceError> {
        let list = self
            .list_thread_page(&query.search_query(), query.page_size, page_token)
            .await?;
        Ok(list.into())
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<Vec<SourceMessage>, SourceError> {
        Ok(self.get_thread(thread_id).await?)
    }
}

// ============================================================================
// Raw message construction
// ============================================================================

/// RFC 822 plain-text message, URL-safe base64 encoded as Gmail expects.
fn build_raw_message(to: &str, subject: &str, body: &str) -> String {
    let message = format!(
        "To: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\nContent-Transfer-Encoding: 8bit\r\n\r\n{}",
        header_safe(to),
        encode_header_value(&header_safe(subject)),
        body
    );
    base64::engine::general_purpose::URL_SAFE.encode(message.as_bytes())
}

/// Strip CR/LF so a value cannot inject extra headers.
fn header_safe(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_string()
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }
    format!(
        "=?UTF-8?B?{}?=",
        base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_facts;

    #[test]
    fn test_thread_list_deserialization() {
        let json = r#"{
            "threads": [
                {"id": "t1", "snippet": "hi", "historyId": "1"},
                {"id": "t2", "snippet": "yo", "historyId": "2"}
            ],
            "nextPageToken": "token123",
            "resultSizeEstimate": 201
        }"#;

        let list: ThreadListResponse = serde_json::from_str(json).unwrap();
        let page: ThreadPage = list.into();
        assert_eq!(page.threads.len(), 2);
        assert_eq!(page.threads[0].id, "t1");
        assert_eq!(page.next_page_token.as_deref(), Some("token123"));
        assert_eq!(page.estimated_total, 201);
    }

    #[test]
    fn test_thread_list_empty() {
        let json = r#"{"resultSizeEstimate": 0}"#;
        let list: ThreadListResponse = serde_json::from_str(json).unwrap();
        let page: ThreadPage = list.into();
        assert!(page.threads.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_empty_page_token_ends_pagination() {
        let json = r#"{"threads": [{"id": "t1"}], "nextPageToken": ""}"#;
        let list: ThreadListResponse = serde_json::from_str(json).unwrap();
        let page: ThreadPage = list.into();
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_thread_detail_full_format() {
        let json = r#"{
            "id": "t1",
            "messages": [
                {
                    "id": "m1",
                    "threadId": "t1",
                    "payload": {
                        "mimeType": "multipart/alternative",
                        "headers": [
                            {"name": "From", "value": "Jane Doe <jane@customer.com>"},
                            {"name": "Date", "value": "Mon, 9 Feb 2026 09:30:00 -0500"}
                        ],
                        "parts": [
                            {"mimeType": "text/plain", "body": {"size": 11, "data": "SGkgdGhlcmUgSm9l"}},
                            {"mimeType": "text/html", "body": {"size": 20, "data": "PHA-SGk8L3A-"}}
                        ]
                    }
                },
                {"id": "m2", "threadId": "t1"}
            ]
        }"#;

        let detail: ThreadDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.messages.len(), 2);

        let facts = extract_facts(&detail.messages[0]);
        assert_eq!(facts.sender, "jane@customer.com");
        assert_eq!(facts.body, "Hi there Joe");
        assert!(facts.date.is_some());
        assert!(detail.messages[1].payload.is_none());
    }

    #[test]
    fn test_build_raw_message() {
        let raw = build_raw_message("a@x.com", "Pricing follow-up", "Hello!\nThanks.");
        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(raw.as_bytes())
            .unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert!(text.starts_with("To: a@x.com\r\nSubject: Pricing follow-up\r\n"));
        assert!(text.ends_with("\r\n\r\nHello!\nThanks."));
    }

    #[test]
    fn test_header_injection_stripped() {
        let raw = build_raw_message("a@x.com\r\nBcc: evil@x.com", "hi", "body");
        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(raw.as_bytes())
            .unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert!(!text.contains("\r\nBcc:"));
    }

    #[test]
    fn test_non_ascii_subject_encoded() {
        assert_eq!(encode_header_value("Hello"), "Hello");
        let encoded = encode_header_value("투자 제안");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.ends_with("?="));
    }
}
