//! Enrichment driver: asks the classification oracle to annotate contacts
//! that have a non-empty recent-message window.
//!
//! Oracle calls run concurrently behind a semaphore, each bounded by a
//! timeout. A failed, timed-out or malformed call leaves that contact's
//! previous annotation in place; it never aborts the batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EnrichmentConfig;
use crate::oracle::ClassificationOracle;
use crate::types::{Annotation, ContactAggregate, EngagementTier, Sentiment, RECENT_MESSAGE_LIMIT};
use crate::util::truncate_chars;

/// Cap applied to each excerpt handed to the oracle.
pub const ORACLE_EXCERPT_MAX_CHARS: usize = 1000;

/// Newest-first excerpts for one contact, each capped for the oracle.
pub fn build_context(contact: &ContactAggregate) -> Vec<String> {
    contact
        .recent_messages
        .iter()
        .take(RECENT_MESSAGE_LIMIT)
        .map(|m| truncate_chars(&m.body_excerpt, ORACLE_EXCERPT_MAX_CHARS))
        .collect()
}

pub struct EnrichmentDriver {
    oracle: Arc<dyn ClassificationOracle>,
    concurrency: usize,
    timeout_secs: u64,
}

impl EnrichmentDriver {
    pub fn new(oracle: Arc<dyn ClassificationOracle>, config: &EnrichmentConfig) -> Self {
        Self {
            oracle,
            concurrency: config.concurrency.max(1),
            timeout_secs: config.timeout_secs.max(1),
        }
    }

    /// Annotate every contact with recent messages. Returns how many contacts
    /// received a fresh annotation.
    pub async fn enrich_contacts(
        &self,
        contacts: &mut BTreeMap<String, ContactAggregate>,
        cancel: &CancellationToken,
    ) -> usize {
        let work: Vec<(String, Vec<String>)> = contacts
            .values()
            .filter(|c| !c.recent_messages.is_empty())
            .map(|c| (c.address.clone(), build_context(c)))
            .collect();
        if work.is_empty() {
            return 0;
        }
        log::info!(
            "enrich: classifying {} contacts ({} in flight)",
            work.len(),
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let timeout = Duration::from_secs(self.timeout_secs);
        let mut join_set = JoinSet::new();

        for (address, excerpts) in work {
            let semaphore = Arc::clone(&semaphore);
            let oracle = Arc::clone(&self.oracle);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (address, None);
                };
                if cancel.is_cancelled() {
                    return (address, None);
                }
                let response = tokio::select! {
                    _ = cancel.cancelled() => return (address, None),
                    result = tokio::time::timeout(timeout, oracle.classify(&excerpts)) => result,
                };
                let annotation = match response {
                    Ok(Ok(raw)) => {
                        let parsed = parse_annotation(&raw);
                        if parsed.is_none() {
                            log::warn!("enrich: malformed oracle response for {}", address);
                        }
                        parsed
                    }
                    Ok(Err(e)) => {
                        log::warn!("enrich: oracle failed for {}: {}", address, e);
                        None
                    }
                    Err(_) => {
                        log::warn!(
                            "enrich: oracle timed out for {} after {}s",
                            address,
                            timeout.as_secs()
                        );
                        None
                    }
                };
                (address, annotation)
            });
        }

        let mut enriched = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((address, Some(annotation))) => {
                    if let Some(contact) = contacts.get_mut(&address) {
                        contact.annotation = Some(annotation);
                        enriched += 1;
                    }
                }
                Ok((_, None)) => {}
                Err(e) => log::warn!("enrich: classification task failed: {}", e),
            }
        }
        enriched
    }
}

/// Ask the oracle for a follow-up email body. Never fails: on any problem
/// the returned text explains why no draft was produced.
pub async fn generate_follow_up_draft(
    oracle: &dyn ClassificationOracle,
    contact: &ContactAggregate,
    timeout_secs: u64,
) -> String {
    let Some(latest) = contact.recent_messages.first() else {
        return format!(
            "[No draft: no recent message from {} to reply to.]",
            contact.address
        );
    };
    let Some(annotation) = contact.annotation.as_ref() else {
        return format!(
            "[No draft: {} has not been enriched yet. Run a scan with enrichment first.]",
            contact.address
        );
    };

    let excerpt = truncate_chars(&latest.body_excerpt, ORACLE_EXCERPT_MAX_CHARS);
    let call = oracle.draft(&excerpt, annotation);
    match tokio::time::timeout(Duration::from_secs(timeout_secs.max(1)), call).await {
        Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(Ok(_)) => "[Draft unavailable: the oracle returned an empty response.]".to_string(),
        Ok(Err(e)) => {
            log::warn!("enrich: draft failed for {}: {}", contact.address, e);
            format!("[Draft unavailable: {}]", e)
        }
        Err(_) => format!(
            "[Draft unavailable: the oracle did not answer within {} seconds.]",
            timeout_secs
        ),
    }
}

/// Whether `text` is one of the placeholders returned by
/// [`generate_follow_up_draft`] instead of a real draft.
pub fn is_draft_placeholder(text: &str) -> bool {
    text.starts_with("[No draft") || text.starts_with("[Draft unavailable")
}

// ============================================================================
// Response parsing
// ============================================================================

/// Parse the oracle's response into an [`Annotation`].
///
/// Finds the outermost `{...}` (the model may wrap it in prose or fences)
/// and validates it. Sentiment, engagement tier and priority are required;
/// list and follow-up fields default when missing. Both snake_case and
/// camelCase keys are accepted.
pub fn parse_annotation(output: &str) -> Option<Annotation> {
    let trimmed = output.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }

    let parsed: Value = match serde_json::from_str(&trimmed[start..=end]) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("enrich: JSON parse failed: {e}");
            return None;
        }
    };
    let obj = parsed.as_object()?;

    let sentiment = field(obj, "sentiment", "sentiment")
        .and_then(Value::as_str)
        .and_then(Sentiment::parse)?;
    let engagement_tier = field(obj, "engagement_tier", "engagementTier")
        .and_then(Value::as_str)
        .and_then(EngagementTier::parse)?;
    let priority_score = field(obj, "priority_score", "priorityScore").and_then(parse_priority)?;

    let follow_up_recommended = match field(obj, "follow_up_recommended", "followUpRecommended") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        _ => false,
    };
    let follow_up_reason = field(obj, "follow_up_reason", "followUpReason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(String::from);

    Some(Annotation {
        sentiment,
        engagement_tier,
        buying_signals: string_list(field(obj, "buying_signals", "buyingSignals")),
        key_topics: string_list(field(obj, "key_topics", "keyTopics")),
        follow_up_recommended,
        follow_up_reason,
        priority_score,
    })
}

fn field<'a>(obj: &'a Map<String, Value>, snake: &str, camel: &str) -> Option<&'a Value> {
    obj.get(snake).or_else(|| obj.get(camel))
}

/// Integer, float or numeric string, rounded and clamped to 1..=10.
fn parse_priority(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(1.0, 10.0) as u8)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleError;
    use crate::types::RecentMessage;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const VALID: &str = r#"{
        "sentiment": "positive",
        "engagement_tier": "hot",
        "buying_signals": ["asked for pricing"],
        "key_topics": ["pricing", "onboarding"],
        "follow_up_recommended": true,
        "follow_up_reason": "Requested a quote",
        "priority_score": 8
    }"#;

    /// Replies from a fixed table keyed by the first excerpt.
    struct ScriptedOracle {
        replies: BTreeMap<String, Result<String, ()>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedOracle {
        fn new(replies: &[(&str, Result<&str, ()>)]) -> Self {
            Self {
                replies: replies
                    .iter()
                    .map(|(k, v)| (k.to_string(), (*v).map(String::from)))
                    .collect(),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl ClassificationOracle for ScriptedOracle {
        async fn classify(&self, excerpts: &[String]) -> Result<String, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let key = excerpts.first().cloned().unwrap_or_default();
            match self.replies.get(&key) {
                Some(Ok(text)) => Ok(text.clone()),
                _ => Err(OracleError::Io("scripted failure".into())),
            }
        }

        async fn draft(&self, excerpt: &str, _annotation: &Annotation) -> Result<String, OracleError> {
            match self.replies.get(excerpt) {
                Some(Ok(text)) => Ok(text.clone()),
                _ => Err(OracleError::RateLimited),
            }
        }
    }

    fn contact_with(address: &str, excerpts: &[&str]) -> ContactAggregate {
        let mut contact = ContactAggregate::new(address);
        for (i, text) in excerpts.iter().enumerate() {
            contact.push_recent(RecentMessage {
                timestamp: Utc.with_ymd_and_hms(2026, 3, 10 - i as u32, 9, 0, 0).unwrap(),
                body_excerpt: text.to_string(),
            });
        }
        contact
    }

    fn annotation(priority: u8) -> Annotation {
        Annotation {
            sentiment: Sentiment::Neutral,
            engagement_tier: EngagementTier::Cold,
            buying_signals: vec![],
            key_topics: vec![],
            follow_up_recommended: false,
            follow_up_reason: None,
            priority_score: priority,
        }
    }

    fn config(concurrency: usize, timeout_secs: u64) -> EnrichmentConfig {
        EnrichmentConfig {
            enabled: true,
            concurrency,
            timeout_secs,
            model: None,
        }
    }

    #[test]
    fn test_parse_valid_annotation() {
        let a = parse_annotation(VALID).unwrap();
        assert_eq!(a.sentiment, Sentiment::Positive);
        assert_eq!(a.engagement_tier, EngagementTier::Hot);
        assert_eq!(a.buying_signals, vec!["asked for pricing"]);
        assert_eq!(a.key_topics.len(), 2);
        assert!(a.follow_up_recommended);
        assert_eq!(a.follow_up_reason.as_deref(), Some("Requested a quote"));
        assert_eq!(a.priority_score, 8);
    }

    #[test]
    fn test_parse_wrapped_in_prose_and_fences() {
        let wrapped = format!("Here is the analysis:\n```json\n{}\n```\nDone.", VALID);
        assert!(parse_annotation(&wrapped).is_some());
    }

    #[test]
    fn test_parse_camel_case_and_lenient_values() {
        let json = r#"{"sentiment": "Mixed", "engagementTier": "WARM",
            "buyingSignals": "budget approved", "followUpRecommended": "yes",
            "followUpReason": "null", "priorityScore": "12.4"}"#;
        let a = parse_annotation(json).unwrap();
        assert_eq!(a.sentiment, Sentiment::Mixed);
        assert_eq!(a.engagement_tier, EngagementTier::Warm);
        assert_eq!(a.buying_signals, vec!["budget approved"]);
        assert!(a.follow_up_recommended);
        assert!(a.follow_up_reason.is_none());
        assert_eq!(a.priority_score, 10);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_annotation("not json").is_none());
        assert!(parse_annotation("").is_none());
        assert!(parse_annotation("} backwards {").is_none());
        assert!(parse_annotation(r#"{"sentiment": "positive""#).is_none());
        // Unknown tier
        assert!(parse_annotation(
            r#"{"sentiment": "positive", "engagement_tier": "lukewarm", "priority_score": 5}"#
        )
        .is_none());
        // Missing priority
        assert!(parse_annotation(r#"{"sentiment": "positive", "engagement_tier": "hot"}"#).is_none());
    }

    #[test]
    fn test_priority_clamped_low() {
        let a = parse_annotation(
            r#"{"sentiment": "negative", "engagement_tier": "cold", "priority_score": 0}"#,
        )
        .unwrap();
        assert_eq!(a.priority_score, 1);
    }

    #[test]
    fn test_build_context_caps_excerpts() {
        let long = "z".repeat(1800);
        let contact = contact_with("a@x.com", &[&long, "second excerpt"]);
        let context = build_context(&contact);
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].chars().count(), ORACLE_EXCERPT_MAX_CHARS);
        assert_eq!(context[1], "second excerpt");
    }

    #[tokio::test]
    async fn test_enrich_contacts_per_contact_failures() {
        let oracle = Arc::new(ScriptedOracle::new(&[
            ("good", Ok(VALID)),
            ("garbage", Ok("not json")),
            ("boom", Err(())),
        ]));

        let mut contacts = BTreeMap::new();
        contacts.insert("good@x.com".to_string(), contact_with("good@x.com", &["good"]));
        let mut garbage = contact_with("garbage@x.com", &["garbage"]);
        garbage.annotation = Some(annotation(4));
        contacts.insert("garbage@x.com".to_string(), garbage);
        contacts.insert("boom@x.com".to_string(), contact_with("boom@x.com", &["boom"]));
        contacts.insert("quiet@x.com".to_string(), ContactAggregate::new("quiet@x.com"));

        let driver = EnrichmentDriver::new(oracle.clone(), &config(2, 5));
        let enriched = driver
            .enrich_contacts(&mut contacts, &CancellationToken::new())
            .await;

        assert_eq!(enriched, 1);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            contacts["good@x.com"].tier(),
            Some(EngagementTier::Hot)
        );
        // Malformed response keeps the prior annotation.
        assert_eq!(contacts["garbage@x.com"].annotation, Some(annotation(4)));
        assert!(contacts["boom@x.com"].annotation.is_none());
        assert!(contacts["quiet@x.com"].annotation.is_none());
    }

    #[tokio::test]
    async fn test_enrich_timeout_is_a_per_contact_failure() {
        let mut oracle = ScriptedOracle::new(&[("slow", Ok(VALID))]);
        oracle.delay = Some(Duration::from_secs(3));
        let driver = EnrichmentDriver::new(Arc::new(oracle), &config(1, 1));

        let mut contacts = BTreeMap::new();
        contacts.insert("slow@x.com".to_string(), contact_with("slow@x.com", &["slow"]));
        let enriched = driver
            .enrich_contacts(&mut contacts, &CancellationToken::new())
            .await;
        assert_eq!(enriched, 0);
        assert!(contacts["slow@x.com"].annotation.is_none());
    }

    #[tokio::test]
    async fn test_enrich_skipped_when_cancelled() {
        let oracle = Arc::new(ScriptedOracle::new(&[("good", Ok(VALID))]));
        let driver = EnrichmentDriver::new(oracle.clone(), &config(1, 5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut contacts = BTreeMap::new();
        contacts.insert("good@x.com".to_string(), contact_with("good@x.com", &["good"]));
        assert_eq!(driver.enrich_contacts(&mut contacts, &cancel).await, 0);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_follow_up_draft_and_placeholders() {
        let oracle = ScriptedOracle::new(&[("latest", Ok("  Thanks! Shall we meet Tuesday?  "))]);

        let mut contact = contact_with("a@x.com", &["latest"]);
        contact.annotation = Some(annotation(7));
        let draft = generate_follow_up_draft(&oracle, &contact, 5).await;
        assert_eq!(draft, "Thanks! Shall we meet Tuesday?");

        let unannotated = contact_with("b@x.com", &["latest"]);
        assert!(generate_follow_up_draft(&oracle, &unannotated, 5)
            .await
            .starts_with("[No draft"));

        let mut failing = contact_with("c@x.com", &["other"]);
        failing.annotation = Some(annotation(7));
        let placeholder = generate_follow_up_draft(&oracle, &failing, 5).await;
        assert!(is_draft_placeholder(&placeholder));
        assert!(!is_draft_placeholder(&draft));
    }
}
