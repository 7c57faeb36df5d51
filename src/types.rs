//! Core data model: per-contact aggregates, enrichment annotations, and the
//! persisted scan state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of recent messages retained per contact.
pub const RECENT_MESSAGE_LIMIT: usize = 3;

/// Maximum characters kept from a message body in the recent window.
pub const EXCERPT_MAX_CHARS: usize = 2000;

/// Bodies at or below this many characters never enter the recent window
/// (signature-only replies, "thanks!", empty bodies).
pub const MIN_BODY_CHARS: usize = 50;

// ============================================================================
// Contact aggregate
// ============================================================================

/// One body excerpt in a contact's recent-message window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentMessage {
    pub timestamp: DateTime<Utc>,
    pub body_excerpt: String,
}

/// Accumulated engagement facts for one sender address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactAggregate {
    /// Lower-cased, trimmed sender address. Natural key of the contact map.
    pub address: String,
    #[serde(default)]
    pub received_count: u64,
    /// Messages sent to this address. Carried through merges but not
    /// populated by the inbound scan.
    #[serde(default)]
    pub sent_count: u64,
    #[serde(default)]
    pub first_contact_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_contact_at: Option<DateTime<Utc>>,
    /// Newest first, at most [`RECENT_MESSAGE_LIMIT`] entries.
    #[serde(default)]
    pub recent_messages: Vec<RecentMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
}

impl ContactAggregate {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            received_count: 0,
            sent_count: 0,
            first_contact_at: None,
            last_contact_at: None,
            recent_messages: Vec::new(),
            annotation: None,
        }
    }

    /// Widen the first/last contact bounds to include `at`.
    pub fn observe_date(&mut self, at: DateTime<Utc>) {
        self.first_contact_at = Some(match self.first_contact_at {
            Some(first) => first.min(at),
            None => at,
        });
        self.last_contact_at = Some(match self.last_contact_at {
            Some(last) => last.max(at),
            None => at,
        });
    }

    /// Add an excerpt to the recent window, keeping the window invariant.
    pub fn push_recent(&mut self, message: RecentMessage) {
        self.recent_messages.push(message);
        normalize_recent(&mut self.recent_messages);
    }

    pub fn tier(&self) -> Option<EngagementTier> {
        self.annotation.as_ref().map(|a| a.engagement_tier)
    }
}

/// Sort newest first, drop entries sharing a timestamp with a newer-listed
/// one, and cap at [`RECENT_MESSAGE_LIMIT`].
///
/// Entries earlier in the input win ties, so callers put the side they
/// trust (the previously persisted window) first.
pub fn normalize_recent(messages: &mut Vec<RecentMessage>) {
    messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    messages.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);
    messages.truncate(RECENT_MESSAGE_LIMIT);
}

// ============================================================================
// Annotation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

impl Sentiment {
    /// Case-insensitive parse of the oracle's sentiment label.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" => Some(Self::Negative),
            "mixed" => Some(Self::Mixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementTier {
    Hot,
    Warm,
    Cold,
}

impl EngagementTier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hot" => Some(Self::Hot),
            "warm" => Some(Self::Warm),
            "cold" => Some(Self::Cold),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }
}

impl fmt::Display for EngagementTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured enrichment output for one contact. Replaced wholesale on every
/// successful enrichment call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub sentiment: Sentiment,
    pub engagement_tier: EngagementTier,
    #[serde(default)]
    pub buying_signals: Vec<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub follow_up_recommended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_reason: Option<String>,
    /// 1 (ignore) to 10 (act today).
    pub priority_score: u8,
}

// ============================================================================
// Scan state
// ============================================================================

/// Everything the tracker persists between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanState {
    /// Watermark for incremental scans.
    #[serde(default)]
    pub last_scan_date: Option<NaiveDate>,
    #[serde(default)]
    pub contacts: BTreeMap<String, ContactAggregate>,
    #[serde(default)]
    pub total_threads_scanned: u64,
}

impl ScanState {
    pub fn is_empty(&self) -> bool {
        self.last_scan_date.is_none() && self.contacts.is_empty() && self.total_threads_scanned == 0
    }
}

/// How a scan picks its date window and merges its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum ScanMode {
    /// Since the watermark (or the default lookback on first run); additive merge.
    Incremental,
    /// All time; replaces stored contacts.
    Full,
    /// The last `days` days; replaces stored contacts.
    Custom { days: u32 },
}

impl ScanMode {
    /// Whether this mode discards stored contacts and the thread counter.
    pub fn resets_state(&self) -> bool {
        !matches!(self, ScanMode::Incremental)
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Incremental => f.write_str("incremental"),
            ScanMode::Full => f.write_str("full"),
            ScanMode::Custom { days } => write!(f, "custom ({} days)", days),
        }
    }
}

/// Advisory progress for a running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub current: u64,
    /// Source-provided estimate; 0 when unknown.
    pub estimated_total: u64,
}

/// Result of one scan run. Partial successes are reported here with smaller
/// counts, never as errors.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub run_id: String,
    pub mode: ScanMode,
    /// Lower date bound used for listing; `None` means all time.
    pub after: Option<NaiveDate>,
    pub conversations_processed: u64,
    pub contacts_tracked: usize,
    pub messages_seen: u64,
    pub fetch_failures: u64,
    pub pagination_complete: bool,
    pub cancelled: bool,
    pub contacts_enriched: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
