//! Tracker configuration (`~/.response-tracker/config.json`).
//!
//! Every field carries a serde default, so a missing file or a partial file
//! still yields a usable configuration.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Env var overriding `mailboxOwner`.
pub const MAILBOX_OWNER_ENV: &str = "TRACKER_MAILBOX_OWNER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    /// The mailbox owner's own address. Never tracked as a contact.
    #[serde(default)]
    pub mailbox_owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<String>,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
}

/// Which messages of a conversation count towards `receivedCount`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CountMode {
    /// Every message from a non-owner sender.
    #[default]
    AllMessages,
    /// Only replies: the opening message of each conversation is skipped and
    /// single-message conversations contribute nothing.
    RepliesOnly,
}

/// When the incremental watermark moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WatermarkPolicy {
    /// Advance to today after every persisted scan, including scans whose
    /// pagination was cut short. Conversations on unfetched pages are not
    /// revisited by the next incremental scan.
    #[default]
    Always,
    /// Advance only when pagination ran to the last page. The next
    /// incremental scan then re-reads the window and may double-count what
    /// the partial run already merged.
    OnCompletePagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_lookback_days")]
    pub default_lookback_days: u32,
    #[serde(default)]
    pub count_mode: CountMode,
    #[serde(default)]
    pub watermark_policy: WatermarkPolicy,
}

fn default_page_size() -> u32 {
    100
}
fn default_fetch_concurrency() -> usize {
    4
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_lookback_days() -> u32 {
    30
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            fetch_concurrency: default_fetch_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            default_lookback_days: default_lookback_days(),
            count_mode: CountMode::default(),
            watermark_policy: WatermarkPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_enrichment_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_enrichment_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_enrichment_concurrency() -> usize {
    4
}
fn default_enrichment_timeout_secs() -> u64 {
    60
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: default_enrichment_concurrency(),
            timeout_secs: default_enrichment_timeout_secs(),
            model: None,
        }
    }
}

impl TrackerConfig {
    /// Lower-cased, trimmed owner address (empty when unset).
    pub fn owner_address(&self) -> String {
        self.mailbox_owner.trim().to_lowercase()
    }

    /// Resolved SQLite path: `storePath` or `~/.response-tracker/tracker.db`.
    pub fn resolved_store_path(&self) -> Result<PathBuf, String> {
        match self.store_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(state_dir()?.join("tracker.db")),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(owner) = std::env::var(MAILBOX_OWNER_ENV) {
            if !owner.trim().is_empty() {
                self.mailbox_owner = owner;
            }
        }
    }
}

/// The tracker's home directory (`~/.response-tracker`).
pub fn state_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".response-tracker"))
}

/// Canonical config file path.
pub fn config_path() -> Result<PathBuf, String> {
    Ok(state_dir()?.join("config.json"))
}

/// Load configuration from disk, falling back to defaults when the file does
/// not exist. Env overrides are applied last.
pub fn load_config() -> Result<TrackerConfig, String> {
    let path = config_path()?;
    let mut config = if path.exists() {
        let content =
            fs::read_to_string(&path).map_err(|e| format!("Failed to read config: {}", e))?;
        parse_config(&content)?
    } else {
        log::debug!("config: {} not found, using defaults", path.display());
        TrackerConfig::default()
    };
    config.apply_env_overrides();
    config.mailbox_owner = config.owner_address();
    Ok(config)
}

fn parse_config(content: &str) -> Result<TrackerConfig, String> {
    serde_json::from_str(content).map_err(|e| format!("Failed to parse config: {}", e))
}
