//! Error types for scan runs
//!
//! Only fatal failures surface as [`ScanError`]:
//! - RequiresUserAction: credential failures at scan start
//! - NonRetryable: state store unreadable/unwritable, invalid requests
//! - Retryable: another scan already holds the gate
//!
//! Per-conversation and per-oracle-call failures are recovered inside the
//! run and only show up as smaller counts in the summary.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Mailbox authentication failed: {0}")]
    Auth(String),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("A scan is already running")]
    ScanInProgress,

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),
}

impl ScanError {
    /// Returns true if retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanError::ScanInProgress)
    }

    /// Returns true if this error requires user action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(self, ScanError::Auth(_))
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            ScanError::Auth(_) => {
                "Re-authorize Gmail access: refresh ~/.response-tracker/google/token.json \
                 or set GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET and GOOGLE_REFRESH_TOKEN."
            }
            ScanError::Store(_) => {
                "Check permissions and free space for the store path in ~/.response-tracker/config.json"
            }
            ScanError::ScanInProgress => "Wait for the running scan to finish and try again.",
            ScanError::InvalidRequest(_) => "Custom scans take between 1 and 365 days.",
        }
    }
}

/// Serializable error representation for consumers of the scan surface
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFailure {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&ScanError> for ScanFailure {
    fn from(err: &ScanError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ScanFailure {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_requires_user_action() {
        let err = ScanError::Auth("token expired".into());
        let failure = ScanFailure::from(&err);
        assert_eq!(failure.error_type, ErrorType::RequiresUserAction);
        assert!(!failure.can_retry);
        assert!(failure.message.contains("token expired"));
    }

    #[test]
    fn test_scan_in_progress_is_retryable() {
        let failure = ScanFailure::from(&ScanError::ScanInProgress);
        assert_eq!(failure.error_type, ErrorType::Retryable);
        assert!(failure.can_retry);
    }

    #[test]
    fn test_failure_serializes_camel_case() {
        let failure = ScanFailure::from(&ScanError::InvalidRequest("days = 0".into()));
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["errorType"], "nonRetryable");
        assert!(json["recoverySuggestion"].as_str().unwrap().contains("365"));
    }
}
