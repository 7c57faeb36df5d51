//! Request-scoped Gmail draft tracking.
//!
//! A [`DraftSession`] remembers the drafts created during one request so they
//! can be sent together or forgotten. It is an ordinary value owned by the
//! caller; nothing here is global.

use async_trait::async_trait;

use crate::google_api::gmail::GmailThreadSource;
use crate::google_api::GoogleApiError;

/// Subject used for generated follow-up drafts.
pub const FOLLOW_UP_SUBJECT: &str = "Following up";

/// Mailbox operations a draft session needs.
#[async_trait]
pub trait DraftMailbox: Send + Sync {
    async fn create_draft(&self, to: &str, subject: &str, body: &str) -> Result<String, GoogleApiError>;
    async fn send_draft(&self, draft_id: &str) -> Result<(), GoogleApiError>;
}

#[async_trait]
impl DraftMailbox for GmailThreadSource {
    async fn create_draft(&self, to: &str, subject: &str, body: &str) -> Result<String, GoogleApiError> {
        GmailThreadSource::create_draft(self, to, subject, body).await
    }

    async fn send_draft(&self, draft_id: &str) -> Result<(), GoogleApiError> {
        GmailThreadSource::send_draft(self, draft_id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedDraft {
    pub id: String,
    pub to: String,
    pub subject: String,
}

#[derive(Debug, Default)]
pub struct SendReport {
    pub sent: usize,
    pub failed: Vec<(SavedDraft, String)>,
}

#[derive(Debug, Default)]
pub struct DraftSession {
    drafts: Vec<SavedDraft>,
}

impl DraftSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drafts(&self) -> &[SavedDraft] {
        &self.drafts
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    /// Save a draft in the mailbox and remember it.
    pub async fn create(
        &mut self,
        mailbox: &dyn DraftMailbox,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<SavedDraft, GoogleApiError> {
        let id = mailbox.create_draft(to, subject, body).await?;
        log::info!("drafts: saved draft {} for {}", id, to);
        let draft = SavedDraft {
            id,
            to: to.to_string(),
            subject: subject.to_string(),
        };
        self.drafts.push(draft.clone());
        Ok(draft)
    }

    /// Send every remembered draft. Sent drafts are forgotten; failed ones
    /// stay in the session so the caller can retry or clear them.
    pub async fn send_all(&mut self, mailbox: &dyn DraftMailbox) -> SendReport {
        let mut report = SendReport::default();
        let mut remaining = Vec::new();
        for draft in std::mem::take(&mut self.drafts) {
            match mailbox.send_draft(&draft.id).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    log::warn!("drafts: sending {} to {} failed: {}", draft.id, draft.to, e);
                    report.failed.push((draft.clone(), e.to_string()));
                    remaining.push(draft);
                }
            }
        }
        self.drafts = remaining;
        report
    }

    /// Forget all drafts. They stay in the mailbox's drafts folder.
    pub fn clear(&mut self) {
        self.drafts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeMailbox {
        created: Mutex<Vec<String>>,
        sent: Mutex<Vec<String>>,
        reject_send_to: Option<String>,
    }

    #[async_trait]
    impl DraftMailbox for FakeMailbox {
        async fn create_draft(&self, to: &str, _subject: &str, _body: &str) -> Result<String, GoogleApiError> {
            let mut created = self.created.lock();
            created.push(to.to_string());
            Ok(format!("d{}", created.len()))
        }

        async fn send_draft(&self, draft_id: &str) -> Result<(), GoogleApiError> {
            if self.reject_send_to.as_deref() == Some(draft_id) {
                return Err(GoogleApiError::ApiError {
                    status: 400,
                    message: "Invalid draft".into(),
                });
            }
            self.sent.lock().push(draft_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_and_send_all() {
        let mailbox = FakeMailbox::default();
        let mut session = DraftSession::new();
        let first = session.create(&mailbox, "a@x.com", FOLLOW_UP_SUBJECT, "hi").await.unwrap();
        session.create(&mailbox, "b@x.com", FOLLOW_UP_SUBJECT, "hi").await.unwrap();
        assert_eq!(first.id, "d1");
        assert_eq!(session.drafts().len(), 2);
        assert_eq!(session.drafts()[0], first);

        let report = session.send_all(&mailbox).await;
        assert_eq!(report.sent, 2);
        assert!(report.failed.is_empty());
        assert!(session.is_empty());
        assert_eq!(*mailbox.sent.lock(), vec!["d1", "d2"]);
    }

    #[tokio::test]
    async fn test_failed_sends_stay_in_session() {
        let mailbox = FakeMailbox {
            reject_send_to: Some("d2".into()),
            ..Default::default()
        };
        let mut session = DraftSession::new();
        session.create(&mailbox, "a@x.com", "s", "b").await.unwrap();
        session.create(&mailbox, "b@x.com", "s", "b").await.unwrap();

        let report = session.send_all(&mailbox).await;
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(session.drafts()[0].to, "b@x.com");

        session.clear();
        assert!(session.is_empty());
    }
}
