//! Classification oracle: the external model that annotates contacts and
//! writes follow-up drafts.
//!
//! The oracle returns raw text. Parsing and validation happen in
//! [`crate::enrich`], so an oracle never decides what counts as a valid
//! annotation.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::EnrichmentConfig;
use crate::pty::PtyManager;
use crate::types::Annotation;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Claude Code CLI not found. Install from https://claude.ai/code")]
    NotAvailable,

    #[error("Claude Code not authenticated. Run 'claude login'")]
    NotAuthenticated,

    #[error("Oracle rate limit exceeded")]
    RateLimited,

    #[error("Oracle call timed out after {0} seconds")]
    Timeout(u64),

    #[error("Oracle I/O error: {0}")]
    Io(String),
}

#[async_trait]
pub trait ClassificationOracle: Send + Sync {
    /// Classify one contact from its most recent excerpts (newest first).
    /// Returns the oracle's raw response, expected to hold one JSON object.
    async fn classify(&self, excerpts: &[String]) -> Result<String, OracleError>;

    /// Write a short follow-up email body for one contact.
    async fn draft(&self, excerpt: &str, annotation: &Annotation) -> Result<String, OracleError>;
}

// ============================================================================
// Claude Code CLI
// ============================================================================

/// Oracle backed by `claude --print` in a pseudo-terminal.
pub struct ClaudeCliOracle {
    timeout_secs: u64,
    model: Option<String>,
    workdir: PathBuf,
}

impl ClaudeCliOracle {
    pub fn new(config: &EnrichmentConfig) -> Self {
        Self {
            timeout_secs: config.timeout_secs,
            model: config.model.clone(),
            workdir: std::env::temp_dir(),
        }
    }

    pub fn is_available() -> bool {
        PtyManager::is_claude_available()
    }

    async fn run(&self, prompt: String) -> Result<String, OracleError> {
        let pty = PtyManager::new()
            .with_timeout(self.timeout_secs)
            .with_model(self.model.clone());
        let workdir = self.workdir.clone();

        let output = tokio::task::spawn_blocking(move || pty.spawn_claude(&workdir, &prompt))
            .await
            .map_err(|e| OracleError::Io(format!("oracle task failed: {}", e)))??;
        Ok(output.stdout)
    }
}

#[async_trait]
impl ClassificationOracle for ClaudeCliOracle {
    async fn classify(&self, excerpts: &[String]) -> Result<String, OracleError> {
        self.run(build_classification_prompt(excerpts)).await
    }

    async fn draft(&self, excerpt: &str, annotation: &Annotation) -> Result<String, OracleError> {
        self.run(build_draft_prompt(excerpt, annotation)).await
    }
}

// ============================================================================
// Prompts
// ============================================================================

pub fn build_classification_prompt(excerpts: &[String]) -> String {
    let mut prompt = String::from(
        "You are analysing recent emails a salesperson received from one contact.\n\
         Classify the contact's engagement based only on the emails below.\n\n",
    );
    for (i, excerpt) in excerpts.iter().enumerate() {
        prompt.push_str(&format!("--- Email {} (most recent first) ---\n{}\n\n", i + 1, excerpt));
    }
    prompt.push_str(
        "Respond with ONLY one JSON object, no markdown fences, with these fields:\n\
         {\n\
         \x20 \"sentiment\": \"positive\" | \"neutral\" | \"negative\" | \"mixed\",\n\
         \x20 \"engagement_tier\": \"hot\" | \"warm\" | \"cold\",\n\
         \x20 \"buying_signals\": [short phrases],\n\
         \x20 \"key_topics\": [short phrases],\n\
         \x20 \"follow_up_recommended\": true | false,\n\
         \x20 \"follow_up_reason\": \"one sentence, or null\",\n\
         \x20 \"priority_score\": integer from 1 (ignore) to 10 (act today)\n\
         }\n",
    );
    prompt
}

pub fn build_draft_prompt(excerpt: &str, annotation: &Annotation) -> String {
    let mut context = format!(
        "Engagement tier: {}\nPriority: {}/10\n",
        annotation.engagement_tier, annotation.priority_score
    );
    if !annotation.buying_signals.is_empty() {
        context.push_str(&format!("Buying signals: {}\n", annotation.buying_signals.join(", ")));
    }
    if !annotation.key_topics.is_empty() {
        context.push_str(&format!("Key topics: {}\n", annotation.key_topics.join(", ")));
    }
    if let Some(reason) = annotation.follow_up_reason.as_deref() {
        context.push_str(&format!("Why follow up: {}\n", reason));
    }

    format!(
        "Write a short follow-up email (under 120 words) replying to the contact's latest message.\n\
         End with one clear call to action (a meeting, a call, or a concrete next step).\n\
         Output only the email body: no subject line, no placeholders in brackets.\n\n\
         {}\n\
         Latest message from the contact:\n{}\n",
        context, excerpt
    )
}
