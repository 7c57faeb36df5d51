//! In-pass contact accumulation.
//!
//! Pure: builds a fresh batch of [`ContactAggregate`]s from fetched
//! conversations without touching persisted state. The merge engine combines
//! the batch with stored contacts afterwards.

use std::collections::BTreeMap;

use crate::config::CountMode;
use crate::extract::{extract_facts, MessageFacts};
use crate::source::SourceMessage;
use crate::types::{ContactAggregate, RecentMessage, EXCERPT_MAX_CHARS, MIN_BODY_CHARS};
use crate::util::truncate_chars;

/// Batch of freshly observed contacts keyed by address.
pub type ContactBatch = BTreeMap<String, ContactAggregate>;

pub struct Accumulator {
    owner: String,
    count_mode: CountMode,
    contacts: ContactBatch,
    messages_seen: u64,
}

impl Accumulator {
    /// `owner` is the mailbox owner's address; messages from it are ignored.
    pub fn new(owner: &str, count_mode: CountMode) -> Self {
        Self {
            owner: owner.trim().to_lowercase(),
            count_mode,
            contacts: ContactBatch::new(),
            messages_seen: 0,
        }
    }

    /// Account for every counted message of one conversation.
    pub fn add_conversation(&mut self, messages: &[SourceMessage]) {
        let counted: &[SourceMessage] = match self.count_mode {
            CountMode::AllMessages => messages,
            CountMode::RepliesOnly if messages.len() < 2 => &[],
            CountMode::RepliesOnly => &messages[1..],
        };
        for message in counted {
            self.add_facts(extract_facts(message));
        }
    }

    /// Account for one message's extracted facts.
    pub fn add_facts(&mut self, facts: MessageFacts) {
        if facts.sender.is_empty() {
            log::debug!("aggregate: skipping message without sender");
            return;
        }
        if !self.owner.is_empty() && facts.sender == self.owner {
            return;
        }
        self.messages_seen += 1;

        let contact = self
            .contacts
            .entry(facts.sender.clone())
            .or_insert_with(|| ContactAggregate::new(facts.sender.clone()));
        contact.received_count += 1;

        let Some(date) = facts.date else {
            return;
        };
        contact.observe_date(date);

        if let Some(body_excerpt) = eligible_excerpt(&facts.body) {
            contact.push_recent(RecentMessage {
                timestamp: date,
                body_excerpt,
            });
        }
    }

    /// Messages counted so far (owner and sender-less messages excluded).
    pub fn messages_seen(&self) -> u64 {
        self.messages_seen
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn into_batch(self) -> ContactBatch {
        self.contacts
    }
}

/// Trimmed body capped at [`EXCERPT_MAX_CHARS`], or `None` when the body is
/// too short to say anything.
pub fn eligible_excerpt(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MIN_BODY_CHARS {
        return None;
    }
    Some(truncate_chars(trimmed, EXCERPT_MAX_CHARS))
}
