//! Merge engine: folds a freshly scanned batch into persisted scan state.
//!
//! Re-applying a non-empty batch double-counts. Callers pick date windows that
//! do not overlap; the engine does not try to detect repeats.

use crate::aggregate::ContactBatch;
use crate::types::{normalize_recent, ContactAggregate, ScanMode, ScanState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Accumulate into the stored contacts (watermark-bounded scans).
    AdditiveIncremental,
    /// Discard stored contacts and counters, keep only the fresh batch.
    ReplaceFull,
}

impl MergePolicy {
    pub fn for_mode(mode: &ScanMode) -> Self {
        if mode.resets_state() {
            MergePolicy::ReplaceFull
        } else {
            MergePolicy::AdditiveIncremental
        }
    }
}

/// Apply `batch` (built from `threads_processed` conversations) to `state`.
pub fn merge_batch(
    state: &mut ScanState,
    batch: ContactBatch,
    threads_processed: u64,
    policy: MergePolicy,
) {
    match policy {
        MergePolicy::ReplaceFull => {
            state.contacts = batch;
            state.total_threads_scanned = threads_processed;
        }
        MergePolicy::AdditiveIncremental => {
            for (address, fresh) in batch {
                match state.contacts.get_mut(&address) {
                    Some(existing) => merge_contact(existing, fresh),
                    None => {
                        state.contacts.insert(address, fresh);
                    }
                }
            }
            state.total_threads_scanned += threads_processed;
        }
    }
}

/// Additive merge of one contact. The annotation is left alone; only the
/// enrichment driver replaces it.
fn merge_contact(existing: &mut ContactAggregate, fresh: ContactAggregate) {
    existing.received_count += fresh.received_count;
    existing.sent_count += fresh.sent_count;

    existing.last_contact_at = match (existing.last_contact_at, fresh.last_contact_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    // firstContactAt is not lowered by later batches, only filled when the
    // stored contact never had a parseable date. Tenure derived from it is
    // therefore "first seen by the tracker", not "first ever".
    if existing.first_contact_at.is_none() {
        existing.first_contact_at = fresh.first_contact_at;
    }

    existing.recent_messages.extend(fresh.recent_messages);
    normalize_recent(&mut existing.recent_messages);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Annotation, EngagementTier, RecentMessage, Sentiment};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).unwrap()
    }

    fn contact(address: &str, count: u64, days: &[u32]) -> ContactAggregate {
        let mut c = ContactAggregate::new(address);
        c.received_count = count;
        for &day in days {
            c.observe_date(at(day));
            c.push_recent(RecentMessage {
                timestamp: at(day),
                body_excerpt: format!("excerpt from day {}", day),
            });
        }
        c
    }

    fn batch(contacts: Vec<ContactAggregate>) -> ContactBatch {
        contacts
            .into_iter()
            .map(|c| (c.address.clone(), c))
            .collect()
    }

    #[test]
    fn test_policy_for_mode() {
        assert_eq!(
            MergePolicy::for_mode(&ScanMode::Incremental),
            MergePolicy::AdditiveIncremental
        );
        assert_eq!(
            MergePolicy::for_mode(&ScanMode::Custom { days: 10 }),
            MergePolicy::ReplaceFull
        );
    }

    #[test]
    fn test_additive_merge_accumulates() {
        let mut state = ScanState::default();
        merge_batch(
            &mut state,
            batch(vec![contact("a@x.com", 1, &[2])]),
            4,
            MergePolicy::AdditiveIncremental,
        );
        merge_batch(
            &mut state,
            batch(vec![contact("a@x.com", 1, &[6]), contact("b@x.com", 2, &[5])]),
            3,
            MergePolicy::AdditiveIncremental,
        );

        assert_eq!(state.total_threads_scanned, 7);
        let a = &state.contacts["a@x.com"];
        assert_eq!(a.received_count, 2);
        assert_eq!(a.first_contact_at, Some(at(2)));
        assert_eq!(a.last_contact_at, Some(at(6)));
        assert_eq!(a.recent_messages.len(), 2);
        assert_eq!(a.recent_messages[0].timestamp, at(6));
        assert_eq!(state.contacts["b@x.com"].received_count, 2);
    }

    #[test]
    fn test_additive_merge_keeps_prior_first_contact() {
        let mut state = ScanState::default();
        merge_batch(
            &mut state,
            batch(vec![contact("a@x.com", 1, &[10])]),
            1,
            MergePolicy::AdditiveIncremental,
        );
        // An older message arriving later does not move firstContactAt.
        merge_batch(
            &mut state,
            batch(vec![contact("a@x.com", 1, &[3])]),
            1,
            MergePolicy::AdditiveIncremental,
        );
        let a = &state.contacts["a@x.com"];
        assert_eq!(a.first_contact_at, Some(at(10)));
        assert_eq!(a.last_contact_at, Some(at(10)));
    }

    #[test]
    fn test_additive_merge_window_invariant() {
        let mut state = ScanState::default();
        merge_batch(
            &mut state,
            batch(vec![contact("a@x.com", 3, &[1, 4, 7])]),
            3,
            MergePolicy::AdditiveIncremental,
        );
        merge_batch(
            &mut state,
            batch(vec![contact("a@x.com", 2, &[2, 9])]),
            2,
            MergePolicy::AdditiveIncremental,
        );
        let days: Vec<_> = state.contacts["a@x.com"]
            .recent_messages
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(days, vec![at(9), at(7), at(4)]);
    }

    #[test]
    fn test_additive_merge_preserves_annotation() {
        let mut state = ScanState::default();
        let mut annotated = contact("a@x.com", 1, &[1]);
        annotated.annotation = Some(Annotation {
            sentiment: Sentiment::Positive,
            engagement_tier: EngagementTier::Warm,
            buying_signals: vec![],
            key_topics: vec![],
            follow_up_recommended: false,
            follow_up_reason: None,
            priority_score: 5,
        });
        state.contacts.insert("a@x.com".into(), annotated);

        merge_batch(
            &mut state,
            batch(vec![contact("a@x.com", 1, &[2])]),
            1,
            MergePolicy::AdditiveIncremental,
        );
        assert!(state.contacts["a@x.com"].annotation.is_some());
    }

    #[test]
    fn test_additive_merge_is_associative_over_disjoint_windows() {
        let early = batch(vec![contact("a@x.com", 2, &[1, 2]), contact("b@x.com", 1, &[3])]);
        let late = batch(vec![contact("a@x.com", 1, &[8]), contact("c@x.com", 4, &[9])]);
        let whole = batch(vec![
            contact("a@x.com", 3, &[1, 2, 8]),
            contact("b@x.com", 1, &[3]),
            contact("c@x.com", 4, &[9]),
        ]);

        let mut split = ScanState::default();
        merge_batch(&mut split, early, 2, MergePolicy::AdditiveIncremental);
        merge_batch(&mut split, late, 2, MergePolicy::AdditiveIncremental);

        let mut single = ScanState::default();
        merge_batch(&mut single, whole, 4, MergePolicy::AdditiveIncremental);

        for (address, contact) in &single.contacts {
            assert_eq!(split.contacts[address].received_count, contact.received_count);
        }
        assert_eq!(split.total_threads_scanned, single.total_threads_scanned);
    }

    #[test]
    fn test_replace_full_discards_prior() {
        let mut state = ScanState::default();
        merge_batch(
            &mut state,
            batch(vec![contact("old@x.com", 9, &[1])]),
            50,
            MergePolicy::AdditiveIncremental,
        );
        merge_batch(
            &mut state,
            batch(vec![contact("new@x.com", 1, &[2])]),
            3,
            MergePolicy::ReplaceFull,
        );
        assert_eq!(state.total_threads_scanned, 3);
        assert_eq!(state.contacts.len(), 1);
        assert_eq!(state.contacts["new@x.com"].received_count, 1);
    }

    #[test]
    fn test_empty_batch_is_idempotent() {
        let mut state = ScanState::default();
        merge_batch(
            &mut state,
            batch(vec![contact("a@x.com", 2, &[1])]),
            2,
            MergePolicy::AdditiveIncremental,
        );
        let before = state.clone();
        merge_batch(&mut state, ContactBatch::new(), 0, MergePolicy::AdditiveIncremental);
        merge_batch(&mut state, ContactBatch::new(), 0, MergePolicy::AdditiveIncremental);
        assert_eq!(state, before);
    }
}
