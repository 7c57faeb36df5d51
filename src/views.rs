//! Read-only views over scan state for consumers.

use crate::types::{ContactAggregate, EngagementTier, ScanState};

/// Priority at or above which a contact counts as a hot lead regardless of tier.
pub const HOT_LEAD_MIN_PRIORITY: u8 = 7;

/// Contacts by `receivedCount` descending, ties by address. `limit` keeps the
/// first N.
pub fn top_contacts(state: &ScanState, limit: Option<usize>) -> Vec<&ContactAggregate> {
    let mut contacts: Vec<&ContactAggregate> = state.contacts.values().collect();
    contacts.sort_by(|a, b| {
        b.received_count
            .cmp(&a.received_count)
            .then_with(|| a.address.cmp(&b.address))
    });
    if let Some(limit) = limit {
        contacts.truncate(limit);
    }
    contacts
}

/// Hot or warm contacts, or any contact with priority >= 7. Highest priority first.
pub fn hot_leads(state: &ScanState) -> Vec<&ContactAggregate> {
    let mut leads: Vec<&ContactAggregate> = state
        .contacts
        .values()
        .filter(|c| {
            c.annotation.as_ref().is_some_and(|a| {
                matches!(a.engagement_tier, EngagementTier::Hot | EngagementTier::Warm)
                    || a.priority_score >= HOT_LEAD_MIN_PRIORITY
            })
        })
        .collect();
    sort_by_priority(&mut leads);
    leads
}

/// Contacts whose last annotation recommends a follow-up.
pub fn follow_up_queue(state: &ScanState) -> Vec<&ContactAggregate> {
    let mut queue: Vec<&ContactAggregate> = state
        .contacts
        .values()
        .filter(|c| c.annotation.as_ref().is_some_and(|a| a.follow_up_recommended))
        .collect();
    sort_by_priority(&mut queue);
    queue
}

fn sort_by_priority(contacts: &mut [&ContactAggregate]) {
    contacts.sort_by(|a, b| {
        let pa = a.annotation.as_ref().map_or(0, |x| x.priority_score);
        let pb = b.annotation.as_ref().map_or(0, |x| x.priority_score);
        pb.cmp(&pa)
            .then_with(|| b.last_contact_at.cmp(&a.last_contact_at))
            .then_with(|| a.address.cmp(&b.address))
    });
}
