//! Merging of message batches into one canonical, newest-first sequence.
//!
//! Batches come from the local snapshot, page fetches, realtime pushes and
//! optimistic sends. Confirmed copies are identified by id. An optimistic
//! entry has no server id yet, so it is matched to its confirmed copy by
//! sender, content and a bounded `created_ms` distance.

use crate::{Message, MessageId, UserId};
use std::collections::{HashMap, HashSet};

/// Maximum distance between an optimistic entry and its confirmed copy.
pub const DEFAULT_DEDUP_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciler {
    dedup_window_ms: i64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW_MS)
    }
}

impl Reconciler {
    pub fn new(dedup_window_ms: i64) -> Self {
        Self { dedup_window_ms }
    }

    pub fn dedup_window_ms(&self) -> i64 {
        self.dedup_window_ms
    }

    /// Merge `incoming` into `existing`. Pure: neither input is mutated.
    ///
    /// The result is sorted by `created_ms` descending. Ties keep
    /// concatenation order, with `incoming` ahead of `existing`.
    pub fn reconcile(&self, incoming: &[Message], existing: &[Message]) -> Vec<Message> {
        let mut combined: Vec<&Message> = incoming.iter().chain(existing.iter()).collect();
        // `sort_by` is stable.
        combined.sort_by(|a, b| b.created_ms.cmp(&a.created_ms));

        let mut confirmed: HashMap<(&UserId, &str), Vec<i64>> = HashMap::new();
        for message in combined.iter().filter(|m| !m.is_optimistic()) {
            confirmed
                .entry((&message.sender_id, message.content.as_str()))
                .or_default()
                .push(message.created_ms);
        }

        let mut seen: HashSet<&MessageId> = HashSet::with_capacity(combined.len());
        let mut output = Vec::with_capacity(combined.len());

        for message in combined {
            if seen.contains(&message.id) {
                continue;
            }
            if message.is_optimistic() && self.is_superseded(message, &confirmed) {
                continue;
            }
            seen.insert(&message.id);
            output.push(message.clone());
        }

        output
    }

    fn is_superseded(
        &self,
        optimistic: &Message,
        confirmed: &HashMap<(&UserId, &str), Vec<i64>>,
    ) -> bool {
        let window = self.dedup_window_ms.max(0) as u64;
        confirmed
            .get(&(&optimistic.sender_id, optimistic.content.as_str()))
            .map(|stamps| {
                stamps
                    .iter()
                    .any(|created| created.abs_diff(optimistic.created_ms) < window)
            })
            .unwrap_or(false)
    }
}

/// [`Reconciler::reconcile`] with the default window.
pub fn reconcile(incoming: &[Message], existing: &[Message]) -> Vec<Message> {
    Reconciler::default().reconcile(incoming, existing)
}

/// Replace the entry whose id equals `updated.id` in place.
///
/// Returns `false` when no entry carries that id; the sequence is untouched.
pub fn apply_update(sequence: &mut [Message], updated: Message) -> bool {
    match sequence.iter_mut().find(|m| m.id == updated.id) {
        Some(slot) => {
            *slot = updated;
            true
        }
        None => false,
    }
}
