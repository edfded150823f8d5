//! Unread counters per conversation and the derived global total

use crate::models::ConversationKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

/// Tracks unread counts. The global total is published on a watch channel
/// for badge/title rendering; nothing else should read it as state.
pub struct UnreadAggregator {
    counts: Mutex<HashMap<ConversationKey, u32>>,
    total: watch::Sender<u32>,
}

impl UnreadAggregator {
    pub fn new() -> Self {
        let (total, _) = watch::channel(0);
        Self {
            counts: Mutex::new(HashMap::new()),
            total,
        }
    }

    pub fn increment(&self, key: &ConversationKey) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        let updated = *count;
        self.publish(&counts);
        updated
    }

    /// Resets `key` to zero. Returns the count it had.
    pub fn reset(&self, key: &ConversationKey) -> u32 {
        let mut counts = self.counts.lock();
        let prior = counts.remove(key).unwrap_or(0);
        if prior > 0 {
            self.publish(&counts);
        }
        prior
    }

    pub fn count(&self, key: &ConversationKey) -> u32 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        *self.total.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.total.subscribe()
    }

    fn publish(&self, counts: &HashMap<ConversationKey, u32>) {
        let total = counts.values().sum();
        self.total.send_replace(total);
    }
}

impl Default for UnreadAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Window title with the unread badge, e.g. `(3) Voxlink`.
pub fn badge_title(base: &str, total: u32) -> String {
    if total > 0 {
        format!("({}) {}", total, base)
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_tracks_counts() {
        let unread = UnreadAggregator::new();
        let a = ConversationKey::direct("U1", "U2");
        let g = ConversationKey::group("G1");

        unread.increment(&a);
        unread.increment(&a);
        unread.increment(&g);
        assert_eq!(unread.count(&a), 2);
        assert_eq!(unread.total(), 3);

        assert_eq!(unread.reset(&a), 2);
        assert_eq!(unread.count(&a), 0);
        assert_eq!(unread.total(), 1);
        assert_eq!(unread.reset(&a), 0);
    }

    #[test]
    fn test_watch_sees_total() {
        let unread = UnreadAggregator::new();
        let rx = unread.subscribe();
        unread.increment(&ConversationKey::group("G1"));
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_badge_title() {
        assert_eq!(badge_title("Voxlink", 0), "Voxlink");
        assert_eq!(badge_title("Voxlink", 4), "(4) Voxlink");
    }
}
