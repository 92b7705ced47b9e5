// Unread message counters
// Per-peer counts are the source of truth; the total is always derived from them

use log::{debug, warn};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnreadLedger {
    counts: HashMap<String, u32>,
    // Messages already counted since the last snapshot; redeliveries are skipped
    counted: HashSet<String>,
}

impl UnreadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all counters with a server snapshot
    pub fn replace(&mut self, server_total: u32, by_sender: HashMap<String, u32>) {
        self.counts = by_sender.into_iter().filter(|(_, count)| *count > 0).collect();
        self.counted.clear();
        let total = self.total();
        if total != server_total {
            // Both numbers come from separate requests; the per-peer map wins
            warn!(
                "Server unread total {} disagrees with per-sender sum {}, using the sum",
                server_total, total
            );
        }
        debug!("Unread counters refreshed: {} total across {} peers", total, self.counts.len());
    }

    /// A message arrived from a peer whose conversation is not open.
    /// Returns false when this message was already counted.
    pub fn increment(&mut self, peer_id: &str, message_id: &str) -> bool {
        if !self.counted.insert(message_id.to_string()) {
            debug!("Message {} from {} already counted as unread", message_id, peer_id);
            return false;
        }
        let count = self.counts.entry(peer_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        true
    }

    /// A read receipt for this peer was accepted. Returns false when there was nothing to decrement.
    pub fn decrement(&mut self, peer_id: &str) -> bool {
        match self.counts.get_mut(peer_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.counts.remove(peer_id);
                true
            }
            None => false,
        }
    }

    pub fn count(&self, peer_id: &str) -> u32 {
        self.counts.get(peer_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().fold(0u32, |acc, c| acc.saturating_add(*c))
    }

    pub fn counts(&self) -> &HashMap<String, u32> {
        &self.counts
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.counted.clear();
    }
}
