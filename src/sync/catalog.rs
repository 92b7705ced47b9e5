// Peer and conversation catalogs
// Snapshots replace each list wholesale; streamed presence that is newer than the snapshot survives the merge

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashSet;

use super::presence::PresenceTracker;
use crate::models::{Peer, UserStatus};

#[derive(Debug, Clone, Default)]
pub struct ConversationCatalog {
    /// Every user the server lists
    users: Vec<Peer>,
    /// Users with at least one exchanged message
    conversations: Vec<Peer>,
}

/// Turn raw snapshot records into peers, dropping anything without a usable id and name
pub fn valid_peers(records: Vec<Value>) -> Vec<Peer> {
    let mut seen = HashSet::new();
    let mut peers = Vec::with_capacity(records.len());
    for record in records {
        let id = match record.get("_id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                warn!("Skipping peer record without an id");
                continue;
            }
        };
        let name = match record.get("name").and_then(Value::as_str) {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => {
                warn!("Skipping peer record {} without a valid name", id);
                continue;
            }
        };
        if !seen.insert(id.clone()) {
            debug!("Duplicate peer record {} in snapshot", id);
            continue;
        }
        let status = record
            .get("status")
            .and_then(|v| serde_json::from_value::<UserStatus>(v.clone()).ok())
            .unwrap_or_default();
        let status_updated_at = record
            .get("statusUpdatedAt")
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
        peers.push(Peer { id, name, status, status_updated_at });
    }
    peers
}

impl ConversationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn users(&self) -> &[Peer] {
        &self.users
    }

    pub fn conversations(&self) -> &[Peer] {
        &self.conversations
    }

    /// Look a peer up in either list
    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.users
            .iter()
            .chain(self.conversations.iter())
            .find(|peer| peer.id == peer_id)
    }

    pub fn replace_users(&mut self, mut snapshot: Vec<Peer>, presence: &PresenceTracker) {
        for peer in snapshot.iter_mut() {
            presence.overlay(peer);
        }
        debug!("User catalog replaced with {} peers", snapshot.len());
        self.users = snapshot;
        self.reconcile_shared();
    }

    pub fn replace_conversations(&mut self, mut snapshot: Vec<Peer>, presence: &PresenceTracker) {
        for peer in snapshot.iter_mut() {
            presence.overlay(peer);
        }
        debug!("Conversation catalog replaced with {} peers", snapshot.len());
        self.conversations = snapshot;
        self.reconcile_shared();
    }

    /// Newest status stamp held for a peer across both lists
    pub fn held_stamp(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.users
            .iter()
            .chain(self.conversations.iter())
            .filter(|peer| peer.id == peer_id)
            .filter_map(|peer| peer.status_updated_at)
            .max()
    }

    /// Set status fields on every entry for this peer
    pub fn apply_presence(&mut self, peer_id: &str, status: UserStatus, at: Option<DateTime<Utc>>) {
        for peer in self
            .users
            .iter_mut()
            .chain(self.conversations.iter_mut())
            .filter(|peer| peer.id == peer_id)
        {
            peer.set_presence(status, at);
        }
    }

    // Two snapshots fetched at different times can disagree; the newer stamp wins in both lists
    fn reconcile_shared(&mut self) {
        for user in self.users.iter_mut() {
            if let Some(conv) = self.conversations.iter_mut().find(|c| c.id == user.id) {
                if user.status == conv.status && user.status_updated_at == conv.status_updated_at {
                    continue;
                }
                if conv.status_updated_at > user.status_updated_at {
                    user.set_presence(conv.status, conv.status_updated_at);
                } else {
                    conv.set_presence(user.status, user.status_updated_at);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.conversations.clear();
    }
}
