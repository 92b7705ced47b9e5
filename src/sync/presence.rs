// Peer presence propagation
// Status-change events are applied to every view of a peer in one step, newest stamp wins

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;

use super::catalog::ConversationCatalog;
use crate::models::{Identity, Peer, UserStatus};
use crate::transport::StatusChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    Applied,
    /// Older than (or as old as) what we already hold
    Stale,
}

/// Remembers the newest streamed status per user so later snapshots
/// cannot roll it back.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    applied: HashMap<String, (UserStatus, DateTime<Utc>)>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a status change to the catalog, the open peer and the identity.
    ///
    /// Events without a server stamp are stamped with `received_at`.
    pub fn apply(
        &mut self,
        change: &StatusChange,
        received_at: DateTime<Utc>,
        catalog: &mut ConversationCatalog,
        active: Option<&mut Peer>,
        identity: Option<&mut Identity>,
    ) -> PresenceOutcome {
        let user_id = change.user_id.as_str();
        let stamp = change.status_updated_at.unwrap_or(received_at);

        let active = active.filter(|peer| peer.id == user_id);
        let identity = identity.filter(|me| me.id == user_id);

        let held = [
            self.applied.get(user_id).map(|(_, at)| *at),
            catalog.held_stamp(user_id),
            active.as_ref().and_then(|peer| peer.status_updated_at),
            identity.as_ref().and_then(|me| me.status_updated_at),
        ]
        .into_iter()
        .flatten()
        .max();

        if let Some(held) = held {
            if stamp <= held {
                debug!(
                    "Discarding stale status {:?} for {} ({} <= {})",
                    change.status, user_id, stamp, held
                );
                return PresenceOutcome::Stale;
            }
        }

        debug!("{} is now {:?} as of {}", user_id, change.status, stamp);
        self.applied.insert(user_id.to_string(), (change.status, stamp));
        catalog.apply_presence(user_id, change.status, Some(stamp));
        if let Some(peer) = active {
            peer.set_presence(change.status, Some(stamp));
        }
        if let Some(me) = identity {
            info!("Own status changed elsewhere to {:?}", change.status);
            me.status = change.status;
            me.status_updated_at = Some(stamp);
        }
        PresenceOutcome::Applied
    }

    /// Carry a newer streamed status over a snapshot record
    pub fn overlay(&self, peer: &mut Peer) {
        if let Some((status, at)) = self.applied.get(&peer.id) {
            let newer = match peer.status_updated_at {
                Some(snapshot_at) => *at > snapshot_at,
                None => true,
            };
            if newer {
                debug!("Keeping streamed status {:?} for {} over snapshot", status, peer.id);
                peer.set_presence(*status, Some(*at));
            }
        }
    }

    pub fn clear(&mut self) {
        self.applied.clear();
    }
}

/// Relative "last seen" label for a status timestamp
pub fn last_seen_label(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let at = match at {
        Some(at) => at,
        None => return String::new(),
    };
    let secs = (now - at).num_seconds().max(0);
    if secs < 60 {
        "just now".to_string()
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}
