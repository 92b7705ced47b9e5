// Message history of the open conversation
// Merges REST history with streamed messages, runs the optimistic send and matches acknowledgements

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::{DeliveryState, Message, MessageRecord, Peer};
use crate::transport::{OutboundEvent, SendFailure};

/// Why a send request was turned into a no-op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejection {
    EmptyContent,
    NoConversation,
    NotConnected,
    AlreadySending,
    UnknownMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Appended to the open history; the caller should mark it read
    Appended,
    /// Same id already present
    Duplicate,
    /// Sender is not the open peer; belongs to the unread ledger
    NotOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// A pending entry was promoted to sent
    Promoted,
    /// No pending entry matched; the message was appended as sent
    Appended,
    Duplicate,
    /// Not ours, or not for the open conversation
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct MessageReconciler {
    active: Option<Peer>,
    // Bumped on every open so late history responses can be recognised
    generation: u64,
    history: Vec<Message>,
    loading: bool,
    // Correlation id of the one outstanding send
    in_flight: Option<String>,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&Peer> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut Peer> {
        self.active.as_mut()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|peer| peer.id.as_str())
    }

    pub fn is_open(&self, peer_id: &str) -> bool {
        self.active_id() == Some(peer_id)
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_sending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Switch to a conversation. Returns the generation the history fetch must carry.
    pub fn open(&mut self, peer: Peer) -> u64 {
        info!("Opening conversation with {} ({})", peer.name, peer.id);
        self.generation += 1;
        self.active = Some(peer);
        self.history.clear();
        self.loading = true;
        self.generation
    }

    /// Replace history with a REST snapshot. Returns false when the response
    /// belongs to a conversation that is no longer open.
    pub fn apply_history(&mut self, generation: u64, records: Vec<MessageRecord>) -> bool {
        if generation != self.generation {
            debug!(
                "Discarding history for generation {} (current {})",
                generation, self.generation
            );
            return false;
        }

        let mut seen = HashSet::new();
        let mut history: Vec<Message> = records
            .into_iter()
            .filter(|record| seen.insert(record.id.clone()))
            .map(Message::from)
            .collect();

        // Local entries the server does not know about yet stay visible
        let known_client_ids: HashSet<&str> = history
            .iter()
            .filter_map(|m| m.client_id.as_deref())
            .collect();
        let local: Vec<Message> = self
            .history
            .iter()
            .filter(|m| m.delivery != DeliveryState::Sent)
            .filter(|m| {
                m.client_id
                    .as_deref()
                    .map_or(true, |id| !known_client_ids.contains(id))
            })
            .cloned()
            .collect();
        history.extend(local);

        debug!("History replaced with {} messages", history.len());
        self.history = history;
        self.loading = false;
        true
    }

    /// History fetch failed; keep whatever is shown
    pub fn history_failed(&mut self, generation: u64) {
        if generation == self.generation {
            self.loading = false;
        }
    }

    /// A `messageReceived` event
    pub fn receive(&mut self, record: MessageRecord) -> ReceiveOutcome {
        if !self.is_open(&record.sender) {
            return ReceiveOutcome::NotOpen;
        }
        if self.contains(&record.id) {
            debug!("Ignoring duplicate delivery of message {}", record.id);
            return ReceiveOutcome::Duplicate;
        }
        self.history.push(Message::from(record));
        ReceiveOutcome::Appended
    }

    /// Start an optimistic send. On success the returned event must be emitted.
    pub fn begin_send(
        &mut self,
        content: &str,
        sender_id: &str,
        connected: bool,
        now: DateTime<Utc>,
    ) -> Result<OutboundEvent, SendRejection> {
        if content.trim().is_empty() {
            return Err(SendRejection::EmptyContent);
        }
        let receiver_id = match self.active_id() {
            Some(id) => id.to_string(),
            None => return Err(SendRejection::NoConversation),
        };
        if !connected {
            return Err(SendRejection::NotConnected);
        }
        if self.in_flight.is_some() {
            return Err(SendRejection::AlreadySending);
        }

        let client_id = Uuid::new_v4().to_string();
        debug!("Sending message {} to {}", client_id, receiver_id);
        self.history
            .push(Message::pending(&client_id, sender_id, &receiver_id, content, now));
        self.in_flight = Some(client_id.clone());
        Ok(OutboundEvent::SendMessage {
            receiver_id,
            content: content.to_string(),
            client_id,
        })
    }

    /// Resend a message that previously failed
    pub fn retry(&mut self, client_id: &str, connected: bool) -> Result<OutboundEvent, SendRejection> {
        if !connected {
            return Err(SendRejection::NotConnected);
        }
        if self.in_flight.is_some() {
            return Err(SendRejection::AlreadySending);
        }
        let entry = self
            .history
            .iter_mut()
            .find(|m| m.client_id.as_deref() == Some(client_id) && m.delivery == DeliveryState::Error)
            .ok_or(SendRejection::UnknownMessage)?;
        entry.delivery = DeliveryState::Pending;
        self.in_flight = Some(client_id.to_string());
        info!("Retrying message {}", client_id);
        Ok(OutboundEvent::SendMessage {
            receiver_id: entry.receiver.clone(),
            content: entry.content.clone(),
            client_id: client_id.to_string(),
        })
    }

    /// A `messageSent` acknowledgement
    pub fn acknowledge(&mut self, record: MessageRecord, identity_id: &str) -> AckOutcome {
        if record.sender != identity_id {
            return AckOutcome::Ignored;
        }

        // Echoed correlation id first, then the single outstanding send
        let target = record.client_id.clone().or_else(|| self.in_flight.clone());
        let released = match (&record.client_id, &self.in_flight) {
            (Some(echoed), Some(current)) => echoed == current,
            (None, Some(_)) => true,
            (_, None) => false,
        };
        if released {
            self.in_flight = None;
        }

        if let Some(target) = target {
            let position = self
                .history
                .iter()
                .position(|m| m.client_id.as_deref() == Some(target.as_str()) && m.delivery != DeliveryState::Sent);
            if let Some(idx) = position {
                if self.contains(&record.id) {
                    // Same server message already shown; keep one copy
                    self.history.remove(idx);
                    return AckOutcome::Duplicate;
                }
                let entry = &mut self.history[idx];
                entry.id = record.id.clone();
                entry.timestamp = record.timestamp.or(entry.timestamp);
                entry.created_at = record.created_at.or(entry.created_at);
                entry.delivery = DeliveryState::Sent;
                debug!("Message {} acknowledged as {}", target, record.id);
                return AckOutcome::Promoted;
            }
        }

        if self.contains(&record.id) {
            return AckOutcome::Duplicate;
        }
        if self.is_open(&record.receiver) {
            // Sent from another device of ours
            self.history.push(Message::from(record));
            return AckOutcome::Appended;
        }
        AckOutcome::Ignored
    }

    /// A `messageError` event. Returns the correlation id of the entry marked failed.
    pub fn fail(&mut self, failure: &SendFailure) -> Option<String> {
        let target = failure.client_id.clone().or_else(|| self.in_flight.clone());
        let release = match (&failure.client_id, &self.in_flight) {
            (Some(id), Some(current)) => id == current,
            (None, Some(_)) => true,
            (_, None) => false,
        };
        if release {
            self.in_flight = None;
        }
        let target = target?;
        match self
            .history
            .iter_mut()
            .find(|m| m.client_id.as_deref() == Some(target.as_str()) && m.delivery == DeliveryState::Pending)
        {
            Some(entry) => {
                warn!("Message {} failed: {}", target, failure.reason);
                entry.delivery = DeliveryState::Error;
                Some(target)
            }
            None => None,
        }
    }

    /// Give up on the outstanding send (teardown)
    pub fn abandon_in_flight(&mut self) {
        if let Some(client_id) = self.in_flight.take() {
            debug!("Abandoning in-flight message {}", client_id);
            for entry in self.history.iter_mut() {
                if entry.client_id.as_deref() == Some(client_id.as_str()) && entry.delivery == DeliveryState::Pending {
                    entry.delivery = DeliveryState::Error;
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.active = None;
        self.history.clear();
        self.loading = false;
        self.in_flight = None;
        self.generation += 1;
    }

    fn contains(&self, id: &str) -> bool {
        self.history.iter().any(|m| m.id == id)
    }
}
