// Typing indicators for the open conversation
// Outbound: trailing-edge debounce of local keystrokes. Inbound: a flag that expires on its own.

use std::time::Duration;
use tokio::time::Instant;

/// Ephemeral typing state. Holds deadlines only; the session decides when to
/// poll them, so every transition is driven by an explicit `now`.
#[derive(Debug, Clone)]
pub struct TypingSignal {
    debounce: Duration,
    expiry: Duration,
    // When the coalesced outbound notification is due
    emit_at: Option<Instant>,
    // When the peer's typing flag clears
    visible_until: Option<Instant>,
}

impl TypingSignal {
    pub fn new(debounce: Duration, expiry: Duration) -> Self {
        TypingSignal {
            debounce,
            expiry,
            emit_at: None,
            visible_until: None,
        }
    }

    /// A local keystroke: restart the coalescing window
    pub fn keystroke(&mut self, now: Instant) {
        self.emit_at = Some(now + self.debounce);
    }

    /// True exactly once per window, when the window has closed
    pub fn take_due_emission(&mut self, now: Instant) -> bool {
        match self.emit_at {
            Some(at) if at <= now => {
                self.emit_at = None;
                true
            }
            _ => false,
        }
    }

    /// The open peer is typing; each event restarts the expiry window
    pub fn remote_typing(&mut self, now: Instant) {
        self.visible_until = Some(now + self.expiry);
    }

    pub fn is_peer_typing(&self, now: Instant) -> bool {
        matches!(self.visible_until, Some(until) if now < until)
    }

    /// Drop an expired flag. Returns true when the flag was cleared.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.visible_until {
            Some(until) if until <= now => {
                self.visible_until = None;
                true
            }
            _ => false,
        }
    }

    /// The peer's burst is over (their message arrived); local typing is untouched
    pub fn clear_remote(&mut self) {
        self.visible_until = None;
    }

    /// Earliest instant at which polling can change something
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.emit_at, self.visible_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Forget everything: conversation switch or teardown
    pub fn reset(&mut self) {
        self.emit_at = None;
        self.visible_until = None;
    }
}
