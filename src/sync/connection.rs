// Realtime channel lifecycle for a session
// Holds at most one channel; tracks its state from lifecycle events delivered in-band

use log::{debug, error, info, warn};
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};
use crate::transport::{ChannelHandle, Connector, InboundEvent, OutboundEvent};

/// Enum for representing channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    handle: Option<ChannelHandle>,
    state: ChannelState,
    // One notice per failure streak
    error_reported: bool,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        ConnectionManager {
            connector,
            handle: None,
            state: ChannelState::Disconnected,
            error_reported: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the channel with `token`, replacing any existing one.
    ///
    /// The handle keeps a single inbound queue across reconnects, so the
    /// session's dispatch loop stays subscribed to every event kind no matter
    /// how many times the driver reconnects underneath.
    pub fn open(&mut self, token: &str) {
        if self.handle.is_some() {
            warn!("Channel already open, closing it before reopening");
            self.close();
        }
        info!("Connecting realtime channel");
        self.state = ChannelState::Connecting;
        self.error_reported = false;
        self.handle = Some(self.connector.open(token));
    }

    /// Tear the channel down. Safe to call in any state, any number of times.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            info!("Closing realtime channel");
            handle.close();
        }
        self.state = ChannelState::Disconnected;
    }

    /// Track a lifecycle event. Returns a message to surface to the user, if any.
    pub fn on_lifecycle(&mut self, event: &InboundEvent) -> Option<String> {
        match event {
            InboundEvent::Connected => {
                info!("Realtime channel connected");
                self.state = ChannelState::Connected;
                self.error_reported = false;
                None
            }
            InboundEvent::ConnectError(reason) => {
                error!("Realtime channel connect error: {}", reason);
                self.state = ChannelState::Error;
                if self.error_reported {
                    None
                } else {
                    self.error_reported = true;
                    Some(format!("Failed to connect to chat server: {}", reason))
                }
            }
            InboundEvent::Disconnected(reason) => {
                warn!("Realtime channel lost ({}), reconnecting", reason);
                self.state = ChannelState::Connecting;
                None
            }
            InboundEvent::AuthRejected(reason) => {
                error!("Realtime channel rejected our credential: {}", reason);
                self.state = ChannelState::Error;
                None
            }
            _ => None,
        }
    }

    pub fn emit(&self, event: OutboundEvent) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        match &self.handle {
            Some(handle) => handle.emit(event),
            None => Err(SyncError::NotConnected),
        }
    }

    /// Next inbound event. Returns None once when the driver stops for good;
    /// after that (and while no channel is open) it never resolves.
    pub async fn next_event(&mut self) -> Option<InboundEvent> {
        match self.handle.as_mut() {
            Some(handle) => match handle.recv().await {
                Some(event) => Some(event),
                None => {
                    debug!("Channel driver stopped");
                    self.handle = None;
                    self.state = ChannelState::Error;
                    None
                }
            },
            None => std::future::pending().await,
        }
    }
}
