// Sync session: the composition root of the engine
// Owns one identity and every component's state; a single dispatch loop applies
// commands, channel events, REST results and timers one step at a time

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub mod catalog;
pub mod connection;
pub mod messages;
pub mod presence;
pub mod typing;
pub mod unread;

pub use catalog::{valid_peers, ConversationCatalog};
pub use connection::{ChannelState, ConnectionManager};
pub use messages::{AckOutcome, MessageReconciler, ReceiveOutcome, SendRejection};
pub use presence::{last_seen_label, PresenceOutcome, PresenceTracker};
pub use typing::TypingSignal;
pub use unread::UnreadLedger;

use crate::api::{ApiError, RestApi};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Identity, Message, MessageRecord, Peer, UserStatus};
use crate::timeline::{group_by_day, DayGroup};
use crate::transport::{Connector, InboundEvent, OutboundEvent, SendFailure};

/// User-visible notifications
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    NetworkFailure(String),
    ChannelError(String),
    SendFailure(String),
    /// The session is over; the front end should return to login
    AuthExpired(String),
}

/// Mutation entry points available to a front end
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenConversation(String),
    /// The compose buffer changed (a keystroke)
    Compose(String),
    /// Send the compose buffer
    Submit,
    Retry(String),
    ToggleStatus,
    RefreshCatalog,
    RefreshUnread,
    Logout,
}

/// Read-only snapshot of the session for presentation
#[derive(Debug, Clone)]
pub struct SessionView {
    pub identity: Option<Identity>,
    pub channel: ChannelState,
    pub users: Vec<Peer>,
    pub conversations: Vec<Peer>,
    pub active_peer: Option<Peer>,
    pub history: Vec<Message>,
    pub loading_history: bool,
    pub unread: HashMap<String, u32>,
    pub total_unread: u32,
    pub peer_typing: bool,
    pub sending: bool,
    pub updating_status: bool,
    pub compose: String,
    /// Set once the session has been torn down
    pub ended: bool,
}

impl Default for SessionView {
    fn default() -> Self {
        SessionView {
            identity: None,
            channel: ChannelState::Disconnected,
            users: Vec::new(),
            conversations: Vec::new(),
            active_peer: None,
            history: Vec::new(),
            loading_history: false,
            unread: HashMap::new(),
            total_unread: 0,
            peer_typing: false,
            sending: false,
            updating_status: false,
            compose: String::new(),
            ended: false,
        }
    }
}

impl SessionView {
    pub fn unread_for(&self, peer_id: &str) -> u32 {
        self.unread.get(peer_id).copied().unwrap_or(0)
    }

    /// History partitioned by day, in the local time zone
    pub fn days(&self) -> Vec<DayGroup<'_>> {
        group_by_day(&self.history, &chrono::Local::now())
    }
}

// Completed REST calls, applied as ordinary dispatch steps
enum RestOutcome {
    Users(Result<Vec<Value>, ApiError>),
    Conversations(Result<Vec<Value>, ApiError>),
    History {
        generation: u64,
        peer_id: String,
        result: Result<Vec<MessageRecord>, ApiError>,
    },
    Unread(Result<(u32, HashMap<String, u32>), ApiError>),
    MarkRead {
        peer_id: String,
        message_id: String,
        result: Result<(), ApiError>,
    },
    Status {
        status: UserStatus,
        result: Result<(), ApiError>,
    },
}

pub struct SyncSession {
    api: Arc<dyn RestApi>,
    identity: Option<Identity>,
    connection: ConnectionManager,
    catalog: ConversationCatalog,
    presence: PresenceTracker,
    unread: UnreadLedger,
    messages: MessageReconciler,
    typing: TypingSignal,
    compose: String,
    updating_status: bool,
    pending: FuturesUnordered<BoxFuture<'static, RestOutcome>>,
    view_tx: watch::Sender<SessionView>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    torn_down: bool,
    end_reason: Option<SyncError>,
}

impl SyncSession {
    /// Confirm the token, then open the channel and request the initial snapshots.
    ///
    /// A missing token or a failed identity fetch ends here with AuthExpired.
    pub async fn start(
        config: SyncConfig,
        api: Arc<dyn RestApi>,
        connector: Arc<dyn Connector>,
        token: Option<String>,
    ) -> SyncResult<(Self, mpsc::UnboundedReceiver<Notice>)> {
        let token = match token {
            Some(token) if !token.trim().is_empty() => token,
            _ => return Err(SyncError::AuthExpired("please login first".to_string())),
        };

        let identity = api.fetch_identity().await.map_err(|e| {
            error!("Error fetching user: {}", e);
            SyncError::AuthExpired(format!("session expired, please login again ({})", e))
        })?;
        info!("Signed in as {} ({})", identity.name, identity.id);

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (view_tx, _) = watch::channel(SessionView::default());
        let mut session = SyncSession {
            api,
            identity: Some(identity),
            connection: ConnectionManager::new(connector),
            catalog: ConversationCatalog::new(),
            presence: PresenceTracker::new(),
            unread: UnreadLedger::new(),
            messages: MessageReconciler::new(),
            typing: TypingSignal::new(config.typing_debounce, config.typing_expiry),
            compose: String::new(),
            updating_status: false,
            pending: FuturesUnordered::new(),
            view_tx,
            notice_tx,
            torn_down: false,
            end_reason: None,
        };

        session.connection.open(&token);
        session.refresh_catalog();
        session.refresh_unread();
        session.publish();
        Ok((session, notice_rx))
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> SessionView {
        let now = Instant::now();
        SessionView {
            identity: self.identity.clone(),
            channel: self.connection.state(),
            users: self.catalog.users().to_vec(),
            conversations: self.catalog.conversations().to_vec(),
            active_peer: self.messages.active().cloned(),
            history: self.messages.history().to_vec(),
            loading_history: self.messages.is_loading(),
            unread: self.unread.counts().clone(),
            total_unread: self.unread.total(),
            peer_typing: self.typing.is_peer_typing(now),
            sending: self.messages.is_sending(),
            updating_status: self.updating_status,
            compose: self.compose.clone(),
            ended: self.torn_down,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.torn_down
    }

    /// Drive the session until logout, auth failure or the command sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> SyncResult<()> {
        while !self.torn_down {
            let deadline = self.typing.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Command channel closed, logging out");
                        self.logout();
                    }
                },
                event = self.connection.next_event() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        self.notify(Notice::ChannelError("connection to chat server lost".to_string()));
                        self.publish();
                    }
                },
                Some(outcome) = self.pending.next(), if !self.pending.is_empty() => {
                    self.handle_outcome(outcome);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_timers(Instant::now());
                }
            }
        }
        match self.end_reason.take() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Await every outstanding REST call and apply the results
    pub async fn settle(&mut self) {
        while let Some(outcome) = self.pending.next().await {
            self.handle_outcome(outcome);
        }
    }

    pub fn handle_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::OpenConversation(peer_id) => {
                if let Err(e) = self.open_conversation_by_id(&peer_id) {
                    warn!("Cannot open conversation {}: {}", peer_id, e);
                }
            }
            Command::Compose(text) => self.set_compose(text),
            Command::Submit => {
                let _ = self.submit();
            }
            Command::Retry(client_id) => {
                if let Err(rejection) = self.retry(&client_id) {
                    warn!("Cannot retry {}: {:?}", client_id, rejection);
                }
            }
            Command::ToggleStatus => self.toggle_status(),
            Command::RefreshCatalog => self.refresh_catalog(),
            Command::RefreshUnread => self.refresh_unread(),
            Command::Logout => self.logout(),
        }
    }

    pub fn open_conversation_by_id(&mut self, peer_id: &str) -> SyncResult<()> {
        let peer = self
            .catalog
            .get(peer_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))?;
        self.open_conversation(peer);
        Ok(())
    }

    /// Make `peer` the open conversation and fetch its history
    pub fn open_conversation(&mut self, peer: Peer) {
        if self.torn_down {
            return;
        }
        self.typing.reset();
        let peer_id = peer.id.clone();
        let generation = self.messages.open(peer);
        let api = self.api.clone();
        self.call(async move {
            let result = api.fetch_history(&peer_id).await;
            RestOutcome::History { generation, peer_id, result }
        });
        self.publish();
    }

    /// The compose buffer changed
    pub fn set_compose(&mut self, text: impl Into<String>) {
        if self.torn_down {
            return;
        }
        self.compose = text.into();
        if self.messages.active().is_some() {
            self.typing.keystroke(Instant::now());
        }
        self.publish();
    }

    /// Send the compose buffer; it is cleared only when the send is accepted
    pub fn submit(&mut self) -> Result<(), SendRejection> {
        let content = self.compose.clone();
        self.send_text(&content)?;
        self.compose.clear();
        self.publish();
        Ok(())
    }

    /// Optimistic send. Rejections leave every piece of state untouched.
    pub fn send_text(&mut self, content: &str) -> Result<(), SendRejection> {
        if self.torn_down {
            return Err(SendRejection::NotConnected);
        }
        let sender_id = match &self.identity {
            Some(me) => me.id.clone(),
            None => return Err(SendRejection::NotConnected),
        };
        let connected = self.connection.is_connected();
        let event = self
            .messages
            .begin_send(content, &sender_id, connected, Utc::now())
            .map_err(|rejection| {
                debug!("Send rejected: {:?}", rejection);
                rejection
            })?;
        self.emit_send(event);
        self.publish();
        Ok(())
    }

    /// Resend a message in the error state
    pub fn retry(&mut self, client_id: &str) -> Result<(), SendRejection> {
        if self.torn_down {
            return Err(SendRejection::NotConnected);
        }
        let event = self.messages.retry(client_id, self.connection.is_connected())?;
        self.emit_send(event);
        self.publish();
        Ok(())
    }

    fn emit_send(&mut self, event: OutboundEvent) {
        let client_id = match &event {
            OutboundEvent::SendMessage { client_id, .. } => Some(client_id.clone()),
            _ => None,
        };
        if let Err(e) = self.connection.emit(event) {
            // The driver is gone; fail the entry right away instead of waiting forever
            error!("Failed to emit message: {}", e);
            self.messages.fail(&SendFailure { client_id, reason: e.to_string() });
            self.notify(Notice::SendFailure("Failed to send message. Please try again.".to_string()));
        }
    }

    /// Punch in/out. Ignored while a previous toggle is still in flight.
    pub fn toggle_status(&mut self) {
        if self.updating_status || self.torn_down {
            return;
        }
        let status = match &self.identity {
            Some(me) => me.status.toggled(),
            None => return,
        };
        self.updating_status = true;
        let api = self.api.clone();
        self.call(async move {
            let result = api.set_status(status).await;
            RestOutcome::Status { status, result }
        });
        self.publish();
    }

    pub fn refresh_catalog(&mut self) {
        self.refresh_users();
        self.refresh_conversations();
    }

    fn refresh_users(&mut self) {
        let api = self.api.clone();
        self.call(async move { RestOutcome::Users(api.fetch_users().await) });
    }

    fn refresh_conversations(&mut self) {
        let api = self.api.clone();
        self.call(async move { RestOutcome::Conversations(api.fetch_conversations().await) });
    }

    pub fn refresh_unread(&mut self) {
        let api = self.api.clone();
        self.call(async move {
            let result = async {
                let total = api.fetch_unread_total().await?;
                let by_sender = api.fetch_unread_by_sender().await?;
                Ok::<_, ApiError>((total, by_sender))
            }
            .await;
            RestOutcome::Unread(result)
        });
    }

    fn mark_read(&mut self, peer_id: String, message_id: String) {
        let api = self.api.clone();
        self.call(async move {
            let result = api.mark_read(&message_id).await;
            RestOutcome::MarkRead { peer_id, message_id, result }
        });
    }

    /// End the session at the user's request
    pub fn logout(&mut self) {
        info!("Logging out");
        self.teardown();
    }

    /// Apply one inbound channel event
    pub fn handle_event(&mut self, event: InboundEvent) {
        if self.torn_down {
            debug!("Ignoring event after teardown: {:?}", event);
            return;
        }
        if event.is_lifecycle() {
            if let Some(message) = self.connection.on_lifecycle(&event) {
                self.notify(Notice::ChannelError(message));
            }
            if let InboundEvent::AuthRejected(reason) = event {
                self.auth_expired(reason);
                return;
            }
            self.publish();
            return;
        }

        match event {
            InboundEvent::MessageReceived(record) => {
                let sender = record.sender.clone();
                let message_id = record.id.clone();
                match self.messages.receive(record) {
                    ReceiveOutcome::Appended => {
                        // A message ends the peer's typing burst
                        self.typing.clear_remote();
                        self.mark_read(sender, message_id);
                    }
                    ReceiveOutcome::Duplicate => {}
                    ReceiveOutcome::NotOpen => {
                        self.unread.increment(&sender, &message_id);
                    }
                }
                // A first message may add a new conversation
                self.refresh_conversations();
            }
            InboundEvent::MessageSent(record) => {
                let me = self.identity.as_ref().map(|me| me.id.clone()).unwrap_or_default();
                let outcome = self.messages.acknowledge(record, &me);
                debug!("Acknowledgement outcome: {:?}", outcome);
            }
            InboundEvent::MessageError(failure) => {
                error!("Message error: {}", failure.reason);
                self.messages.fail(&failure);
                self.notify(Notice::SendFailure("Failed to send message. Please try again.".to_string()));
            }
            InboundEvent::UserStatusChanged(change) => {
                self.presence.apply(
                    &change,
                    Utc::now(),
                    &mut self.catalog,
                    self.messages.active_mut(),
                    self.identity.as_mut(),
                );
            }
            InboundEvent::UserTyping(notice) => {
                if self.messages.is_open(&notice.user_id) {
                    self.typing.remote_typing(Instant::now());
                }
            }
            _ => {}
        }
        self.publish();
    }

    fn handle_outcome(&mut self, outcome: RestOutcome) {
        if self.torn_down {
            return;
        }
        match outcome {
            RestOutcome::Users(Ok(records)) => {
                self.catalog.replace_users(valid_peers(records), &self.presence);
                self.sync_active_peer();
            }
            RestOutcome::Users(Err(e)) => self.network_failure("Failed to load users.", e),
            RestOutcome::Conversations(Ok(records)) => {
                self.catalog.replace_conversations(valid_peers(records), &self.presence);
                self.sync_active_peer();
            }
            RestOutcome::Conversations(Err(e)) => self.network_failure("Failed to load conversations.", e),
            RestOutcome::History { generation, peer_id, result } => match result {
                Ok(records) => {
                    debug!("Fetched {} messages with {}", records.len(), peer_id);
                    if self.messages.apply_history(generation, records) {
                        self.refresh_unread();
                    }
                }
                Err(e) => {
                    self.messages.history_failed(generation);
                    self.network_failure("Failed to load messages.", e);
                }
            },
            RestOutcome::Unread(Ok((total, by_sender))) => self.unread.replace(total, by_sender),
            RestOutcome::Unread(Err(e)) => self.network_failure("Failed to load unread counts.", e),
            RestOutcome::MarkRead { peer_id, message_id, result } => match result {
                Ok(()) => {
                    self.unread.decrement(&peer_id);
                }
                Err(e) => {
                    warn!("Error marking message {} as read: {}", message_id, e);
                    self.network_failure("Failed to mark message as read.", e);
                }
            },
            RestOutcome::Status { status, result } => {
                self.updating_status = false;
                match result {
                    Ok(()) => {
                        // The stamp stays the server's; its echo or the users refresh supplies one
                        if let Some(me) = self.identity.as_mut() {
                            info!("Status updated to {:?}", status);
                            me.status = status;
                            self.catalog.apply_presence(&me.id, status, me.status_updated_at);
                        }
                        self.refresh_users();
                    }
                    Err(e) => self.network_failure("Failed to update status.", e),
                }
            }
        }
        self.publish();
    }

    /// Poll typing deadlines
    pub fn fire_timers(&mut self, now: Instant) {
        if self.torn_down {
            return;
        }
        if self.typing.take_due_emission(now) {
            if let Some(receiver_id) = self.messages.active_id().map(str::to_string) {
                if self.connection.is_connected() {
                    if let Err(e) = self.connection.emit(OutboundEvent::Typing { receiver_id }) {
                        debug!("Dropping typing notification: {}", e);
                    }
                }
            }
        }
        if self.typing.expire(now) {
            debug!("Peer typing indicator expired");
        }
        self.publish();
    }

    /// Earliest pending timer, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.typing.next_deadline()
    }

    // The open peer is a copy; keep it in step with newer catalog data
    fn sync_active_peer(&mut self) {
        if let Some(active) = self.messages.active_mut() {
            if let Some(fresh) = self.catalog.get(&active.id) {
                if fresh.status_updated_at > active.status_updated_at {
                    active.set_presence(fresh.status, fresh.status_updated_at);
                }
            }
        }
    }

    fn call<F>(&mut self, future: F)
    where
        F: Future<Output = RestOutcome> + Send + 'static,
    {
        if self.torn_down {
            return;
        }
        self.pending.push(Box::pin(future));
    }

    fn network_failure(&mut self, message: &str, error: ApiError) {
        if error.is_unauthorized() {
            // The credential is gone; nothing else will succeed either
            self.auth_expired(format!("{} ({})", message, error));
            return;
        }
        error!("{} ({})", message, error);
        self.notify(Notice::NetworkFailure(message.to_string()));
    }

    fn auth_expired(&mut self, reason: String) {
        error!("Authentication lost: {}", reason);
        self.notify(Notice::AuthExpired(reason.clone()));
        self.end_reason = Some(SyncError::AuthExpired(reason));
        self.teardown();
    }

    fn notify(&self, notice: Notice) {
        if self.notice_tx.send(notice).is_err() {
            debug!("No one is listening for notices");
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.connection.close();
        self.typing.reset();
        self.messages.abandon_in_flight();
        // Dropping the futures cancels the calls; their results never land
        self.pending = FuturesUnordered::new();
        self.messages.reset();
        self.catalog.clear();
        self.presence.clear();
        self.unread.clear();
        self.identity = None;
        self.compose.clear();
        self.updating_status = false;
        self.publish();
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view());
    }
}
