// Common test utilities for integration tests
// A scripted REST fake and an in-memory channel connector stand in for the server
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::LevelFilter;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use tokio::sync::mpsc;

use teamsync::transport::{ChannelHandle, Connector, InboundEvent, OutboundEvent};
use teamsync::{ApiError, Identity, MessageRecord, Notice, RestApi, SyncConfig, SyncSession, UserStatus};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub const ME: &str = "u1";
pub const BEA: &str = "u2";
pub const CY: &str = "u3";

/// Fixed instant offset by `secs`
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn identity() -> Identity {
    Identity {
        id: ME.to_string(),
        name: "Ana".to_string(),
        email: "ana@example.com".to_string(),
        status: UserStatus::Offline,
        status_updated_at: Some(at(0)),
        created_at: None,
    }
}

pub fn peer_json(id: &str, name: &str, status: &str, stamp: DateTime<Utc>) -> Value {
    json!({ "_id": id, "name": name, "status": status, "statusUpdatedAt": stamp })
}

pub fn record(id: &str, sender: &str, receiver: &str, content: &str, timestamp: DateTime<Utc>) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        sender: sender.to_string(),
        receiver: receiver.to_string(),
        content: content.to_string(),
        timestamp: Some(timestamp),
        created_at: None,
        client_id: None,
    }
}

/// Everything the fake server will answer with
pub struct FakeState {
    pub identity: Option<Identity>,
    pub users: Vec<Value>,
    pub conversations: Vec<Value>,
    pub histories: HashMap<String, Vec<MessageRecord>>,
    pub unread_total: u32,
    pub unread_by_sender: HashMap<String, u32>,
    pub fail_users: bool,
    pub fail_mark_read: bool,
    /// The token stops being accepted for the users endpoint
    pub revoked: bool,
    pub calls: Vec<String>,
}

impl Default for FakeState {
    fn default() -> Self {
        FakeState {
            identity: Some(identity()),
            users: vec![
                peer_json(BEA, "Bea", "online", at(10)),
                peer_json(CY, "Cy", "offline", at(10)),
            ],
            conversations: vec![peer_json(BEA, "Bea", "online", at(10))],
            histories: HashMap::new(),
            unread_total: 0,
            unread_by_sender: HashMap::new(),
            fail_users: false,
            fail_mark_read: false,
            revoked: false,
            calls: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeApi::default())
    }

    pub fn edit(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn record_call(&self, call: impl Into<String>) -> std::sync::MutexGuard<'_, FakeState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.into());
        state
    }
}

fn server_error() -> ApiError {
    ApiError::UnexpectedStatus {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: "boom".to_string(),
    }
}

#[async_trait]
impl RestApi for FakeApi {
    async fn fetch_identity(&self) -> Result<Identity, ApiError> {
        let state = self.record_call("identity");
        state
            .identity
            .clone()
            .ok_or(ApiError::Unauthorized(StatusCode::UNAUTHORIZED))
    }

    async fn fetch_users(&self) -> Result<Vec<Value>, ApiError> {
        let state = self.record_call("users");
        if state.revoked {
            return Err(ApiError::Unauthorized(StatusCode::UNAUTHORIZED));
        }
        if state.fail_users {
            return Err(server_error());
        }
        Ok(state.users.clone())
    }

    async fn fetch_conversations(&self) -> Result<Vec<Value>, ApiError> {
        let state = self.record_call("conversations");
        Ok(state.conversations.clone())
    }

    async fn fetch_history(&self, peer_id: &str) -> Result<Vec<MessageRecord>, ApiError> {
        let state = self.record_call(format!("history:{}", peer_id));
        Ok(state.histories.get(peer_id).cloned().unwrap_or_default())
    }

    async fn fetch_unread_total(&self) -> Result<u32, ApiError> {
        let state = self.record_call("unread_total");
        Ok(state.unread_total)
    }

    async fn fetch_unread_by_sender(&self) -> Result<HashMap<String, u32>, ApiError> {
        let state = self.record_call("unread_by_sender");
        Ok(state.unread_by_sender.clone())
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ApiError> {
        let state = self.record_call(format!("read:{}", message_id));
        if state.fail_mark_read {
            return Err(server_error());
        }
        Ok(())
    }

    async fn set_status(&self, status: UserStatus) -> Result<(), ApiError> {
        let _state = self.record_call(format!("status:{}", status.as_str()));
        Ok(())
    }
}

/// Test side of one opened channel
pub struct FakeChannel {
    pub inbound: mpsc::UnboundedSender<InboundEvent>,
    pub outbound: mpsc::UnboundedReceiver<OutboundEvent>,
}

impl FakeChannel {
    /// Everything the session emitted so far
    pub fn sent(&mut self) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outbound.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Default)]
pub struct FakeConnector {
    channels: Mutex<Vec<FakeChannel>>,
    tokens: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeConnector::default())
    }

    pub fn opened(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn take_channel(&self) -> FakeChannel {
        self.channels.lock().unwrap().pop().expect("no channel was opened")
    }
}

impl Connector for FakeConnector {
    fn open(&self, token: &str) -> ChannelHandle {
        self.tokens.lock().unwrap().push(token.to_string());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.channels.lock().unwrap().push(FakeChannel { inbound: in_tx, outbound: out_rx });
        ChannelHandle::new(out_tx, in_rx, None)
    }
}

/// A started, connected session with its initial snapshots applied
pub async fn connected_session(
    api: Arc<FakeApi>,
) -> (SyncSession, mpsc::UnboundedReceiver<Notice>, FakeChannel) {
    setup_logging();
    let connector = FakeConnector::new();
    let (mut session, notices) = SyncSession::start(
        SyncConfig::new("http://localhost:5000"),
        api,
        connector.clone(),
        Some("token".to_string()),
    )
    .await
    .expect("session should start");
    let channel = connector.take_channel();
    session.handle_event(InboundEvent::Connected);
    session.settle().await;
    (session, notices, channel)
}

pub fn drain_notices(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut drained = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        drained.push(notice);
    }
    drained
}
