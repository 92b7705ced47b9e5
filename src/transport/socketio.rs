// Socket.IO v5 / Engine.IO v4 text packet codec
// Only the subset used over the WebSocket transport on the default namespace: no binary attachments

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Engine.IO handshake data carried by the open packet
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenInfo {
    pub sid: String,
    #[serde(rename = "pingInterval", default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(rename = "pingTimeout", default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // Engine.IO level
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Noop,
    // Socket.IO level
    Connect(Value),
    Disconnect,
    Event { name: String, payload: Value },
    Ack { id: u64 },
    ConnectError(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownType(char),
    #[error("binary packets are not supported")]
    Binary,
    #[error("event without a name")]
    MissingEventName,
    #[error("invalid packet json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame answering a server ping
pub const PONG: &str = "3";

pub fn decode(frame: &str) -> Result<Packet, CodecError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket(rest),
        '6' => Ok(Packet::Noop),
        other => Err(CodecError::UnknownType(other)),
    }
}

fn decode_socket(body: &str) -> Result<Packet, CodecError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let rest = strip_namespace(chars.as_str());
    // Optional ack id between the type and the data
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    let (ack_id, data) = rest.split_at(digits);
    match kind {
        '0' => {
            let value = if data.is_empty() { Value::Null } else { serde_json::from_str(data)? };
            Ok(Packet::Connect(value))
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let args: Vec<Value> = serde_json::from_str(data)?;
            let mut args = args.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                _ => return Err(CodecError::MissingEventName),
            };
            let payload = args.next().unwrap_or(Value::Null);
            Ok(Packet::Event { name, payload })
        }
        '3' => Ok(Packet::Ack { id: ack_id.parse().unwrap_or(0) }),
        '4' => {
            let value: Value = if data.is_empty() { Value::Null } else { serde_json::from_str(data)? };
            let message = match &value {
                Value::String(s) => s.clone(),
                other => other
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("connection refused")
                    .to_string(),
            };
            Ok(Packet::ConnectError(message))
        }
        '5' | '6' => Err(CodecError::Binary),
        other => Err(CodecError::UnknownType(other)),
    }
}

// "/chat,..." carries an explicit namespace; the default one is implicit
fn strip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    } else {
        rest
    }
}

/// Socket.IO CONNECT carrying the bearer token as auth payload
pub fn encode_connect(token: &str) -> String {
    format!("40{}", json!({ "token": token }))
}

pub fn encode_event(name: &str, payload: &Value) -> String {
    format!("42{}", json!([name, payload]))
}

pub fn encode_disconnect() -> String {
    "41".to_string()
}
