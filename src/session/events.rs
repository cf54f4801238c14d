use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::base64_bytes;

/// Kind of a recorded session event. Serialized as the `type` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    #[default]
    SessionStart,
    SessionStop,
    NewRequest,
    NewChannel,
    WindowResize,
    NewMessage,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SessionStart => "session-start",
            EventType::SessionStop => "session-stop",
            EventType::NewRequest => "new-request",
            EventType::NewChannel => "new-channel",
            EventType::WindowResize => "window-resize",
            EventType::NewMessage => "new-message",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a data chunk. `Incoming` flows upstream → client,
/// `Outgoing` flows client → upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// Which stream of a channel carried a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// One observable thing that happened in a session.
///
/// Every field except `type` is left out of the JSON when it is zero or
/// empty, so each event only carries what is relevant to its kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub start: i64,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub stop: i64,
    /// Seconds.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub length: i64,
    /// Milliseconds since the session started.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub size: usize,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub term_rows: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub term_cols: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_type: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub channel_data: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_type: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub request_payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub channel_id: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub request_id: u32,
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

impl SessionEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            ..Default::default()
        }
    }

    pub fn new_channel(channel_type: &str, extra_data: &[u8], channel_id: u32) -> Self {
        Self {
            channel_type: channel_type.to_string(),
            channel_data: extra_data.to_vec(),
            channel_id,
            ..Self::new(EventType::NewChannel)
        }
    }

    /// `channel_id` 0 marks a connection-level request.
    pub fn new_request(request_type: &str, payload: &[u8], channel_id: u32, request_id: u32) -> Self {
        Self {
            request_type: request_type.to_string(),
            request_payload: payload.to_vec(),
            channel_id,
            request_id,
            ..Self::new(EventType::NewRequest)
        }
    }

    pub fn window_resize(rows: u32, cols: u32) -> Self {
        Self {
            term_rows: rows,
            term_cols: cols,
            ..Self::new(EventType::WindowResize)
        }
    }

    pub fn message(direction: Direction, stream: Stream, channel_id: u32, data: Vec<u8>) -> Self {
        Self {
            direction: Some(direction),
            channel_type: stream.as_str().to_string(),
            channel_id,
            size: data.len(),
            data,
            ..Self::new(EventType::NewMessage)
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One line of the proxy-wide session index (`.session_list`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub start: i64,
    pub stop: i64,
    pub length: i64,
    pub client_host: String,
    pub server_host: String,
    pub username: String,
    pub password: String,
    pub term_rows: u32,
    pub term_cols: u32,
    pub filename: String,
    pub requests: Vec<String>,
}
