use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use jetstream_model::fragment::SyncFragment;

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Structured error carried by a rejecting reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i64,
    pub message: String,
}

/// The closed set of protocol messages. Every message carries `type` and
/// `index`; replies carry `replyTo` naming the originating index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Handshake request.
    SessionCreate { index: u64, version: String },

    /// Handshake reply.
    SessionCreateResponse {
        #[serde(default)]
        index: u64,
        #[serde(rename = "replyTo")]
        reply_to: u64,
        success: bool,
        #[serde(
            rename = "sessionToken",
            skip_serializing_if = "Option::is_none",
            default
        )]
        session_token: Option<String>,
    },

    /// Attach request for a named scope.
    ScopeFetch {
        index: u64,
        name: String,
        #[serde(default)]
        params: JsonValue,
    },

    /// Generic reply; for a scope fetch it carries `scopeIndex` on success
    /// or `error` on rejection.
    Reply {
        #[serde(default)]
        index: u64,
        #[serde(rename = "replyTo")]
        reply_to: u64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        result: Option<bool>,
        #[serde(
            rename = "scopeIndex",
            skip_serializing_if = "Option::is_none",
            default
        )]
        scope_index: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorPayload>,
    },

    /// Full state dump for an attached scope.
    ScopeState {
        index: u64,
        #[serde(rename = "scopeIndex")]
        scope_index: u64,
        #[serde(rename = "rootFragment")]
        root_fragment: SyncFragment,
        #[serde(rename = "syncFragments", default)]
        sync_fragments: Vec<SyncFragment>,
    },

    /// Incremental fragment batch for an attached scope.
    ScopeSync {
        index: u64,
        #[serde(rename = "scopeIndex")]
        scope_index: u64,
        #[serde(rename = "syncFragments", default)]
        sync_fragments: Vec<SyncFragment>,
    },

    /// Keep-alive and acknowledgement high-water mark.
    Ping {
        index: u64,
        ack: u64,
        #[serde(
            rename = "resendMissing",
            skip_serializing_if = "Option::is_none",
            default
        )]
        resend_missing: Option<bool>,
    },
}

impl Message {
    pub fn index(&self) -> u64 {
        match self {
            Message::SessionCreate { index, .. }
            | Message::SessionCreateResponse { index, .. }
            | Message::ScopeFetch { index, .. }
            | Message::Reply { index, .. }
            | Message::ScopeState { index, .. }
            | Message::ScopeSync { index, .. }
            | Message::Ping { index, .. } => *index,
        }
    }

    /// The index this message replies to, if it is a reply shape.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            Message::SessionCreateResponse { reply_to, .. } | Message::Reply { reply_to, .. } => {
                Some(*reply_to)
            }
            _ => None,
        }
    }

    pub fn is_ping(&self) -> bool {
        matches!(self, Message::Ping { .. })
    }

    /// Decodes one transport frame: a single JSON object or an array of
    /// objects treated as a batch. Malformed elements and unknown types are
    /// dropped with a warning; the connection survives.
    pub fn decode_batch(raw: &str) -> Vec<Message> {
        let value: JsonValue = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!("Dropping unparseable frame: {}", e);
                return Vec::new();
            }
        };
        let elements = match value {
            JsonValue::Array(items) => items,
            other => vec![other],
        };
        let mut messages = Vec::with_capacity(elements.len());
        for element in elements {
            match serde_json::from_value::<Message>(element) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Dropping undecodable message: {}", e),
            }
        }
        messages
    }
}
