//! Canonical wire message types.
//!
//! Every message is a JSON object with a `type` tag and a `payload`, carried
//! in a single WebSocket text frame. Structural validation is the serde
//! deserialization itself: anything that fails to parse as a
//! [`ClientMessage`] is answered with an `INVALID_MESSAGE` error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::state::GameState;

/// Controller → host messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Join (or rejoin) the session under a client-held secret.
    #[serde(rename = "JOIN")]
    Join(JoinPayload),

    /// A game action for the reducer.
    #[serde(rename = "ACTION")]
    Action(ActionPayload),

    /// Time-sync probe; answered directly, never touches state.
    #[serde(rename = "PING")]
    Ping(PingPayload),

    /// Controller finished preloading its assets. The payload must be
    /// literally `true`.
    #[serde(rename = "ASSETS_LOADED")]
    AssetsLoaded(bool),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinPayload {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingPayload {
    pub id: String,
    pub timestamp: f64,
}

/// Host → controller messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    /// First message after a JOIN: the caller's player ID and a snapshot
    /// that already contains them.
    #[serde(rename = "WELCOME")]
    Welcome {
        #[serde(rename = "playerId")]
        player_id: String,
        state: GameState,
        #[serde(rename = "serverTime")]
        server_time: i64,
    },

    /// Authoritative snapshot broadcast. `action` echoes the last dispatched
    /// action when there was one.
    #[serde(rename = "STATE_UPDATE")]
    StateUpdate {
        #[serde(rename = "newState")]
        new_state: GameState,
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<Value>,
    },

    /// Time-sync reply carrying the probe id, its original timestamp, and
    /// the host clock.
    #[serde(rename = "PONG")]
    Pong {
        id: String,
        #[serde(rename = "origTimestamp")]
        orig_timestamp: f64,
        #[serde(rename = "serverTime")]
        server_time: i64,
    },

    #[serde(rename = "ERROR")]
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidSecret,
    ForbiddenAction,
}

impl ServerMessage {
    /// Error reply with the canonical message text for the code.
    pub fn error(code: ErrorCode) -> Self {
        let message = match code {
            ErrorCode::InvalidMessage => "Malformed message",
            ErrorCode::InvalidSecret => "Invalid session secret",
            ErrorCode::ForbiddenAction => "Reserved action type",
        };
        Self::Error {
            code,
            message: message.to_string(),
        }
    }
}
