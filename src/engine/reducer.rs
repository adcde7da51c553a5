//! Reducer wrapper.
//!
//! The engine composes the user-supplied reduction function with built-in
//! handling of session lifecycle events, so the player table stays correct
//! without the game reducer knowing about joins and disconnects. On the
//! wire these events are the reserved `__…__` action names; internally they
//! are a typed enum and the string form is only ever checked at the
//! boundary.

use serde::Serialize;
use serde_json::Value;

use crate::engine::state::{GameState, Player};
use crate::session::identity::PlayerId;

/// Prefix reserved for framework-injected action types. Wire actions using
/// it are rejected with `FORBIDDEN_ACTION`.
pub const RESERVED_PREFIX: &str = "__";

/// Whether a wire-level action type is reserved for the framework.
pub fn is_reserved(kind: &str) -> bool {
    kind.starts_with(RESERVED_PREFIX)
}

/// A game action as seen by the user reducer.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(rename = "playerId", skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
}

impl Action {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            player_id: None,
        }
    }
}

/// User-supplied reduction function.
pub type Reducer = dyn Fn(GameState, &Action) -> GameState + Send;

/// Everything the engine can feed through the wrapped reducer: the session
/// lifecycle plus ordinary user actions.
#[derive(Debug, Clone)]
pub enum EngineAction {
    /// Replace the state wholesale.
    Hydrate(GameState),
    PlayerJoined {
        id: PlayerId,
        name: String,
        avatar: Option<String>,
    },
    PlayerLeft {
        id: PlayerId,
    },
    PlayerReconnected {
        id: PlayerId,
    },
    PlayerRemoved {
        id: PlayerId,
    },
    User(Action),
}

/// The wrapped reducer. Lifecycle events edit the player table; anything
/// else is delegated to the user reducer. Pure: no I/O, no clocks.
pub fn apply(user: &Reducer, state: GameState, action: &EngineAction) -> GameState {
    match action {
        EngineAction::Hydrate(next) => next.clone(),
        EngineAction::PlayerJoined { id, name, avatar } => {
            let mut state = state;
            state.players.insert(
                id.clone(),
                Player::joining(id.clone(), name.clone(), avatar.clone()),
            );
            state
        }
        EngineAction::PlayerLeft { id } => {
            let mut state = state;
            if let Some(player) = state.players.get_mut(id) {
                player.connected = false;
            }
            state
        }
        EngineAction::PlayerReconnected { id } => {
            let mut state = state;
            if let Some(player) = state.players.get_mut(id) {
                player.connected = true;
            }
            state
        }
        EngineAction::PlayerRemoved { id } => {
            let mut state = state;
            state.players.remove(id);
            state
        }
        EngineAction::User(action) => user(state, action),
    }
}
