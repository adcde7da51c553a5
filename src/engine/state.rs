//! Authoritative game state data model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::identity::PlayerId;

/// The state object owned by the engine.
///
/// `status` and `players` are the reserved fields the engine reads and
/// writes; everything else belongs to the game and rides along untouched in
/// the flattened map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    pub status: String,
    #[serde(default)]
    pub players: HashMap<PlayerId, Player>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GameState {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            players: HashMap::new(),
            extra: Map::new(),
        }
    }
}

/// One entry in the `players` table, keyed by player ID.
///
/// Reducer-added per-player fields land in the flattened map, which is what
/// lets them survive a disconnect/reconnect cycle byte for byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub is_host: bool,
    pub connected: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Player {
    /// A freshly joined controller. Controllers are never the host.
    pub fn joining(id: impl Into<PlayerId>, name: impl Into<String>, avatar: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar,
            is_host: false,
            connected: true,
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn player_serializes_camel_case() {
        let value = serde_json::to_value(Player::joining("p1", "Ada", None)).unwrap();
        assert_eq!(
            value,
            json!({"id": "p1", "name": "Ada", "isHost": false, "connected": true})
        );
    }

    #[test]
    fn avatar_appears_when_present() {
        let player = Player::joining("p1", "Ada", Some("owl".to_string()));
        let value = serde_json::to_value(player).unwrap();
        assert_eq!(value["avatar"], "owl");
    }

    #[test]
    fn game_fields_ride_through_state_round_trip() {
        let raw = json!({
            "status": "playing",
            "players": {
                "p1": {"id": "p1", "name": "Ada", "isHost": false, "connected": true, "score": 12}
            },
            "round": 3,
            "prompt": "draw a cat"
        });
        let state: GameState = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(state.status, "playing");
        assert_eq!(state.extra["round"], 3);
        assert_eq!(state.players["p1"].extra["score"], 12);

        let back = serde_json::to_value(state).unwrap();
        assert_eq!(back, raw);
    }
}
