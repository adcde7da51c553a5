//! Session registry.
//!
//! Maps session secrets to the connection currently owning them, connections
//! back to secrets, and tracks which connections still owe (or have already
//! received) their welcome message. Stale-player timers are keyed by player
//! ID and owned by the engine; the registry records identity only.

use std::collections::{HashMap, HashSet};

use crate::session::identity::{derive_player_id, ConnectionId, PlayerId};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// secret → latest connection owning the session.
    sessions: HashMap<String, ConnectionId>,
    /// connection → secret, for disconnect resolution.
    reverse: HashMap<ConnectionId, String>,
    /// connection → player awaiting a welcome message.
    pending_welcome: HashMap<ConnectionId, PlayerId>,
    /// connections whose welcome has been sent.
    welcomed: HashSet<ConnectionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` the current owner of `secret`. A previous owner (a dying
    /// connection the client replaced) keeps its reverse entry so its late
    /// disconnect can still be resolved — and then race-guarded.
    pub fn bind(&mut self, secret: &str, conn: &str) {
        self.sessions.insert(secret.to_string(), conn.to_string());
        self.reverse.insert(conn.to_string(), secret.to_string());
    }

    /// Whether `conn` is still the current owner of `secret`. False means the
    /// session was adopted by a newer connection.
    pub fn is_current(&self, secret: &str, conn: &str) -> bool {
        self.sessions.get(secret).map(String::as_str) == Some(conn)
    }

    /// Remove a connection's reverse entry, returning its secret.
    pub fn release(&mut self, conn: &str) -> Option<String> {
        self.reverse.remove(conn)
    }

    /// Resolve a connection to the player ID derived from its secret.
    pub fn player_for(&self, conn: &str) -> Option<PlayerId> {
        self.reverse.get(conn).map(|secret| derive_player_id(secret))
    }

    /// Forget a session entirely (stale removal).
    pub fn drop_session(&mut self, secret: &str) {
        self.sessions.remove(secret);
    }

    /// Queue a welcome for `conn`. A connection re-joining after it was
    /// already welcomed goes back to pending, keeping the two sets disjoint.
    pub fn queue_welcome(&mut self, conn: &str, player: &str) {
        self.welcomed.remove(conn);
        self.pending_welcome
            .insert(conn.to_string(), player.to_string());
    }

    /// Drain every queued welcome, marking the connections welcomed.
    pub fn take_pending_welcomes(&mut self) -> Vec<(ConnectionId, PlayerId)> {
        let drained: Vec<_> = self.pending_welcome.drain().collect();
        for (conn, _) in &drained {
            self.welcomed.insert(conn.clone());
        }
        drained
    }

    /// Drop all welcome bookkeeping for a closed connection.
    pub fn forget_connection(&mut self, conn: &str) {
        self.pending_welcome.remove(conn);
        self.welcomed.remove(conn);
    }

    #[cfg(test)]
    fn pending_and_welcomed_disjoint(&self) -> bool {
        self.pending_welcome
            .keys()
            .all(|conn| !self.welcomed.contains(conn))
    }
}
