//! Player-session identity across connections, disconnects, and refreshes.

pub mod identity;
pub mod registry;

pub use identity::{derive_player_id, validate_secret, ConnectionId, PlayerId};
pub use registry::SessionRegistry;
