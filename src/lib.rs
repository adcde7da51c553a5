//! Playroom — a LAN party-game session host.
//!
//! A television (or any box on the local network) owns the canonical game
//! state; phones connect as controllers over a handcrafted WebSocket layer.
//! The embedder supplies the initial state and a pure reducer; the host
//! multiplexes controllers, keeps player identity stable across page
//! refreshes and disconnects, and broadcasts throttled state snapshots.
//!
//! ```no_run
//! use playroom::{GameHost, GameState, ServerConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let host = GameHost::new(
//!     ServerConfig::default(),
//!     GameState::new("lobby"),
//!     |mut state, action| {
//!         if action.kind == "START" {
//!             state.status = "playing".to_string();
//!         }
//!         state
//!     },
//! );
//! let handle = host.spawn().await?;
//! println!("controllers connect to ws://<lan-ip>:{}", handle.port());
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod config;
pub mod engine;
pub mod host;
pub mod protocol;
pub mod session;
pub mod socket;

pub use config::ServerConfig;
pub use engine::{Action, GameState, NoHooks, Player, SessionHooks};
pub use host::{GameHost, HostHandle};
