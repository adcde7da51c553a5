//! Authoritative state: the reducer wrapper and the engine task that owns
//! it.

pub mod orchestrator;
pub mod reducer;
pub mod state;

pub use orchestrator::{EngineCommand, GameEngine, MessageSink, NoHooks, SessionHooks};
pub use reducer::{Action, EngineAction, Reducer};
pub use state::{GameState, Player};
