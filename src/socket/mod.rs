//! Handcrafted WebSocket server: TCP accept loop, upgrade handshake, frame
//! processing, keepalive.

pub mod connection;
pub mod server;

pub use server::{SocketEvent, WebSocketServer};
