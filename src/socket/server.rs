//! WebSocket server: listener, connection table, outbound fan-out.
//!
//! The server owns no game semantics. It accepts TCP connections, runs one
//! task per connection, and surfaces [`SocketEvent`]s to the engine through
//! an unbounded channel. Outbound messages are serialized and framed once,
//! then handed to each connection's writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context};
use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::engine::orchestrator::MessageSink;
use crate::protocol::frame::{self, Opcode};
use crate::protocol::messages::ServerMessage;
use crate::session::identity::ConnectionId;
use crate::socket::connection;

/// Events surfaced by the socket layer to the engine.
#[derive(Debug)]
pub enum SocketEvent {
    Listening { port: u16 },
    Connected { conn: ConnectionId },
    Message { conn: ConnectionId, value: Value },
    Disconnected { conn: ConnectionId },
    Error { error: anyhow::Error },
}

/// Commands to a connection's writer half.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Pre-encoded frame bytes to write as-is.
    Frame(Bytes),
    /// Write a close frame, then tear the connection down.
    Close,
}

pub(crate) struct ConnectionHandle {
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

pub(crate) type ConnectionTable = Arc<Mutex<HashMap<ConnectionId, ConnectionHandle>>>;

pub(crate) fn lock_table(table: &ConnectionTable) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the socket server. Cheap to clone; every clone drives the same
/// listener and connection table.
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Arc<ServerShared>,
}

struct ServerShared {
    config: Arc<ServerConfig>,
    connections: ConnectionTable,
    events: mpsc::UnboundedSender<SocketEvent>,
    shutdown: watch::Sender<bool>,
}

impl WebSocketServer {
    pub fn new(config: Arc<ServerConfig>, events: mpsc::UnboundedSender<SocketEvent>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerShared {
                config,
                connections: Arc::new(Mutex::new(HashMap::new())),
                events,
                shutdown,
            }),
        }
    }

    /// Bind the listener and spawn the accept loop. Port 0 asks the OS for
    /// an ephemeral port; the actual port is returned and carried by the
    /// `Listening` event either way.
    pub async fn start(&self, port: u16) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind 0.0.0.0:{}", port))?;
        let local_port = listener.local_addr().context("listener has no address")?.port();

        info!("WebSocket server listening on 0.0.0.0:{}", local_port);
        let _ = self.inner.events.send(SocketEvent::Listening { port: local_port });

        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Accepted TCP connection");
                            let _ = stream.set_nodelay(true);
                            connection::spawn(
                                stream,
                                inner.config.clone(),
                                inner.connections.clone(),
                                inner.events.clone(),
                                inner.shutdown.subscribe(),
                            );
                        }
                        Err(err) => warn!("Accept failed: {}", err),
                    },
                    changed = shutdown.changed() => match changed {
                        Ok(()) if *shutdown.borrow() => break,
                        Ok(()) => {}
                        Err(_) => break,
                    },
                }
            }
            debug!("Accept loop stopped");
        });

        Ok(local_port)
    }

    /// Send one message to one connection. Failures are logged and surfaced
    /// as `error` events, never propagated: a dying connection must not take
    /// the caller with it.
    pub fn send(&self, conn: &str, message: &ServerMessage) {
        let Some(frame) = self.encode(message) else {
            return;
        };
        match lock_table(&self.inner.connections).get(conn) {
            Some(handle) => {
                if handle.outbound.send(Outbound::Frame(frame)).is_err() {
                    self.report_delivery_failure(conn, "send raced connection teardown");
                }
            }
            None => self.report_delivery_failure(conn, "send to unknown connection"),
        }
    }

    /// Send one message to every connection except `exclude`. Serialized
    /// and framed once; a failure on one recipient never affects the rest.
    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) {
        let Some(frame) = self.encode(message) else {
            return;
        };
        let mut failed = Vec::new();
        for (id, handle) in lock_table(&self.inner.connections).iter() {
            if Some(id.as_str()) == exclude {
                continue;
            }
            if handle.outbound.send(Outbound::Frame(frame.clone())).is_err() {
                failed.push(id.clone());
            }
        }
        for id in failed {
            self.report_delivery_failure(&id, "broadcast raced connection teardown");
        }
    }

    /// Shut everything down: every connection writes a close frame and
    /// exits, the accept loop stops, the table drains.
    pub fn stop(&self) {
        debug!("Stopping WebSocket server");
        let _ = self.inner.shutdown.send(true);
    }

    fn report_delivery_failure(&self, conn: &str, reason: &str) {
        debug!(conn = %conn, "{}", reason);
        let _ = self.inner.events.send(SocketEvent::Error {
            error: anyhow!("{} (connection {})", reason, conn),
        });
    }

    fn encode(&self, message: &ServerMessage) -> Option<Bytes> {
        match serde_json::to_vec(message) {
            Ok(payload) => Some(frame::encode(Opcode::Text, &payload)),
            Err(err) => {
                error!("Failed to serialize outbound message: {}", err);
                let _ = self.inner.events.send(SocketEvent::Error {
                    error: anyhow::Error::new(err).context("serializing outbound message"),
                });
                None
            }
        }
    }
}

impl MessageSink for WebSocketServer {
    fn send(&self, conn: &str, message: &ServerMessage) {
        WebSocketServer::send(self, conn, message);
    }

    fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) {
        WebSocketServer::broadcast(self, message, exclude);
    }
}
