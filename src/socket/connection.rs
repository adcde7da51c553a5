//! Per-connection task.
//!
//! Each accepted socket gets one task that owns its receive buffer, runs
//! the upgrade handshake, decodes frames, and drives keepalive. Everything
//! stateful is marshaled to the engine as [`SocketEvent`]s; outbound frames
//! arrive through the connection's mpsc writer queue.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::protocol::buffer::ConnectionBuffer;
use crate::protocol::frame::{self, Decoded, Opcode};
use crate::protocol::handshake;
use crate::session::identity::{generate_connection_id, ConnectionId};
use crate::socket::server::{
    lock_table, ConnectionHandle, ConnectionTable, Outbound, SocketEvent,
};

/// Unmasked close frame with no status code.
const CLOSE_FRAME: [u8; 2] = [0x88, 0x00];

const READ_CHUNK: usize = 4096;

pub(crate) fn spawn<S>(
    stream: S,
    config: Arc<ServerConfig>,
    table: ConnectionTable,
    events: mpsc::UnboundedSender<SocketEvent>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(run(stream, config, table, events, shutdown));
}

async fn run<S>(
    stream: S,
    config: Arc<ServerConfig>,
    table: ConnectionTable,
    events: mpsc::UnboundedSender<SocketEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let mut inbound = Inbound {
        config: config.clone(),
        table,
        events,
        outbound: outbound_tx,
        buffer: ConnectionBuffer::new(),
        id: None,
        handshake_done: false,
        closing: false,
        last_pong: Instant::now(),
    };

    let keepalive_enabled = config.keepalive_interval_ms > 0;
    let keepalive_period = if keepalive_enabled {
        config.keepalive_interval()
    } else {
        Duration::from_secs(3600)
    };
    let mut keepalive = interval_at(Instant::now() + keepalive_period, keepalive_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut chunk = [0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = reader.read(&mut chunk), if !inbound.closing => match read {
                Ok(0) => break,
                Ok(n) => {
                    if !inbound.ingest(&chunk[..n]) {
                        break;
                    }
                }
                Err(err) => {
                    debug!("Read failed: {}", err);
                    break;
                }
            },

            maybe_out = outbound_rx.recv() => match maybe_out {
                Some(Outbound::Frame(frame)) => {
                    if let Err(err) = writer.write_all(&frame).await {
                        debug!("Write failed: {}", err);
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = writer.write_all(&CLOSE_FRAME).await;
                    break;
                }
            },

            _ = keepalive.tick(), if keepalive_enabled => {
                if inbound.last_pong.elapsed()
                    > config.keepalive_interval() + config.keepalive_timeout()
                {
                    debug!("Keepalive expired; destroying connection");
                    break;
                }
                if let Err(err) = writer.write_all(&frame::encode(Opcode::Ping, &[])).await {
                    debug!("Keepalive ping failed: {}", err);
                    break;
                }
            }

            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => {
                    let _ = writer.write_all(&CLOSE_FRAME).await;
                    break;
                }
                Ok(()) => {}
                // Sender gone: the server is being torn down.
                Err(_) => break,
            },
        }
    }

    inbound.teardown();
}

struct Inbound {
    config: Arc<ServerConfig>,
    table: ConnectionTable,
    events: mpsc::UnboundedSender<SocketEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
    buffer: ConnectionBuffer,
    id: Option<ConnectionId>,
    handshake_done: bool,
    closing: bool,
    last_pong: Instant,
}

impl Inbound {
    /// Feed freshly read bytes through handshake and frame processing.
    /// Returns false when the connection must be destroyed.
    fn ingest(&mut self, data: &[u8]) -> bool {
        self.buffer.append(data);

        if !self.handshake_done && !self.try_handshake() {
            return false;
        }
        if !self.handshake_done {
            // Header still incomplete.
            return true;
        }

        self.process_frames()
    }

    /// Attempt the upgrade once the header terminator is buffered. Returns
    /// false on a rejected handshake.
    fn try_handshake(&mut self) -> bool {
        let Some(end) = handshake::header_end(self.buffer.valid()) else {
            return true;
        };

        let request = String::from_utf8_lossy(&self.buffer.valid()[..end]).into_owned();
        let response = match handshake::upgrade_response(&request) {
            Ok(response) => response,
            Err(err) => {
                debug!("Handshake rejected: {}", err);
                return false;
            }
        };
        if self
            .outbound
            .send(Outbound::Frame(Bytes::from(response.into_bytes())))
            .is_err()
        {
            return false;
        }

        let id = generate_connection_id();
        lock_table(&self.table).insert(
            id.clone(),
            ConnectionHandle {
                outbound: self.outbound.clone(),
            },
        );
        let _ = self.events.send(SocketEvent::Connected { conn: id.clone() });
        debug!(conn = %id, "Handshake complete");

        self.id = Some(id);
        self.handshake_done = true;
        // Compact by byte length of the header block; frames may already
        // sit behind it in the same packet.
        self.buffer.compact(end);
        true
    }

    fn process_frames(&mut self) -> bool {
        let mut offset = 0;
        let mut alive = true;

        while !self.closing {
            match frame::decode(&self.buffer.valid()[offset..], self.config.max_frame_size) {
                Ok(Decoded::NeedMore) => break,
                Ok(Decoded::Frame(frame)) => {
                    offset += frame.consumed;
                    self.dispatch_frame(frame);
                }
                Err(err) => {
                    warn!("Destroying connection: {}", err);
                    alive = false;
                    break;
                }
            }
        }

        self.buffer.compact(offset);
        alive
    }

    fn dispatch_frame(&mut self, frame: frame::Frame) {
        match frame.opcode {
            Opcode::Text => self.on_text(&frame.payload),
            Opcode::Close => {
                debug!("Close frame received");
                let _ = self.outbound.send(Outbound::Close);
                self.closing = true;
            }
            Opcode::Ping => {
                let _ = self
                    .outbound
                    .send(Outbound::Frame(frame::encode(Opcode::Pong, &frame.payload)));
            }
            Opcode::Pong => {
                self.last_pong = Instant::now();
            }
            other => debug!(opcode = ?other, "Discarding frame"),
        }
    }

    fn on_text(&mut self, payload: &[u8]) {
        let Some(id) = &self.id else {
            return;
        };
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => {
                let _ = self.events.send(SocketEvent::Message {
                    conn: id.clone(),
                    value,
                });
            }
            // The frame is dropped; the connection survives.
            Err(err) => debug!(conn = %id, "Discarding unparseable text frame: {}", err),
        }
    }

    fn teardown(&mut self) {
        if let Some(id) = self.id.take() {
            lock_table(&self.table).remove(&id);
            let _ = self.events.send(SocketEvent::Disconnected { conn: id });
        }
    }
}
