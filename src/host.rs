//! Top-level host wiring.
//!
//! [`GameHost`] ties the socket server and the engine together;
//! [`HostHandle`] is what the embedding game loop keeps: dispatch host-side
//! actions, replace state, stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::orchestrator::{EngineCommand, GameEngine, NoHooks, SessionHooks};
use crate::engine::reducer::{Action, Reducer};
use crate::engine::state::GameState;
use crate::socket::server::WebSocketServer;

/// A configured-but-not-yet-running session host.
pub struct GameHost {
    config: ServerConfig,
    initial_state: GameState,
    reducer: Box<Reducer>,
    hooks: Arc<dyn SessionHooks>,
}

impl GameHost {
    pub fn new(
        config: ServerConfig,
        initial_state: GameState,
        reducer: impl Fn(GameState, &Action) -> GameState + Send + 'static,
    ) -> Self {
        Self {
            config,
            initial_state,
            reducer: Box::new(reducer),
            hooks: Arc::new(NoHooks),
        }
    }

    /// Install observer hooks.
    pub fn with_hooks(mut self, hooks: impl SessionHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Validate the configuration, bind the listener, and start the engine.
    ///
    /// A bind failure (port already taken) is reported through `on_error`
    /// and returned; nothing panics.
    pub async fn spawn(self) -> Result<HostHandle> {
        self.config.validate().context("invalid configuration")?;
        let config = Arc::new(self.config);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let server = WebSocketServer::new(config.clone(), event_tx);
        let port = match server.start(config.ws_port()).await {
            Ok(port) => port,
            Err(err) => {
                self.hooks.on_error(&err);
                return Err(err);
            }
        };

        let engine = GameEngine::new(
            config,
            self.initial_state,
            self.reducer,
            self.hooks,
            server.clone(),
        );
        let engine_task = tokio::spawn(engine.run(event_rx, command_rx));

        info!("Game host ready on port {}", port);
        Ok(HostHandle {
            port,
            commands: command_tx,
            server,
            engine: engine_task,
        })
    }
}

/// Running host. Dropping the handle leaves the host running; call
/// [`HostHandle::stop`] for an orderly shutdown.
pub struct HostHandle {
    port: u16,
    commands: mpsc::UnboundedSender<EngineCommand>,
    server: WebSocketServer,
    engine: JoinHandle<()>,
}

impl HostHandle {
    /// The port controllers connect to. Useful with an ephemeral bind.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Dispatch a host-side action through the reducer.
    pub fn dispatch(&self, action: Action) {
        if self.commands.send(EngineCommand::Dispatch(action)).is_err() {
            warn!("Dispatch after engine stopped");
        }
    }

    /// Replace the authoritative state wholesale.
    pub fn hydrate(&self, state: GameState) {
        if self.commands.send(EngineCommand::Hydrate(state)).is_err() {
            warn!("Hydrate after engine stopped");
        }
    }

    /// Stop the engine, close every connection, and wait briefly for the
    /// engine task to drain.
    pub async fn stop(self) {
        let _ = self.commands.send(EngineCommand::Stop);
        self.server.stop();

        match tokio::time::timeout(Duration::from_secs(5), self.engine).await {
            Ok(Ok(())) => info!("Game host stopped"),
            Ok(Err(err)) => warn!("Engine task panicked: {}", err),
            Err(_) => warn!("Engine did not stop in time"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::protocol::frame::{self, Decoded, Opcode};

    const SECRET: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const PLAYER: &str = "aaaaaaaaaaaaaaaa";

    fn test_config() -> ServerConfig {
        ServerConfig {
            // Ephemeral port so tests never collide.
            ws_port: Some(0),
            ..ServerConfig::default()
        }
    }

    fn buzz_reducer(mut state: GameState, action: &Action) -> GameState {
        if action.kind == "BUZZ" {
            state
                .extra
                .insert("buzzer".into(), json!(action.player_id));
        }
        state
    }

    /// Byte-level WebSocket client, enough to drive the host end to end.
    struct Controller {
        stream: TcpStream,
        residue: Vec<u8>,
    }

    impl Controller {
        async fn connect(port: u16) -> Self {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let request = format!(
                "GET /session HTTP/1.1\r\n\
                 Host: 127.0.0.1:{port}\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                 Sec-WebSocket-Version: 13\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).await.unwrap();

            let mut header = Vec::new();
            let mut byte = [0u8; 1];
            while !header.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                header.push(byte[0]);
            }
            let text = String::from_utf8(header).unwrap();
            assert!(text.starts_with("HTTP/1.1 101 Switching Protocols"));

            Self {
                stream,
                residue: Vec::new(),
            }
        }

        async fn send(&mut self, value: Value) {
            let payload = value.to_string().into_bytes();
            let key = [0x0Fu8, 0xF0, 0x55, 0xAA];
            let mut raw = vec![0x81];
            if payload.len() <= 125 {
                raw.push(0x80 | payload.len() as u8);
            } else {
                raw.push(0x80 | 126);
                raw.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            }
            raw.extend_from_slice(&key);
            raw.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
            self.stream.write_all(&raw).await.unwrap();
        }

        async fn send_join(&mut self, secret: &str, name: &str) {
            self.send(json!({
                "type": "JOIN",
                "payload": {"name": name, "secret": secret}
            }))
            .await;
        }

        async fn recv_frame(&mut self) -> (Opcode, Vec<u8>) {
            loop {
                match frame::decode(&self.residue, 16 * 1024 * 1024).unwrap() {
                    Decoded::Frame(frame) => {
                        let payload = frame.payload.to_vec();
                        let opcode = frame.opcode;
                        self.residue.drain(..frame.consumed);
                        return (opcode, payload);
                    }
                    Decoded::NeedMore => {
                        let mut chunk = [0u8; 4096];
                        let n = self.stream.read(&mut chunk).await.unwrap();
                        assert!(n > 0, "connection closed while awaiting a frame");
                        self.residue.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }

        /// Next text message whose `type` matches, skipping everything else
        /// (keepalive pings, interleaved broadcasts).
        async fn recv_until(&mut self, kind: &str) -> Value {
            let deadline = Duration::from_secs(5);
            tokio::time::timeout(deadline, async {
                loop {
                    let (opcode, payload) = self.recv_frame().await;
                    if opcode != Opcode::Text {
                        continue;
                    }
                    let value: Value = serde_json::from_slice(&payload).unwrap();
                    if value["type"] == kind {
                        return value;
                    }
                }
            })
            .await
            .unwrap_or_else(|_| panic!("no {} message within 5s", kind))
        }

        /// Next STATE_UPDATE whose new state satisfies the predicate,
        /// skipping earlier broadcasts still in flight.
        async fn recv_state_until(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
            let deadline = Duration::from_secs(5);
            tokio::time::timeout(deadline, async {
                loop {
                    let update = self.recv_until("STATE_UPDATE").await;
                    if pred(&update["payload"]["newState"]) {
                        return update;
                    }
                }
            })
            .await
            .expect("no matching STATE_UPDATE within 5s")
        }

        /// Drain until the peer closes the TCP stream.
        async fn expect_closed(&mut self) {
            let deadline = Duration::from_secs(5);
            tokio::time::timeout(deadline, async {
                let mut chunk = [0u8; 4096];
                loop {
                    if self.stream.read(&mut chunk).await.unwrap() == 0 {
                        return;
                    }
                }
            })
            .await
            .expect("connection was not closed within 5s")
        }
    }

    #[tokio::test]
    async fn join_act_observe() {
        let handle = GameHost::new(test_config(), GameState::new("lobby"), buzz_reducer)
            .spawn()
            .await
            .unwrap();

        let mut controller = Controller::connect(handle.port()).await;
        controller.send_join(SECRET, "A").await;

        let welcome = controller.recv_until("WELCOME").await;
        assert_eq!(welcome["payload"]["playerId"], PLAYER);
        let record = &welcome["payload"]["state"]["players"][PLAYER];
        assert_eq!(record["id"], PLAYER);
        assert_eq!(record["name"], "A");
        assert_eq!(record["isHost"], false);
        assert_eq!(record["connected"], true);
        assert!(welcome["payload"]["serverTime"].is_i64());

        controller
            .send(json!({"type": "ACTION", "payload": {"type": "BUZZ"}}))
            .await;

        let update = controller
            .recv_state_until(|state| state.get("buzzer").is_some())
            .await;
        assert_eq!(update["payload"]["newState"]["buzzer"], PLAYER);

        handle.stop().await;
    }

    #[tokio::test]
    async fn forbidden_action_is_refused_over_the_wire() {
        let handle = GameHost::new(test_config(), GameState::new("lobby"), buzz_reducer)
            .spawn()
            .await
            .unwrap();

        let mut controller = Controller::connect(handle.port()).await;
        controller.send_join(SECRET, "A").await;
        controller.recv_until("WELCOME").await;

        controller
            .send(json!({
                "type": "ACTION",
                "payload": {"type": "__HYDRATE__", "payload": {"malicious": true}}
            }))
            .await;

        let error = controller.recv_until("ERROR").await;
        assert_eq!(error["payload"]["code"], "FORBIDDEN_ACTION");

        // State is untouched: the next broadcast still says lobby.
        handle.dispatch(Action::new("NOOP", Value::Null));
        let update = controller.recv_until("STATE_UPDATE").await;
        assert_eq!(update["payload"]["newState"]["status"], "lobby");
        assert!(update["payload"]["newState"].get("malicious").is_none());

        handle.stop().await;
    }

    #[tokio::test]
    async fn oversized_frame_closes_only_the_offender() {
        let config = ServerConfig {
            max_frame_size: 4096,
            ..test_config()
        };
        let handle = GameHost::new(config, GameState::new("lobby"), buzz_reducer)
            .spawn()
            .await
            .unwrap();

        let mut honest = Controller::connect(handle.port()).await;
        honest.send_join(SECRET, "A").await;
        honest.recv_until("WELCOME").await;

        let mut offender = Controller::connect(handle.port()).await;
        // Header declaring 2 MiB; no payload follows.
        let mut header = vec![0x81u8, 0x80 | 127];
        header.extend_from_slice(&(2u64 * 1024 * 1024).to_be_bytes());
        offender.stream.write_all(&header).await.unwrap();
        offender.expect_closed().await;

        // The honest controller still sees broadcasts.
        handle.dispatch(Action::new("BUZZ", Value::Null));
        let update = honest.recv_until("STATE_UPDATE").await;
        assert_eq!(update["payload"]["newState"]["status"], "lobby");

        handle.stop().await;
    }

    #[tokio::test]
    async fn broadcasts_reach_every_controller_and_stop_closes_them() {
        let handle = GameHost::new(test_config(), GameState::new("lobby"), buzz_reducer)
            .spawn()
            .await
            .unwrap();

        let mut first = Controller::connect(handle.port()).await;
        first
            .send_join("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", "B")
            .await;
        first.recv_until("WELCOME").await;

        let mut second = Controller::connect(handle.port()).await;
        second
            .send_join("cccccccccccccccccccccccccccccccc", "C")
            .await;
        second.recv_until("WELCOME").await;

        let update = first.recv_until("STATE_UPDATE").await;
        let players = update["payload"]["newState"]["players"].as_object().unwrap();
        assert!(players.contains_key("bbbbbbbbbbbbbbbb"));
        let update = second.recv_until("STATE_UPDATE").await;
        assert!(update["payload"]["newState"]["players"]
            .as_object()
            .unwrap()
            .contains_key("cccccccccccccccc"));

        handle.stop().await;
        first.expect_closed().await;
        second.expect_closed().await;
    }

    #[tokio::test]
    async fn ping_is_answered_for_time_sync() {
        let handle = GameHost::new(test_config(), GameState::new("lobby"), buzz_reducer)
            .spawn()
            .await
            .unwrap();

        let mut controller = Controller::connect(handle.port()).await;
        controller
            .send(json!({"type": "PING", "payload": {"id": "sync-1", "timestamp": 17.5}}))
            .await;

        let pong = controller.recv_until("PONG").await;
        assert_eq!(pong["payload"]["id"], "sync-1");
        assert_eq!(pong["payload"]["origTimestamp"], 17.5);
        assert!(pong["payload"]["serverTime"].is_i64());

        handle.stop().await;
    }

    #[tokio::test]
    async fn spawning_on_a_taken_port_surfaces_the_error() {
        let handle = GameHost::new(test_config(), GameState::new("lobby"), buzz_reducer)
            .spawn()
            .await
            .unwrap();

        let config = ServerConfig {
            ws_port: Some(handle.port()),
            ..ServerConfig::default()
        };
        let result = GameHost::new(config, GameState::new("lobby"), buzz_reducer)
            .spawn()
            .await;
        assert!(result.is_err());

        handle.stop().await;
    }
}
