//! The state engine.
//!
//! One task owns the authoritative state, the session registry, the
//! broadcast throttle, and the stale-player timers. Network tasks marshal
//! everything through the event channel, so state is only ever touched
//! here.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::engine::reducer::{self, Action, EngineAction, Reducer};
use crate::engine::state::GameState;
use crate::protocol::messages::{
    ActionPayload, ClientMessage, ErrorCode, JoinPayload, ServerMessage,
};
use crate::session::identity::{derive_player_id, validate_secret, PlayerId};
use crate::session::registry::SessionRegistry;
use crate::socket::server::SocketEvent;

/// Observer hooks for the embedding game. All methods default to no-ops.
pub trait SessionHooks: Send + Sync + 'static {
    fn on_player_joined(&self, _player: &str, _name: &str) {}
    fn on_player_left(&self, _player: &str) {}
    fn on_assets_loaded(&self, _player: &str) {}
    fn on_error(&self, _error: &anyhow::Error) {}
}

/// Hooks that observe nothing.
#[derive(Debug, Default)]
pub struct NoHooks;

impl SessionHooks for NoHooks {}

/// Where outbound messages go. The socket server implements this; tests
/// substitute a recorder.
pub trait MessageSink: Send {
    fn send(&self, conn: &str, message: &ServerMessage);
    fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>);
}

impl<T: MessageSink + Sync + ?Sized> MessageSink for Arc<T> {
    fn send(&self, conn: &str, message: &ServerMessage) {
        (**self).send(conn, message);
    }

    fn broadcast(&self, message: &ServerMessage, exclude: Option<&str>) {
        (**self).broadcast(message, exclude);
    }
}

/// Commands from the embedding game loop.
#[derive(Debug)]
pub enum EngineCommand {
    /// Dispatch a host-side action through the reducer.
    Dispatch(Action),
    /// Replace the state wholesale.
    Hydrate(GameState),
    Stop,
}

/// Resettable broadcast timer. Armed on every state change; each further
/// change pushes it out by the full window, and only the snapshot at fire
/// time is sent.
type Throttle = Option<Pin<Box<Sleep>>>;

/// What the cleanup timer needs to erase a session for good.
#[derive(Debug)]
struct StaleSession {
    player: PlayerId,
    secret: String,
}

pub struct GameEngine<S> {
    config: Arc<ServerConfig>,
    state: GameState,
    reducer: Box<Reducer>,
    hooks: Arc<dyn SessionHooks>,
    sink: S,
    registry: SessionRegistry,
    cleanup: DelayQueue<StaleSession>,
    cleanup_keys: HashMap<PlayerId, Key>,
    last_action: Option<Value>,
}

impl<S: MessageSink> GameEngine<S> {
    pub fn new(
        config: Arc<ServerConfig>,
        initial_state: GameState,
        reducer: Box<Reducer>,
        hooks: Arc<dyn SessionHooks>,
        sink: S,
    ) -> Self {
        Self {
            config,
            state: initial_state,
            reducer,
            hooks,
            sink,
            registry: SessionRegistry::new(),
            cleanup: DelayQueue::new(),
            cleanup_keys: HashMap::new(),
            last_action: None,
        }
    }

    /// Run until the event channel closes or a `Stop` command arrives.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    ) {
        let mut throttle: Throttle = None;

        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.handle_socket_event(event, &mut throttle),
                    None => break,
                },

                maybe_command = commands.recv() => match maybe_command {
                    Some(EngineCommand::Dispatch(action)) => {
                        self.dispatch(EngineAction::User(action), &mut throttle);
                    }
                    Some(EngineCommand::Hydrate(state)) => {
                        self.dispatch(EngineAction::Hydrate(state), &mut throttle);
                    }
                    Some(EngineCommand::Stop) | None => break,
                },

                () = async { throttle.as_mut().unwrap().as_mut().await },
                    if throttle.is_some() =>
                {
                    throttle = None;
                    self.broadcast_state();
                }

                Some(expired) = std::future::poll_fn(|cx| self.cleanup.poll_expired(cx)) => {
                    self.remove_stale(expired.into_inner(), &mut throttle);
                }
            }
        }

        debug!("Engine stopped");
    }

    fn handle_socket_event(&mut self, event: SocketEvent, throttle: &mut Throttle) {
        match event {
            SocketEvent::Listening { port } => {
                info!("Session host listening on port {}", port);
            }
            SocketEvent::Connected { conn } => {
                debug!(conn = %conn, "Controller connected");
            }
            SocketEvent::Message { conn, value } => self.handle_message(&conn, value, throttle),
            SocketEvent::Disconnected { conn } => self.handle_disconnect(&conn, throttle),
            SocketEvent::Error { error } => {
                error!("Socket error: {:#}", error);
                self.hooks.on_error(&error);
            }
        }
    }

    fn handle_message(&mut self, conn: &str, value: Value, throttle: &mut Throttle) {
        let message = match serde_json::from_value::<ClientMessage>(value) {
            Ok(message) => message,
            Err(err) => {
                debug!(conn = %conn, "Rejecting malformed message: {}", err);
                self.sink
                    .send(conn, &ServerMessage::error(ErrorCode::InvalidMessage));
                return;
            }
        };

        match message {
            ClientMessage::Join(join) => self.handle_join(conn, join, throttle),
            ClientMessage::Action(action) => self.handle_action(conn, action, throttle),
            ClientMessage::Ping(ping) => {
                // Answered directly; time sync never touches state.
                self.sink.send(
                    conn,
                    &ServerMessage::Pong {
                        id: ping.id,
                        orig_timestamp: ping.timestamp,
                        server_time: now_millis(),
                    },
                );
            }
            ClientMessage::AssetsLoaded(true) => {
                if let Some(player) = self.registry.player_for(conn) {
                    debug!(player = %player, "Controller finished preloading");
                    self.hooks.on_assets_loaded(&player);
                }
            }
            ClientMessage::AssetsLoaded(false) => {
                self.sink
                    .send(conn, &ServerMessage::error(ErrorCode::InvalidMessage));
            }
        }
    }

    fn handle_join(&mut self, conn: &str, join: JoinPayload, throttle: &mut Throttle) {
        if !validate_secret(&join.secret) {
            debug!(conn = %conn, "Rejecting join with invalid secret");
            self.sink
                .send(conn, &ServerMessage::error(ErrorCode::InvalidSecret));
            return;
        }

        let player = derive_player_id(&join.secret);
        self.registry.bind(&join.secret, conn);

        if let Some(key) = self.cleanup_keys.remove(&player) {
            self.cleanup.remove(&key);
            debug!(player = %player, "Cancelled stale-removal timer");
        }

        // Queue the welcome before reducing: the flush that follows the
        // dispatch then sends a snapshot that already contains the player.
        self.registry.queue_welcome(conn, &player);

        let lifecycle = if self.state.players.contains_key(&player) {
            info!(player = %player, "Player reconnected");
            EngineAction::PlayerReconnected { id: player.clone() }
        } else {
            info!(player = %player, name = %join.name, "Player joined");
            EngineAction::PlayerJoined {
                id: player.clone(),
                name: join.name.clone(),
                avatar: join.avatar,
            }
        };
        self.dispatch(lifecycle, throttle);

        self.hooks.on_player_joined(&player, &join.name);
    }

    fn handle_action(&mut self, conn: &str, payload: ActionPayload, throttle: &mut Throttle) {
        if reducer::is_reserved(&payload.kind) {
            warn!(conn = %conn, kind = %payload.kind, "Rejecting reserved action type");
            self.sink
                .send(conn, &ServerMessage::error(ErrorCode::ForbiddenAction));
            return;
        }

        // None when a controller acts before joining; the action is still
        // dispatched, just anonymous.
        let player_id = self.registry.player_for(conn);
        self.dispatch(
            EngineAction::User(Action {
                kind: payload.kind,
                payload: payload.payload,
                player_id,
            }),
            throttle,
        );
    }

    fn handle_disconnect(&mut self, conn: &str, throttle: &mut Throttle) {
        self.registry.forget_connection(conn);

        let Some(secret) = self.registry.release(conn) else {
            debug!(conn = %conn, "Connection closed before joining");
            return;
        };
        let player = derive_player_id(&secret);

        // A newer connection may have adopted the session already; a late
        // FIN from the superseded socket must not mark the player as gone.
        if !self.registry.is_current(&secret, conn) {
            debug!(player = %player, "Ignoring disconnect of superseded connection");
            return;
        }

        info!(player = %player, "Player disconnected");
        self.dispatch(EngineAction::PlayerLeft { id: player.clone() }, throttle);
        self.hooks.on_player_left(&player);

        let key = self.cleanup.insert(
            StaleSession {
                player: player.clone(),
                secret,
            },
            self.config.stale_removal_delay(),
        );
        self.cleanup_keys.insert(player, key);
    }

    fn remove_stale(&mut self, stale: StaleSession, throttle: &mut Throttle) {
        info!(player = %stale.player, "Removing stale player");
        self.cleanup_keys.remove(&stale.player);
        self.registry.drop_session(&stale.secret);
        self.dispatch(EngineAction::PlayerRemoved { id: stale.player }, throttle);
    }

    /// Feed one action through the wrapped reducer, then flush queued
    /// welcomes and re-arm the broadcast timer.
    fn dispatch(&mut self, action: EngineAction, throttle: &mut Throttle) {
        let input = self.state.clone();
        let next = match catch_unwind(AssertUnwindSafe(|| {
            reducer::apply(&*self.reducer, input, &action)
        })) {
            Ok(next) => next,
            Err(_) => {
                error!("Reducer panicked; keeping previous state");
                self.hooks.on_error(&anyhow!("reducer panicked"));
                return;
            }
        };
        self.state = next;

        self.last_action = match &action {
            EngineAction::User(action) => serde_json::to_value(action).ok(),
            _ => None,
        };

        self.flush_welcomes();
        *throttle = Some(Box::pin(sleep(self.config.broadcast_throttle())));
    }

    fn flush_welcomes(&mut self) {
        for (conn, player) in self.registry.take_pending_welcomes() {
            debug!(conn = %conn, player = %player, "Sending welcome");
            self.sink.send(
                &conn,
                &ServerMessage::Welcome {
                    player_id: player,
                    state: self.state.clone(),
                    server_time: now_millis(),
                },
            );
        }
    }

    fn broadcast_state(&mut self) {
        self.sink.broadcast(
            &ServerMessage::StateUpdate {
                new_state: self.state.clone(),
                timestamp: now_millis(),
                action: self.last_action.take(),
            },
            None,
        );
    }
}

/// Host wall clock in milliseconds since the epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
