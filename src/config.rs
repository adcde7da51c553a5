//! Server configuration.
//!
//! Every tunable constant of the host lives here. The struct derives
//! `Deserialize` so an embedding binary can load it from whatever config
//! format it prefers; `Default` gives the stock values.

use std::time::Duration;

use serde::Deserialize;

use crate::common::error::ConfigError;

/// Configuration for a game session host.
///
/// Durations are stored as integer milliseconds to keep the type trivially
/// deserializable; the accessor methods hand out [`Duration`]s.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port of the static HTTP server shipping controller assets.
    ///
    /// The HTTP server itself is external to this crate; the port is kept
    /// here because the WebSocket port is conventionally derived from it.
    pub http_port: u16,
    /// WebSocket port override. When `None`, `http_port + 2` is used
    /// (the `+1` neighbour is customarily taken by bundler dev servers).
    pub ws_port: Option<u16>,
    /// Maximum accepted frame payload in bytes. Frames declaring more are
    /// fatal to their connection.
    pub max_frame_size: usize,
    /// Keepalive ping interval in milliseconds. `0` disables keepalive.
    pub keepalive_interval_ms: u64,
    /// Grace window on top of the interval before a silent connection is
    /// destroyed.
    pub keepalive_timeout_ms: u64,
    /// How long a disconnected player's record survives before permanent
    /// removal.
    pub stale_removal_delay_ms: u64,
    /// Coalescing window for state broadcasts (~30 Hz by default).
    pub broadcast_throttle_ms: u64,
    /// Controller-side time-sync ping cadence.
    pub sync_interval_ms: u64,
    /// Controller-side cap on in-flight time-sync pings.
    pub max_pending_pings: usize,
    /// Controller-side reconnect attempts before giving up.
    pub max_retries: u32,
    /// Controller-side reconnect backoff base delay.
    pub base_delay_ms: u64,
    /// Controller-side reconnect backoff ceiling.
    pub max_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            ws_port: None,
            max_frame_size: 1024 * 1024,
            keepalive_interval_ms: 30_000,
            keepalive_timeout_ms: 10_000,
            stale_removal_delay_ms: 5 * 60 * 1000,
            broadcast_throttle_ms: 33,
            sync_interval_ms: 5_000,
            max_pending_pings: 50,
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl ServerConfig {
    /// The effective WebSocket port.
    pub fn ws_port(&self) -> u16 {
        self.ws_port.unwrap_or(self.http_port.wrapping_add(2))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn stale_removal_delay(&self) -> Duration {
        Duration::from_millis(self.stale_removal_delay_ms)
    }

    pub fn broadcast_throttle(&self) -> Duration {
        Duration::from_millis(self.broadcast_throttle_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validate the configuration and return every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.max_frame_size == 0 {
            errors.push("max_frame_size must be greater than zero".to_string());
        }

        if self.broadcast_throttle_ms == 0 {
            errors.push("broadcast_throttle_ms must be greater than zero".to_string());
        }

        if self.ws_port() == self.http_port {
            errors.push(format!(
                "ws_port {} collides with http_port {}",
                self.ws_port(),
                self.http_port
            ));
        }

        if self.keepalive_interval_ms > 0 {
            if self.keepalive_timeout_ms == 0 {
                errors.push(
                    "keepalive_timeout_ms must be greater than zero when keepalive is enabled"
                        .to_string(),
                );
            } else if self.keepalive_timeout_ms >= self.keepalive_interval_ms {
                errors.push(format!(
                    "keepalive_timeout_ms {} must be below keepalive_interval_ms {}",
                    self.keepalive_timeout_ms, self.keepalive_interval_ms
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation {
                message: errors.join("; "),
            })
        }
    }
}
