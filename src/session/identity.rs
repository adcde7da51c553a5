//! Session identity: secrets, player IDs, connection IDs.

use rand::rngs::OsRng;
use rand::RngCore;

/// Stable public identifier derived from a session secret.
pub type PlayerId = String;

/// Server-assigned identifier for a single TCP connection.
pub type ConnectionId = String;

/// Minimum number of hex characters a secret must carry (dashes aside).
pub const MIN_SECRET_HEX_CHARS: usize = 32;

/// Number of hex characters of the secret that become the player ID.
pub const PLAYER_ID_HEX_CHARS: usize = 16;

/// Check a client-supplied secret: at least 32 hex characters, dashes
/// ignored, case-insensitive hex only.
pub fn validate_secret(secret: &str) -> bool {
    let mut hex_chars = 0usize;
    for c in secret.chars() {
        if c == '-' {
            continue;
        }
        if !c.is_ascii_hexdigit() {
            return false;
        }
        hex_chars += 1;
    }
    hex_chars >= MIN_SECRET_HEX_CHARS
}

/// Derive the public player ID from a secret: strip dashes, take the first
/// 16 hex characters. Deterministic, so the same device always maps to the
/// same player. Not a hash — it merely keeps the full secret out of
/// broadcast state.
pub fn derive_player_id(secret: &str) -> PlayerId {
    secret
        .chars()
        .filter(|c| *c != '-')
        .take(PLAYER_ID_HEX_CHARS)
        .collect()
}

/// Fresh connection ID from the OS random source.
pub fn generate_connection_id() -> ConnectionId {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
