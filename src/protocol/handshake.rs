//! HTTP upgrade handshake (RFC 6455 §4).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::common::error::HandshakeError;

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Find the end of the request header block, returning the byte offset just
/// past the blank line. Byte offset, not character offset: the caller
/// compacts its buffer by this amount.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Parse an upgrade request and render the 101 response.
///
/// Requires `Sec-WebSocket-Key`; rejects an explicit `Sec-WebSocket-Version`
/// other than 13. Anything else in the request is ignored.
pub fn upgrade_response(request: &str) -> Result<String, HandshakeError> {
    let mut key = None;

    for line in request.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        if name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value);
        } else if name.eq_ignore_ascii_case("sec-websocket-version") && value != "13" {
            return Err(HandshakeError::UnsupportedVersion {
                version: value.to_string(),
            });
        }
    }

    let key = key.ok_or(HandshakeError::MissingKey)?;

    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    ))
}
