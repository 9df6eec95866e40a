// Realtime protocol: versioning and the event envelopes exchanged over the
// relay WebSocket.

pub mod events;

pub const CURRENT_PROTOCOL_VERSION: &str = "taskhub-realtime.v1";
pub const PREVIOUS_PROTOCOL_VERSION: &str = "taskhub-realtime.v0";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[CURRENT_PROTOCOL_VERSION, PREVIOUS_PROTOCOL_VERSION];

#[must_use]
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}
