// Protocol version negotiation for the WebSocket upgrade.
//
// Clients may name the protocol they speak in the `protocol` query
// parameter. Anything outside the N / N-1 window is refused with
// UPGRADE_REQUIRED before the socket is accepted.

use serde_json::json;
use taskhub_common::protocol::{
    is_supported_protocol_version, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

use crate::error::{ErrorCode, RelayError};

/// Resolve the version a connection will speak. A client that names none is
/// assumed to speak the current version.
pub fn negotiate(requested: Option<&str>) -> Result<&'static str, RelayError> {
    match requested.map(str::trim).filter(|version| !version.is_empty()) {
        None => Ok(CURRENT_PROTOCOL_VERSION),
        Some(version) => {
            require_supported(version)?;
            Ok(SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .copied()
                .find(|supported| *supported == version)
                .unwrap_or(CURRENT_PROTOCOL_VERSION))
        }
    }
}

/// Validates a client-supplied protocol version. Unsupported versions carry
/// `details.supported_versions` so clients can tell what to upgrade to.
pub fn require_supported(version: &str) -> Result<(), RelayError> {
    if is_supported_protocol_version(version) {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_PROTOCOL_VERSION,
        })))
    }
}
