pub mod jwt;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use taskhub_common::types::UserId;
use tracing::debug;

use crate::error::{ErrorCode, RelayError};
use jwt::IdentityTokenService;

/// Resolve the identity presented on a WebSocket upgrade. The
/// `Authorization: Bearer` header wins over the `token` query parameter,
/// which exists because browsers cannot set headers on WebSocket requests.
///
/// `Ok(None)` means no token was presented; a presented token that fails
/// verification is always an error.
pub fn resolve_identity(
    tokens: &IdentityTokenService,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Option<UserId>, RelayError> {
    let header_token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token);
    let query_token = query_token.map(str::trim).filter(|token| !token.is_empty());

    let Some(token) = header_token.or(query_token) else {
        return Ok(None);
    };

    tokens.validate_identity_token(token).map(Some).map_err(|error| {
        debug!(error = %error, "identity token rejected");
        RelayError::from_code(ErrorCode::AuthInvalidToken)
    })
}

pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}
