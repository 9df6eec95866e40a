use crate::auth::{jwt::IdentityTokenService, resolve_identity};
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::metrics;
use crate::protocol;
use crate::registry::ConnectionId;
use crate::relay::Relay;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use taskhub_common::{
    protocol::events::{ClientEvent, Connected, DecodeError, ServerEvent},
    types::UserId,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL_MS: u32 = 15_000;
const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const MAX_FRAME_BYTES: u32 = 262_144;

#[derive(Clone)]
pub struct WsState {
    pub relay: Arc<Relay>,
    pub tokens: Arc<IdentityTokenService>,
    /// Refuse upgrades that present no identity token.
    pub require_token: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpgradeQuery {
    protocol: Option<String>,
    token: Option<String>,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<WsState>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> impl IntoResponse {
    let protocol_version = match protocol::negotiate(query.protocol.as_deref()) {
        Ok(version) => version,
        Err(error) => return error.into_response(),
    };

    let user_id = match resolve_identity(&state.tokens, &headers, query.token.as_deref()) {
        Ok(Some(user_id)) => Some(user_id),
        Ok(None) if state.require_token => {
            return RelayError::new(ErrorCode::AuthInvalidToken, "identity token required")
                .into_response();
        }
        Ok(None) => None,
        Err(error) => return error.into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let relay = state.relay.clone();
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES as usize).on_upgrade(move |socket| async move {
        with_request_id_scope(
            request_id,
            handle_socket(relay, user_id, protocol_version, socket),
        )
        .await;
    })
}

async fn handle_socket(
    relay: Arc<Relay>,
    user_id: Option<UserId>,
    protocol_version: &'static str,
    mut socket: WebSocket,
) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    let connection_id = match relay.connect(outbound_sender, user_id.as_ref()) {
        Ok(connection_id) => connection_id,
        Err(error) => {
            warn!(request_id = %request_id, error = %error, "connection refused");
            let _ = send_event(&mut socket, &error.to_frame(None)).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let connected = ServerEvent::Connected(Connected {
        connection_id,
        user_id,
        heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
        protocol_version: protocol_version.to_string(),
    });
    if send_event(&mut socket, &connected).await.is_err() {
        relay.disconnect(connection_id);
        return;
    }

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(
        HEARTBEAT_INTERVAL_MS as u64 + HEARTBEAT_TIMEOUT_MS,
    );

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(
                        connection_id = %connection_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let reply = dispatch_frame(&relay, connection_id, raw_message.as_str());
                        if let Some(reply) = reply {
                            if send_event(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        metrics::record_ws_event("binary", true, 0);
                        let reply = RelayError::new(
                            ErrorCode::ValidationFailed,
                            "binary frames are not supported",
                        )
                        .to_frame(None);
                        if send_event(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        debug!(connection_id = %connection_id, error = %error, "socket error");
                        break;
                    }
                }
            }
        }
    }

    relay.disconnect(connection_id);
}

/// Metric label for a frame that failed to decode. Client-chosen names
/// never become labels.
fn decode_error_label(error: &DecodeError) -> &'static str {
    error.known_event().unwrap_or("unknown")
}

/// Decode and dispatch one text frame. Returns the error frame to send back
/// to the client, if any.
fn dispatch_frame(relay: &Relay, connection_id: ConnectionId, raw: &str) -> Option<ServerEvent> {
    let started_at = Instant::now();

    let event = match ClientEvent::decode(raw) {
        Ok(event) => event,
        Err(decode_error) => {
            metrics::record_ws_event(
                decode_error_label(&decode_error),
                true,
                elapsed_ms(started_at),
            );
            debug!(
                connection_id = %connection_id,
                error = %decode_error,
                "inbound frame rejected"
            );
            let error = RelayError::new(ErrorCode::ValidationFailed, decode_error.to_string());
            return Some(error.to_frame(decode_error.event()));
        }
    };

    let event_name = event.name();
    let result = relay.handle_isolated(connection_id, event);
    metrics::record_ws_event(event_name, result.is_err(), elapsed_ms(started_at));

    match result {
        Ok(()) => None,
        Err(error) => {
            if error.code() == ErrorCode::InternalError {
                error!(connection_id = %connection_id, event = event_name, "event failed");
            } else {
                info!(
                    connection_id = %connection_id,
                    event = event_name,
                    code = error.code().as_str(),
                    message = error.message(),
                    "event refused"
                );
            }
            Some(error.to_frame(Some(event_name)))
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = event.encode().map_err(|encode_error| {
        error!(event = event.name(), error = %encode_error, "failed to encode outbound event");
    })?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

fn elapsed_ms(started_at: Instant) -> u64 {
    u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}
