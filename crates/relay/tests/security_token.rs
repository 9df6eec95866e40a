const JWT_SOURCE: &str = include_str!("../src/auth/jwt.rs");
const AUTH_SOURCE: &str = include_str!("../src/auth/mod.rs");
const WS_SOURCE: &str = include_str!("../src/ws/mod.rs");
const RELAY_SOURCE: &str = include_str!("../src/relay.rs");

#[test]
fn identity_tokens_are_strictly_validated() {
    assert!(JWT_SOURCE.contains("validation.leeway = 0"), "expiry must not be relaxed");
    assert!(
        JWT_SOURCE.contains("set_required_spec_claims(&[\"exp\", \"sub\"])"),
        "identity tokens must carry exp and sub"
    );
    assert!(JWT_SOURCE.contains("secret.len() < 32"), "short HS256 secrets must be refused");
    assert!(
        JWT_SOURCE.contains("rejects_expired_tokens"),
        "unit coverage must reject expired identity tokens"
    );
}

#[test]
fn invalid_tokens_are_refused_before_the_socket_opens() {
    let identity = WS_SOURCE.find("resolve_identity(").expect("upgrade must resolve identity");
    let upgrade = WS_SOURCE.find(".on_upgrade(").expect("upgrade must accept the socket");
    assert!(identity < upgrade, "identity must be checked before the upgrade completes");
    assert!(
        AUTH_SOURCE.contains("ErrorCode::AuthInvalidToken"),
        "a presented but invalid token must map to AUTH_INVALID_TOKEN"
    );
}

#[test]
fn connections_cannot_switch_identity() {
    assert!(
        RELAY_SOURCE.contains("binding_a_second_identity_is_refused"),
        "relay coverage must refuse rebinding a connection to another user"
    );
    assert!(
        RELAY_SOURCE.contains("spoofed_sender_is_refused"),
        "relay coverage must refuse payload identities that differ from the binding"
    );
}
