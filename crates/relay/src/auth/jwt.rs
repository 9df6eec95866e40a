use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use taskhub_common::types::UserId;

pub const IDENTITY_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Verifies HS256 identity tokens minted by the identity provider. The relay
/// only learns who a connection is; it never decides what they may see.
#[derive(Clone)]
pub struct IdentityTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl IdentityTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Mint a token for `user_id`. Used by tests and local tooling.
    pub fn issue_identity_token(&self, user_id: &UserId) -> anyhow::Result<String> {
        self.issue_identity_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_identity_token_at(&self, user_id: &UserId, issued_at: i64) -> anyhow::Result<String> {
        let claims = IdentityClaims {
            sub: user_id.to_string(),
            iat: issued_at,
            exp: issued_at + IDENTITY_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode identity token")
    }

    pub fn validate_identity_token(&self, token: &str) -> anyhow::Result<UserId> {
        let claims = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode identity token")?
            .claims;

        UserId::new(claims.sub.as_str())
            .with_context(|| format!("identity token subject '{}' is not a user id", claims.sub))
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
