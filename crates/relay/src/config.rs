// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::{net::SocketAddr, time::Duration};

use crate::presence::{DEFAULT_IDLE_AFTER, DEFAULT_TYPING_TIMEOUT};

const DEV_JWT_SECRET: &str = "taskhub_local_development_jwt_secret_32ch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with the identity provider.
    pub jwt_secret: String,
    /// Refuse WebSocket upgrades that carry no identity token.
    pub require_token: bool,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `taskhub_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Server-side ring timeout. `None` leaves giving up to the caller.
    pub ring_timeout: Option<Duration>,
    pub typing_timeout: Duration,
    pub idle_after: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TASKHUB_RELAY_HOST` | `0.0.0.0` |
    /// | `TASKHUB_RELAY_PORT` | `8080` |
    /// | `TASKHUB_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `TASKHUB_RELAY_REQUIRE_TOKEN` | `false` |
    /// | `TASKHUB_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `TASKHUB_RELAY_LOG_FILTER` | `info` |
    /// | `TASKHUB_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `TASKHUB_RELAY_RING_TIMEOUT_SECS` | `0` (disabled) |
    /// | `TASKHUB_RELAY_TYPING_TIMEOUT_SECS` | `5` |
    /// | `TASKHUB_RELAY_IDLE_AFTER_SECS` | `300` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TASKHUB_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("TASKHUB_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("TASKHUB_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let require_token =
            env("TASKHUB_RELAY_REQUIRE_TOKEN").ok().is_some_and(|v| parse_flag(&v));
        let cors_origins = env("TASKHUB_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("TASKHUB_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("TASKHUB_RELAY_LOG_FORMAT") {
            Ok(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let secs = |key: &str| env(key).ok().and_then(|v| v.trim().parse::<u64>().ok());
        let ring_timeout =
            secs("TASKHUB_RELAY_RING_TIMEOUT_SECS").filter(|s| *s > 0).map(Duration::from_secs);
        let typing_timeout = secs("TASKHUB_RELAY_TYPING_TIMEOUT_SECS")
            .filter(|s| *s > 0)
            .map_or(DEFAULT_TYPING_TIMEOUT, Duration::from_secs);
        let idle_after = secs("TASKHUB_RELAY_IDLE_AFTER_SECS")
            .filter(|s| *s > 0)
            .map_or(DEFAULT_IDLE_AFTER, Duration::from_secs);

        Self {
            listen_addr,
            jwt_secret,
            require_token,
            cors_origins,
            log_filter,
            log_format,
            ring_timeout,
            typing_timeout,
            idle_after,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(!cfg.require_token);
        assert!(cfg.cors_origins.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert!(cfg.ring_timeout.is_none());
        assert_eq!(cfg.typing_timeout, Duration::from_secs(5));
        assert_eq!(cfg.idle_after, Duration::from_secs(300));
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_HOST", "127.0.0.1");
        m.insert("TASKHUB_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn require_token_accepts_common_truthy_spellings() {
        let cases = [("true", true), ("1", true), ("YES", true), ("false", false), ("", false)];
        for (raw, expected) in cases {
            let mut m = HashMap::new();
            m.insert("TASKHUB_RELAY_REQUIRE_TOKEN", raw);
            let cfg = RelayConfig::from_env_fn(env_from_map(m));
            assert_eq!(cfg.require_token, expected, "value {raw:?}");
        }
    }

    #[test]
    fn json_log_format_and_filter_override() {
        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_LOG_FORMAT", "JSON");
        m.insert("TASKHUB_RELAY_LOG_FILTER", "debug,tower_http=trace");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }

    #[test]
    fn ring_timeout_is_opt_in() {
        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_RING_TIMEOUT_SECS", "0");
        assert!(RelayConfig::from_env_fn(env_from_map(m)).ring_timeout.is_none());

        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_RING_TIMEOUT_SECS", "45");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.ring_timeout, Some(Duration::from_secs(45)));
    }

    #[test]
    fn presence_windows_ignore_zero_and_garbage() {
        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_TYPING_TIMEOUT_SECS", "0");
        m.insert("TASKHUB_RELAY_IDLE_AFTER_SECS", "ten");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.typing_timeout, DEFAULT_TYPING_TIMEOUT);
        assert_eq!(cfg.idle_after, DEFAULT_IDLE_AFTER);

        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_TYPING_TIMEOUT_SECS", "8");
        m.insert("TASKHUB_RELAY_IDLE_AFTER_SECS", "60");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.typing_timeout, Duration::from_secs(8));
        assert_eq!(cfg.idle_after, Duration::from_secs(60));
    }

    #[test]
    fn cors_origins_from_env() {
        let mut m = HashMap::new();
        m.insert("TASKHUB_RELAY_CORS_ORIGINS", "https://app.taskhub.dev");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.cors_origins.as_deref(), Some("https://app.taskhub.dev"));
    }
}
