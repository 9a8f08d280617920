//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the hub can start with zero configuration
//! for local development. Production deployments must set a session
//! signing secret; startup refuses to continue without one.

use std::net::SocketAddr;
use std::time::Duration;

use veillee_shared::constants::{
    ACTIVITY_TIMEOUT_SECS, DEFAULT_HTTP_PORT, PING_INTERVAL_SECS, ROOM_EMPTY_GRACE_SECS,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Symmetric secret for verifying session tokens (HS256).
    /// Env: `SESSION_SECRET`
    /// Default: unset (production refuses to start).
    pub session_secret: Option<String>,

    /// Expected `aud` claim of session tokens. Unset or empty switches the
    /// verifier into development-mode acceptance of unsigned tokens.
    /// Env: `TOKEN_AUDIENCE`
    /// Default: unset.
    pub token_audience: Option<String>,

    /// Origins allowed by CORS, comma-separated. Empty means allow-all in
    /// development and deny-all in production.
    /// Env: `CORS_ORIGINS`
    /// Default: empty.
    pub cors_origins: Vec<String>,

    /// Encryption flag applied to rooms created without an explicit value.
    /// Env: `DEFAULT_ENCRYPTION_REQUIRED` (true/false)
    /// Default: `false`
    pub default_encryption_required: bool,

    /// Redis endpoint for the metadata mirror. Unset disables mirroring.
    /// Env: `CACHE_URL`
    /// Default: unset.
    pub cache_url: Option<String>,

    /// How long an empty room survives before deletion.
    /// Env: `ROOM_EMPTY_GRACE_SECS`
    /// Default: `86400` (one day)
    pub room_empty_grace: Duration,

    /// Interval between server liveness pings.
    /// Env: `PING_INTERVAL_SECS`
    /// Default: `15`
    pub ping_interval: Duration,

    /// Window without any inbound activity after which a connection is
    /// force-closed.
    /// Env: `ACTIVITY_TIMEOUT_SECS`
    /// Default: `7200` (two hours)
    pub activity_timeout: Duration,

    /// Whether this is a production deployment.
    /// Env: `ENVIRONMENT` (`development`/`production`)
    /// Default: `development`
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            session_secret: None,
            token_audience: None,
            cors_origins: Vec::new(),
            default_encryption_required: false,
            cache_url: None,
            room_empty_grace: Duration::from_secs(ROOM_EMPTY_GRACE_SECS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            activity_timeout: Duration::from_secs(ACTIVITY_TIMEOUT_SECS),
            production: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults. Invalid values log a warning and keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(secret) = std::env::var("SESSION_SECRET") {
            if !secret.is_empty() {
                config.session_secret = Some(secret);
            }
        }

        if let Ok(aud) = std::env::var("TOKEN_AUDIENCE") {
            if !aud.trim().is_empty() {
                config.token_audience = Some(aud);
            }
        }

        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            config.cors_origins = parse_origins(&origins);
        }

        if let Ok(val) = std::env::var("DEFAULT_ENCRYPTION_REQUIRED") {
            config.default_encryption_required = val != "false" && val != "0";
        }

        if let Ok(url) = std::env::var("CACHE_URL") {
            if !url.is_empty() {
                config.cache_url = Some(url);
            }
        }

        config.room_empty_grace = duration_var("ROOM_EMPTY_GRACE_SECS", config.room_empty_grace);
        config.ping_interval = duration_var("PING_INTERVAL_SECS", config.ping_interval);
        config.activity_timeout = duration_var("ACTIVITY_TIMEOUT_SECS", config.activity_timeout);

        if let Ok(env_name) = std::env::var("ENVIRONMENT") {
            config.production = env_name.eq_ignore_ascii_case("production");
        }

        config
    }

    /// Reject configurations that must not reach production.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.production && self.session_secret.is_none() {
            anyhow::bail!("SESSION_SECRET must be set when ENVIRONMENT=production");
        }
        if self.production && self.token_audience.is_none() {
            tracing::warn!(
                "TOKEN_AUDIENCE is unset in production: session tokens will NOT be \
                 signature-checked"
            );
        }
        Ok(())
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn duration_var(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Err(_) => default,
        Ok(val) => match val.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                tracing::warn!(var = name, value = %val, "Invalid duration, using default");
                default
            }
        },
    }
}
