use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// A credential that supports "current/next" rotation: connection code
/// tries `current` first, then falls back to `next` on auth failure, so an
/// operator can roll credentials without a coordinated restart.
#[derive(Debug, Clone)]
pub struct RotatingSecret {
    pub current: String,
    pub next: Option<String>,
}

impl RotatingSecret {
    fn from_env(current_var: &str, next_var: &str) -> Result<Self> {
        let current = env::var(current_var)
            .with_context(|| format!("{current_var} must be set"))?;
        let next = env::var(next_var).ok().filter(|s| !s.is_empty());
        Ok(Self { current, next })
    }

    /// Every candidate to try, in order: current first, then next.
    pub fn candidates(&self) -> Vec<&str> {
        let mut v = vec![self.current.as_str()];
        if let Some(next) = &self.next {
            v.push(next.as_str());
        }
        v
    }
}

/// Process-level configuration loaded once at startup via the environment
/// (or an external secrets provider feeding the same variables). Unlike
/// `DynConfig`, nothing here can change without a restart.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub server_host: String,
    pub server_port: u16,

    pub queue_url: String,
    pub database_url: String,
    pub sink_url: String,

    /// Stable identity of this replica, used for processing-list and
    /// heartbeat key suffixes (`mutt:processing:alerter:{pod}`).
    pub pod_id: String,

    pub api_key: RotatingSecret,
    pub sink_auth_token: RotatingSecret,

    pub ingest_max_body_bytes: usize,

    pub queue_pop_timeout: Duration,
    pub sink_http_timeout: Duration,
    pub audit_db_timeout: Duration,
    pub config_read_timeout: Duration,

    /// Heartbeat interval H; TTL on the heartbeat key is `3 * H`.
    pub heartbeat_interval: Duration,

    pub shutdown_grace_period: Duration,

    /// min/max size of the bounded connection pool shared per replica for
    /// both the queue substrate and the audit store.
    pub pool_min_connections: u32,
    pub pool_max_connections: u32,
}

impl StaticConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server_host: env::var("MUTT_SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            server_port: env::var("MUTT_SERVER_PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()
                .context("MUTT_SERVER_PORT must be a u16")?,

            queue_url: env::var("MUTT_QUEUE_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            database_url: env::var("MUTT_DATABASE_URL")
                .context("MUTT_DATABASE_URL must be set")?,
            sink_url: env::var("MUTT_SINK_URL").context("MUTT_SINK_URL must be set")?,

            pod_id: env::var("MUTT_POD_ID").unwrap_or_else(|_| {
                format!("pod-{}", uuid::Uuid::new_v4().simple())
            }),

            api_key: RotatingSecret::from_env("MUTT_API_KEY", "MUTT_API_KEY_NEXT")?,
            sink_auth_token: RotatingSecret::from_env(
                "MUTT_SINK_AUTH_TOKEN",
                "MUTT_SINK_AUTH_TOKEN_NEXT",
            )?,

            ingest_max_body_bytes: env::var("MUTT_INGEST_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16 * 1024 * 1024),

            queue_pop_timeout: parse_duration_env("MUTT_QUEUE_POP_TIMEOUT", "5s")?,
            sink_http_timeout: parse_duration_env("MUTT_SINK_HTTP_TIMEOUT", "10s")?,
            audit_db_timeout: parse_duration_env("MUTT_AUDIT_DB_TIMEOUT", "5s")?,
            config_read_timeout: parse_duration_env("MUTT_CONFIG_READ_TIMEOUT", "2s")?,
            heartbeat_interval: parse_duration_env("MUTT_HEARTBEAT_INTERVAL", "10s")?,
            shutdown_grace_period: parse_duration_env("MUTT_SHUTDOWN_GRACE_PERIOD", "30s")?,

            pool_min_connections: env::var("MUTT_POOL_MIN_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            pool_max_connections: env::var("MUTT_POOL_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        })
    }

    /// TTL a worker's heartbeat key is set with; `3 * heartbeat_interval` per
    /// the spec's invariant that an absent heartbeat means the janitor may
    /// reclaim the worker's processing list.
    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

fn parse_duration_env(var: &str, default: &str) -> Result<Duration> {
    let raw = env::var(var).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(&raw).with_context(|| format!("invalid duration in {var}: {raw}"))
}
