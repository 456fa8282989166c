//! The external AIOps receiver that forwarded alerts are delivered to.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request timed out")]
    Timeout,
    #[error("sink connection failed: {0}")]
    Connection(String),
    #[error("sink rejected with status {0}: {1}")]
    Http4xx(u16, String),
    #[error("sink transient failure with status {0}: {1}")]
    Http5xx(u16, String),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Health of the sink as observed by a lightweight probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkHealth {
    Healthy,
    Unhealthy,
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver a single alert payload. Transient failures (`Http5xx`,
    /// `Timeout`, `Connection`) are retryable; `Http4xx` is permanent.
    async fn deliver(&self, alert_json: &str) -> SinkResult<()>;

    /// Lightweight liveness probe used by the remediation worker.
    async fn probe_health(&self) -> SinkHealth;
}
