use std::sync::Arc;

use mutt_config::{DynConfig, StaticConfig};
use mutt_contracts::queue::QueueSubstrate;
use mutt_core::ratelimit::SlidingWindowRateLimiter;

/// Shared state for the ingest gateway's axum handlers.
#[derive(Clone)]
pub struct IngestState {
    pub queue: Arc<dyn QueueSubstrate>,
    pub dyn_config: DynConfig,
    pub rate_limiter: Arc<SlidingWindowRateLimiter>,
    pub static_config: Arc<StaticConfig>,
}
