use serde::{Deserialize, Serialize};

/// Circuit breaker state for the forwarder -> sink edge, shared across
/// forwarder replicas via the queue substrate's key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    /// Unix millis timestamp of the most recent transition into `Open`.
    pub opened_at_ms: Option<i64>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            consecutive_failures: 0,
            opened_at_ms: None,
        }
    }
}
