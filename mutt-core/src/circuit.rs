//! Circuit breaker for the forwarder -> sink edge (spec §4.F). State lives
//! in the queue substrate's KV store (`mutt:cb:sink`) and is mutated only
//! inside atomic scripts, so transitions are linearizable across every
//! forwarder replica sharing the key.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mutt_contracts::queue::QueueSubstrate;
use mutt_types::circuit::CircuitPhase;

const GATE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local open_duration = tonumber(ARGV[2])

local state = redis.call('HMGET', key, 'phase', 'opened_at')
local phase = state[1] or 'closed'
local opened_at = tonumber(state[2]) or 0

if phase == 'open' then
    if (now - opened_at) >= open_duration then
        redis.call('HSET', key, 'phase', 'half_open')
        return {1, 'half_open'}
    end
    return {0, 'open'}
end

return {1, phase}
"#;

const REPORT_SCRIPT: &str = r#"
local key = KEYS[1]
local success = ARGV[1]
local now = tonumber(ARGV[2])
local failure_threshold = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'phase', 'consecutive_failures')
local phase = state[1] or 'closed'
local failures = tonumber(state[2]) or 0

if success == '1' then
    redis.call('HSET', key, 'phase', 'closed', 'consecutive_failures', 0)
    return {'closed', 0}
end

failures = failures + 1
if phase == 'half_open' or failures >= failure_threshold then
    redis.call('HSET', key, 'phase', 'open', 'consecutive_failures', failures, 'opened_at', now)
    return {'open', failures}
end

redis.call('HSET', key, 'consecutive_failures', failures)
return {phase, failures}
"#;

fn parse_phase(raw: &str) -> CircuitPhase {
    match raw {
        "open" => CircuitPhase::Open,
        "half_open" => CircuitPhase::HalfOpen,
        _ => CircuitPhase::Closed,
    }
}

/// A request-gate decision: whether the forwarder may contact the sink.
#[derive(Debug, Clone, Copy)]
pub struct GateDecision {
    pub allowed: bool,
    pub phase: CircuitPhase,
}

pub struct CircuitBreaker {
    queue: Arc<dyn QueueSubstrate>,
    key: String,
}

impl CircuitBreaker {
    pub fn new(queue: Arc<dyn QueueSubstrate>) -> Self {
        Self {
            queue,
            key: "mutt:cb:sink".to_string(),
        }
    }

    fn now_secs() -> anyhow::Result<f64> {
        Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64())
    }

    /// Call before attempting delivery. OPEN and not yet expired => denied
    /// (caller should requeue without contacting the sink); OPEN and
    /// expired => flips atomically to HALF_OPEN and allows exactly this
    /// probe through.
    pub async fn gate(&self, open_duration_secs: u64) -> anyhow::Result<GateDecision> {
        let now = Self::now_secs()?;
        let args = vec![now.to_string(), open_duration_secs.to_string()];
        let reply = self
            .queue
            .eval_script(GATE_SCRIPT, &[self.key.as_str()], &args)
            .await?;
        let values = reply.as_array().cloned().unwrap_or_default();
        let allowed = values.first().and_then(|v| v.as_i64()).unwrap_or(1) == 1;
        let phase = values
            .get(1)
            .and_then(|v| v.as_str())
            .map(parse_phase)
            .unwrap_or(CircuitPhase::Closed);
        Ok(GateDecision { allowed, phase })
    }

    /// Call after every delivery attempt to update shared state.
    pub async fn report(&self, success: bool, failure_threshold: u32) -> anyhow::Result<CircuitPhase> {
        let now = Self::now_secs()?;
        let args = vec![
            if success { "1" } else { "0" }.to_string(),
            now.to_string(),
            failure_threshold.to_string(),
        ];
        let reply = self
            .queue
            .eval_script(REPORT_SCRIPT, &[self.key.as_str()], &args)
            .await?;
        let values = reply.as_array().cloned().unwrap_or_default();
        Ok(values
            .first()
            .and_then(|v| v.as_str())
            .map(parse_phase)
            .unwrap_or(CircuitPhase::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutt_contracts::queue::{MockQueueSubstrate, ScriptReply};

    #[test]
    fn parses_known_phases() {
        assert_eq!(parse_phase("open"), CircuitPhase::Open);
        assert_eq!(parse_phase("half_open"), CircuitPhase::HalfOpen);
        assert_eq!(parse_phase("closed"), CircuitPhase::Closed);
        assert_eq!(parse_phase("garbage"), CircuitPhase::Closed);
    }

    #[tokio::test]
    async fn gate_denies_while_open_and_not_yet_expired() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!([0, "open"]))));
        let breaker = CircuitBreaker::new(Arc::new(mock));
        let decision = breaker.gate(60).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.phase, CircuitPhase::Open);
    }

    #[tokio::test]
    async fn gate_flips_to_half_open_once_expired() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!([1, "half_open"]))));
        let breaker = CircuitBreaker::new(Arc::new(mock));
        let decision = breaker.gate(60).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.phase, CircuitPhase::HalfOpen);
    }

    #[tokio::test]
    async fn report_success_resets_to_closed() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!(["closed", 0]))));
        let breaker = CircuitBreaker::new(Arc::new(mock));
        let phase = breaker.report(true, 5).await.unwrap();
        assert_eq!(phase, CircuitPhase::Closed);
    }

    #[tokio::test]
    async fn report_failure_in_half_open_reopens_immediately() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!(["open", 1]))));
        let breaker = CircuitBreaker::new(Arc::new(mock));
        let phase = breaker.report(false, 5).await.unwrap();
        assert_eq!(phase, CircuitPhase::Open);
    }
}
