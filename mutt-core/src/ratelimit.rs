//! The sliding-window rate limiter shared by the ingest gateway (§4.D) and
//! the forwarder (§4.F). Backed by a single atomic script so the cap is
//! honored faithfully across every replica sharing the key.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mutt_contracts::queue::QueueSubstrate;

/// Sorted-set sliding window: drop entries older than `now - period`, then
/// admit iff the remaining cardinality is below `cap`.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local period = tonumber(ARGV[2])
local cap = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, 0, now - period)
local current = redis.call('ZCARD', key)

if current < cap then
    redis.call('ZADD', key, now, member)
    redis.call('EXPIRE', key, period)
    return {1, current + 1}
else
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local delta = period
    if oldest[2] ~= nil then
        delta = (tonumber(oldest[2]) + period) - now
    end
    return {0, current, delta}
end
"#;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current_count: i64,
    /// Seconds until the next admission would succeed, only set on denial.
    pub retry_after_secs: Option<f64>,
}

pub struct SlidingWindowRateLimiter {
    queue: Arc<dyn QueueSubstrate>,
}

impl SlidingWindowRateLimiter {
    pub fn new(queue: Arc<dyn QueueSubstrate>) -> Self {
        Self { queue }
    }

    pub async fn check(
        &self,
        key: &str,
        period_secs: u64,
        cap: u64,
    ) -> anyhow::Result<RateLimitDecision> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
        let member = format!("{now}-{}", uuid::Uuid::new_v4());
        let args = vec![
            now.to_string(),
            period_secs.to_string(),
            cap.to_string(),
            member,
        ];
        let reply = self
            .queue
            .eval_script(SLIDING_WINDOW_SCRIPT, &[key], &args)
            .await?;
        let values = reply.as_array().cloned().unwrap_or_default();
        let allowed = values.first().and_then(|v| v.as_i64()).unwrap_or(0) == 1;
        let current_count = values.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
        let retry_after_secs = if allowed {
            None
        } else {
            values.get(2).and_then(|v| v.as_f64())
        };
        Ok(RateLimitDecision {
            allowed,
            current_count,
            retry_after_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutt_contracts::queue::{MockQueueSubstrate, ScriptReply};

    #[tokio::test]
    async fn admits_under_cap() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!([1, 5]))));
        let limiter = SlidingWindowRateLimiter::new(Arc::new(mock));
        let decision = limiter.check("mutt:ratelimit:sink", 1, 100).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current_count, 5);
        assert!(decision.retry_after_secs.is_none());
    }

    #[tokio::test]
    async fn denies_over_cap_with_retry_hint() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_eval_script()
            .returning(|_, _, _| Ok(ScriptReply(serde_json::json!([0, 100, 0.25]))));
        let limiter = SlidingWindowRateLimiter::new(Arc::new(mock));
        let decision = limiter.check("mutt:ratelimit:sink", 1, 100).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(0.25));
    }
}
