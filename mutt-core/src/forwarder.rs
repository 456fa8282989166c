//! The rate-limited forwarder (spec §4.F): drains the alert queue to the
//! external sink under a globally coordinated rate limit, with retry,
//! circuit breaker, and dead-letter handling.

use std::sync::Arc;
use std::time::Duration;

use mutt_config::DynConfig;
use mutt_contracts::queue::QueueSubstrate;
use mutt_contracts::sink::{Sink, SinkError};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::circuit::CircuitBreaker;
use crate::dlq::DlqEnvelope;
use crate::heartbeat::HeartbeatLoop;
use crate::janitor::Janitor;
use crate::ratelimit::SlidingWindowRateLimiter;

pub const ALERT_QUEUE: &str = "mutt:alert_queue";
pub const FORWARDER_DLQ: &str = "mutt:dlq:moog";
const PROCESSING_PREFIX: &str = "mutt:processing:moog:";
const HEARTBEAT_PREFIX: &str = "mutt:heartbeat:moog:";
const RATE_LIMIT_KEY: &str = "mutt:ratelimit:sink";

fn processing_list(pod: &str) -> String {
    format!("{PROCESSING_PREFIX}{pod}")
}

fn heartbeat_key(pod: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{pod}")
}

fn retry_counter_key(alert_json: &str) -> String {
    let digest = Sha256::digest(alert_json.as_bytes());
    format!("mutt:retry:{:x}", digest)
}

pub struct Forwarder {
    queue: Arc<dyn QueueSubstrate>,
    sink: Arc<dyn Sink>,
    dyn_config: DynConfig,
    circuit: CircuitBreaker,
    rate_limiter: SlidingWindowRateLimiter,
    pod_id: String,
}

impl Forwarder {
    pub fn new(
        queue: Arc<dyn QueueSubstrate>,
        sink: Arc<dyn Sink>,
        dyn_config: DynConfig,
        pod_id: impl Into<String>,
    ) -> Self {
        Self {
            circuit: CircuitBreaker::new(queue.clone()),
            rate_limiter: SlidingWindowRateLimiter::new(queue.clone()),
            queue,
            sink,
            dyn_config,
            pod_id: pod_id.into(),
        }
    }

    pub async fn startup(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let janitor = Janitor::new(self.queue.clone());
        janitor
            .reclaim(PROCESSING_PREFIX, HEARTBEAT_PREFIX, ALERT_QUEUE)
            .await?;

        let heartbeat_interval = Duration::from_secs(10);
        let heartbeat = HeartbeatLoop::new(
            self.queue.clone(),
            heartbeat_key(&self.pod_id),
            heartbeat_interval,
            heartbeat_interval * 3,
        );
        Ok(heartbeat.spawn(shutdown))
    }

    async fn route_to_dlq(&self, reason: &str, alert_json: &str) {
        let payload = serde_json::from_str(alert_json).unwrap_or(serde_json::Value::Null);
        let envelope = DlqEnvelope::new(reason, payload);
        if let Err(e) = self.queue.push(FORWARDER_DLQ, &envelope.to_json()).await {
            tracing::error!(reason, error = %e, "failed to route alert to forwarder DLQ");
        }
    }

    /// Run one iteration of the main loop. `Ok(true)` if an alert was
    /// handled (delivered, retried, or DLQ'd), `Ok(false)` on an empty pop.
    pub async fn tick(&self) -> anyhow::Result<bool> {
        let list = processing_list(&self.pod_id);
        let alert_json = match self
            .queue
            .atomic_pop_and_stash(ALERT_QUEUE, &list, Duration::from_secs(5))
            .await?
        {
            Some(a) => a,
            None => return Ok(false),
        };

        let open_seconds = self.dyn_config.get_u64("sink_cb_open_seconds", 60).await;
        let gate = self.circuit.gate(open_seconds).await?;
        if !gate.allowed {
            self.queue.push(ALERT_QUEUE, &alert_json).await?;
            self.queue.ack(&list, &alert_json).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            return Ok(true);
        }

        let period_s = self.dyn_config.get_u64("sink_rate_period_s", 1).await;
        let cap = self.dyn_config.get_u64("sink_rate_limit", 100).await;
        let decision = self.rate_limiter.check(RATE_LIMIT_KEY, period_s, cap).await?;
        if !decision.allowed {
            self.queue.push(ALERT_QUEUE, &alert_json).await?;
            self.queue.ack(&list, &alert_json).await?;
            let delay = decision.retry_after_secs.unwrap_or(0.1).max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            return Ok(true);
        }

        let failure_threshold = self.dyn_config.get_u64("sink_cb_failure_threshold", 5).await as u32;
        match self.sink.deliver(&alert_json).await {
            Ok(()) => {
                self.circuit.report(true, failure_threshold).await?;
                self.queue.ack(&list, &alert_json).await?;
            }
            Err(SinkError::Http4xx(status, body)) => {
                warn!(status, body, "sink rejected alert permanently");
                self.route_to_dlq("http_4xx", &alert_json).await;
                self.queue.ack(&list, &alert_json).await?;
            }
            Err(transient) => {
                warn!(error = %transient, "sink delivery transient failure");
                self.circuit.report(false, failure_threshold).await?;
                self.handle_retry(&list, &alert_json).await?;
            }
        }

        Ok(true)
    }

    async fn handle_retry(&self, list: &str, alert_json: &str) -> anyhow::Result<()> {
        let max_retries = self.dyn_config.get_u64("sink_max_retries", 3).await as u32;
        let base_delay = self
            .dyn_config
            .get_duration("sink_retry_base_delay", Duration::from_secs(1))
            .await;
        let max_delay = self
            .dyn_config
            .get_duration("sink_retry_max_delay", Duration::from_secs(30))
            .await;

        let key = retry_counter_key(alert_json);
        let deadline_ttl = max_delay * (max_retries.max(1) + 1);
        let attempts = self.queue.kv_incr(&key, deadline_ttl).await? as u32;

        if attempts <= max_retries {
            let exp = base_delay.saturating_mul(1u32 << attempts.saturating_sub(1).min(20));
            let capped = exp.min(max_delay);
            let jitter_ms = rand::rng().random_range(0..100);
            tokio::time::sleep(capped + Duration::from_millis(jitter_ms)).await;
            self.queue.push(ALERT_QUEUE, alert_json).await?;
            self.queue.ack(list, alert_json).await?;
            info!(attempts, max_retries, "alert retry requeued");
        } else {
            self.route_to_dlq("retry_exhausted", alert_json).await;
            self.queue.ack(list, alert_json).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutt_contracts::queue::MockQueueSubstrate;
    use mutt_contracts::sink::MockSink;
    use serde_json::json;

    fn empty_dyn_config() -> DynConfig {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_get().returning(|_| Ok(None));
        DynConfig::new(Arc::new(mock), "moog-1", Duration::from_secs(5))
    }

    fn expect_closed_circuit_and_open_rate_gate(mock: &mut MockQueueSubstrate) {
        mock.expect_eval_script()
            .withf(|_script, keys: &[&str], args: &[String]| keys[0] == "mutt:cb:sink" && args.len() == 2)
            .returning(|_, _, _| Ok(mutt_contracts::queue::ScriptReply(json!([1, "closed"]))));
        mock.expect_eval_script()
            .withf(|_script, keys: &[&str], args: &[String]| keys[0] == "mutt:cb:sink" && args.len() == 3)
            .returning(|_, _, _| Ok(mutt_contracts::queue::ScriptReply(json!(["closed", 0]))));
        mock.expect_eval_script()
            .withf(|_script, keys: &[&str], _args: &[String]| keys[0] == RATE_LIMIT_KEY)
            .returning(|_, _, _| Ok(mutt_contracts::queue::ScriptReply(json!([1, 1]))));
    }

    #[tokio::test]
    async fn successful_delivery_acks_and_reports_success_to_circuit() {
        let alert_json = r#"{"dummy":"alert"}"#.to_string();
        let popped = alert_json.clone();
        let acked = alert_json.clone();

        let mut queue = MockQueueSubstrate::new();
        queue
            .expect_atomic_pop_and_stash()
            .withf(|src: &str, dst: &str, _t: &Duration| src == ALERT_QUEUE && dst == "mutt:processing:moog:moog-1")
            .returning(move |_, _, _| Ok(Some(popped.clone())));
        expect_closed_circuit_and_open_rate_gate(&mut queue);
        queue
            .expect_ack()
            .withf(move |list: &str, item: &str| list == "mutt:processing:moog:moog-1" && item == acked)
            .returning(|_, _| Ok(()));

        let mut sink = MockSink::new();
        sink.expect_deliver().returning(|_| Ok(()));

        let forwarder = Forwarder::new(Arc::new(queue), Arc::new(sink), empty_dyn_config(), "moog-1");
        let processed = forwarder.tick().await.unwrap();
        assert!(processed);
    }

    #[tokio::test]
    async fn http_4xx_routes_straight_to_dlq_without_retry() {
        let alert_json = r#"{"dummy":"alert"}"#.to_string();
        let popped = alert_json.clone();

        let mut queue = MockQueueSubstrate::new();
        queue
            .expect_atomic_pop_and_stash()
            .returning(move |_, _, _| Ok(Some(popped.clone())));
        expect_closed_circuit_and_open_rate_gate(&mut queue);
        queue
            .expect_push()
            .withf(|list: &str, _item: &str| list == FORWARDER_DLQ)
            .returning(|_, _| Ok(()));
        queue.expect_ack().returning(|_, _| Ok(()));

        let mut sink = MockSink::new();
        sink.expect_deliver()
            .returning(|_| Err(SinkError::Http4xx(400, "bad request".to_string())));

        let forwarder = Forwarder::new(Arc::new(queue), Arc::new(sink), empty_dyn_config(), "moog-1");
        let processed = forwarder.tick().await.unwrap();
        assert!(processed);
    }

    #[tokio::test]
    async fn open_circuit_requeues_without_contacting_sink() {
        let alert_json = r#"{"dummy":"alert"}"#.to_string();
        let popped = alert_json.clone();

        let mut queue = MockQueueSubstrate::new();
        queue
            .expect_atomic_pop_and_stash()
            .returning(move |_, _, _| Ok(Some(popped.clone())));
        queue
            .expect_eval_script()
            .withf(|_script, keys: &[&str], _args: &[String]| keys[0] == "mutt:cb:sink")
            .returning(|_, _, _| Ok(mutt_contracts::queue::ScriptReply(json!([0, "open"]))));
        queue
            .expect_push()
            .withf(|list: &str, _item: &str| list == ALERT_QUEUE)
            .returning(|_, _| Ok(()));
        queue.expect_ack().returning(|_, _| Ok(()));

        let mut sink = MockSink::new();
        sink.expect_deliver().times(0);

        let forwarder = Forwarder::new(Arc::new(queue), Arc::new(sink), empty_dyn_config(), "moog-1");
        let processed = forwarder.tick().await.unwrap();
        assert!(processed);
    }

    #[test]
    fn retry_counter_key_is_stable_for_same_payload() {
        let a = retry_counter_key("same");
        let b = retry_counter_key("same");
        assert_eq!(a, b);
        assert_ne!(a, retry_counter_key("different"));
    }
}
