//! The remediation worker (spec §4.G): probes sink health, replays
//! dead-lettered alerts in batches once the sink recovers, and quarantines
//! messages that keep failing replay ("poison").

use std::sync::Arc;

use mutt_config::DynConfig;
use mutt_contracts::queue::QueueSubstrate;
use mutt_contracts::sink::{Sink, SinkHealth};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{info, warn};

use crate::dlq::DlqEnvelope;

pub const ALERT_QUEUE: &str = "mutt:alert_queue";
const DEAD_LIST: &str = "mutt:dlq:dead";
const STAGING_PREFIX: &str = "mutt:processing:remediation:";

fn replay_counter_key(item: &str) -> String {
    let digest = Sha256::digest(item.as_bytes());
    format!("mutt:replay:{:x}", digest)
}

/// A per-target staging list for the atomic pop-and-stash handoff. Replay
/// must unwrap the `DlqEnvelope` before the payload reaches `ALERT_QUEUE`,
/// so the DLQ item is first stashed here rather than moved straight into
/// the alert queue.
fn staging_list(target: &str) -> String {
    format!("{STAGING_PREFIX}{}", target.replace(':', "_"))
}

pub struct RemediationWorker {
    queue: Arc<dyn QueueSubstrate>,
    sink: Arc<dyn Sink>,
    dyn_config: DynConfig,
    /// DLQ targets drained in order, moog-DLQ first per spec §4.G.
    dlq_targets: Vec<&'static str>,
}

impl RemediationWorker {
    pub fn new(queue: Arc<dyn QueueSubstrate>, sink: Arc<dyn Sink>, dyn_config: DynConfig) -> Self {
        Self {
            queue,
            sink,
            dyn_config,
            dlq_targets: vec![crate::forwarder::FORWARDER_DLQ, crate::alerter::ALERTER_DLQ],
        }
    }

    /// Run one remediation cycle. Returns the number of items replayed.
    pub async fn run_cycle(&self) -> anyhow::Result<u64> {
        if !self.dyn_config.get_bool("remediation_enabled", true).await {
            return Ok(0);
        }

        let healthy = matches!(self.sink.probe_health().await, SinkHealth::Healthy);
        if !healthy {
            info!("sink unhealthy, skipping remediation cycle");
            return Ok(0);
        }

        let batch_size = self.dyn_config.get_u64("remediation_batch_size", 50).await;
        let max_poison_retries = self.dyn_config.get_u64("max_poison_retries", 5).await;

        let mut replayed = 0u64;
        for target in &self.dlq_targets {
            replayed += self.drain_target(target, batch_size, max_poison_retries).await?;
        }
        Ok(replayed)
    }

    async fn drain_target(&self, target: &str, batch_size: u64, max_poison_retries: u64) -> anyhow::Result<u64> {
        let staging = staging_list(target);
        let mut drained = 0u64;
        for _ in 0..batch_size {
            // A short nonblocking timeout against the DLQ itself, stashing
            // into a staging list rather than straight into the alert queue:
            // the popped item is still envelope-wrapped and must be unwrapped
            // before anything downstream sees it.
            let item = match self
                .queue
                .atomic_pop_and_stash(target, &staging, Duration::from_millis(50))
                .await?
            {
                Some(item) => item,
                None => break,
            };

            let key = replay_counter_key(&item);
            let attempts = self.queue.kv_incr(&key, Duration::from_secs(86_400)).await? as u64;
            if attempts > max_poison_retries {
                // Move straight to the terminal dead list instead of letting
                // it re-enter the alert queue again.
                self.queue.push(DEAD_LIST, &item).await?;
                self.queue.ack(&staging, &item).await?;
                warn!(target, attempts, "item exceeded poison replay budget, quarantined");
                continue;
            }

            let envelope: DlqEnvelope = match serde_json::from_str(&item) {
                Ok(e) => e,
                Err(e) => {
                    warn!(target, error = %e, "dlq item failed to parse as an envelope, quarantining");
                    self.queue.push(DEAD_LIST, &item).await?;
                    self.queue.ack(&staging, &item).await?;
                    continue;
                }
            };
            let payload_json = serde_json::to_string(&envelope.raw_payload)?;
            self.queue.push(ALERT_QUEUE, &payload_json).await?;
            self.queue.ack(&staging, &item).await?;
            drained += 1;
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutt_contracts::queue::MockQueueSubstrate;
    use mutt_contracts::sink::MockSink;

    fn empty_dyn_config() -> DynConfig {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_get().returning(|_| Ok(None));
        DynConfig::new(Arc::new(mock), "remediation-1", Duration::from_secs(5))
    }

    fn disabled_dyn_config() -> DynConfig {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_get()
            .withf(|k: &str| k == "mutt:config:remediation_enabled")
            .returning(|_| Ok(Some("false".to_string())));
        DynConfig::new(Arc::new(mock), "remediation-1", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn disabled_flag_skips_the_cycle_entirely() {
        let queue = MockQueueSubstrate::new();
        let mut sink = MockSink::new();
        sink.expect_probe_health().times(0);

        let worker = RemediationWorker::new(Arc::new(queue), Arc::new(sink), disabled_dyn_config());
        let replayed = worker.run_cycle().await.unwrap();
        assert_eq!(replayed, 0);
    }

    #[tokio::test]
    async fn unhealthy_sink_skips_the_cycle() {
        let mut queue = MockQueueSubstrate::new();
        queue.expect_atomic_pop_and_stash().times(0);
        let mut sink = MockSink::new();
        sink.expect_probe_health().returning(|| SinkHealth::Unhealthy);

        let worker = RemediationWorker::new(Arc::new(queue), Arc::new(sink), empty_dyn_config());
        let replayed = worker.run_cycle().await.unwrap();
        assert_eq!(replayed, 0);
    }

    #[tokio::test]
    async fn healthy_sink_drains_both_dlqs_and_replays_the_unwrapped_payload() {
        let envelope_json =
            DlqEnvelope::new("http_4xx", serde_json::json!({"alert": "one"})).to_json();
        let popped = envelope_json.clone();

        let mut queue = MockQueueSubstrate::new();
        let mut alerter_calls = 0u32;
        queue.expect_atomic_pop_and_stash().returning(move |src, dst, _t| {
            if src == crate::alerter::ALERTER_DLQ {
                assert_eq!(dst, staging_list(crate::alerter::ALERTER_DLQ));
                alerter_calls += 1;
                if alerter_calls == 1 {
                    Ok(Some(popped.clone()))
                } else {
                    Ok(None)
                }
            } else {
                Ok(None)
            }
        });
        queue.expect_kv_incr().returning(|_, _| Ok(1));
        queue
            .expect_push()
            .withf(|list: &str, item: &str| {
                list == ALERT_QUEUE && serde_json::from_str::<serde_json::Value>(item).unwrap() == serde_json::json!({"alert": "one"})
            })
            .returning(|_, _| Ok(()));
        queue
            .expect_ack()
            .withf(|list: &str, _item: &str| list == staging_list(crate::alerter::ALERTER_DLQ))
            .returning(|_, _| Ok(()));

        let mut sink = MockSink::new();
        sink.expect_probe_health().returning(|| SinkHealth::Healthy);

        let worker = RemediationWorker::new(Arc::new(queue), Arc::new(sink), empty_dyn_config());
        let replayed = worker.run_cycle().await.unwrap();
        assert_eq!(replayed, 1);
    }

    #[tokio::test]
    async fn item_past_poison_budget_is_quarantined_with_the_full_envelope_not_replayed() {
        let envelope_json =
            DlqEnvelope::new("http_4xx", serde_json::json!({"alert": "poisoned"})).to_json();
        let popped = envelope_json.clone();
        let quarantined = envelope_json.clone();

        let mut queue = MockQueueSubstrate::new();
        let mut calls = 0u32;
        queue.expect_atomic_pop_and_stash().returning(move |src, _dst, _t| {
            if src == crate::forwarder::FORWARDER_DLQ {
                calls += 1;
                if calls == 1 {
                    Ok(Some(popped.clone()))
                } else {
                    Ok(None)
                }
            } else {
                Ok(None)
            }
        });
        queue.expect_kv_incr().returning(|_, _| Ok(6));
        queue
            .expect_ack()
            .withf(|list: &str, _item: &str| list == staging_list(crate::forwarder::FORWARDER_DLQ))
            .returning(|_, _| Ok(()));
        queue
            .expect_push()
            .withf(move |list: &str, item: &str| list == DEAD_LIST && item == quarantined)
            .returning(|_, _| Ok(()));

        let mut sink = MockSink::new();
        sink.expect_probe_health().returning(|| SinkHealth::Healthy);

        let worker = RemediationWorker::new(Arc::new(queue), Arc::new(sink), empty_dyn_config());
        let replayed = worker.run_cycle().await.unwrap();
        assert_eq!(replayed, 0);
    }

    #[tokio::test]
    async fn unparseable_dlq_item_is_quarantined_instead_of_replayed() {
        let garbage = "not json at all".to_string();
        let popped = garbage.clone();
        let quarantined = garbage.clone();

        let mut queue = MockQueueSubstrate::new();
        let mut calls = 0u32;
        queue.expect_atomic_pop_and_stash().returning(move |src, _dst, _t| {
            if src == crate::forwarder::FORWARDER_DLQ {
                calls += 1;
                if calls == 1 {
                    Ok(Some(popped.clone()))
                } else {
                    Ok(None)
                }
            } else {
                Ok(None)
            }
        });
        queue.expect_kv_incr().returning(|_, _| Ok(1));
        queue.expect_ack().returning(|_, _| Ok(()));
        queue
            .expect_push()
            .withf(move |list: &str, item: &str| list == DEAD_LIST && item == quarantined)
            .returning(|_, _| Ok(()));

        let mut sink = MockSink::new();
        sink.expect_probe_health().returning(|| SinkHealth::Healthy);

        let worker = RemediationWorker::new(Arc::new(queue), Arc::new(sink), empty_dyn_config());
        let replayed = worker.run_cycle().await.unwrap();
        assert_eq!(replayed, 0);
    }

    #[test]
    fn replay_counter_key_is_stable_for_same_item() {
        let a = replay_counter_key("same");
        let b = replay_counter_key("same");
        assert_eq!(a, b);
        assert_ne!(a, replay_counter_key("different"));
    }

    #[test]
    fn staging_list_is_distinct_per_target() {
        assert_ne!(
            staging_list(crate::forwarder::FORWARDER_DLQ),
            staging_list(crate::alerter::ALERTER_DLQ)
        );
    }
}
