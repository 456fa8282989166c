//! Poison-message tracking (spec §4.E, §7): a per-payload retry counter
//! bounds how many times a message that keeps blowing up processing is
//! retried before it is quarantined to a DLQ.

use std::sync::Arc;
use std::time::Duration;

use mutt_contracts::queue::QueueSubstrate;
use sha2::{Digest, Sha256};

fn fingerprint(raw_payload: &str) -> String {
    let digest = Sha256::digest(raw_payload.as_bytes());
    format!("mutt:poison:{:x}", digest)
}

pub struct PoisonTracker {
    queue: Arc<dyn QueueSubstrate>,
}

impl PoisonTracker {
    pub fn new(queue: Arc<dyn QueueSubstrate>) -> Self {
        Self { queue }
    }

    /// Increment the retry counter for `raw_payload` and report whether the
    /// item has now exceeded `max_retries` and should be quarantined.
    pub async fn record_failure(
        &self,
        raw_payload: &str,
        max_retries: u32,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let key = fingerprint(raw_payload);
        let attempts = self.queue.kv_incr(&key, ttl).await?;
        Ok(attempts as u32 > max_retries)
    }
}
