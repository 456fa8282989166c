//! Startup recovery routine shared by the alerter and the forwarder (spec
//! §4.H). Scans processing-list keys under a worker-type prefix and drains
//! any whose paired heartbeat key has expired back into the main queue.

use std::sync::Arc;
use std::time::Duration;

use mutt_contracts::queue::QueueSubstrate;
use tracing::{info, warn};

pub struct Janitor {
    queue: Arc<dyn QueueSubstrate>,
}

impl Janitor {
    pub fn new(queue: Arc<dyn QueueSubstrate>) -> Self {
        Self { queue }
    }

    /// `processing_prefix` e.g. `mutt:processing:alerter:`, `heartbeat_prefix`
    /// e.g. `mutt:heartbeat:alerter:`. Drains every processing list whose pod
    /// suffix has no live heartbeat back to the head of `main_queue`, then
    /// deletes the empty list. Safe under concurrent janitors: draining is
    /// itself a sequence of atomic pops, so a duplicate enqueue from a racing
    /// janitor is merely a harmless at-least-once redelivery.
    pub async fn reclaim(
        &self,
        processing_prefix: &str,
        heartbeat_prefix: &str,
        main_queue: &str,
    ) -> anyhow::Result<u64> {
        let pattern = format!("{processing_prefix}*");
        let processing_lists = self.queue.keys(&pattern).await?;
        let mut reclaimed = 0u64;

        for list_key in processing_lists {
            let pod = match list_key.strip_prefix(processing_prefix) {
                Some(p) => p,
                None => continue,
            };
            let heartbeat_key = format!("{heartbeat_prefix}{pod}");
            if self.queue.kv_exists(&heartbeat_key).await? {
                continue;
            }

            // A short, nonzero timeout: some backends treat a zero timeout on
            // the blocking pop primitive as "block forever", which would hang
            // a janitor pass on an already-empty list.
            let mut drained_from_this_list = 0u64;
            loop {
                match self
                    .queue
                    .atomic_pop_and_stash(&list_key, main_queue, Duration::from_millis(50))
                    .await?
                {
                    Some(_item) => drained_from_this_list += 1,
                    None => break,
                }
            }

            if drained_from_this_list > 0 {
                warn!(
                    pod,
                    list_key,
                    drained = drained_from_this_list,
                    "janitor reclaimed orphaned processing list"
                );
                reclaimed += drained_from_this_list;
            }
            // Best-effort cleanup; an empty list that still exists is harmless,
            // the next scan simply finds it empty and moves on.
            let _ = self.queue.kv_del(&list_key).await;
        }

        if reclaimed > 0 {
            info!(processing_prefix, reclaimed, "janitor pass complete");
        }
        Ok(reclaimed)
    }
}
