//! The per-worker heartbeat loop (spec §4.E/§4.F startup, §5 suspension
//! points). A worker renews its heartbeat key on a fixed interval; the
//! janitor treats an expired heartbeat as proof the worker died with items
//! still on its processing list.

use std::sync::Arc;
use std::time::Duration;

use mutt_contracts::queue::QueueSubstrate;
use tracing::{error, trace};

pub struct HeartbeatLoop {
    queue: Arc<dyn QueueSubstrate>,
    key: String,
    interval: Duration,
    ttl: Duration,
}

impl HeartbeatLoop {
    /// `ttl` should be a multiple of `interval` (spec: "interval H, TTL 3H")
    /// so a single missed tick doesn't cause a false reclaim.
    pub fn new(queue: Arc<dyn QueueSubstrate>, key: impl Into<String>, interval: Duration, ttl: Duration) -> Self {
        Self {
            queue,
            key: key.into(),
            interval,
            ttl,
        }
    }

    pub fn spawn(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.queue.kv_set(&self.key, "1", Some(self.ttl)).await {
                    error!(key = %self.key, error = %e, "heartbeat renewal failed");
                } else {
                    trace!(key = %self.key, "heartbeat renewed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let _ = self.queue.kv_del(&self.key).await;
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutt_contracts::queue::MockQueueSubstrate;

    #[tokio::test(start_paused = true)]
    async fn deletes_its_key_on_clean_shutdown() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_set()
            .withf(|key: &str, value: &str, ttl: &Option<Duration>| {
                key == "mutt:heartbeat:alerter:p1" && value == "1" && ttl.is_some()
            })
            .returning(|_, _, _| Ok(()));
        mock.expect_kv_del()
            .withf(|key: &str| key == "mutt:heartbeat:alerter:p1")
            .returning(|_| Ok(()));

        let (tx, rx) = tokio::sync::watch::channel(false);
        let loop_ = HeartbeatLoop::new(
            Arc::new(mock),
            "mutt:heartbeat:alerter:p1",
            Duration::from_secs(30),
            Duration::from_secs(90),
        );
        let handle = loop_.spawn(rx);
        tokio::time::sleep(Duration::from_millis(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
