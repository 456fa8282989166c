//! Unhandled-event aggregation (spec §3 UnhandledBucket, §4.E step 8).
//! Events that no rule matches are counted per `(hostname, fingerprint)`;
//! crossing a threshold atomically renames the counter to a sealed key, and
//! only the replica that wins the rename emits the meta-alert, guaranteeing
//! single emission across replicas.

use std::sync::Arc;
use std::time::Duration;

use mutt_contracts::queue::QueueSubstrate;
use uuid::Uuid;

fn counter_key(hostname: &str, fingerprint: &str) -> String {
    format!("mutt:unhandled:{hostname}:{fingerprint}")
}

fn sealed_key(hostname: &str, fingerprint: &str) -> String {
    format!(
        "mutt:unhandled:sealed:{hostname}:{fingerprint}:{}",
        Uuid::new_v4()
    )
}

/// Outcome of recording one unhandled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhandledOutcome {
    /// Counted, threshold not yet reached.
    Counted,
    /// This call crossed the threshold and won the seal race: the caller
    /// should emit exactly one meta-alert.
    Sealed,
    /// Threshold crossed by another replica first; nothing to emit here.
    AlreadySealedElsewhere,
}

pub struct UnhandledTracker {
    queue: Arc<dyn QueueSubstrate>,
}

impl UnhandledTracker {
    pub fn new(queue: Arc<dyn QueueSubstrate>) -> Self {
        Self { queue }
    }

    pub async fn record(
        &self,
        hostname: &str,
        fingerprint: &str,
        threshold: u64,
        expiry: Duration,
    ) -> anyhow::Result<UnhandledOutcome> {
        let key = counter_key(hostname, fingerprint);
        let new_value = self.queue.kv_incr(&key, expiry).await?;
        if (new_value as u64) < threshold {
            return Ok(UnhandledOutcome::Counted);
        }

        let sealed = sealed_key(hostname, fingerprint);
        if self.queue.rename(&key, &sealed).await? {
            Ok(UnhandledOutcome::Sealed)
        } else {
            Ok(UnhandledOutcome::AlreadySealedElsewhere)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutt_contracts::queue::MockQueueSubstrate;

    #[tokio::test]
    async fn counts_below_threshold_without_renaming() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_incr()
            .withf(|key: &str, _ttl: &Duration| key == "mutt:unhandled:h1:fp1")
            .returning(|_, _| Ok(1));
        mock.expect_rename().times(0);

        let tracker = UnhandledTracker::new(Arc::new(mock));
        let outcome = tracker
            .record("h1", "fp1", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, UnhandledOutcome::Counted);
    }

    #[tokio::test]
    async fn seals_and_reports_winner_on_threshold_cross() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_incr().returning(|_, _| Ok(3));
        mock.expect_rename()
            .withf(|src: &str, dst: &str| {
                src == "mutt:unhandled:h1:fp1" && dst.starts_with("mutt:unhandled:sealed:h1:fp1:")
            })
            .returning(|_, _| Ok(true));

        let tracker = UnhandledTracker::new(Arc::new(mock));
        let outcome = tracker
            .record("h1", "fp1", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, UnhandledOutcome::Sealed);
    }

    #[tokio::test]
    async fn reports_already_sealed_when_rename_loses_race() {
        let mut mock = MockQueueSubstrate::new();
        mock.expect_kv_incr().returning(|_, _| Ok(4));
        mock.expect_rename().returning(|_, _| Ok(false));

        let tracker = UnhandledTracker::new(Arc::new(mock));
        let outcome = tracker
            .record("h1", "fp1", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(outcome, UnhandledOutcome::AlreadySealedElsewhere);
    }
}
