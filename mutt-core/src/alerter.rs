//! The rule-matching engine (spec §4.E): crash-safe consume of the ingest
//! queue, classification, audit persistence, and either an alert-queue push
//! or unhandled-bucket aggregation.

use std::sync::Arc;
use std::time::Duration;

use mutt_config::DynConfig;
use mutt_contracts::audit_store::{AuditRecord, AuditStore};
use mutt_types::alert::Alert;
use mutt_types::event::Event;
use tracing::{error, info, warn};

use crate::dlq::DlqEnvelope;
use crate::heartbeat::HeartbeatLoop;
use crate::janitor::Janitor;
use crate::poison::PoisonTracker;
use crate::rule_cache::RuleCache;
use crate::unhandled::{UnhandledOutcome, UnhandledTracker};

pub const INGEST_QUEUE: &str = "mutt:ingest_queue";
pub const ALERT_QUEUE: &str = "mutt:alert_queue";
pub const ALERTER_DLQ: &str = "mutt:dlq:alerter";
const PROCESSING_PREFIX: &str = "mutt:processing:alerter:";
const HEARTBEAT_PREFIX: &str = "mutt:heartbeat:alerter:";

/// Poison retry budget for malformed/crashing events (spec §4.E). Not a
/// recognized dynamic-config key (see §6's table), so it is a fixed
/// constant rather than a `DynConfig` lookup.
const POISON_MAX_RETRIES: u32 = 3;

fn processing_list(pod: &str) -> String {
    format!("{PROCESSING_PREFIX}{pod}")
}

fn heartbeat_key(pod: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{pod}")
}

enum ShedDecision {
    Proceed,
    Shed,
    Defer,
}

pub struct Alerter {
    queue: Arc<dyn mutt_contracts::queue::QueueSubstrate>,
    rule_cache: Arc<RuleCache>,
    audit_store: Arc<dyn AuditStore>,
    dyn_config: DynConfig,
    unhandled: UnhandledTracker,
    poison: PoisonTracker,
    pod_id: String,
}

impl Alerter {
    pub fn new(
        queue: Arc<dyn mutt_contracts::queue::QueueSubstrate>,
        rule_cache: Arc<RuleCache>,
        audit_store: Arc<dyn AuditStore>,
        dyn_config: DynConfig,
        pod_id: impl Into<String>,
    ) -> Self {
        Self {
            unhandled: UnhandledTracker::new(queue.clone()),
            poison: PoisonTracker::new(queue.clone()),
            queue,
            rule_cache,
            audit_store,
            dyn_config,
            pod_id: pod_id.into(),
        }
    }

    /// Startup sequence (spec §4.E): initial rule cache load (already done
    /// by the caller via `RuleCache::load_initial`), janitor reclaim, then
    /// spawn the heartbeat loop. Returns the heartbeat task handle so the
    /// caller can await it at shutdown.
    pub async fn startup(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let janitor = Janitor::new(self.queue.clone());
        janitor
            .reclaim(PROCESSING_PREFIX, HEARTBEAT_PREFIX, INGEST_QUEUE)
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

    async fn shed_decision(&self) -> anyhow::Result<ShedDecision> {
        let shed_threshold = self.dyn_config.get_u64("alerter_queue_shed_threshold", 5000).await;
        let warn_threshold = self.dyn_config.get_u64("alerter_queue_warn_threshold", 1000).await;
        let depth = self.queue.length(ALERT_QUEUE).await?;

        if depth >= shed_threshold {
            let mode = self.dyn_config.get("alerter_shed_mode", "dlq").await;
            return Ok(if mode == "defer" {
                ShedDecision::Defer
            } else {
                ShedDecision::Shed
            });
        }
        if depth >= warn_threshold {
            warn!(depth, warn_threshold, "alert queue depth above warn threshold");
        }
        Ok(ShedDecision::Proceed)
    }

    async fn route_to_dlq(&self, reason: &str, raw: &str) {
        let payload = serde_json::from_str(raw).unwrap_or(serde_json::Value::Null);
        let envelope = DlqEnvelope::new(reason, payload);
        if let Err(e) = self.queue.push(ALERTER_DLQ, &envelope.to_json()).await {
            error!(reason, error = %e, "failed to route item to alerter DLQ");
        }
    }

    /// Run one iteration of the main loop. Returns `Ok(true)` if an item was
    /// processed (for test/driving loops), `Ok(false)` on an empty pop.
    pub async fn tick(&self) -> anyhow::Result<bool> {
        let list = processing_list(&self.pod_id);
        let raw = match self
            .queue
            .atomic_pop_and_stash(INGEST_QUEUE, &list, Duration::from_secs(5))
            .await?
        {
            Some(raw) => raw,
            None => return Ok(false),
        };

        match self.shed_decision().await {
            Ok(ShedDecision::Shed) => {
                self.route_to_dlq("shed", &raw).await;
                self.queue.ack(&list, &raw).await?;
                return Ok(true);
            }
            Ok(ShedDecision::Defer) => {
                let sleep_ms = self.dyn_config.get_u64("alerter_defer_sleep_ms", 250).await;
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                self.queue.push(INGEST_QUEUE, &raw).await?;
                self.queue.ack(&list, &raw).await?;
                return Ok(true);
            }
            Ok(ShedDecision::Proceed) => {}
            Err(e) => {
                warn!(error = %e, "shed-decision check failed; proceeding without backpressure check");
            }
        }

        if let Err(e) = self.process_one(&list, &raw).await {
            error!(error = %e, "unhandled error processing event; routing to DLQ as poison");
            self.route_to_dlq("internal_invariant_violation", &raw).await;
            let _ = self.queue.ack(&list, &raw).await;
        }

        Ok(true)
    }

    async fn process_one(&self, list: &str, raw: &str) -> anyhow::Result<()> {
        let event: Event = match serde_json::from_str(raw) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "event failed to parse; treating as poison");
                return self.handle_poison(list, raw, "poison").await;
            }
        };

        let outcome = self.rule_cache.match_event(&event);

        let (matched_rule_id, handling_decision, team_assignment, environment) = match &outcome {
            Some(m) => (
                m.matched_rule_id,
                m.handling_decision,
                m.team_assignment.clone(),
                m.environment,
            ),
            None => (
                None,
                mutt_types::rule::HandlingDecision::TicketOnly,
                "UNASSIGNED".to_string(),
                self.rule_cache
                    .environment_for_hostname(&event.hostname)
                    .unwrap_or(mutt_types::rule::Environment::Prod),
            ),
        };

        let raw_payload: serde_json::Value = serde_json::to_value(&event)?;
        let audit_record = AuditRecord {
            correlation_id: event.correlation_id,
            matched_rule_id,
            handling_decision: format!("{handling_decision:?}"),
            team_assignment: team_assignment.clone(),
            environment: format!("{environment:?}"),
            raw_payload,
            processing_pod_id: self.pod_id.clone(),
            recorded_at: chrono::Utc::now(),
        };

        if let Err(e) = self.write_audit_with_retry(&audit_record).await {
            warn!(error = %e, "audit write exhausted retries; routing to alerter DLQ");
            self.route_to_dlq("audit_write_failed", raw).await;
            self.queue.ack(list, raw).await?;
            return Ok(());
        }

        match outcome {
            Some(m) if m.handling_decision != mutt_types::rule::HandlingDecision::Ignore => {
                let alert = Alert {
                    event: event.clone(),
                    matched_rule_id: m.matched_rule_id,
                    handling_decision: m.handling_decision,
                    team_assignment: m.team_assignment,
                    environment: m.environment,
                };
                let alert_json = serde_json::to_string(&alert)?;
                self.queue.push(ALERT_QUEUE, &alert_json).await?;
            }
            Some(_) => {
                // Matched but handling decision is Ignore: audited, nothing forwarded.
            }
            None => {
                self.handle_unhandled(&event).await?;
            }
        }

        self.queue.ack(list, raw).await?;
        Ok(())
    }

    async fn write_audit_with_retry(&self, record: &AuditRecord) -> anyhow::Result<()> {
        let mut delay = Duration::from_millis(200);
        for attempt in 1..=3 {
            match self.audit_store.write_audit_row(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt == 3 => return Err(e.into()),
                Err(e) => {
                    warn!(attempt, error = %e, "audit write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        unreachable!()
    }

    async fn handle_unhandled(&self, event: &Event) -> anyhow::Result<()> {
        let threshold = self.dyn_config.get_u64("unhandled_threshold", 3).await;
        let expiry = self
            .dyn_config
            .get_duration("unhandled_expiry_seconds", Duration::from_secs(3600))
            .await;
        let fingerprint = event.unhandled_fingerprint();

        match self
            .unhandled
            .record(&event.hostname, &fingerprint, threshold, expiry)
            .await?
        {
            UnhandledOutcome::Counted => {}
            UnhandledOutcome::Sealed => {
                info!(hostname = %event.hostname, fingerprint, "unhandled bucket sealed, emitting meta-alert");
                let meta_alert = Alert {
                    event: event.clone(),
                    matched_rule_id: None,
                    handling_decision: mutt_types::rule::HandlingDecision::TicketOnly,
                    team_assignment: "UNASSIGNED".to_string(),
                    environment: self
                        .rule_cache
                        .environment_for_hostname(&event.hostname)
                        .unwrap_or(mutt_types::rule::Environment::Prod),
                };
                let alert_json = serde_json::to_string(&meta_alert)?;
                self.queue.push(ALERT_QUEUE, &alert_json).await?;
            }
            UnhandledOutcome::AlreadySealedElsewhere => {}
        }
        Ok(())
    }

    async fn handle_poison(&self, list: &str, raw: &str, reason: &str) -> anyhow::Result<()> {
        let poison_ttl = Duration::from_secs(3600);
        let exceeded = self
            .poison
            .record_failure(raw, POISON_MAX_RETRIES, poison_ttl)
            .await?;
        if exceeded {
            self.route_to_dlq(reason, raw).await;
            self.queue.ack(list, raw).await?;
        } else {
            // Still within retry budget: requeue for another attempt.
            self.queue.push(INGEST_QUEUE, raw).await?;
            self.queue.ack(list, raw).await?;
        }
        Ok(())
    }
}
