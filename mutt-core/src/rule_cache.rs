//! The rule-matching engine's in-memory snapshot (spec §4.B). Replica-local,
//! read-mostly; refreshes atomically swap a pointer so readers never observe
//! a torn or half-loaded snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mutt_contracts::rule_store::{RuleSnapshot, RuleStore};
use mutt_types::event::Event;
use mutt_types::rule::{Environment, HandlingDecision, MatchType, Rule};
use regex::Regex;
use tracing::{error, info, warn};

/// A rule plus its precompiled regex (if `match_type == Regex`), so the hot
/// matching path never compiles a pattern per event.
struct CompiledRule {
    rule: Rule,
    regex: Option<Regex>,
}

struct Snapshot {
    rules: Vec<CompiledRule>,
    inner: RuleSnapshot,
    loaded_at: DateTime<Utc>,
}

/// Outcome of matching a single event against the current snapshot.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub matched_rule_id: Option<i64>,
    pub handling_decision: HandlingDecision,
    pub team_assignment: String,
    pub environment: Environment,
}

pub struct RuleCache {
    store: Arc<dyn RuleStore>,
    current: RwLock<Option<Arc<Snapshot>>>,
    refresh_failures: AtomicU64,
}

fn oid_prefix_match(event_oid: &str, rule_oid: &str) -> bool {
    event_oid.starts_with(rule_oid)
        && (event_oid.len() == rule_oid.len()
            || event_oid.as_bytes().get(rule_oid.len()) == Some(&b'.'))
}

fn compile_snapshot(snapshot: RuleSnapshot) -> Snapshot {
    let mut rules: Vec<CompiledRule> = snapshot
        .rules
        .iter()
        .filter(|r| r.is_active && r.is_well_formed())
        .cloned()
        .map(|rule| {
            let regex = if rule.match_type == MatchType::Regex {
                match rule.match_string.as_deref().map(Regex::new) {
                    Some(Ok(re)) => Some(re),
                    Some(Err(e)) => {
                        warn!(rule_id = rule.id, error = %e, "rule regex failed to compile; rule will never match");
                        None
                    }
                    None => None,
                }
            } else {
                None
            };
            CompiledRule { rule, regex }
        })
        .collect();

    // First-match-wins in ascending priority; ties broken by ascending id.
    rules.sort_by(|a, b| {
        a.rule
            .priority
            .cmp(&b.rule.priority)
            .then(a.rule.id.cmp(&b.rule.id))
    });

    Snapshot {
        rules,
        inner: snapshot,
        loaded_at: Utc::now(),
    }
}

fn rule_matches(rule: &Rule, regex: Option<&Regex>, event: &Event) -> bool {
    let mut matched_any_criterion = false;

    if rule.match_type == MatchType::OidPrefix {
        if let Some(rule_oid) = &rule.trap_oid {
            matched_any_criterion = true;
            let event_oid = match &event.trap_oid {
                Some(oid) => oid,
                None => return false,
            };
            if !oid_prefix_match(event_oid, rule_oid) {
                return false;
            }
        }
    } else if let Some(match_string) = &rule.match_string {
        matched_any_criterion = true;
        let hit = match rule.match_type {
            MatchType::Contains => event.message.contains(match_string.as_str()),
            MatchType::Regex => regex.map(|re| re.is_match(&event.message)).unwrap_or(false),
            MatchType::OidPrefix => unreachable!(),
        };
        if !hit {
            return false;
        }
    }

    if let Some(severity) = rule.syslog_severity {
        matched_any_criterion = true;
        if event.syslog_severity != Some(severity) {
            return false;
        }
    }

    matched_any_criterion
}

impl RuleCache {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
            refresh_failures: AtomicU64::new(0),
        }
    }

    /// Block until the first snapshot loads successfully, retrying with a
    /// short fixed backoff. Callers should treat exhaustion as a fatal
    /// startup error (fail-start), per spec §4.E step 1.
    pub async fn load_initial(&self, max_attempts: u32, retry_delay: Duration) -> anyhow::Result<()> {
        for attempt in 1..=max_attempts {
            match self.refresh().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(attempt, max_attempts, error = %e, "initial rule cache load failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }
        anyhow::bail!("rule store unreachable after {max_attempts} attempts; failing start")
    }

    /// Read the full rule corpus and atomically swap the snapshot pointer.
    /// A failed refresh never clears the previous snapshot.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let loaded = self.store.load_snapshot().await?;
        let compiled = Arc::new(compile_snapshot(loaded));
        let count = compiled.rules.len();
        *self.current.write().expect("rule cache lock poisoned") = Some(compiled);
        info!(active_rules = count, "rule cache refreshed");
        Ok(())
    }

    /// Spawn the background refresh loop. Reads `rule_cache_ttl` from
    /// dynamic config every tick so an operator can change the interval
    /// without a restart.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        dyn_config: mutt_config::DynConfig,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let ttl_secs = dyn_config.get_u64("rule_cache_ttl", 300).await;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(ttl_secs)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
                if let Err(e) = self.refresh().await {
                    self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "periodic rule cache refresh failed; previous snapshot remains in effect");
                }
            }
        })
    }

    pub fn refresh_failure_count(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.current
            .read()
            .expect("rule cache lock poisoned")
            .as_ref()
            .map(|s| s.loaded_at)
    }

    fn environment_for(snapshot: &Snapshot, hostname: &str) -> Environment {
        if snapshot.inner.dev_hosts.contains(hostname) {
            Environment::Dev
        } else {
            Environment::Prod
        }
    }

    /// Classify a bare hostname (no matching rule involved), used when
    /// composing a meta-alert or an unhandled audit row.
    pub fn environment_for_hostname(&self, hostname: &str) -> Option<Environment> {
        let snapshot = self.current.read().expect("rule cache lock poisoned").clone()?;
        Some(Self::environment_for(&snapshot, hostname))
    }

    /// Classify `event` against the current snapshot. Deterministic: the
    /// same snapshot and event always produce the same outcome.
    pub fn match_event(&self, event: &Event) -> Option<MatchOutcome> {
        let snapshot = self.current.read().expect("rule cache lock poisoned").clone()?;
        let environment = Self::environment_for(&snapshot, &event.hostname);

        for compiled in &snapshot.rules {
            if rule_matches(&compiled.rule, compiled.regex.as_ref(), event) {
                let team = snapshot
                    .inner
                    .team_mappings
                    .team_for(&event.hostname)
                    .map(str::to_string)
                    .unwrap_or_else(|| compiled.rule.team_assignment.clone());
                return Some(MatchOutcome {
                    matched_rule_id: Some(compiled.rule.id),
                    handling_decision: compiled.rule.handling_for(environment),
                    team_assignment: team,
                    environment,
                });
            }
        }
        None
    }
}
