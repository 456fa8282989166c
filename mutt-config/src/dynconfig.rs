//! The dynamic-config subsystem (spec §4.C): a key/value store with
//! pub/sub invalidation and a per-key audit trail, letting operators change
//! tunables at runtime without a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use mutt_contracts::queue::QueueSubstrate;
use mutt_types::dynconfig::ConfigAuditRecord;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Recognized dynamic keys and their defaults (spec §6). The seed routine
/// writes these on first start of a deployment if they are absent.
pub const RECOGNIZED_DEFAULTS: &[(&str, &str)] = &[
    ("ingest_queue_cap", "10000"),
    ("ingest_rate_limit", "1000"),
    ("ingest_rate_period_s", "1"),
    ("rule_cache_ttl", "300"),
    ("unhandled_threshold", "3"),
    ("unhandled_expiry_seconds", "3600"),
    ("alerter_queue_warn_threshold", "1000"),
    ("alerter_queue_shed_threshold", "5000"),
    ("alerter_shed_mode", "dlq"),
    ("alerter_defer_sleep_ms", "250"),
    ("sink_rate_limit", "100"),
    ("sink_rate_period_s", "1"),
    ("sink_max_retries", "3"),
    ("sink_retry_base_delay", "1s"),
    ("sink_retry_max_delay", "30s"),
    ("sink_cb_failure_threshold", "5"),
    ("sink_cb_open_seconds", "60"),
    ("remediation_enabled", "true"),
    ("remediation_interval", "30s"),
    ("remediation_batch_size", "50"),
    ("max_poison_retries", "5"),
];

/// Channel that `set` publishes the changed key name on.
pub const CONFIG_UPDATES_CHANNEL: &str = "mutt:config:updates";

fn config_key(key: &str) -> String {
    format!("mutt:config:{key}")
}

fn audit_list_key(key: &str) -> String {
    format!("mutt:config:audit:{key}")
}

#[derive(Debug, Error)]
pub enum DynConfigError {
    #[error("queue substrate error: {0}")]
    Queue(#[from] mutt_contracts::queue::QueueError),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type DynConfigResult<T> = Result<T, DynConfigError>;

#[derive(Clone)]
struct CachedEntry {
    value: String,
    cached_at: Instant,
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// A per-replica dynamic-config handle. Cheap to clone (wraps `Arc`s); the
/// watcher task it spawns is owned by the handle's lifetime via an explicit
/// `watch()` call rather than an ambient module-level singleton.
#[derive(Clone)]
pub struct DynConfig {
    queue: Arc<dyn QueueSubstrate>,
    cache: Arc<RwLock<HashMap<String, CachedEntry>>>,
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
    cache_ttl: Duration,
    identity: String,
}

impl DynConfig {
    pub fn new(queue: Arc<dyn QueueSubstrate>, identity: impl Into<String>, cache_ttl: Duration) -> Self {
        Self {
            queue,
            cache: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            cache_ttl,
            identity: identity.into(),
        }
    }

    /// Seed default values for every recognized key that is absent. Safe to
    /// call from every replica on startup: a raced double-seed is idempotent
    /// because the default is the same value either way.
    pub async fn seed_defaults(&self) -> DynConfigResult<()> {
        for (key, default) in RECOGNIZED_DEFAULTS {
            if self.queue.kv_get(&config_key(key)).await?.is_none() {
                info!(key, default, "seeding dynamic config default");
                self.set(key, default, "system", "initial seed").await?;
            }
        }
        Ok(())
    }

    /// Return the cached value if within TTL, otherwise re-read and cache.
    pub async fn get(&self, key: &str, default: &str) -> String {
        if let Some(entry) = self.cache.read().await.get(key) {
            if entry.cached_at.elapsed() < self.cache_ttl {
                return entry.value.clone();
            }
        }
        let fetched = match self.queue.kv_get(&config_key(key)).await {
            Ok(Some(v)) => v,
            Ok(None) => default.to_string(),
            Err(e) => {
                warn!(key, error = %e, "dynamic config read failed, using default");
                return default.to_string();
            }
        };
        self.cache.write().await.insert(
            key.to_string(),
            CachedEntry {
                value: fetched.clone(),
                cached_at: Instant::now(),
            },
        );
        fetched
    }

    pub async fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key, &default.to_string())
            .await
            .parse()
            .unwrap_or(default)
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key, &default.to_string())
            .await
            .parse()
            .unwrap_or(default)
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key, &default.to_string())
            .await
            .parse()
            .unwrap_or(default)
    }

    pub async fn get_duration(&self, key: &str, default: Duration) -> Duration {
        let raw = self.get(key, &humantime::format_duration(default).to_string()).await;
        humantime::parse_duration(&raw).unwrap_or(default)
    }

    /// Write `value`, append an audit record, and publish an invalidation.
    /// A failed publish never hides the write: subscribers that missed the
    /// notification will still see the new value once their cache TTL
    /// expires.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        changed_by: &str,
        reason: &str,
    ) -> DynConfigResult<()> {
        let old_value = self.queue.kv_get(&config_key(key)).await?;
        self.queue.kv_set(&config_key(key), value, None).await?;

        let record = ConfigAuditRecord {
            key: key.to_string(),
            old_value: old_value.clone(),
            new_value: value.to_string(),
            changed_by: changed_by.to_string(),
            reason: reason.to_string(),
            changed_at: Utc::now(),
            version: 0,
        };
        let record_json = serde_json::to_string(&record).unwrap_or_default();
        self.queue.push(&audit_list_key(key), &record_json).await?;

        if let Err(e) = self.queue.pubsub_publish(CONFIG_UPDATES_CHANNEL, key).await {
            warn!(key, error = %e, "config update publish failed; relying on cache TTL expiry");
        }

        self.cache.write().await.remove(key);
        Ok(())
    }

    /// Register a per-key callback invoked (after cache eviction) whenever
    /// `watch()` observes an invalidation for `key`. Used to re-read and
    /// reconfigure hot parameters such as thresholds or the shed mode.
    pub async fn register_listener(&self, key: &str, callback: Listener) {
        self.listeners
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push(callback);
    }

    /// Subscribe to `mutt:config:updates` and evict cache entries (then run
    /// listeners) as invalidations arrive. Runs until the queue substrate's
    /// subscription stream ends; callers spawn this as an owned task tied to
    /// this handle's lifetime, never as a background singleton.
    pub async fn watch(&self) -> DynConfigResult<()> {
        let mut stream = self.queue.pubsub_subscribe(CONFIG_UPDATES_CHANNEL).await?;
        while let Some(key) = stream.next().await {
            debug!(key, identity = %self.identity, "config invalidation received");
            self.cache.write().await.remove(&key);
            if let Some(callbacks) = self.listeners.read().await.get(&key) {
                for cb in callbacks {
                    cb(&key);
                }
            }
        }
        Ok(())
    }
}
