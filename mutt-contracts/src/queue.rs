//! The queue substrate capability: durable FIFO lists, atomic pop-and-stash
//! handoff, a small KV store, pub/sub, and server-side atomic scripts.
//!
//! This is the single seam through which every component (ingest gateway,
//! alerter, forwarder, remediation worker, janitor) talks to the durable
//! backing store. A single adapter implements it; nothing else in the core
//! pipeline depends on a concrete transport.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("script error: {0}")]
    Script(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Result of a server-side atomic script evaluation. Scripts return a small,
/// fixed shape so callers don't need a generic deserializer for every script.
#[derive(Debug, Clone)]
pub struct ScriptReply(pub Value);

impl ScriptReply {
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        self.0.as_array()
    }
}

/// Capability surface required by every worker loop. Implemented once by a
/// concrete substrate adapter (see `mutt-core::redis_queue`).
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait QueueSubstrate: Send + Sync {
    /// Append `item` (already serialized) to the tail of `list`.
    async fn push(&self, list: &str, item: &str) -> QueueResult<()>;

    /// Current depth of `list`.
    async fn length(&self, list: &str) -> QueueResult<u64>;

    /// Block up to `timeout` waiting for an item on `src`; atomically move it
    /// to the head of `dst` and return it. This is the at-least-once handoff
    /// primitive: if the caller dies before `ack`, the item remains on `dst`
    /// for the janitor to recover.
    async fn atomic_pop_and_stash(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> QueueResult<Option<String>>;

    /// Remove `item` from the head of the processing list `dst` by value.
    async fn ack(&self, dst: &str, item: &str) -> QueueResult<()>;

    /// Atomically rename list `src` to `dst`. Used both for unhandled-bucket
    /// sealing and for janitor draining (which instead drains item-by-item).
    async fn rename(&self, src: &str, dst: &str) -> QueueResult<bool>;

    /// List all keys matching `pattern` (SCAN-based, not KEYS, under the
    /// hood in a real adapter).
    async fn keys(&self, pattern: &str) -> QueueResult<Vec<String>>;

    async fn kv_get(&self, key: &str) -> QueueResult<Option<String>>;
    async fn kv_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()>;
    async fn kv_del(&self, key: &str) -> QueueResult<()>;
    async fn kv_expire(&self, key: &str, ttl: Duration) -> QueueResult<()>;
    /// Atomically increment a counter key, creating it with `ttl` if absent,
    /// and return the post-increment value.
    async fn kv_incr(&self, key: &str, ttl: Duration) -> QueueResult<i64>;
    /// True if a heartbeat/marker key is present and unexpired.
    async fn kv_exists(&self, key: &str) -> QueueResult<bool>;

    async fn pubsub_publish(&self, channel: &str, message: &str) -> QueueResult<()>;
    /// Subscribe to `channel`; the returned stream yields published messages
    /// until the subscription is dropped.
    async fn pubsub_subscribe(
        &self,
        channel: &str,
    ) -> QueueResult<Pin<Box<dyn Stream<Item = String> + Send>>>;

    /// Evaluate a named, pre-registered atomic script with `keys` and `args`.
    /// Used for the sliding-window rate limiter and the circuit breaker
    /// state transitions, both of which must be linearizable across
    /// forwarder replicas.
    async fn eval_script(
        &self,
        script: &'static str,
        keys: &[&str],
        args: &[String],
    ) -> QueueResult<ScriptReply>;
}
