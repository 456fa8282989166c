//! The concrete queue-substrate adapter: durable lists, KV, pub/sub, and
//! atomic scripts backed by Redis. This is the single adapter implementing
//! [`QueueSubstrate`]; every other component depends only on the trait.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use mutt_contracts::queue::{QueueError, QueueResult, QueueSubstrate, ScriptReply};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script, Value as RedisValue};
use serde_json::Value as JsonValue;
use tracing::debug;

/// Lua scripts for operations that must be atomic across replicas.
mod scripts {
    use redis::Script;

    /// Increment a counter, setting its TTL only on the first increment so
    /// later increments don't keep resetting the expiry.
    pub fn incr_with_ttl() -> Script {
        Script::new(
            r#"
            local key = KEYS[1]
            local ttl = tonumber(ARGV[1])
            local new_value = redis.call('INCR', key)
            if new_value == 1 then
                redis.call('EXPIRE', key, ttl)
            end
            return new_value
            "#,
        )
    }
}

/// Redis-backed implementation of the queue substrate capability.
///
/// `push` enqueues at the Redis head (`LPUSH`); `atomic_pop_and_stash`
/// dequeues from the tail via `BRPOPLPUSH`. Taken together this realizes the
/// FIFO ordering the spec's §5 ordering guarantees require -- see
/// `DESIGN.md` for why the alternative (literal "append to tail, pop from
/// tail") would make the "FIFO list" a LIFO stack.
#[derive(Clone)]
pub struct RedisQueueSubstrate {
    conn: ConnectionManager,
    pubsub_client: redis::Client,
    incr_with_ttl: Script,
}

impl std::fmt::Debug for RedisQueueSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueSubstrate").finish()
    }
}

impl RedisQueueSubstrate {
    pub async fn connect(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Unavailable(format!("failed to connect to redis: {e}")))?;

        Ok(Self {
            conn,
            pubsub_client: client,
            incr_with_ttl: scripts::incr_with_ttl(),
        })
    }
}

fn redis_value_to_json(value: RedisValue) -> JsonValue {
    match value {
        RedisValue::Nil => JsonValue::Null,
        RedisValue::Int(i) => JsonValue::from(i),
        RedisValue::Double(d) => JsonValue::from(d),
        RedisValue::Boolean(b) => JsonValue::from(b),
        RedisValue::BulkString(bytes) => {
            JsonValue::from(String::from_utf8_lossy(&bytes).to_string())
        }
        RedisValue::SimpleString(s) => JsonValue::from(s),
        RedisValue::Array(items) | RedisValue::Set(items) => {
            JsonValue::Array(items.into_iter().map(redis_value_to_json).collect())
        }
        RedisValue::Map(pairs) => JsonValue::Array(
            pairs
                .into_iter()
                .flat_map(|(k, v)| [redis_value_to_json(k), redis_value_to_json(v)])
                .collect(),
        ),
        _ => JsonValue::Null,
    }
}

#[async_trait]
impl QueueSubstrate for RedisQueueSubstrate {
    async fn push(&self, list: &str, item: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(list, item)
            .await
            .map_err(|e| QueueError::Backend(format!("LPUSH {list} failed: {e}")))
    }

    async fn length(&self, list: &str) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        conn.llen(list)
            .await
            .map_err(|e| QueueError::Backend(format!("LLEN {list} failed: {e}")))
    }

    async fn atomic_pop_and_stash(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> QueueResult<Option<String>> {
        let mut conn = self.conn.clone();
        let result: Option<String> = conn
            .brpoplpush(src, dst, timeout.as_secs_f64())
            .await
            .map_err(|e| QueueError::Backend(format!("BRPOPLPUSH {src}->{dst} failed: {e}")))?;
        Ok(result)
    }

    async fn ack(&self, dst: &str, item: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .lrem(dst, 1, item)
            .await
            .map_err(|e| QueueError::Backend(format!("LREM {dst} failed: {e}")))?;
        if removed == 0 {
            debug!(dst, "ack found no matching item; already reclaimed by a janitor");
        }
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        match redis::cmd("RENAME")
            .arg(src)
            .arg(dst)
            .query_async::<()>(&mut conn)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.to_string().contains("no such key") => Ok(false),
            Err(e) => Err(QueueError::Backend(format!("RENAME {src}->{dst} failed: {e}"))),
        }
    }

    async fn keys(&self, pattern: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut found = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Backend(format!("SCAN {pattern} failed: {e}")))?;
            found.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(found)
    }

    async fn kv_get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| QueueError::Backend(format!("GET {key} failed: {e}")))
    }

    async fn kv_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| QueueError::Backend(format!("SETEX {key} failed: {e}"))),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| QueueError::Backend(format!("SET {key} failed: {e}"))),
        }
    }

    async fn kv_del(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| QueueError::Backend(format!("DEL {key} failed: {e}")))
    }

    async fn kv_expire(&self, key: &str, ttl: Duration) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| QueueError::Backend(format!("EXPIRE {key} failed: {e}")))
    }

    async fn kv_incr(&self, key: &str, ttl: Duration) -> QueueResult<i64> {
        let mut conn = self.conn.clone();
        self.incr_with_ttl
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Script(format!("incr_with_ttl {key} failed: {e}")))
    }

    async fn kv_exists(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key)
            .await
            .map_err(|e| QueueError::Backend(format!("EXISTS {key} failed: {e}")))
    }

    async fn pubsub_publish(&self, channel: &str, message: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(|e| QueueError::Backend(format!("PUBLISH {channel} failed: {e}")))
    }

    async fn pubsub_subscribe(
        &self,
        channel: &str,
    ) -> QueueResult<Pin<Box<dyn Stream<Item = String> + Send>>> {
        let mut pubsub = self
            .pubsub_client
            .get_async_pubsub()
            .await
            .map_err(|e| QueueError::Backend(format!("pubsub connect failed: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| QueueError::Backend(format!("SUBSCRIBE {channel} failed: {e}")))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            msg.get_payload::<String>().ok()
        });
        Ok(Box::pin(stream))
    }

    async fn eval_script(
        &self,
        script: &'static str,
        keys: &[&str],
        args: &[String],
    ) -> QueueResult<ScriptReply> {
        let mut conn = self.conn.clone();
        let compiled = Script::new(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation = invocation.key(*key);
        }
        for arg in args {
            invocation = invocation.arg(arg.as_str());
        }
        let value: RedisValue = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Script(format!("script eval failed: {e}")))?;
        Ok(ScriptReply(redis_value_to_json(value)))
    }
}
