// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use rand::Rng;
use redis::{aio::ConnectionManager, cluster::ClusterClient, cluster_async::ClusterConnection};
use redis::{AsyncCommands, RedisResult, Script, Value};

use crate::error::KvError;

use super::store::{KvStore, SeqMallocOutcome};

/// Either a single-node connection manager or a cluster connection,
/// depending on [`crate::config::KvSettings::cluster_mode`].
#[derive(Clone)]
enum Backend {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

#[derive(Clone)]
pub struct RedisKvStore {
    backend: Backend,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

impl RedisKvStore {
    pub async fn connect(nodes: &[String], cluster_mode: bool) -> Result<Self, KvError> {
        let backend = if cluster_mode {
            let client = ClusterClient::new(nodes.to_vec())?;
            Backend::Cluster(client.get_async_connection().await?)
        } else {
            let client = redis::Client::open(nodes[0].clone())?;
            Backend::Single(ConnectionManager::new(client).await?)
        };
        Ok(Self { backend })
    }

    async fn eval<T: redis::FromRedisValue>(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> RedisResult<T> {
        let invocation = {
            let mut inv = script.prepare_invoke();
            for key in keys {
                inv.key(*key);
            }
            for arg in args {
                inv.arg(arg);
            }
            inv
        };
        match self.backend.clone() {
            Backend::Single(mut conn) => invocation.invoke_async(&mut conn).await,
            Backend::Cluster(mut conn) => invocation.invoke_async(&mut conn).await,
        }
    }
}

/// The atomic `Malloc` hash script (§4.5). Returns a mixed-type array:
/// `[state, ...]` with the per-state payload described in the spec.
const SEQ_MALLOC_SCRIPT: &str = r#"
local key = KEYS[1]
local size = tonumber(ARGV[1])
local lock_ttl = tonumber(ARGV[2])
local data_ttl = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

if redis.call('EXISTS', key) == 0 then
    local lock = math.random(1, 2147483647)
    redis.call('HSET', key, 'LOCK', lock, 'TIME', now)
    redis.call('PEXPIRE', key, lock_ttl)
    return {1, lock, now}
end

local lock = redis.call('HGET', key, 'LOCK')
if lock then
    return {2}
end

local curr = tonumber(redis.call('HGET', key, 'CURR') or '0')
local last = tonumber(redis.call('HGET', key, 'LAST') or '0')

if size == 0 then
    return {0, curr, last, now}
end

if curr + size <= last then
    local new_curr = curr + size
    redis.call('HSET', key, 'CURR', new_curr, 'TIME', now)
    redis.call('PEXPIRE', key, data_ttl)
    return {0, curr, last, now}
end

local new_lock = math.random(1, 2147483647)
redis.call('HSET', key, 'LOCK', new_lock, 'CURR', last, 'TIME', now)
redis.call('PEXPIRE', key, lock_ttl)
return {3, curr, last, new_lock, now}
"#;

/// Compare-and-set publish of a completed refill (§4.5): only commits if the
/// lock nonce still matches, then clears the lock.
const SEQ_COMMIT_SCRIPT: &str = r#"
local lock = redis.call('HGET', KEYS[1], 'LOCK')
if not lock or tostring(lock) ~= tostring(ARGV[1]) then
    return 0
end
redis.call('HSET', KEYS[1], 'CURR', ARGV[2], 'LAST', ARGV[3])
redis.call('HDEL', KEYS[1], 'LOCK')
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 1
"#;

/// Compare-and-delete unlock, avoiding releasing a lock acquired by someone
/// else after our TTL expired.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let result: Option<Vec<u8>> = match self.backend.clone() {
            Backend::Single(mut conn) => conn.get(key).await?,
            Backend::Cluster(mut conn) => conn.get(key).await?,
        };
        Ok(result)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_ms: i64) -> Result<(), KvError> {
        match self.backend.clone() {
            Backend::Single(mut conn) => {
                let _: () = conn.pset_ex(key, value, ttl_ms as u64).await?;
            }
            Backend::Cluster(mut conn) => {
                let _: () = conn.pset_ex(key, value, ttl_ms as u64).await?;
            }
        }
        Ok(())
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: u64 = match self.backend.clone() {
            Backend::Single(mut conn) => conn.del(keys).await?,
            Backend::Cluster(mut conn) => conn.del(keys).await?,
        };
        Ok(deleted)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), KvError> {
        match self.backend.clone() {
            Backend::Single(mut conn) => {
                let _: () = conn.publish(channel, payload).await?;
            }
            Backend::Cluster(mut conn) => {
                let _: () = conn.publish(channel, payload).await?;
            }
        }
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl_ms: i64) -> Result<Option<i64>, KvError> {
        let nonce: i64 = rand::thread_rng().gen_range(1..i64::MAX);
        let acquired: bool = match self.backend.clone() {
            Backend::Single(mut conn) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(nonce)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
                    .map(|v: Option<String>| v.is_some())?
            }
            Backend::Cluster(mut conn) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(nonce)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
                    .map(|v: Option<String>| v.is_some())?
            }
        };
        Ok(acquired.then_some(nonce))
    }

    async fn unlock(&self, key: &str, lock_value: i64) -> Result<(), KvError> {
        let script = Script::new(UNLOCK_SCRIPT);
        let _: i64 = self
            .eval(&script, &[key], &[lock_value.to_string()])
            .await?;
        Ok(())
    }

    async fn seq_malloc(
        &self,
        key: &str,
        size: i64,
        lock_ttl_ms: i64,
        data_ttl_ms: i64,
    ) -> Result<SeqMallocOutcome, KvError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let script = Script::new(SEQ_MALLOC_SCRIPT);
        let reply: Value = self
            .eval(
                &script,
                &[key],
                &[
                    size.to_string(),
                    lock_ttl_ms.to_string(),
                    data_ttl_ms.to_string(),
                    now_ms.to_string(),
                ],
            )
            .await?;
        parse_malloc_reply(reply)
    }

    async fn seq_commit(
        &self,
        key: &str,
        lock_value: i64,
        curr: i64,
        last: i64,
        data_ttl_ms: i64,
    ) -> Result<bool, KvError> {
        let script = Script::new(SEQ_COMMIT_SCRIPT);
        let committed: i64 = self
            .eval(
                &script,
                &[key],
                &[
                    lock_value.to_string(),
                    curr.to_string(),
                    last.to_string(),
                    data_ttl_ms.to_string(),
                ],
            )
            .await?;
        Ok(committed == 1)
    }
}

fn parse_malloc_reply(value: Value) -> Result<SeqMallocOutcome, KvError> {
    let Value::Array(items) = value else {
        return Err(KvError::Redis(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "unexpected Malloc script reply shape",
        ))));
    };
    let state = items
        .first()
        .and_then(value_as_i64)
        .ok_or_else(|| redis_shape_error("missing state"))?;
    match state {
        0 => Ok(SeqMallocOutcome::Success {
            curr: items.get(1).and_then(value_as_i64).unwrap_or_default(),
            last: items.get(2).and_then(value_as_i64).unwrap_or_default(),
            time_ms: items.get(3).and_then(value_as_i64).unwrap_or_default(),
        }),
        1 => Ok(SeqMallocOutcome::NeedsRefill {
            lock_value: items.get(1).and_then(value_as_i64).unwrap_or_default(),
            time_ms: items.get(2).and_then(value_as_i64).unwrap_or_default(),
        }),
        2 => Ok(SeqMallocOutcome::Busy),
        3 => Ok(SeqMallocOutcome::NeedsRefillExceeded {
            curr: items.get(1).and_then(value_as_i64).unwrap_or_default(),
            last: items.get(2).and_then(value_as_i64).unwrap_or_default(),
            lock_value: items.get(3).and_then(value_as_i64).unwrap_or_default(),
            time_ms: items.get(4).and_then(value_as_i64).unwrap_or_default(),
        }),
        other => Err(redis_shape_error(&format!("unknown Malloc state {other}"))),
    }
}

fn redis_shape_error(msg: &str) -> KvError {
    KvError::Redis(redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "Malloc script reply",
        msg.to_string(),
    )))
}
