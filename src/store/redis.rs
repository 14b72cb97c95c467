//! Redis-backed timestamp store.
//!
//! Series live in sorted sets scored by timestamp, under keys prefixed
//! `rate_limiter:`. The admission path runs prune + count + conditional
//! append as a single server-side script, so concurrent admissions on
//! one key never interleave (other clients of the same Redis included).
//!
//! Member payloads carry the entry weight (`<nanos>:<weight>:<nonce>`);
//! weighted series are summed by payload, pure request series use
//! cardinality. Every write refreshes a key expiry of one window length
//! so idle keys do not accumulate forever.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::{encode_member, member_weight, Admission, TimestampStore};
use crate::config::RedisConfig;
use crate::error::{Result, WindwardError};

/// Atomic prune + count + conditional append.
///
/// KEYS[1] series key
/// ARGV[1] cutoff, ARGV[2] now (timestamp score), ARGV[3] weight,
/// ARGV[4] limit, ARGV[5] member, ARGV[6] weighted flag, ARGV[7] ttl ms
///
/// Returns {admitted, load, oldest}; load and oldest are strings so
/// fractional seconds survive the Lua number round-trip.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local weight = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
local member = ARGV[5]
local weighted = tonumber(ARGV[6])
local ttl_ms = tonumber(ARGV[7])

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. ARGV[1])

local load = 0
if weighted == 1 then
  local members = redis.call('ZRANGE', key, 0, -1)
  for _, m in ipairs(members) do
    local w = tonumber(string.match(m, '^[^:]*:([^:]*):'))
    load = load + (w or 1)
  end
else
  load = redis.call('ZCARD', key)
end

local admitted = 0
if load + weight <= limit then
  admitted = 1
  redis.call('ZADD', key, ARGV[2], member)
  load = load + weight
end

if ttl_ms > 0 and redis.call('EXISTS', key) == 1 then
  redis.call('PEXPIRE', key, ttl_ms)
end

local oldest = ''
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if first[2] then
  oldest = first[2]
end

return {admitted, tostring(load), oldest}
"#;

/// Store backed by an external Redis instance, shared across processes.
pub struct RedisStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    timeout: Duration,
    admit_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!(host = %config.host, port = config.port, db = config.db, "Connecting to Redis");

        let client = Client::open(config.url())?;
        let conn = match tokio::time::timeout(
            config.operation_timeout(),
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(conn) => conn?,
            Err(_) => return Err(WindwardError::Timeout(config.operation_timeout())),
        };

        let store = Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            timeout: config.operation_timeout(),
            admit_script: Script::new(ADMIT_SCRIPT),
        };
        store.ping().await?;

        debug!(prefix = %store.key_prefix, "Redis store ready");
        Ok(store)
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Run one store operation under the configured timeout. Timeouts
    /// surface as backend errors, never as silent retries.
    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WindwardError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl TimestampStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn check_and_admit(
        &self,
        key: &str,
        cutoff: f64,
        now: f64,
        weight: f64,
        limit: f64,
        weighted: bool,
    ) -> Result<Admission> {
        let redis_key = self.redis_key(key);
        let member = encode_member(now, weight);
        let ttl_ms = ((now - cutoff) * 1000.0).max(0.0) as i64;

        let mut conn = self.conn.clone();
        let (admitted, load, oldest): (i64, String, String) = self
            .timed(
                self.admit_script
                    .key(&redis_key)
                    .arg(cutoff)
                    .arg(now)
                    .arg(weight)
                    .arg(limit)
                    .arg(&member)
                    .arg(if weighted { 1 } else { 0 })
                    .arg(ttl_ms)
                    .invoke_async(&mut conn),
            )
            .await?;

        let load: f64 = load.parse().map_err(|_| {
            WindwardError::Inconsistent(format!("admit script returned load {:?}", load))
        })?;
        let oldest = if oldest.is_empty() {
            None
        } else {
            Some(oldest.parse().map_err(|_| {
                WindwardError::Inconsistent(format!("admit script returned oldest {:?}", oldest))
            })?)
        };
        let admitted = admitted == 1;

        Ok(Admission {
            admitted,
            load,
            oldest,
            member: admitted.then_some(member),
        })
    }

    async fn add(&self, key: &str, t: f64, weight: f64) -> Result<String> {
        let redis_key = self.redis_key(key);
        let member = encode_member(t, weight);

        let mut conn = self.conn.clone();
        let _: i64 = self
            .timed(redis::cmd("ZADD").arg(&redis_key).arg(t).arg(&member).query_async(&mut conn))
            .await?;
        Ok(member)
    }

    async fn prune(&self, key: &str, cutoff: f64) -> Result<()> {
        let redis_key = self.redis_key(key);

        let mut conn = self.conn.clone();
        let _: i64 = self
            .timed(
                redis::cmd("ZREMRANGEBYSCORE")
                    .arg(&redis_key)
                    .arg("-inf")
                    .arg(format!("({}", cutoff))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn load(&self, key: &str, cutoff: f64, weighted: bool) -> Result<f64> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();

        if weighted {
            let members: Vec<String> = self
                .timed(
                    redis::cmd("ZRANGEBYSCORE")
                        .arg(&redis_key)
                        .arg(cutoff)
                        .arg("+inf")
                        .query_async(&mut conn),
                )
                .await?;
            Ok(members.iter().map(|m| member_weight(m)).sum())
        } else {
            let count: i64 = self
                .timed(
                    redis::cmd("ZCOUNT")
                        .arg(&redis_key)
                        .arg(cutoff)
                        .arg("+inf")
                        .query_async(&mut conn),
                )
                .await?;
            Ok(count as f64)
        }
    }

    async fn oldest(&self, key: &str, cutoff: f64) -> Result<Option<f64>> {
        let redis_key = self.redis_key(key);

        let mut conn = self.conn.clone();
        let first: Vec<(String, f64)> = self
            .timed(
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&redis_key)
                    .arg(cutoff)
                    .arg("+inf")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(1)
                    .arg("WITHSCORES")
                    .query_async(&mut conn),
            )
            .await?;
        Ok(first.first().map(|(_, score)| *score))
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool> {
        let redis_key = self.redis_key(key);

        let mut conn = self.conn.clone();
        let removed: i64 = self
            .timed(redis::cmd("ZREM").arg(&redis_key).arg(member).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let redis_key = self.redis_key(key);

        let mut conn = self.conn.clone();
        let _: i64 = self
            .timed(redis::cmd("DEL").arg(&redis_key).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        let pattern = format!("{}*", self.key_prefix);
        let prefix_len = self.key_prefix.len();

        let mut conn = self.conn.clone();
        let keys = self
            .timed(async move {
                let mut keys = Vec::new();
                let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(&pattern).await?;
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                Ok::<_, redis::RedisError>(keys)
            })
            .await?;

        Ok(keys
            .into_iter()
            .map(|k| k.get(prefix_len..).map(str::to_string).unwrap_or(k))
            .collect())
    }

    async fn report_memory(&self) -> Result<u64> {
        let keys = self.all_keys().await?;

        let mut total = 0u64;
        let mut conn = self.conn.clone();
        for key in keys {
            let redis_key = self.redis_key(&key);
            let usage: Option<i64> = self
                .timed(
                    redis::cmd("MEMORY")
                        .arg("USAGE")
                        .arg(&redis_key)
                        .query_async(&mut conn),
                )
                .await?;
            total += usage.unwrap_or(0).max(0) as u64;
        }
        Ok(total)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = self.timed(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}
