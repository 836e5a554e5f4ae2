//! `Dragonfly` (Redis-compatible) backend of the storage adapter.
//!
//! This is the fast remote store. Plain hash/set/sorted-set/key-value calls
//! map one-to-one onto Redis commands. The compound operations used by the
//! fertile queue and the delivery coordinator run as server-side Lua
//! scripts so no other client can observe an intermediate state.
//!
//! # Scripts
//!
//! | Script | Keys | Args | Returns |
//! |--------|------|------|---------|
//! | [`ENQUEUE_SCRIPT`] | queue, members | member, score | `1` added / `0` already queued |
//! | [`POP_DUE_SCRIPT`] | queue, members | now | member or nil |
//! | [`RELEASE_LOCK_SCRIPT`] | lock | token | `1` released / `0` not holder |

use std::collections::HashMap;
use std::time::Duration;

use fred::prelude::*;
use fred::types::{Expiration, SetOptions, Value};

use crate::adapter::Command;
use crate::error::AdapterError;

/// Add `member` to the queue unless the membership set already holds it.
pub const ENQUEUE_SCRIPT: &str = r"
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  return 0
end
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
return 1
";

/// Remove and return the earliest member whose score is at most `now`.
pub const POP_DUE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
  return false
end
redis.call('ZREM', KEYS[1], due[1])
redis.call('SREM', KEYS[2], due[1])
return due[1]
";

/// Delete the lock only if it still carries the caller's token.
pub const RELEASE_LOCK_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Key probed by the supervisor's health check.
const PROBE_KEY: &str = "gridworld:probe";

/// `KEYS` and `ARGV` of one script call.
#[derive(Debug, PartialEq)]
struct ScriptCall {
    keys: Vec<String>,
    args: Vec<String>,
}

impl ScriptCall {
    fn enqueue(queue: &str, members: &str, member: &str, score: f64) -> Self {
        Self {
            keys: vec![queue.to_owned(), members.to_owned()],
            args: vec![member.to_owned(), score.to_string()],
        }
    }

    fn pop_due(queue: &str, members: &str, now: f64) -> Self {
        Self {
            keys: vec![queue.to_owned(), members.to_owned()],
            args: vec![now.to_string()],
        }
    }

    fn release_lock(key: &str, token: &str) -> Self {
        Self {
            keys: vec![key.to_owned()],
            args: vec![token.to_owned()],
        }
    }
}

/// Scripts answer `1` for success and `0` otherwise.
const fn script_flag(reply: i64) -> bool {
    reply == 1
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Connection handle to a `Dragonfly` instance.
#[derive(Clone)]
pub struct DragonflyBackend {
    client: Client,
}

impl DragonflyBackend {
    /// Build a client for `url` and start connecting in the background.
    ///
    /// The client reconnects on its own with exponential backoff; the
    /// adapter supervisor decides when it is usable again. Returns once the
    /// first connection succeeds or `ready_timeout` elapses, whichever comes
    /// first; the boolean reports which.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Config`] if the URL cannot be parsed.
    /// Returns [`AdapterError::Dragonfly`] if the client cannot be built.
    pub async fn connect(
        url: &str,
        command_timeout: Duration,
        ready_timeout: Duration,
    ) -> Result<(Self, bool), AdapterError> {
        let config = Config::from_url(url)
            .map_err(|e| AdapterError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config)
            .with_performance_config(|perf| {
                perf.default_command_timeout = command_timeout;
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2))
            .build()?;
        let _connection = client.connect();

        let connected = matches!(
            tokio::time::timeout(ready_timeout, client.wait_for_connect()).await,
            Ok(Ok(()))
        );

        if connected {
            tracing::info!("Connected to Dragonfly");
        } else {
            tracing::warn!(
                timeout_ms = u64::try_from(ready_timeout.as_millis()).unwrap_or(u64::MAX),
                "Dragonfly not reachable yet, client keeps reconnecting"
            );
        }
        Ok((Self { client }, connected))
    }

    /// Check that the server answers a round trip within `timeout`.
    pub async fn probe(&self, timeout: Duration) -> bool {
        if !self.client.is_connected() {
            return false;
        }
        let call = self.client.get::<Option<String>, _>(PROBE_KEY);
        matches!(tokio::time::timeout(timeout, call).await, Ok(Ok(_)))
    }

    // =========================================================================
    // Key-value
    // =========================================================================

    pub(crate) async fn get(&self, key: &str) -> Result<Option<String>, AdapterError> {
        Ok(self.client.get(key).await?)
    }

    pub(crate) async fn set(&self, key: &str, value: &str) -> Result<(), AdapterError> {
        let _: () = self.client.set(key, value, None, None, false).await?;
        Ok(())
    }

    pub(crate) async fn del(&self, keys: &[String]) -> Result<u64, AdapterError> {
        if keys.is_empty() {
            return Ok(0);
        }
        Ok(self.client.del(keys.to_vec()).await?)
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    pub(crate) async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, AdapterError> {
        Ok(self.client.hget(key, field).await?)
    }

    pub(crate) async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), AdapterError> {
        let _: u64 = self
            .client
            .hset(key, vec![(field.to_owned(), value.to_owned())])
            .await?;
        Ok(())
    }

    pub(crate) async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, AdapterError> {
        Ok(self.client.hgetall(key).await?)
    }

    pub(crate) async fn hdel(&self, key: &str, field: &str) -> Result<bool, AdapterError> {
        let removed: u64 = self.client.hdel(key, field).await?;
        Ok(removed > 0)
    }

    // =========================================================================
    // Sets
    // =========================================================================

    pub(crate) async fn sadd(&self, key: &str, member: &str) -> Result<bool, AdapterError> {
        let added: u64 = self.client.sadd(key, member).await?;
        Ok(added > 0)
    }

    pub(crate) async fn srem(&self, key: &str, member: &str) -> Result<bool, AdapterError> {
        let removed: u64 = self.client.srem(key, member).await?;
        Ok(removed > 0)
    }

    pub(crate) async fn smembers(&self, key: &str) -> Result<Vec<String>, AdapterError> {
        Ok(self.client.smembers(key).await?)
    }

    pub(crate) async fn scard(&self, key: &str) -> Result<u64, AdapterError> {
        Ok(self.client.scard(key).await?)
    }

    pub(crate) async fn sismember(&self, key: &str, member: &str) -> Result<bool, AdapterError> {
        Ok(self.client.sismember(key, member).await?)
    }

    // =========================================================================
    // Sorted sets
    // =========================================================================

    pub(crate) async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), AdapterError> {
        let _: u64 = self
            .client
            .zadd(key, None, None, false, false, (score, member))
            .await?;
        Ok(())
    }

    pub(crate) async fn zrem(&self, key: &str, member: &str) -> Result<bool, AdapterError> {
        let removed: u64 = self.client.zrem(key, member).await?;
        Ok(removed > 0)
    }

    pub(crate) async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, AdapterError> {
        Ok(self
            .client
            .zrangebyscore(key, min, max, true, None)
            .await?)
    }

    // =========================================================================
    // Compound operations
    // =========================================================================

    pub(crate) async fn atomic_enqueue(
        &self,
        queue: &str,
        members: &str,
        member: &str,
        score: f64,
    ) -> Result<bool, AdapterError> {
        let call = ScriptCall::enqueue(queue, members, member, score);
        let added: i64 = self.client.eval(ENQUEUE_SCRIPT, call.keys, call.args).await?;
        Ok(script_flag(added))
    }

    pub(crate) async fn atomic_pop_due(
        &self,
        queue: &str,
        members: &str,
        now: f64,
    ) -> Result<Option<String>, AdapterError> {
        let call = ScriptCall::pop_due(queue, members, now);
        Ok(self.client.eval(POP_DUE_SCRIPT, call.keys, call.args).await?)
    }

    pub(crate) async fn try_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, AdapterError> {
        let ttl_ms = ttl_millis(ttl);
        let reply: Option<String> = self
            .client
            .set(
                key,
                token,
                Some(Expiration::PX(ttl_ms)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(reply.is_some())
    }

    pub(crate) async fn release_lock(&self, key: &str, token: &str) -> Result<bool, AdapterError> {
        let call = ScriptCall::release_lock(key, token);
        let released: i64 = self.client.eval(RELEASE_LOCK_SCRIPT, call.keys, call.args).await?;
        Ok(script_flag(released))
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Submit `commands` in one round trip. Not atomic.
    pub(crate) async fn exec(&self, commands: &[Command]) -> Result<(), AdapterError> {
        let pipeline = self.client.pipeline();
        for command in commands {
            match command {
                Command::Set { key, value } => {
                    let _: () = pipeline
                        .set(key.as_str(), value.as_str(), None, None, false)
                        .await?;
                }
                Command::Del { key } => {
                    let _: () = pipeline.del(key.as_str()).await?;
                }
                Command::HSet { key, field, value } => {
                    let _: () = pipeline
                        .hset(key.as_str(), vec![(field.clone(), value.clone())])
                        .await?;
                }
                Command::HDel { key, field } => {
                    let _: () = pipeline.hdel(key.as_str(), field.as_str()).await?;
                }
                Command::SAdd { key, member } => {
                    let _: () = pipeline.sadd(key.as_str(), member.as_str()).await?;
                }
                Command::SRem { key, member } => {
                    let _: () = pipeline.srem(key.as_str(), member.as_str()).await?;
                }
                Command::ZAdd { key, member, score } => {
                    let _: () = pipeline
                        .zadd(key.as_str(), None, None, false, false, (*score, member.as_str()))
                        .await?;
                }
                Command::ZRem { key, member } => {
                    let _: () = pipeline.zrem(key.as_str(), member.as_str()).await?;
                }
            }
        }
        let _: Vec<Value> = pipeline.all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Highest `{prefix}n]` index a script reads.
    fn highest_index(script: &str, prefix: &str) -> usize {
        script
            .match_indices(prefix)
            .filter_map(|(at, _)| {
                let rest = script.get(at.saturating_add(prefix.len())..)?;
                let end = rest.find(']')?;
                rest.get(..end)?.parse().ok()
            })
            .max()
            .unwrap_or(0)
    }

    fn assert_fits(script: &str, call: &ScriptCall) {
        assert_eq!(highest_index(script, "KEYS["), call.keys.len());
        assert_eq!(highest_index(script, "ARGV["), call.args.len());
    }

    #[test]
    fn enqueue_call_matches_script() {
        let call = ScriptCall::enqueue("queue:fertile", "queue:fertile:members", "7", 1_461_048.0);
        assert_fits(ENQUEUE_SCRIPT, &call);
        assert_eq!(call.keys, ["queue:fertile", "queue:fertile:members"]);
        assert_eq!(call.args, ["7", "1461048"]);
    }

    #[test]
    fn pop_due_call_matches_script() {
        let call = ScriptCall::pop_due("queue:fertile", "queue:fertile:members", 1_461_048.5);
        assert_fits(POP_DUE_SCRIPT, &call);
        assert_eq!(call.args, ["1461048.5"]);
    }

    #[test]
    fn release_call_matches_script() {
        let call = ScriptCall::release_lock("lock:family:p3", "token-1");
        assert_fits(RELEASE_LOCK_SCRIPT, &call);
        assert_eq!(call.keys, ["lock:family:p3"]);
        assert_eq!(call.args, ["token-1"]);
    }

    #[test]
    fn script_replies_map_to_flags() {
        assert!(script_flag(1));
        assert!(!script_flag(0));
        assert!(!script_flag(-1));
    }

    #[test]
    fn lock_ttl_saturates() {
        assert_eq!(ttl_millis(Duration::from_millis(5_000)), 5_000);
        assert_eq!(ttl_millis(Duration::MAX), i64::MAX);
    }
}
