//! In-process fallback backend of the storage adapter.
//!
//! Holds every structure in plain maps behind one [`tokio::sync::Mutex`].
//! Each call, including the compound queue and lock operations, runs inside
//! a single critical section, which is what makes `atomic_enqueue` and
//! `atomic_pop_due` indivisible here.
//!
//! Nothing in this backend survives a restart.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::adapter::Command;

/// A string value with an optional expiry deadline.
#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

#[derive(Debug, Default)]
struct MemoryData {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

impl MemoryData {
    fn live_string(&self, key: &str) -> Option<&String> {
        let now = Instant::now();
        self.strings
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| &entry.value)
    }

    fn del(&mut self, key: &str) -> bool {
        let s = self.strings.remove(key).is_some();
        let h = self.hashes.remove(key).is_some();
        let st = self.sets.remove(key).is_some();
        let z = self.zsets.remove(key).is_some();
        s || h || st || z
    }

    fn sadd(&mut self, key: &str, member: &str) -> bool {
        self.sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned())
    }

    fn srem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) {
        self.zsets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    /// Members with `min <= score <= max`, ordered by score then member.
    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Vec<(String, f64)> {
        let mut hits: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|zset| {
                zset.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
    }

    fn hdel(&mut self, key: &str, field: &str) -> bool {
        let Some(hash) = self.hashes.get_mut(key) else {
            return false;
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            self.hashes.remove(key);
        }
        removed
    }

    fn apply(&mut self, command: &Command) {
        match command {
            Command::Set { key, value } => {
                self.strings.insert(
                    key.clone(),
                    StringEntry {
                        value: value.clone(),
                        expires_at: None,
                    },
                );
            }
            Command::Del { key } => {
                self.del(key);
            }
            Command::HSet { key, field, value } => self.hset(key, field, value),
            Command::HDel { key, field } => {
                self.hdel(key, field);
            }
            Command::SAdd { key, member } => {
                self.sadd(key, member);
            }
            Command::SRem { key, member } => {
                self.srem(key, member);
            }
            Command::ZAdd { key, member, score } => self.zadd(key, member, *score),
            Command::ZRem { key, member } => {
                self.zrem(key, member);
            }
        }
    }
}

/// In-process store used while the remote backend is unavailable, or as
/// the only store when no remote backend is configured.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<MemoryData>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key.
    pub async fn clear(&self) {
        *self.data.lock().await = MemoryData::default();
    }

    pub(crate) async fn get(&self, key: &str) -> Option<String> {
        self.data.lock().await.live_string(key).cloned()
    }

    pub(crate) async fn set(&self, key: &str, value: &str) {
        self.data.lock().await.apply(&Command::Set {
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }

    pub(crate) async fn del(&self, keys: &[String]) -> u64 {
        let mut data = self.data.lock().await;
        let removed = keys.iter().filter(|key| data.del(key)).count();
        u64::try_from(removed).unwrap_or(u64::MAX)
    }

    pub(crate) async fn hget(&self, key: &str, field: &str) -> Option<String> {
        self.data
            .lock()
            .await
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned()
    }

    pub(crate) async fn hset(&self, key: &str, field: &str, value: &str) {
        self.data.lock().await.hset(key, field, value);
    }

    pub(crate) async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        self.data
            .lock()
            .await
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn hdel(&self, key: &str, field: &str) -> bool {
        self.data.lock().await.hdel(key, field)
    }

    pub(crate) async fn sadd(&self, key: &str, member: &str) -> bool {
        self.data.lock().await.sadd(key, member)
    }

    pub(crate) async fn srem(&self, key: &str, member: &str) -> bool {
        self.data.lock().await.srem(key, member)
    }

    pub(crate) async fn smembers(&self, key: &str) -> Vec<String> {
        self.data
            .lock()
            .await
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn scard(&self, key: &str) -> u64 {
        let len = self.data.lock().await.sets.get(key).map_or(0, HashSet::len);
        u64::try_from(len).unwrap_or(u64::MAX)
    }

    pub(crate) async fn sismember(&self, key: &str, member: &str) -> bool {
        self.data
            .lock()
            .await
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member))
    }

    pub(crate) async fn zadd(&self, key: &str, member: &str, score: f64) {
        self.data.lock().await.zadd(key, member, score);
    }

    pub(crate) async fn zrem(&self, key: &str, member: &str) -> bool {
        self.data.lock().await.zrem(key, member)
    }

    pub(crate) async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Vec<(String, f64)> {
        self.data.lock().await.zrange_by_score(key, min, max)
    }

    pub(crate) async fn atomic_enqueue(
        &self,
        queue: &str,
        members: &str,
        member: &str,
        score: f64,
    ) -> bool {
        let mut data = self.data.lock().await;
        if !data.sadd(members, member) {
            return false;
        }
        data.zadd(queue, member, score);
        true
    }

    pub(crate) async fn atomic_pop_due(&self, queue: &str, members: &str, now: f64) -> Option<String> {
        let mut data = self.data.lock().await;
        let (member, _) = data
            .zrange_by_score(queue, f64::NEG_INFINITY, now)
            .into_iter()
            .next()?;
        data.zrem(queue, &member);
        data.srem(members, &member);
        Some(member)
    }

    pub(crate) async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let mut data = self.data.lock().await;
        if data.live_string(key).is_some() {
            return false;
        }
        data.strings.insert(
            key.to_owned(),
            StringEntry {
                value: token.to_owned(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        true
    }

    pub(crate) async fn release_lock(&self, key: &str, token: &str) -> bool {
        let mut data = self.data.lock().await;
        if data.live_string(key).is_some_and(|holder| holder == token) {
            data.strings.remove(key);
            true
        } else {
            false
        }
    }

    /// Apply `commands` in order. Each command is applied under the lock,
    /// but other callers may interleave between commands.
    pub(crate) async fn exec(&self, commands: &[Command]) {
        for command in commands {
            self.data.lock().await.apply(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_due_respects_score_and_order() {
        let mem = MemoryBackend::new();
        assert!(mem.atomic_enqueue("q", "q:members", "b", 5.0).await);
        assert!(mem.atomic_enqueue("q", "q:members", "a", 5.0).await);
        assert!(mem.atomic_enqueue("q", "q:members", "c", 9.0).await);

        assert_eq!(mem.atomic_pop_due("q", "q:members", 4.0).await, None);
        assert_eq!(mem.atomic_pop_due("q", "q:members", 6.0).await.as_deref(), Some("a"));
        assert_eq!(mem.atomic_pop_due("q", "q:members", 6.0).await.as_deref(), Some("b"));
        assert_eq!(mem.atomic_pop_due("q", "q:members", 6.0).await, None);
        assert!(!mem.sismember("q:members", "a").await);
        assert!(mem.sismember("q:members", "c").await);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let mem = MemoryBackend::new();
        let ttl = Duration::from_secs(30);
        assert!(mem.try_lock("lock:x", "t1", ttl).await);
        assert!(!mem.try_lock("lock:x", "t2", ttl).await);
        assert!(!mem.release_lock("lock:x", "t2").await);
        assert!(mem.release_lock("lock:x", "t1").await);
        assert!(mem.try_lock("lock:x", "t2", ttl).await);
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken() {
        let mem = MemoryBackend::new();
        assert!(mem.try_lock("lock:y", "t1", Duration::from_millis(1)).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(mem.try_lock("lock:y", "t2", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn empty_structures_disappear() {
        let mem = MemoryBackend::new();
        mem.hset("h", "f", "1").await;
        assert!(mem.hdel("h", "f").await);
        assert!(mem.hgetall("h").await.is_empty());
    }
}
