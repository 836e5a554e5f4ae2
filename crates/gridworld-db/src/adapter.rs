//! Storage adapter: one hash/set/sorted-set/key-value interface over the
//! remote `Dragonfly` backend and the in-process fallback.
//!
//! # States
//!
//! ```text
//! Disconnected --> Connecting --> Ready <--> Degraded
//! ```
//!
//! - `Ready` routes every call to the remote backend (or, in fallback-only
//!   mode, to the in-process backend, which is then authoritative).
//! - `Degraded` routes every call to the in-process fallback. Nothing is
//!   copied between backends on either transition: writes made while
//!   degraded live only in process memory until a flush persists them, and
//!   are lost if the process stops first. This is the accepted
//!   loss-of-durability window.
//! - `Disconnected` and `Connecting` reject calls with
//!   [`AdapterError::Unavailable`].
//!
//! The state machine is owned by a single [`AdapterSupervisor`] task. The
//! adapter itself only reads the published state and reports failed remote
//! calls to the supervisor. Transitions from `Degraded` back to `Ready` are
//! announced on a broadcast channel ([`StorageAdapter::subscribe_recovered`])
//! so the reconciliation engine can reload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fred::error::ErrorKind;
use tokio::sync::{broadcast, mpsc, watch};

use crate::dragonfly::DragonflyBackend;
use crate::error::AdapterError;
use crate::memory::MemoryBackend;

/// Default per-command timeout against the remote backend.
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 2_000;

/// Default time to wait for the first remote connection.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5_000;

/// Default supervisor probe interval.
const DEFAULT_PROBE_INTERVAL_MS: u64 = 1_000;

/// Capacity of the recovery broadcast channel.
const RECOVERY_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle state of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Not connected and not trying.
    Disconnected,
    /// Waiting for the first remote connection.
    Connecting,
    /// Serving calls from the authoritative cache.
    Ready,
    /// Remote backend lost; serving calls from the in-process fallback.
    Degraded,
}

/// Broadcast when the remote backend comes back after a degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovered;

/// Configuration for [`StorageAdapter::connect`].
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Remote backend URL (`redis://host:port`). `None` runs on the
    /// in-process backend only.
    pub dragonfly_url: Option<String>,
    /// Whether the in-process fallback may serve calls.
    pub fallback_enabled: bool,
    /// Per-command timeout against the remote backend.
    pub command_timeout: Duration,
    /// How long startup waits for the first remote connection.
    pub ready_timeout: Duration,
    /// How often the supervisor probes the remote backend.
    pub probe_interval: Duration,
}

impl AdapterConfig {
    /// Configuration with default timeouts.
    pub fn new(dragonfly_url: Option<String>, fallback_enabled: bool) -> Self {
        Self {
            dragonfly_url,
            fallback_enabled,
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            probe_interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
        }
    }

    /// Set the first-connection timeout.
    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the supervisor probe interval.
    #[must_use]
    pub const fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the per-command timeout.
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// A write queued in a [`Pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `SET key value`.
    Set {
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
    /// `DEL key`.
    Del {
        /// Key.
        key: String,
    },
    /// `HSET key field value`.
    HSet {
        /// Hash key.
        key: String,
        /// Field.
        field: String,
        /// Value.
        value: String,
    },
    /// `HDEL key field`.
    HDel {
        /// Hash key.
        key: String,
        /// Field.
        field: String,
    },
    /// `SADD key member`.
    SAdd {
        /// Set key.
        key: String,
        /// Member.
        member: String,
    },
    /// `SREM key member`.
    SRem {
        /// Set key.
        key: String,
        /// Member.
        member: String,
    },
    /// `ZADD key score member`.
    ZAdd {
        /// Sorted-set key.
        key: String,
        /// Member.
        member: String,
        /// Score.
        score: f64,
    },
    /// `ZREM key member`.
    ZRem {
        /// Sorted-set key.
        key: String,
        /// Member.
        member: String,
    },
}

/// Routes one call to the backend selected by the current state.
macro_rules! dispatch {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {
        match $self.route()? {
            Route::Remote(remote) => {
                let result = remote.$method($($arg),*).await;
                $self.observe(result)
            }
            Route::Fallback => Ok($self.fallback.$method($($arg),*).await),
        }
    };
}

enum Route<'a> {
    Remote(&'a DragonflyBackend),
    Fallback,
}

/// Uniform cache interface with automatic failover.
pub struct StorageAdapter {
    remote: Option<DragonflyBackend>,
    fallback: Arc<MemoryBackend>,
    fallback_enabled: bool,
    state: watch::Receiver<AdapterState>,
    reached_ready: watch::Receiver<bool>,
    recovered: broadcast::Sender<Recovered>,
    failures: mpsc::UnboundedSender<String>,
}

impl StorageAdapter {
    /// Connect according to `config` and build the supervisor that owns the
    /// state machine. The caller must spawn [`AdapterSupervisor::run`].
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Config`] if neither a remote backend nor the
    /// fallback is configured, or the URL is invalid.
    /// Returns [`AdapterError::Unavailable`] if the remote backend is not
    /// reachable within `ready_timeout` and the fallback is disabled.
    pub async fn connect(config: &AdapterConfig) -> Result<(Self, AdapterSupervisor), AdapterError> {
        let (remote, initial) = match config.dragonfly_url.as_deref() {
            None if !config.fallback_enabled => {
                return Err(AdapterError::Config(String::from(
                    "no Dragonfly URL and fallback disabled",
                )));
            }
            None => {
                tracing::info!("No Dragonfly configured, using in-process store");
                (None, AdapterState::Ready)
            }
            Some(url) => {
                let (backend, connected) =
                    DragonflyBackend::connect(url, config.command_timeout, config.ready_timeout)
                        .await?;
                let initial = match (connected, config.fallback_enabled) {
                    (true, _) => AdapterState::Ready,
                    (false, true) => {
                        tracing::warn!("Starting degraded on the in-process fallback");
                        AdapterState::Degraded
                    }
                    (false, false) => {
                        return Err(AdapterError::Unavailable(String::from(
                            "Dragonfly unreachable at startup and fallback disabled",
                        )));
                    }
                };
                (Some(backend), initial)
            }
        };

        let (adapter, supervisor) = Self::assemble(remote, config.fallback_enabled, initial);
        let supervisor = supervisor.with_probe(config.probe_interval, config.command_timeout);
        Ok((adapter, supervisor))
    }

    /// An adapter backed only by the in-process store, already `Ready`.
    pub fn in_memory() -> Self {
        Self::assemble(None, true, AdapterState::Ready).0
    }

    /// An adapter pinned to `state` with no supervisor running.
    #[cfg(test)]
    pub(crate) fn detached(state: AdapterState) -> Self {
        Self::assemble(None, true, state).0
    }

    fn assemble(
        remote: Option<DragonflyBackend>,
        fallback_enabled: bool,
        initial: AdapterState,
    ) -> (Self, AdapterSupervisor) {
        let (state_tx, state_rx) = watch::channel(initial);
        let (ready_tx, ready_rx) = watch::channel(initial == AdapterState::Ready);
        let (recovered_tx, _) = broadcast::channel(RECOVERY_CHANNEL_CAPACITY);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let fallback = Arc::new(MemoryBackend::new());

        let supervisor = AdapterSupervisor {
            remote: remote.clone(),
            fallback: Arc::clone(&fallback),
            fallback_enabled,
            state: state_tx,
            reached_ready: ready_tx,
            recovered: recovered_tx.clone(),
            failures: failures_rx,
            probe_interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
            probe_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
        };
        let adapter = Self {
            remote,
            fallback,
            fallback_enabled,
            state: state_rx,
            reached_ready: ready_rx,
            recovered: recovered_tx,
            failures: failures_tx,
        };
        (adapter, supervisor)
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        *self.state.borrow()
    }

    /// Whether the authoritative cache is serving calls.
    pub fn is_available(&self) -> bool {
        self.state() == AdapterState::Ready
    }

    /// Whether calls are currently served by the in-process fallback.
    pub fn is_degraded(&self) -> bool {
        self.state() == AdapterState::Degraded
    }

    /// Suspend until the adapter has reached `Ready` at least once.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Unavailable`] if the supervisor has gone away
    /// without ever reaching `Ready`.
    pub async fn wait_for_ready(&self) -> Result<(), AdapterError> {
        let mut rx = self.reached_ready.clone();
        rx.wait_for(|reached| *reached)
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::Unavailable(format!("supervisor stopped: {e}")))
    }

    /// Subscribe to `Degraded -> Ready` transitions.
    pub fn subscribe_recovered(&self) -> broadcast::Receiver<Recovered> {
        self.recovered.subscribe()
    }

    fn route(&self) -> Result<Route<'_>, AdapterError> {
        match (self.state(), self.remote.as_ref()) {
            (AdapterState::Ready, Some(remote)) => Ok(Route::Remote(remote)),
            (AdapterState::Ready, None) => Ok(Route::Fallback),
            (AdapterState::Degraded, _) if self.fallback_enabled => Ok(Route::Fallback),
            (state, _) => Err(AdapterError::Unavailable(format!("adapter is {state:?}"))),
        }
    }

    /// Pass a remote result through, reporting connection-level failures to
    /// the supervisor.
    fn observe<T>(&self, result: Result<T, AdapterError>) -> Result<T, AdapterError> {
        if let Err(AdapterError::Dragonfly(ref e)) = result
            && matches!(
                e.kind(),
                ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled
            )
        {
            let _ = self.failures.send(e.to_string());
        }
        result
    }

    // =========================================================================
    // Key-value
    // =========================================================================

    /// `GET key`.
    pub async fn get(&self, key: &str) -> Result<Option<String>, AdapterError> {
        dispatch!(self, get(key))
    }

    /// `SET key value`.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), AdapterError> {
        dispatch!(self, set(key, value))
    }

    /// `DEL key [key ...]`, returning how many keys existed.
    pub async fn del(&self, keys: &[String]) -> Result<u64, AdapterError> {
        dispatch!(self, del(keys))
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    /// `HGET key field`.
    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, AdapterError> {
        dispatch!(self, hget(key, field))
    }

    /// `HSET key field value`.
    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), AdapterError> {
        dispatch!(self, hset(key, field, value))
    }

    /// `HGETALL key`.
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, AdapterError> {
        dispatch!(self, hgetall(key))
    }

    /// `HDEL key field`, returning whether the field existed.
    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool, AdapterError> {
        dispatch!(self, hdel(key, field))
    }

    // =========================================================================
    // Sets
    // =========================================================================

    /// `SADD key member`, returning whether the member was new.
    pub async fn sadd(&self, key: &str, member: &str) -> Result<bool, AdapterError> {
        dispatch!(self, sadd(key, member))
    }

    /// `SREM key member`, returning whether the member was present.
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool, AdapterError> {
        dispatch!(self, srem(key, member))
    }

    /// `SMEMBERS key`.
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, AdapterError> {
        dispatch!(self, smembers(key))
    }

    /// `SCARD key`.
    pub async fn scard(&self, key: &str) -> Result<u64, AdapterError> {
        dispatch!(self, scard(key))
    }

    /// `SISMEMBER key member`.
    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool, AdapterError> {
        dispatch!(self, sismember(key, member))
    }

    // =========================================================================
    // Sorted sets
    // =========================================================================

    /// `ZADD key score member`.
    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), AdapterError> {
        dispatch!(self, zadd(key, member, score))
    }

    /// `ZREM key member`, returning whether the member was present.
    pub async fn zrem(&self, key: &str, member: &str) -> Result<bool, AdapterError> {
        dispatch!(self, zrem(key, member))
    }

    /// `ZRANGEBYSCORE key min max WITHSCORES`, ordered by score.
    pub async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, AdapterError> {
        dispatch!(self, zrange_by_score(key, min, max))
    }

    // =========================================================================
    // Compound operations (fertile queue and delivery coordinator only)
    // =========================================================================

    /// Add `member` with `score` to the sorted set `key` unless the
    /// membership set `{key}:members` already contains it. Indivisible.
    pub(crate) async fn atomic_enqueue(
        &self,
        key: &str,
        member: &str,
        score: f64,
    ) -> Result<bool, AdapterError> {
        let members = members_key(key);
        let members = members.as_str();
        dispatch!(self, atomic_enqueue(key, members, member, score))
    }

    /// Remove and return the earliest member of `key` with score `<= now`,
    /// also removing it from `{key}:members`. Indivisible.
    pub(crate) async fn atomic_pop_due(
        &self,
        key: &str,
        now: f64,
    ) -> Result<Option<String>, AdapterError> {
        let members = members_key(key);
        let members = members.as_str();
        dispatch!(self, atomic_pop_due(key, members, now))
    }

    /// Take the lock `key` for `ttl` if nobody holds it.
    pub(crate) async fn try_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, AdapterError> {
        dispatch!(self, try_lock(key, token, ttl))
    }

    /// Release the lock `key` if `token` still holds it.
    pub(crate) async fn release_lock(&self, key: &str, token: &str) -> Result<bool, AdapterError> {
        dispatch!(self, release_lock(key, token))
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Start a batch of writes submitted together by [`Pipeline::exec`].
    pub const fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            adapter: self,
            commands: Vec::new(),
        }
    }
}

/// Key of the membership set paired with the sorted set `key`.
pub fn members_key(key: &str) -> String {
    format!("{key}:members")
}

/// A batch of writes submitted in one round trip. Not atomic: other callers
/// may observe a partially applied pipeline.
#[must_use = "a pipeline does nothing until exec() is called"]
pub struct Pipeline<'a> {
    adapter: &'a StorageAdapter,
    commands: Vec<Command>,
}

impl Pipeline<'_> {
    /// Queue an arbitrary command.
    pub fn push(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Queue `HSET key field value`.
    pub fn hset(self, key: &str, field: &str, value: &str) -> Self {
        self.push(Command::HSet {
            key: key.to_owned(),
            field: field.to_owned(),
            value: value.to_owned(),
        })
    }

    /// Queue `HDEL key field`.
    pub fn hdel(self, key: &str, field: &str) -> Self {
        self.push(Command::HDel {
            key: key.to_owned(),
            field: field.to_owned(),
        })
    }

    /// Queue `SADD key member`.
    pub fn sadd(self, key: &str, member: &str) -> Self {
        self.push(Command::SAdd {
            key: key.to_owned(),
            member: member.to_owned(),
        })
    }

    /// Queue `SREM key member`.
    pub fn srem(self, key: &str, member: &str) -> Self {
        self.push(Command::SRem {
            key: key.to_owned(),
            member: member.to_owned(),
        })
    }

    /// Queue `ZREM key member`.
    pub fn zrem(self, key: &str, member: &str) -> Self {
        self.push(Command::ZRem {
            key: key.to_owned(),
            member: member.to_owned(),
        })
    }

    /// Queue `DEL key`.
    pub fn del(self, key: &str) -> Self {
        self.push(Command::Del {
            key: key.to_owned(),
        })
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Submit every queued command.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the active backend rejects the batch.
    pub async fn exec(self) -> Result<(), AdapterError> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let adapter = self.adapter;
        let commands = self.commands.as_slice();
        dispatch!(adapter, exec(commands))
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owner of the adapter state machine.
///
/// Runs as one task. Moves `Ready -> Degraded` when a remote call fails at
/// the connection level or a probe fails, and `Degraded -> Ready` when a
/// probe succeeds again. On recovery the fallback is emptied (nothing is
/// migrated) and [`Recovered`] is broadcast.
pub struct AdapterSupervisor {
    remote: Option<DragonflyBackend>,
    fallback: Arc<MemoryBackend>,
    fallback_enabled: bool,
    state: watch::Sender<AdapterState>,
    reached_ready: watch::Sender<bool>,
    recovered: broadcast::Sender<Recovered>,
    failures: mpsc::UnboundedReceiver<String>,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl AdapterSupervisor {
    const fn with_probe(mut self, interval: Duration, timeout: Duration) -> Self {
        self.probe_interval = interval;
        self.probe_timeout = timeout;
        self
    }

    /// Drive the state machine until the adapter is dropped.
    pub async fn run(mut self) {
        let Some(remote) = self.remote.clone() else {
            tracing::debug!("No remote backend, supervisor idle");
            return;
        };

        let mut probe = tokio::time::interval(self.probe_interval);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                failure = self.failures.recv() => {
                    let Some(reason) = failure else {
                        tracing::debug!("Storage adapter dropped, supervisor stopping");
                        return;
                    };
                    self.on_failure(&reason);
                }
                _ = probe.tick() => {
                    let healthy = remote.probe(self.probe_timeout).await;
                    self.on_probe(healthy).await;
                }
            }
        }
    }

    fn current(&self) -> AdapterState {
        *self.state.borrow()
    }

    fn on_failure(&self, reason: &str) {
        if self.current() == AdapterState::Ready {
            self.degrade(reason);
        }
    }

    async fn on_probe(&self, healthy: bool) {
        match (self.current(), healthy) {
            (AdapterState::Ready, false) => self.degrade("probe failed"),
            (AdapterState::Degraded | AdapterState::Connecting | AdapterState::Disconnected, true) => {
                self.promote().await;
            }
            _ => {}
        }
    }

    fn degrade(&self, reason: &str) {
        if self.fallback_enabled {
            tracing::warn!(
                reason,
                "Dragonfly lost, switching to in-process fallback (cache writes are not durable until the next flush)"
            );
            self.transition(AdapterState::Degraded);
        } else {
            tracing::error!(reason, "Dragonfly lost and fallback disabled");
            self.transition(AdapterState::Disconnected);
        }
    }

    async fn promote(&self) {
        let previous = self.current();
        self.transition(AdapterState::Ready);
        let _ = self.reached_ready.send(true);
        if previous == AdapterState::Degraded {
            tracing::info!("Dragonfly recovered, discarding fallback contents");
            self.fallback.clear().await;
            let _ = self.recovered.send(Recovered);
        } else {
            tracing::info!(?previous, "Dragonfly ready");
        }
    }

    fn transition(&self, next: AdapterState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                tracing::debug!(from = ?*state, to = ?next, "Adapter state change");
                *state = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_adapter_is_ready() {
        let adapter = StorageAdapter::in_memory();
        assert!(adapter.is_available());
        assert!(adapter.wait_for_ready().await.is_ok());
    }

    #[tokio::test]
    async fn basic_ops_round_trip() {
        let adapter = StorageAdapter::in_memory();
        assert!(adapter.set("k", "v").await.is_ok());
        assert_eq!(adapter.get("k").await.ok().flatten().as_deref(), Some("v"));

        assert!(adapter.hset("h", "a", "1").await.is_ok());
        assert_eq!(adapter.hgetall("h").await.ok().map(|m| m.len()), Some(1));

        assert_eq!(adapter.sadd("s", "x").await.ok(), Some(true));
        assert_eq!(adapter.sadd("s", "x").await.ok(), Some(false));
        assert_eq!(adapter.scard("s").await.ok(), Some(1));

        assert!(adapter.zadd("z", "late", 9.0).await.is_ok());
        assert!(adapter.zadd("z", "early", 1.0).await.is_ok());
        let range = adapter.zrange_by_score("z", 0.0, 5.0).await.unwrap_or_default();
        assert_eq!(range, vec![(String::from("early"), 1.0)]);
    }

    #[tokio::test]
    async fn pipeline_applies_in_order() {
        let adapter = StorageAdapter::in_memory();
        let result = adapter
            .pipeline()
            .hset("h", "f", "1")
            .sadd("s", "m")
            .srem("s", "m")
            .hdel("h", "f")
            .sadd("s", "n")
            .exec()
            .await;
        assert!(result.is_ok());
        assert!(adapter.hgetall("h").await.unwrap_or_default().is_empty());
        assert_eq!(adapter.smembers("s").await.unwrap_or_default(), vec![String::from("n")]);
    }

    #[tokio::test]
    async fn connecting_adapter_rejects_calls() {
        let (adapter, _supervisor) = StorageAdapter::assemble(None, true, AdapterState::Connecting);
        assert!(matches!(
            adapter.get("k").await,
            Err(AdapterError::Unavailable(_))
        ));
        assert!(!adapter.is_available());
    }

    #[tokio::test]
    async fn supervisor_degrades_and_recovers() {
        let (adapter, supervisor) = StorageAdapter::assemble(None, true, AdapterState::Ready);
        let mut recovered = adapter.subscribe_recovered();

        supervisor.on_failure("connection reset");
        assert_eq!(adapter.state(), AdapterState::Degraded);
        assert!(adapter.is_degraded());
        // Degraded adapters keep serving from the fallback.
        assert!(adapter.set("k", "v").await.is_ok());

        supervisor.on_probe(true).await;
        assert_eq!(adapter.state(), AdapterState::Ready);
        assert_eq!(recovered.try_recv().ok(), Some(Recovered));
        // Fallback contents do not survive recovery.
        assert_eq!(adapter.fallback.get("k").await, None);
    }

    #[tokio::test]
    async fn degrade_without_fallback_disconnects() {
        let (adapter, supervisor) = StorageAdapter::assemble(None, false, AdapterState::Ready);
        supervisor.on_probe(false).await;
        assert_eq!(adapter.state(), AdapterState::Disconnected);
        assert!(adapter.get("k").await.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_resolves_on_promotion() {
        let (adapter, supervisor) = StorageAdapter::assemble(None, true, AdapterState::Connecting);
        let adapter = std::sync::Arc::new(adapter);
        let waiter = {
            let adapter = std::sync::Arc::clone(&adapter);
            tokio::spawn(async move { adapter.wait_for_ready().await.is_ok() })
        };
        tokio::task::yield_now().await;
        supervisor.on_probe(true).await;
        assert!(waiter.await.unwrap_or(false));
    }
}
