// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wordbot_common::{
    DEFAULT_WORD_LENGTH, GameMode, GameSnapshot, GameStatus, GuessScore, MAX_WORD_LENGTH,
    MIN_WORD_LENGTH, WordList, expand_env_vars, normalize_guess, render_board,
};

/// Key namespace shared by every replica; existing persisted data depends on it.
const STORE_NAMESPACE: &str = "wordbot";

/// A channel lock is held for one game mutation; the TTL bounds the critical
/// section so a crashed holder cannot wedge the channel.
const CHANNEL_LOCK_TTL: Duration = Duration::from_secs(5);
const CHANNEL_LOCK_BLOCKING_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_ACQUIRE_RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Fraction of backend-unreachable occurrences that get logged.
const UNAVAILABLE_LOG_SAMPLE: f64 = 0.2;

#[derive(Debug, Clone)]
struct RedisConfig {
    enable: bool,
    host: String,
    port: u16,
}

#[derive(Debug, Clone)]
struct SupervisorConfig {
    lease_ttl: Duration,
    renewal_factor: u32,
    acquire_poll_interval: Duration,
    acquire_backoff_ceiling: Duration,
    extend_call_timeout: Duration,
    drain_grace: Duration,
}

impl SupervisorConfig {
    fn renewal_interval(&self) -> Duration {
        self.lease_ttl / self.renewal_factor.max(2)
    }
}

#[derive(Debug, Clone)]
struct BotConfig {
    identity_token: String,
    bind_addr: SocketAddr,
    redis: RedisConfig,
    supervisor: SupervisorConfig,
    wordlist_path: String,
    wordlist_url: Option<String>,
}

impl BotConfig {
    fn from_env() -> anyhow::Result<Self> {
        let identity_token = std::env::var("WORDBOT_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("WORDBOT_TOKEN must be set to the bot identity token")?;

        Ok(Self {
            identity_token,
            bind_addr: parse_bind_addr("WORDBOT_BIND", "0.0.0.0:8088")?,
            redis: RedisConfig {
                enable: parse_env_flag("WORDBOT_REDIS_ENABLE"),
                host: std::env::var("WORDBOT_REDIS_HOST")
                    .ok()
                    .unwrap_or_else(|| "redis".to_string()),
                port: std::env::var("WORDBOT_REDIS_PORT")
                    .ok()
                    .and_then(|value| value.parse::<u16>().ok())
                    .unwrap_or(6379),
            },
            supervisor: SupervisorConfig {
                lease_ttl: parse_env_duration_secs("WORDBOT_LEASE_TTL_SECONDS", 10),
                renewal_factor: std::env::var("WORDBOT_LEASE_RENEWAL_FACTOR")
                    .ok()
                    .and_then(|value| value.parse::<u32>().ok())
                    .unwrap_or(2)
                    .max(2),
                acquire_poll_interval: parse_env_duration_ms("WORDBOT_ACQUIRE_POLL_MS", 1_000),
                acquire_backoff_ceiling: parse_env_duration_ms(
                    "WORDBOT_ACQUIRE_BACKOFF_CEILING_MS",
                    5_000,
                ),
                extend_call_timeout: parse_env_duration_ms("WORDBOT_EXTEND_TIMEOUT_MS", 1_000),
                drain_grace: Duration::from_secs(10),
            },
            wordlist_path: std::env::var("WORDBOT_WORDLIST_PATH")
                .ok()
                .unwrap_or_else(|| "data/wordlist.txt".to_string()),
            wordlist_url: std::env::var("WORDBOT_WORDLIST_URL")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        })
    }
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

fn parse_env_flag(var_name: &str) -> bool {
    std::env::var(var_name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes"
            )
        })
        .unwrap_or(false)
}

fn parse_env_duration_ms(var_name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(
        std::env::var(var_name)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(default_ms),
    )
}

fn parse_env_duration_secs(var_name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(var_name)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(default_secs),
    )
}

#[derive(Debug, Clone, Default)]
struct ChannelFilter {
    allow_channels: HashSet<u64>,
    deny_channels: HashSet<u64>,
}

impl ChannelFilter {
    fn allows(&self, channel_id: u64) -> bool {
        if self.deny_channels.contains(&channel_id) {
            return false;
        }
        self.allow_channels.is_empty() || self.allow_channels.contains(&channel_id)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChannelFilterFile {
    #[serde(default)]
    allow_channels: Vec<u64>,
    #[serde(default)]
    deny_channels: Vec<u64>,
}

fn load_channel_filter() -> ChannelFilter {
    let Some(path) = std::env::var("WORDBOT_CHANNEL_FILTER_CONFIG_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    else {
        return ChannelFilter::default();
    };

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read channel filter config path");
            return ChannelFilter::default();
        }
    };

    let expanded = expand_env_vars(&raw);
    let parsed = match serde_yaml::from_str::<ChannelFilterFile>(&expanded) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse channel filter config yaml");
            return ChannelFilter::default();
        }
    };

    let filter = ChannelFilter {
        allow_channels: parsed.allow_channels.into_iter().collect(),
        deny_channels: parsed.deny_channels.into_iter().collect(),
    };
    info!(
        path = %path,
        allow_count = filter.allow_channels.len(),
        deny_count = filter.deny_channels.len(),
        "loaded channel filter config"
    );
    filter
}

/// Backend error taxonomy. Everything the supervisor's state machine matches
/// on is one of these variants; raw backend errors never cross this boundary.
#[derive(thiserror::Error, Debug)]
enum StoreError {
    #[error("state backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("lease not owned: {0}")]
    LeaseNotOwned(String),
    #[error("lock acquisition timed out after {0:?}")]
    AcquireTimeout(Duration),
    #[error("no game running in this channel")]
    GameNotFound,
    #[error("game store failure: {0}")]
    Backend(String),
}

fn store_error_from_redis(error: redis::RedisError) -> StoreError {
    if error.is_io_error()
        || error.is_timeout()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
    {
        StoreError::BackendUnavailable(error.to_string())
    } else {
        StoreError::Backend(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendKind {
    Local,
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let description = match self {
            BackendKind::Local => "ephemeral",
            BackendKind::Remote => "persistent",
        };
        write!(f, "{description}")
    }
}

#[async_trait]
trait KeyValueBackend: Send + Sync {
    /// Atomic set-if-absent with expiry; the lease-acquire primitive.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Re-arm the TTL only while `owner_token` still owns the key.
    async fn extend(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Conditional delete keyed by owner token.
    async fn release(&self, key: &str, owner_token: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    fn kind(&self) -> BackendKind;
}

#[derive(Debug)]
struct LocalEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process backend used when no remote backend is configured or reachable.
/// Lease expiry is honored so single-process behavior matches the remote
/// backend's observable semantics.
#[derive(Default)]
struct LocalBackend {
    entries: tokio::sync::Mutex<HashMap<String, LocalEntry>>,
}

impl LocalBackend {
    fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueBackend for LocalBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(LocalEntry::is_expired) {
            entries.remove(key);
        }
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn extend(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() && entry.value == owner_token.as_bytes() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(())
            }
            _ => Err(StoreError::LeaseNotOwned(format!(
                "lease {key} is not held by this owner"
            ))),
        }
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired() && entry.value == owner_token.as_bytes() => {
                entries.remove(key);
                Ok(())
            }
            _ => Err(StoreError::LeaseNotOwned(format!(
                "lease {key} is not held by this owner"
            ))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(LocalEntry::is_expired) {
            entries.remove(key);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            LocalEntry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, _)| key)
            .filter(|key| key_matches_pattern(pattern, key))
            .cloned()
            .collect())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}

/// Glob matching for the `*` wildcard, the only pattern shape the store uses.
fn key_matches_pattern(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = key;
    for (index, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if index == 0 {
            match rest.strip_prefix(segment) {
                Some(stripped) => rest = stripped,
                None => return false,
            }
        } else if index == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

const LEASE_EXTEND_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    redis.call('pexpire', KEYS[1], ARGV[2])
    return 1
end
return 0
";

const LEASE_RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
";

/// Network-attached backend shared by the whole fleet. Conditional extend and
/// release run as server-side scripts so the owner check is atomic.
struct RedisBackend {
    conn: redis::aio::ConnectionManager,
    extend_script: redis::Script,
    release_script: redis::Script,
}

impl RedisBackend {
    async fn connect(host: &str, port: u16) -> Result<Self, StoreError> {
        let client = redis::Client::open(format!("redis://{host}:{port}"))
            .map_err(store_error_from_redis)?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(store_error_from_redis)?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error_from_redis)?;
        if pong != "PONG" {
            return Err(StoreError::Backend(format!(
                "unexpected reply to connectivity probe: {pong}"
            )));
        }

        Ok(Self {
            conn,
            extend_script: redis::Script::new(LEASE_EXTEND_SCRIPT),
            release_script: redis::Script::new(LEASE_RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_error_from_redis)?;
        Ok(created.is_some())
    }

    async fn extend(&self, key: &str, owner_token: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_script
            .key(key)
            .arg(owner_token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error_from_redis)?;
        if extended == 1 {
            Ok(())
        } else {
            Err(StoreError::LeaseNotOwned(format!(
                "lease {key} is not held by this owner"
            )))
        }
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release_script
            .key(key)
            .arg(owner_token)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error_from_redis)?;
        if released == 1 {
            Ok(())
        } else {
            Err(StoreError::LeaseNotOwned(format!(
                "lease {key} is not held by this owner"
            )))
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(store_error_from_redis)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await.map_err(store_error_from_redis)?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .del(keys.to_vec())
            .await
            .map_err(store_error_from_redis)?;
        Ok(removed)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await.map_err(store_error_from_redis)?;
        Ok(keys)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }
}

/// A named time-bounded lock over the backend's lease primitive. Each
/// acquisition cycle mints a fresh owner token, so a stale holder can never
/// extend or release a successor's lease.
#[derive(Clone)]
struct LeaseLock {
    backend: Arc<dyn KeyValueBackend>,
    key: String,
    ttl: Duration,
    owner_token: String,
}

impl LeaseLock {
    fn new(backend: Arc<dyn KeyValueBackend>, key: String, ttl: Duration) -> Self {
        Self {
            backend,
            key,
            ttl,
            owner_token: Uuid::new_v4().to_string(),
        }
    }

    /// Single acquisition attempt.
    async fn try_acquire(&mut self) -> Result<bool, StoreError> {
        self.owner_token = Uuid::new_v4().to_string();
        self.backend
            .set_if_absent(&self.key, self.owner_token.as_bytes(), self.ttl)
            .await
    }

    /// Retry until acquired or the blocking window elapses. Connectivity
    /// failures propagate; the caller decides whether to keep retrying.
    async fn acquire(&mut self, blocking_timeout: Duration) -> Result<bool, StoreError> {
        self.owner_token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + blocking_timeout;
        loop {
            if self
                .backend
                .set_if_absent(&self.key, self.owner_token.as_bytes(), self.ttl)
                .await?
            {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::time::sleep(LOCK_ACQUIRE_RETRY_SLEEP.min(remaining)).await;
        }
    }

    /// Re-arm the full TTL; `LeaseNotOwned` means the lease is gone.
    async fn extend(&self) -> Result<(), StoreError> {
        self.backend
            .extend(&self.key, &self.owner_token, self.ttl)
            .await
    }

    async fn release(&self) -> Result<(), StoreError> {
        self.backend.release(&self.key, &self.owner_token).await
    }

    fn into_guard(self) -> StoreLockGuard {
        StoreLockGuard {
            backend: self.backend,
            key: self.key,
            owner_token: self.owner_token,
            released: false,
        }
    }
}

/// Scoped critical-section handle for per-channel mutations. Callers release
/// explicitly; any path that drops the guard without releasing (early return,
/// cancellation) gets a best-effort release in the background.
struct StoreLockGuard {
    backend: Arc<dyn KeyValueBackend>,
    key: String,
    owner_token: String,
    released: bool,
}

impl StoreLockGuard {
    async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.backend.release(&self.key, &self.owner_token).await
    }
}

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let owner_token = std::mem::take(&mut self.owner_token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = backend.release(&key, &owner_token).await {
                    debug!(key = %key, error = %error, "deferred channel lock release failed");
                }
            });
        }
    }
}

fn run_lock_key(identity_token: &str) -> String {
    format!(
        "{}:lock:{:x}",
        STORE_NAMESPACE,
        Sha256::digest(identity_token.as_bytes())
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelRef {
    guild_id: u64,
    channel_id: u64,
}

/// CRUD over per-channel game records plus the two lock namespaces: one lock
/// per channel for game mutations, one process-wide run lock for leadership.
struct StateStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl StateStore {
    fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    fn channel_prefix(&self, channel: ChannelRef) -> String {
        format!(
            "{}:channel:{}:{}",
            STORE_NAMESPACE, channel.guild_id, channel.channel_id
        )
    }

    fn channel_state_key(&self, channel: ChannelRef) -> String {
        format!("{}:state", self.channel_prefix(channel))
    }

    fn channel_lock_key(&self, channel: ChannelRef) -> String {
        format!("{}:lock", self.channel_prefix(channel))
    }

    async fn get_game(&self, channel: ChannelRef) -> Result<Option<Vec<u8>>, StoreError> {
        self.backend.get(&self.channel_state_key(channel)).await
    }

    async fn put_game(&self, channel: ChannelRef, payload: &[u8]) -> Result<(), StoreError> {
        self.backend
            .set(&self.channel_state_key(channel), payload)
            .await
    }

    /// Remove everything stored under the channel. Reports `true` only when
    /// every enumerated key was removed, `false` when nothing was there.
    async fn remove_game(&self, channel: ChannelRef) -> Result<bool, StoreError> {
        let pattern = format!("{}:*", self.channel_prefix(channel));
        let keys = self.backend.keys_matching(&pattern).await?;
        if keys.is_empty() {
            return Ok(false);
        }
        let removed = self.backend.delete(&keys).await?;
        Ok(removed == keys.len())
    }

    /// Acquire the per-channel mutation lock as a scoped guard.
    async fn lock_channel(&self, channel: ChannelRef) -> Result<StoreLockGuard, StoreError> {
        let mut lock = LeaseLock::new(
            self.backend.clone(),
            self.channel_lock_key(channel),
            CHANNEL_LOCK_TTL,
        );
        if lock.acquire(CHANNEL_LOCK_BLOCKING_TIMEOUT).await? {
            Ok(lock.into_guard())
        } else {
            Err(StoreError::AcquireTimeout(CHANNEL_LOCK_BLOCKING_TIMEOUT))
        }
    }

    /// The process-leadership lease; key derived from the identity token so
    /// replicas sharing a token contend for the same lease.
    fn run_lock(&self, identity_token: &str, ttl: Duration) -> LeaseLock {
        LeaseLock::new(self.backend.clone(), run_lock_key(identity_token), ttl)
    }
}

/// Thin façade translating channel identities to store keys and game payloads
/// to their serialized form. The store itself never inspects payloads.
struct GameManager {
    store: Arc<StateStore>,
}

impl GameManager {
    fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    async fn lock(&self, channel: ChannelRef) -> Result<StoreLockGuard, StoreError> {
        self.store.lock_channel(channel).await
    }

    async fn get_game(&self, channel: ChannelRef) -> Result<Option<GameSnapshot>, StoreError> {
        let Some(payload) = self.store.get_game(channel).await? else {
            return Ok(None);
        };
        let game = serde_json::from_slice::<GameSnapshot>(&payload)
            .map_err(|error| StoreError::Backend(format!("failed to decode game state: {error}")))?;
        Ok(Some(game))
    }

    async fn current_game(&self, channel: ChannelRef) -> Result<GameSnapshot, StoreError> {
        self.get_game(channel).await?.ok_or(StoreError::GameNotFound)
    }

    async fn put_game(&self, channel: ChannelRef, game: &GameSnapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(game)
            .map_err(|error| StoreError::Backend(format!("failed to encode game state: {error}")))?;
        self.store.put_game(channel, &payload).await
    }

    async fn stop_game(&self, channel: ChannelRef) -> Result<bool, StoreError> {
        self.store.remove_game(channel).await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RenewalExit {
    LeaseLost,
    Stopped,
}

enum TermEvent {
    RenewalExited(Result<RenewalExit, tokio::task::JoinError>),
    ForegroundExited(Result<anyhow::Result<()>, tokio::task::JoinError>),
    ShutdownRequested,
}

/// Leader-election supervisor. One instance per process; `run` owns the whole
/// lifecycle: acquire the run lock, keep it renewed while the foreground work
/// runs, drain both on loss or shutdown, repeat until shutdown.
struct RunSupervisor {
    store: Arc<StateStore>,
    config: SupervisorConfig,
    identity_token: String,
    shutdown: watch::Receiver<bool>,
}

impl RunSupervisor {
    async fn run<F, Fut>(mut self, foreground: F) -> anyhow::Result<()>
    where
        F: Fn(watch::Receiver<bool>) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.store.backend_kind() == BackendKind::Local {
            return self.run_without_election(foreground).await;
        }

        let mut lock = self
            .store
            .run_lock(&self.identity_token, self.config.lease_ttl);
        info!("attempting to acquire run lock");

        while !*self.shutdown.borrow() {
            if !self.wait_for_lock(&mut lock).await {
                break;
            }
            info!("run lock acquired; starting foreground work");

            let (term_stop_tx, term_stop_rx) = watch::channel(false);
            let mut renewal_handle = tokio::spawn(renew_run_lock(
                lock.clone(),
                self.config.clone(),
                self.shutdown.clone(),
                term_stop_rx.clone(),
            ));
            let mut foreground_handle = tokio::spawn(foreground(term_stop_rx));

            let event = tokio::select! {
                exit = &mut renewal_handle => TermEvent::RenewalExited(exit),
                result = &mut foreground_handle => TermEvent::ForegroundExited(result),
                _ = self.shutdown.wait_for(|stopped| *stopped) => TermEvent::ShutdownRequested,
            };

            let _ = term_stop_tx.send(true);
            let mut still_owned = true;
            match event {
                TermEvent::RenewalExited(exit) => {
                    match exit {
                        Ok(RenewalExit::LeaseLost) => still_owned = false,
                        Ok(RenewalExit::Stopped) => {}
                        Err(join_error) => {
                            warn!(error = %join_error, "run lock renewal task failed")
                        }
                    }
                    drain_task(
                        "foreground",
                        foreground_handle,
                        self.config.drain_grace,
                    )
                    .await;
                }
                TermEvent::ForegroundExited(result) => {
                    match result {
                        Ok(Ok(())) => info!("foreground work exited"),
                        Ok(Err(error)) => warn!(error = %error, "foreground work failed"),
                        Err(join_error) => warn!(error = %join_error, "foreground task failed"),
                    }
                    drain_task("run lock renewal", renewal_handle, self.config.drain_grace).await;
                }
                TermEvent::ShutdownRequested => {
                    info!("shutdown requested; draining leadership");
                    drain_task("run lock renewal", renewal_handle, self.config.drain_grace).await;
                    drain_task(
                        "foreground",
                        foreground_handle,
                        self.config.drain_grace,
                    )
                    .await;
                }
            }

            if still_owned && !*self.shutdown.borrow() {
                // The lease is still ours but the term ended; hand it back so
                // another replica does not have to wait out the TTL.
                match lock.release().await {
                    Ok(()) => info!("run lock released after drain"),
                    Err(StoreError::LeaseNotOwned(reason)) => debug!(reason = %reason, "run lock already gone"),
                    Err(error) => warn!(error = %error, "failed to release run lock after drain"),
                }
            }
        }

        match lock.release().await {
            Ok(()) => info!("run lock released"),
            Err(StoreError::LeaseNotOwned(reason)) => debug!(reason = %reason, "run lock not held at shutdown"),
            Err(error) => warn!(error = %error, "failed to release run lock at shutdown"),
        }
        info!("run supervisor stopped");
        Ok(())
    }

    /// Local-backend fast path: a single process needs no coordination.
    async fn run_without_election<F, Fut>(mut self, foreground: F) -> anyhow::Result<()>
    where
        F: Fn(watch::Receiver<bool>) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (term_stop_tx, term_stop_rx) = watch::channel(false);
        let mut handle = tokio::spawn(foreground(term_stop_rx));

        tokio::select! {
            result = &mut handle => {
                match result {
                    Ok(Ok(())) => {
                        info!("foreground work exited");
                        Ok(())
                    }
                    Ok(Err(error)) => Err(error.context("foreground work failed")),
                    Err(join_error) => Err(anyhow::anyhow!("foreground task failed: {join_error}")),
                }
            }
            _ = async { let _ = self.shutdown.wait_for(|stopped| *stopped).await; } => {
                let _ = term_stop_tx.send(true);
                drain_task("foreground", handle, self.config.drain_grace).await;
                info!("run supervisor stopped");
                Ok(())
            }
        }
    }

    /// Acquiring: poll the run lock at a fixed cadence. Connectivity failures
    /// back off by a uniform random fraction of the ceiling so a fleet does
    /// not retry in lockstep. Returns `false` when shutdown was requested.
    async fn wait_for_lock(&mut self, lock: &mut LeaseLock) -> bool {
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            if sleep_or_shutdown(&mut self.shutdown, self.config.acquire_poll_interval).await {
                return false;
            }

            match lock.try_acquire().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(StoreError::BackendUnavailable(reason)) => {
                    let fraction = rand::rng().random::<f64>();
                    if fraction <= UNAVAILABLE_LOG_SAMPLE {
                        info!(error = %reason, "state backend unreachable while acquiring run lock");
                    }
                    let backoff = self.config.acquire_backoff_ceiling.mul_f64(fraction);
                    if sleep_or_shutdown(&mut self.shutdown, backoff).await {
                        return false;
                    }
                }
                Err(error) => {
                    warn!(error = %error, "unexpected error while acquiring run lock");
                    if sleep_or_shutdown(&mut self.shutdown, self.config.acquire_backoff_ceiling)
                        .await
                    {
                        return false;
                    }
                }
            }
        }
    }
}

/// Returns `true` when shutdown was requested before the pause elapsed.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        _ = shutdown.wait_for(|stopped| *stopped) => true,
    }
}

/// Renewal unit: one bounded extend call per tick, strictly serialized. A
/// timed-out call retries; connectivity loss jitters the next tick but is not
/// lease loss; `LeaseNotOwned` or anything unexpected ends the term.
async fn renew_run_lock(
    lock: LeaseLock,
    config: SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
    mut term_stop: watch::Receiver<bool>,
) -> RenewalExit {
    let interval = config.renewal_interval();
    loop {
        if *shutdown.borrow() || *term_stop.borrow() {
            return RenewalExit::Stopped;
        }

        let mut pause = interval;
        match tokio::time::timeout(config.extend_call_timeout, lock.extend()).await {
            Err(_) => continue,
            Ok(Ok(())) => {}
            Ok(Err(StoreError::BackendUnavailable(reason))) => {
                let fraction = rand::rng().random::<f64>();
                if fraction <= UNAVAILABLE_LOG_SAMPLE {
                    warn!(error = %reason, "state backend unreachable while renewing run lock");
                }
                pause = interval.mul_f64(fraction);
            }
            Ok(Err(StoreError::LeaseNotOwned(_))) => {
                warn!("run lock lost");
                return RenewalExit::LeaseLost;
            }
            Ok(Err(error)) => {
                warn!(error = %error, "failed to extend run lock; relinquishing leadership");
                return RenewalExit::LeaseLost;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => return RenewalExit::Stopped,
            _ = term_stop.wait_for(|stopped| *stopped) => return RenewalExit::Stopped,
        }
    }
}

/// Wait for a drained unit to stop on its own; abort only if it overstays the
/// grace period. Leadership transitions must not leave orphaned activity.
async fn drain_task<T>(name: &str, mut handle: tokio::task::JoinHandle<T>, grace: Duration) {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(_) => {}
        Err(_) => {
            warn!(task = name, "task did not stop within drain grace; aborting");
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[derive(Clone)]
struct AppState {
    games: Arc<GameManager>,
    words: Arc<WordList>,
    channel_filter: ChannelFilter,
    state_backend: BackendKind,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/v1/guilds/{guild_id}/channels/{channel_id}/game",
            post(start_game_handler)
                .get(game_progress_handler)
                .delete(stop_game_handler),
        )
        .route(
            "/v1/guilds/{guild_id}/channels/{channel_id}/guesses",
            post(submit_guess_handler),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "service": "bot-service",
        "state_backend": state.state_backend.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct StartGameRequest {
    #[serde(default)]
    word_length: Option<usize>,
    #[serde(default)]
    mode: Option<GameMode>,
}

#[derive(Debug, Serialize)]
struct StartGameResponse {
    started: bool,
    reason: Option<String>,
    word_length: usize,
    mode: GameMode,
    max_guesses: Option<usize>,
    guess_count: usize,
}

#[derive(Debug, Deserialize)]
struct GuessRequest {
    guess: String,
}

#[derive(Debug, Serialize)]
struct GuessResponse {
    accepted: bool,
    applied: bool,
    reason: Option<String>,
    status: GameStatus,
    result: Option<GuessScore>,
    board: String,
    guess_count: usize,
    remaining_guesses: Option<usize>,
    revealed_word: Option<String>,
}

#[derive(Debug, Serialize)]
struct GameProgressResponse {
    status: GameStatus,
    mode: GameMode,
    word_length: usize,
    guess_count: usize,
    max_guesses: Option<usize>,
    board: String,
    guesses: Vec<GuessScore>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct StopGameResponse {
    stopped: bool,
    revealed_word: Option<String>,
}

fn ensure_channel_allowed(state: &AppState, channel_id: u64) -> Result<(), ApiError> {
    if state.channel_filter.allows(channel_id) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!(
            "channel {channel_id} is not allowed to play"
        )))
    }
}

async fn release_channel_guard(guard: StoreLockGuard) {
    if let Err(error) = guard.release().await {
        warn!(error = %error, "failed to release channel lock");
    }
}

async fn start_game_handler(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(u64, u64)>,
    Json(request): Json<StartGameRequest>,
) -> Result<Json<StartGameResponse>, ApiError> {
    ensure_channel_allowed(&state, channel_id)?;
    let channel = ChannelRef {
        guild_id,
        channel_id,
    };

    let word_length = request.word_length.unwrap_or(DEFAULT_WORD_LENGTH);
    if !(MIN_WORD_LENGTH..=MAX_WORD_LENGTH).contains(&word_length) {
        return Err(ApiError::bad_request(format!(
            "word_length must be between {MIN_WORD_LENGTH} and {MAX_WORD_LENGTH}"
        )));
    }
    let mode = request.mode.unwrap_or(GameMode::Classic);

    let guard = state.games.lock(channel).await?;

    if let Some(existing) = state.games.get_game(channel).await? {
        let response = StartGameResponse {
            started: false,
            reason: Some("ALREADY_RUNNING".to_string()),
            word_length: existing.word_length(),
            mode: existing.mode,
            max_guesses: existing.max_guesses(),
            guess_count: existing.guesses.len(),
        };
        release_channel_guard(guard).await;
        return Ok(Json(response));
    }

    let Some(word) = state.words.pick(word_length) else {
        release_channel_guard(guard).await;
        return Err(ApiError::bad_request(format!(
            "no words of length {word_length} in the word list"
        )));
    };

    let game = GameSnapshot::new(word.to_string(), mode);
    state.games.put_game(channel, &game).await?;
    release_channel_guard(guard).await;

    info!(guild_id, channel_id, word_length, ?mode, "game started");
    Ok(Json(StartGameResponse {
        started: true,
        reason: None,
        word_length,
        mode,
        max_guesses: game.max_guesses(),
        guess_count: 0,
    }))
}

async fn game_progress_handler(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(u64, u64)>,
) -> Result<Json<GameProgressResponse>, ApiError> {
    ensure_channel_allowed(&state, channel_id)?;
    let channel = ChannelRef {
        guild_id,
        channel_id,
    };

    let game = state.games.current_game(channel).await?;
    Ok(Json(GameProgressResponse {
        status: game.status,
        mode: game.mode,
        word_length: game.word_length(),
        guess_count: game.guesses.len(),
        max_guesses: game.max_guesses(),
        board: render_board(&game),
        guesses: game.guesses.clone(),
        created_at: game.created_at,
        updated_at: game.updated_at,
    }))
}

async fn submit_guess_handler(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(u64, u64)>,
    Json(request): Json<GuessRequest>,
) -> Result<Json<GuessResponse>, ApiError> {
    ensure_channel_allowed(&state, channel_id)?;
    let channel = ChannelRef {
        guild_id,
        channel_id,
    };

    let Some(guess) = normalize_guess(&request.guess) else {
        return Err(ApiError::bad_request("guesses must contain letters only"));
    };

    let guard = state.games.lock(channel).await?;
    let mut game = state.games.current_game(channel).await?;

    if guess.chars().count() != game.word_length() {
        let response = soft_reject(&game, "WRONG_LENGTH");
        release_channel_guard(guard).await;
        return Ok(Json(response));
    }
    if !state.words.contains(&guess) {
        let response = soft_reject(&game, "UNKNOWN_WORD");
        release_channel_guard(guard).await;
        return Ok(Json(response));
    }

    let entry = game.apply_guess(&guess);
    let status = game.status;
    let revealed_word = match status {
        GameStatus::InProgress => {
            state.games.put_game(channel, &game).await?;
            None
        }
        GameStatus::Solved | GameStatus::Lost => {
            state.games.stop_game(channel).await?;
            Some(game.word.clone())
        }
    };
    release_channel_guard(guard).await;

    info!(
        guild_id,
        channel_id,
        guess = %guess,
        status = ?status,
        "guess applied"
    );
    Ok(Json(GuessResponse {
        accepted: true,
        applied: true,
        reason: None,
        status,
        result: Some(entry),
        board: render_board(&game),
        guess_count: game.guesses.len(),
        remaining_guesses: game.remaining_guesses(),
        revealed_word,
    }))
}

fn soft_reject(game: &GameSnapshot, reason: &str) -> GuessResponse {
    GuessResponse {
        accepted: true,
        applied: false,
        reason: Some(reason.to_string()),
        status: game.status,
        result: None,
        board: render_board(game),
        guess_count: game.guesses.len(),
        remaining_guesses: game.remaining_guesses(),
        revealed_word: None,
    }
}

async fn stop_game_handler(
    State(state): State<AppState>,
    Path((guild_id, channel_id)): Path<(u64, u64)>,
) -> Result<Json<StopGameResponse>, ApiError> {
    ensure_channel_allowed(&state, channel_id)?;
    let channel = ChannelRef {
        guild_id,
        channel_id,
    };

    let guard = state.games.lock(channel).await?;
    let existing = state.games.get_game(channel).await?;
    let stopped = state.games.stop_game(channel).await?;
    release_channel_guard(guard).await;

    if stopped {
        info!(guild_id, channel_id, "game stopped");
    }
    Ok(Json(StopGameResponse {
        stopped,
        revealed_word: existing.map(|game| game.word),
    }))
}

async fn configure_state_backend(config: &RedisConfig) -> Arc<dyn KeyValueBackend> {
    if !config.enable {
        return Arc::new(LocalBackend::new());
    }

    match RedisBackend::connect(&config.host, config.port).await {
        Ok(backend) => {
            info!(host = %config.host, port = config.port, "connected to redis state backend");
            Arc::new(backend)
        }
        Err(error) => {
            warn!(error = %error, "unable to connect to redis state backend; using in-process state");
            Arc::new(LocalBackend::new())
        }
    }
}

async fn bootstrap_wordlist(config: &BotConfig) -> anyhow::Result<WordList> {
    let path = std::path::Path::new(&config.wordlist_path);
    if !path.exists() {
        let url = config.wordlist_url.as_deref().with_context(|| {
            format!(
                "word list {} is missing and WORDBOT_WORDLIST_URL is not set",
                config.wordlist_path
            )
        })?;

        info!("performing first time setup");
        info!(url = %url, "downloading word list");
        let body = reqwest::get(url)
            .await
            .context("word list download failed")?
            .error_for_status()
            .context("word list download failed")?
            .text()
            .await
            .context("word list download returned an unreadable body")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create word list directory")?;
        }
        tokio::fs::write(path, &body)
            .await
            .context("failed to write word list")?;
        info!("setup complete");
    }

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read word list {}", config.wordlist_path))?;
    let words = WordList::parse(&raw);
    anyhow::ensure!(
        !words.is_empty(),
        "word list {} contains no usable words",
        config.wordlist_path
    );
    Ok(words)
}

async fn run_bot_service(
    state: AppState,
    bind_addr: SocketAddr,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind bot command listener")?;
    info!(%bind_addr, "bot-service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
        .context("bot command server failed")?;

    info!("bot command surface stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "bot_service=info,tower_http=info".to_string()),
        )
        .init();

    let config = BotConfig::from_env()?;
    let words = Arc::new(bootstrap_wordlist(&config).await?);
    let channel_filter = load_channel_filter();

    let backend = configure_state_backend(&config.redis).await;
    let store = Arc::new(StateStore::new(backend));
    info!(
        state_backend = %store.backend_kind(),
        word_count = words.len(),
        "bot ready"
    );

    let app_state = AppState {
        games: Arc::new(GameManager::new(store.clone())),
        words,
        channel_filter,
        state_backend: store.backend_kind(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, exiting"),
            _ = sigterm.recv() => info!("received SIGTERM, exiting"),
        }
        let _ = shutdown_tx.send(true);
    });

    let bind_addr = config.bind_addr;
    let supervisor = RunSupervisor {
        store,
        config: config.supervisor.clone(),
        identity_token: config.identity_token.clone(),
        shutdown: shutdown_rx,
    };
    supervisor
        .run(move |stop| run_bot_service(app_state.clone(), bind_addr, stop))
        .await?;

    info!("bot-service stopped");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn service_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::GameNotFound => ApiError::not_found("no game running in this channel"),
            StoreError::AcquireTimeout(_) => {
                ApiError::conflict("channel is busy with another command; try again")
            }
            StoreError::LeaseNotOwned(reason) => ApiError::conflict(reason),
            StoreError::BackendUnavailable(reason) => ApiError::service_unavailable(reason),
            StoreError::Backend(reason) => ApiError::internal(reason),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "bot request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
