//! Client for the shared coordination store.
//!
//! Wraps Redis with per-operation timeouts and graceful degradation: an
//! unreachable store makes lock acquisition report `StoreUnavailable` and
//! every other operation return its negative/empty result. Callers proceed
//! best-effort single-worker; they never crash on store loss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::{timeout, Instant};

use crate::config::RedisConfig;

/// Outcome of an atomic set-if-absent acquisition.
///
/// `Contended` (someone else holds the key) and `StoreUnavailable` (the
/// store could not be asked) are distinct: the first is a normal race loss,
/// the second forces the caller to choose between refusing and proceeding
/// single-worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired,
    Contended,
    StoreUnavailable,
}

impl LockAcquisition {
    #[must_use]
    pub fn is_acquired(self) -> bool {
        matches!(self, Self::Acquired)
    }
}

enum Backend {
    Redis(ConnectionManager),
    /// Process-local store for single-worker deployments and tests
    Memory(Arc<MemoryStore>),
    Unavailable,
}

impl Clone for Backend {
    fn clone(&self) -> Self {
        match self {
            Self::Redis(conn) => Self::Redis(conn.clone()),
            Self::Memory(mem) => Self::Memory(mem.clone()),
            Self::Unavailable => Self::Unavailable,
        }
    }
}

/// Shared coordination store client
#[derive(Clone)]
pub struct CoordStore {
    backend: Backend,
    key_prefix: String,
    op_timeout: Duration,
}

impl CoordStore {
    /// Connect to Redis per config. An empty URL or a failed connection
    /// yields a store that degrades every operation instead of erroring.
    pub async fn connect(config: &RedisConfig) -> Self {
        let op_timeout = Duration::from_secs(config.op_timeout_seconds.max(1));

        if config.url.is_empty() {
            tracing::info!("Coordination store not configured, running single-worker");
            return Self {
                backend: Backend::Unavailable,
                key_prefix: config.key_prefix.clone(),
                op_timeout,
            };
        }

        let backend = match redis::Client::open(config.url.as_str()) {
            Ok(client) => match timeout(op_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    tracing::info!("Coordination store connected");
                    Backend::Redis(conn)
                }
                Ok(Err(e)) => {
                    tracing::error!("Coordination store connection failed: {e}");
                    Backend::Unavailable
                }
                Err(_) => {
                    tracing::error!("Coordination store connection timed out");
                    Backend::Unavailable
                }
            },
            Err(e) => {
                tracing::error!("Invalid coordination store URL: {e}");
                Backend::Unavailable
            }
        };

        Self {
            backend,
            key_prefix: config.key_prefix.clone(),
            op_timeout,
        }
    }

    /// Process-local store. Atomicity holds within this worker only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(MemoryStore::default())),
            key_prefix: String::new(),
            op_timeout: Duration::from_secs(5),
        }
    }

    /// A store where every operation degrades
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            backend: Backend::Unavailable,
            key_prefix: String::new(),
            op_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self.backend, Backend::Unavailable)
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    async fn run<T: redis::FromRedisValue>(&self, op: &str, cmd: redis::Cmd) -> Option<T> {
        let Backend::Redis(ref conn) = self.backend else {
            return None;
        };
        let mut conn = conn.clone();
        match timeout(self.op_timeout, cmd.query_async::<T>(&mut conn)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                tracing::warn!(op, "Coordination store command failed: {e}");
                None
            }
            Err(_) => {
                tracing::warn!(op, "Coordination store command timed out");
                None
            }
        }
    }

    /// Atomic set-if-absent with expiry (`SET key token NX EX ttl`)
    pub async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> LockAcquisition {
        match &self.backend {
            Backend::Unavailable => LockAcquisition::StoreUnavailable,
            Backend::Memory(mem) => mem.set_nx_ex(&self.key(key), token, ttl),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(self.key(key))
                    .arg(token)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1));
                match self.run::<Option<String>>("SET NX EX", cmd).await {
                    Some(Some(_)) => LockAcquisition::Acquired,
                    Some(None) => LockAcquisition::Contended,
                    None => LockAcquisition::StoreUnavailable,
                }
            }
        }
    }

    /// Delete `key` only if it still holds `token`.
    ///
    /// Check-and-delete runs as a Lua script so a lock that expired and was
    /// re-acquired by another worker is never released from here.
    pub async fn release(&self, key: &str, token: &str) -> bool {
        match &self.backend {
            Backend::Unavailable => false,
            Backend::Memory(mem) => mem.release_if_owner(&self.key(key), token),
            Backend::Redis(conn) => {
                let script = redis::Script::new(
                    r#"
                    if redis.call("get", KEYS[1]) == ARGV[1] then
                        return redis.call("del", KEYS[1])
                    else
                        return 0
                    end
                    "#,
                );
                let mut conn = conn.clone();
                let mut prepared = script.key(self.key(key));
                let prepared = prepared.arg(token);
                let invocation = prepared.invoke_async::<i64>(&mut conn);
                match timeout(self.op_timeout, invocation).await {
                    Ok(Ok(deleted)) => deleted > 0,
                    Ok(Err(e)) => {
                        tracing::warn!(key, "Lock release failed: {e}");
                        false
                    }
                    Err(_) => {
                        tracing::warn!(key, "Lock release timed out");
                        false
                    }
                }
            }
        }
    }

    /// Atomically increment a counter; `None` when the store is unreachable
    pub async fn increment(&self, key: &str) -> Option<u64> {
        match &self.backend {
            Backend::Unavailable => None,
            Backend::Memory(mem) => Some(mem.increment(&self.key(key))),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("INCR");
                cmd.arg(self.key(key));
                self.run::<u64>("INCR", cmd).await
            }
        }
    }

    /// Atomically decrement a counter, flooring at zero; `None` when the
    /// store is unreachable
    pub async fn decrement(&self, key: &str) -> Option<u64> {
        match &self.backend {
            Backend::Unavailable => None,
            Backend::Memory(mem) => Some(mem.decrement(&self.key(key))),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("DECR");
                cmd.arg(self.key(key));
                self.run::<i64>("DECR", cmd).await.map(|v| v.max(0) as u64)
            }
        }
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool {
        match &self.backend {
            Backend::Unavailable => false,
            Backend::Memory(mem) => {
                mem.set_ex(&self.key(key), value, ttl);
                true
            }
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("SETEX");
                cmd.arg(self.key(key)).arg(ttl.as_secs().max(1)).arg(value);
                self.run::<()>("SETEX", cmd).await.is_some()
            }
        }
    }

    /// Serialize `value` as JSON and store it with a TTL
    pub async fn set_json_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.set_with_ttl(key, &json, ttl).await,
            Err(e) => {
                tracing::warn!(key, "Failed to serialize value for store: {e}");
                false
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match &self.backend {
            Backend::Unavailable => None,
            Backend::Memory(mem) => mem.get(&self.key(key)),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("GET");
                cmd.arg(self.key(key));
                self.run::<Option<String>>("GET", cmd).await.flatten()
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, "Malformed JSON in store: {e}");
                None
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match &self.backend {
            Backend::Unavailable => false,
            Backend::Memory(mem) => mem.delete(&self.key(key)),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("DEL");
                cmd.arg(self.key(key));
                self.run::<i64>("DEL", cmd).await.is_some()
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match &self.backend {
            Backend::Unavailable => false,
            Backend::Memory(mem) => mem.exists(&self.key(key)),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("EXISTS");
                cmd.arg(self.key(key));
                self.run::<i64>("EXISTS", cmd).await.unwrap_or(0) > 0
            }
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        match &self.backend {
            Backend::Unavailable => false,
            Backend::Memory(mem) => mem.expire(&self.key(key), ttl),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("EXPIRE");
                cmd.arg(self.key(key)).arg(ttl.as_secs().max(1));
                self.run::<i64>("EXPIRE", cmd).await.unwrap_or(0) > 0
            }
        }
    }

    pub async fn hash_set(&self, key: &str, field: &str, value: &str) -> bool {
        match &self.backend {
            Backend::Unavailable => false,
            Backend::Memory(mem) => {
                mem.hash_set(&self.key(key), field, value);
                true
            }
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("HSET");
                cmd.arg(self.key(key)).arg(field).arg(value);
                self.run::<i64>("HSET", cmd).await.is_some()
            }
        }
    }

    pub async fn hash_delete(&self, key: &str, field: &str) -> bool {
        match &self.backend {
            Backend::Unavailable => false,
            Backend::Memory(mem) => mem.hash_delete(&self.key(key), field),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("HDEL");
                cmd.arg(self.key(key)).arg(field);
                self.run::<i64>("HDEL", cmd).await.is_some()
            }
        }
    }

    /// Number of fields in a hash; `None` when the store is unreachable
    pub async fn hash_len(&self, key: &str) -> Option<u64> {
        match &self.backend {
            Backend::Unavailable => None,
            Backend::Memory(mem) => Some(mem.hash_len(&self.key(key))),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("HLEN");
                cmd.arg(self.key(key));
                self.run::<u64>("HLEN", cmd).await
            }
        }
    }

    pub async fn hash_get_all(&self, key: &str) -> Option<HashMap<String, String>> {
        match &self.backend {
            Backend::Unavailable => None,
            Backend::Memory(mem) => Some(mem.hash_get_all(&self.key(key))),
            Backend::Redis(_) => {
                let mut cmd = redis::cmd("HGETALL");
                cmd.arg(self.key(key));
                self.run::<HashMap<String, String>>("HGETALL", cmd).await
            }
        }
    }
}

impl std::fmt::Debug for CoordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend {
            Backend::Redis(_) => "redis",
            Backend::Memory(_) => "memory",
            Backend::Unavailable => "unavailable",
        };
        f.debug_struct("CoordStore").field("backend", &backend).finish()
    }
}

/// Process-local backend. TTLs use the tokio clock so paused-time tests can
/// advance through expiries.
#[derive(Default)]
struct MemoryStore {
    kv: Mutex<HashMap<String, Entry>>,
    hashes: Mutex<HashMap<String, (HashMap<String, String>, Option<Instant>)>>,
    counters: Mutex<HashMap<String, u64>>,
}

struct Entry {
    value: String,
    deadline: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.deadline.is_none_or(|d| Instant::now() < d)
    }
}

impl MemoryStore {
    fn set_nx_ex(&self, key: &str, token: &str, ttl: Duration) -> LockAcquisition {
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(entry) if entry.live() => LockAcquisition::Contended,
            _ => {
                kv.insert(
                    key.to_string(),
                    Entry {
                        value: token.to_string(),
                        deadline: Some(Instant::now() + ttl),
                    },
                );
                LockAcquisition::Acquired
            }
        }
    }

    fn release_if_owner(&self, key: &str, token: &str) -> bool {
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(entry) if entry.live() && entry.value == token => {
                kv.remove(key);
                true
            }
            _ => false,
        }
    }

    fn increment(&self, key: &str) -> u64 {
        let mut counters = self.counters.lock();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        *value
    }

    fn decrement(&self, key: &str) -> u64 {
        let mut counters = self.counters.lock();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value = value.saturating_sub(1);
        *value
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        self.kv.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: Some(Instant::now() + ttl),
            },
        );
    }

    fn get(&self, key: &str) -> Option<String> {
        let mut kv = self.kv.lock();
        match kv.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                kv.remove(key);
                None
            }
            None => None,
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.kv.lock().remove(key).is_some()
    }

    fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn expire(&self, key: &str, ttl: Duration) -> bool {
        let mut kv = self.kv.lock();
        if let Some(entry) = kv.get_mut(key) {
            if entry.live() {
                entry.deadline = Some(Instant::now() + ttl);
                return true;
            }
        }
        let mut hashes = self.hashes.lock();
        if let Some((_, deadline)) = hashes.get_mut(key) {
            *deadline = Some(Instant::now() + ttl);
            return true;
        }
        false
    }

    fn hash_entry_live(deadline: Option<Instant>) -> bool {
        deadline.is_none_or(|d| Instant::now() < d)
    }

    fn hash_set(&self, key: &str, field: &str, value: &str) {
        let mut hashes = self.hashes.lock();
        let slot = hashes.entry(key.to_string()).or_insert_with(|| (HashMap::new(), None));
        if !Self::hash_entry_live(slot.1) {
            slot.0.clear();
            slot.1 = None;
        }
        slot.0.insert(field.to_string(), value.to_string());
    }

    fn hash_delete(&self, key: &str, field: &str) -> bool {
        let mut hashes = self.hashes.lock();
        match hashes.get_mut(key) {
            Some((fields, deadline)) if Self::hash_entry_live(*deadline) => {
                fields.remove(field).is_some()
            }
            Some(_) => {
                hashes.remove(key);
                false
            }
            None => false,
        }
    }

    fn hash_len(&self, key: &str) -> u64 {
        let mut hashes = self.hashes.lock();
        match hashes.get(key) {
            Some((fields, deadline)) if Self::hash_entry_live(*deadline) => fields.len() as u64,
            Some(_) => {
                hashes.remove(key);
                0
            }
            None => 0,
        }
    }

    fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        let mut hashes = self.hashes.lock();
        match hashes.get(key) {
            Some((fields, deadline)) if Self::hash_entry_live(*deadline) => fields.clone(),
            Some(_) => {
                hashes.remove(key);
                HashMap::new()
            }
            None => HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_store_degrades() {
        let store = CoordStore::unavailable();
        assert!(!store.is_available());

        assert_eq!(
            store.acquire("lock", "t", Duration::from_secs(5)).await,
            LockAcquisition::StoreUnavailable
        );
        assert_eq!(store.increment("counter").await, None);
        assert!(!store.set_with_ttl("k", "v", Duration::from_secs(5)).await);
        assert_eq!(store.get("k").await, None);
        assert!(!store.exists("k").await);
        assert_eq!(store.hash_len("h").await, None);
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_released() {
        let store = CoordStore::in_memory();

        assert_eq!(
            store.acquire("lock", "a", Duration::from_secs(10)).await,
            LockAcquisition::Acquired
        );
        assert_eq!(
            store.acquire("lock", "b", Duration::from_secs(10)).await,
            LockAcquisition::Contended
        );

        // Foreign token cannot release
        assert!(!store.release("lock", "b").await);
        assert!(store.release("lock", "a").await);

        assert_eq!(
            store.acquire("lock", "b", Duration::from_secs(10)).await,
            LockAcquisition::Acquired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_succeeds_after_holder_expiry() {
        let store = CoordStore::in_memory();

        assert!(store
            .acquire("lock", "crashed-holder", Duration::from_secs(10))
            .await
            .is_acquired());

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(
            store.acquire("lock", "other", Duration::from_secs(10)).await,
            LockAcquisition::Acquired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_honors_ttl() {
        let store = CoordStore::in_memory();
        assert!(store.set_with_ttl("k", "v", Duration::from_secs(30)).await);
        assert_eq!(store.get("k").await.as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.get("k").await, None);
        assert!(!store.exists("k").await);
    }

    #[tokio::test]
    async fn test_increment_is_monotonic() {
        let store = CoordStore::in_memory();
        assert_eq!(store.increment("rr").await, Some(1));
        assert_eq!(store.increment("rr").await, Some(2));
        assert_eq!(store.increment("rr").await, Some(3));
        assert_eq!(store.increment("other").await, Some(1));
    }

    #[tokio::test]
    async fn test_decrement_floors_at_zero() {
        let store = CoordStore::in_memory();
        store.increment("refs").await;
        store.increment("refs").await;
        assert_eq!(store.decrement("refs").await, Some(1));
        assert_eq!(store.decrement("refs").await, Some(0));
        assert_eq!(store.decrement("refs").await, Some(0));
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = CoordStore::in_memory();
        assert!(store.hash_set("viewers", "alice", "100").await);
        assert!(store.hash_set("viewers", "bob", "101").await);
        assert_eq!(store.hash_len("viewers").await, Some(2));

        // Re-registering the same field does not grow the hash
        assert!(store.hash_set("viewers", "alice", "102").await);
        assert_eq!(store.hash_len("viewers").await, Some(2));

        assert!(store.hash_delete("viewers", "alice").await);
        assert_eq!(store.hash_len("viewers").await, Some(1));

        let all = store.hash_get_all("viewers").await.unwrap_or_default();
        assert_eq!(all.get("bob").map(String::as_str), Some("101"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_expiry() {
        let store = CoordStore::in_memory();
        assert!(store.hash_set("viewers", "alice", "100").await);
        assert!(store.expire("viewers", Duration::from_secs(300)).await);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(store.hash_len("viewers").await, Some(0));
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Snapshot {
            pid: u32,
            cpu: f32,
        }

        let store = CoordStore::in_memory();
        let snap = Snapshot { pid: 42, cpu: 1.5 };
        assert!(store.set_json_with_ttl("stats", &snap, Duration::from_secs(60)).await);

        let back: Snapshot = store.get_json("stats").await.expect("stored json");
        assert_eq!(back.pid, 42);
    }
}
