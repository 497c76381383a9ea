//! Short-TTL coordination cache.
//!
//! Holds the cross-handler locks (`schedule_processing:<id>`), the
//! per-(account, video) micro-cooldowns, and the "last account for video"
//! markers. The [`Cache`] trait is the seam to a shared store; the bundled
//! [`MemoryCache`] binds it in-process for single-node deployments.
//!
//! Every key written through this module carries a TTL; nothing is stored
//! without one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Key-value coordination store with TTLs.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    /// Read a key, `None` when absent or expired.
    async fn get(&self, key: &str) -> Option<String>;

    /// Write a key with a TTL, overwriting any prior value.
    async fn put(&self, key: &str, value: &str, ttl: Duration);

    /// Atomically write a key only if absent. Returns `true` when the
    /// write won (the lock/cooldown was acquired).
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool;

    /// Delete a key.
    async fn delete(&self, key: &str);

    /// Delete every key with the given prefix.
    async fn delete_prefix(&self, prefix: &str);
}

/// In-process [`Cache`] with lazy expiry.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop expired entries. Called opportunistically on writes.
    fn sweep(entries: &mut HashMap<String, (String, Instant)>) {
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            _ => None,
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        Self::sweep(&mut entries);
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        Self::sweep(&mut entries);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        true
    }

    async fn delete(&self, key: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(key);
    }

    async fn delete_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.retain(|key, _| !key.starts_with(prefix));
    }
}

/// Key for the per-schedule processing lock.
pub fn schedule_processing_key(schedule_id: i64) -> String {
    format!("schedule_processing:{schedule_id}")
}

/// Key remembering the last account used on a video within a schedule.
pub fn last_account_key(schedule_id: i64, video_id: &str) -> String {
    format!("schedule:{schedule_id}:video:{video_id}:last_account")
}

/// Key for the per-(account, video) dispatch cooldown.
pub fn cooldown_key(account_id: i64, video_id: &str) -> String {
    format!("account:{account_id}:video:{video_id}:cooldown")
}

/// Acquire a TTL lock at `key`. Dropping the guard does NOT release the
/// lock; call [`TtlLock::release`] on clean completion and let the TTL
/// expire it after a crash.
pub struct TtlLock<'a> {
    cache: &'a dyn Cache,
    key: String,
}

impl<'a> TtlLock<'a> {
    /// Try to take the lock. `None` when another holder has it.
    pub async fn acquire(cache: &'a dyn Cache, key: String, ttl: Duration) -> Option<TtlLock<'a>> {
        if cache.set_nx(&key, "1", ttl).await {
            Some(Self { cache, key })
        } else {
            None
        }
    }

    /// Release the lock early.
    pub async fn release(self) {
        self.cache.delete(&self.key).await;
    }
}
