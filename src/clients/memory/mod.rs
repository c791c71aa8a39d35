/// In-process key/value cache with per-item expiry
///
/// Expired entries are invisible to readers straight away and removed by a
/// background task every `gc_interval`, at most `gc_max_items` per pass.
use crate::clients::log_failure;
use crate::config::MemoryConfig;
use crate::core::value::{decode_int, Encode};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(60);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);
pub const MIN_GC_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_GC_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_GC_MAX_ITEMS: usize = 1000;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expire: Option<Instant>,
}

impl Entry {
    fn new(value: Bytes, expire: Option<Duration>) -> Self {
        Self {
            value,
            expire: Some(Instant::now() + expire.unwrap_or(DEFAULT_EXPIRE)),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expire.is_some_and(|at| at <= now)
    }
}

struct MemoryInner {
    items: RwLock<HashMap<String, Entry>>,
    gc_max_items: usize,
    gc: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for MemoryInner {
    fn drop(&mut self) {
        if let Some(handle) = self.gc.get_mut().take() {
            handle.abort();
        }
    }
}

/// Memory client; clones share the same items
#[derive(Clone)]
pub struct Client {
    inner: Arc<MemoryInner>,
}

/// Intervals outside [10s, 600s] fall back to the default
pub fn gc_interval(interval: Duration) -> Duration {
    if (MIN_GC_INTERVAL..=MAX_GC_INTERVAL).contains(&interval) {
        interval
    } else {
        DEFAULT_GC_INTERVAL
    }
}

impl Client {
    /// Build the client and start its collector; needs a tokio runtime
    pub fn new(config: &MemoryConfig) -> Self {
        let client = Self::without_gc(config.gc_max_items);
        let handle = spawn_collector(Arc::downgrade(&client.inner), gc_interval(config.gc_interval()));
        *client.inner.gc.lock() = Some(handle);
        client
    }

    fn without_gc(gc_max_items: usize) -> Self {
        let gc_max_items = if gc_max_items == 0 {
            DEFAULT_GC_MAX_ITEMS
        } else {
            gc_max_items
        };

        Self {
            inner: Arc::new(MemoryInner {
                items: RwLock::new(HashMap::new()),
                gc_max_items,
                gc: Mutex::new(None),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let items = self.inner.items.read();
        items
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Every requested key is present in the result, `None` when missing
    pub fn mget<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, Option<Bytes>> {
        let now = Instant::now();
        let items = self.inner.items.read();
        keys.iter()
            .map(|key| {
                let value = items
                    .get(key.as_ref())
                    .filter(|entry| !entry.is_expired(now))
                    .map(|entry| entry.value.clone());
                (key.as_ref().to_string(), value)
            })
            .collect()
    }

    pub fn set<V: Encode>(&self, key: &str, value: V, expire: Option<Duration>) -> bool {
        let Some(value) = log_failure("memory", "set", value.encode()) else {
            return false;
        };
        self.inner.items.write().insert(key.to_string(), Entry::new(value, expire));
        true
    }

    pub fn mset<K: AsRef<str>, V: Encode>(&self, items: &[(K, V)], expire: Option<Duration>) -> bool {
        let Some(encoded) = Self::encode_all("mset", items) else {
            return false;
        };

        let mut map = self.inner.items.write();
        for (key, value) in encoded {
            map.insert(key, Entry::new(value, expire));
        }
        true
    }

    /// Store only if `key` is absent or expired
    pub fn add<V: Encode>(&self, key: &str, value: V, expire: Option<Duration>) -> bool {
        let Some(value) = log_failure("memory", "add", value.encode()) else {
            return false;
        };

        let now = Instant::now();
        let mut items = self.inner.items.write();
        match items.get(key) {
            Some(entry) if !entry.is_expired(now) => false,
            _ => {
                items.insert(key.to_string(), Entry::new(value, expire));
                true
            }
        }
    }

    /// Add every absent key; true only when all of them were added
    pub fn madd<K: AsRef<str>, V: Encode>(&self, items: &[(K, V)], expire: Option<Duration>) -> bool {
        let Some(encoded) = Self::encode_all("madd", items) else {
            return false;
        };

        let now = Instant::now();
        let total = encoded.len();
        let mut map = self.inner.items.write();
        let mut added = 0;
        for (key, value) in encoded {
            if map.get(&key).map_or(true, |entry| entry.is_expired(now)) {
                map.insert(key, Entry::new(value, expire));
                added += 1;
            }
        }
        added == total
    }

    fn encode_all<K: AsRef<str>, V: Encode>(op: &str, items: &[(K, V)]) -> Option<Vec<(String, Bytes)>> {
        items
            .iter()
            .map(|(key, value)| Some((key.as_ref().to_string(), log_failure("memory", op, value.encode())?)))
            .collect()
    }

    pub fn del(&self, key: &str) -> bool {
        self.inner.items.write().remove(key).is_some()
    }

    /// True only when every key existed
    pub fn mdel<K: AsRef<str>>(&self, keys: &[K]) -> bool {
        let mut items = self.inner.items.write();
        let removed = keys.iter().filter(|key| items.remove(key.as_ref()).is_some()).count();
        removed == keys.len()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Add `delta` to the stored integer and return the result. A missing,
    /// expired or non-numeric value counts as zero; the expiry is kept.
    pub fn incr(&self, key: &str, delta: i64) -> i64 {
        let now = Instant::now();
        let mut items = self.inner.items.write();
        let entry = items
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.is_expired(now) {
                    entry.value = Bytes::new();
                    entry.expire = None;
                }
            })
            .or_insert_with(|| Entry {
                value: Bytes::new(),
                expire: None,
            });

        let value = decode_int(&entry.value).unwrap_or(0).wrapping_add(delta);
        entry.value = Bytes::from(value.to_string());
        value
    }

    /// Remove up to `max_items` expired entries, returns how many went
    pub fn collect_garbage(&self, max_items: usize) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let items = self.inner.items.read();
            items
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .take(max_items)
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut items = self.inner.items.write();
        let mut removed = 0;
        for key in expired {
            // a writer may have refreshed the key between the two locks
            if items.get(&key).is_some_and(|entry| entry.is_expired(now)) {
                items.remove(&key);
                removed += 1;
            }
        }
        removed
    }
}

fn spawn_collector(inner: Weak<MemoryInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let max_items = inner.gc_max_items;
            let removed = Client { inner }.collect_garbage(max_items);
            if removed > 0 {
                debug!("memory: collected {} expired items", removed);
            }
        }
    })
}
