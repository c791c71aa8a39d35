/// Memcache client over the shared pool
///
/// Memcache has no replication, so the pool always shards keys over the
/// hash ring. Keys are prefixed before they are hashed.
pub mod codec;

use crate::clients::log_failure;
use crate::config::MemcacheConfig;
use crate::core::connection::Conn;
use crate::core::pool::{Pool, PoolOptions, PooledConn, Protocol};
use crate::core::router::PoolMode;
use crate::core::value::Encode;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use codec::{Item, RetrieveCommand, StoreCommand};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, Default)]
pub struct MemcacheProtocol;

#[async_trait]
impl Protocol for MemcacheProtocol {
    type Handle = Conn;

    fn name(&self) -> &'static str {
        "memcache"
    }

    async fn connect(&self, addr: &str, net_timeout: Duration) -> CacheResult<Conn> {
        Conn::connect(addr, net_timeout).await
    }

    async fn keepalive(&self, conn: &mut Conn) -> CacheResult<()> {
        codec::version(conn).await.map(|_| ())
    }
}

/// Memcache client
#[derive(Clone)]
pub struct Client {
    pool: Pool<MemcacheProtocol>,
}

impl Client {
    /// Build a client from its config section
    pub async fn new(config: &MemcacheConfig) -> CacheResult<Self> {
        Self::with_options(config.pool_options()).await
    }

    pub async fn with_options(mut options: PoolOptions) -> CacheResult<Self> {
        options.mode = PoolMode::Cluster;
        Ok(Self {
            pool: Pool::new(MemcacheProtocol, options).await?,
        })
    }

    pub fn pool(&self) -> &Pool<MemcacheProtocol> {
        &self.pool
    }

    async fn conn_for(&self, key: &str) -> CacheResult<PooledConn<MemcacheProtocol>> {
        let addr = self.pool.route("", key)?;
        self.pool.acquire(&addr).await
    }

    fn expire_secs(expire: Option<Duration>) -> u64 {
        expire.unwrap_or(DEFAULT_EXPIRE).as_secs()
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let result = self.retrieve(RetrieveCommand::Get, key).await;
        log_failure("memcache", "get", result).flatten().map(|item| item.data)
    }

    /// Every requested key is present in the result, `None` when missing
    pub async fn mget<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, Option<Bytes>> {
        let mut result: HashMap<String, Option<Bytes>> =
            keys.iter().map(|k| (k.as_ref().to_string(), None)).collect();

        for item in self.multi_retrieve(RetrieveCommand::Get, keys).await {
            result.insert(item.key, Some(item.data));
        }
        result
    }

    pub async fn set<V: Encode>(&self, key: &str, value: V, expire: Option<Duration>) -> bool {
        self.store_value(StoreCommand::Set, key, &value, expire).await
    }

    pub async fn add<V: Encode>(&self, key: &str, value: V, expire: Option<Duration>) -> bool {
        self.store_value(StoreCommand::Add, key, &value, expire).await
    }

    async fn store_value(&self, cmd: StoreCommand, key: &str, value: &dyn Encode, expire: Option<Duration>) -> bool {
        let result = match value.encode() {
            Ok(data) => self.store(cmd, Item::new(key, data), expire).await,
            Err(e) => Err(e),
        };
        log_failure("memcache", cmd.as_str(), result).unwrap_or(false)
    }

    pub async fn mset<K: AsRef<str>, V: Encode>(&self, items: &[(K, V)], expire: Option<Duration>) -> bool {
        self.multi_store_values(StoreCommand::Set, items, expire).await
    }

    pub async fn madd<K: AsRef<str>, V: Encode>(&self, items: &[(K, V)], expire: Option<Duration>) -> bool {
        self.multi_store_values(StoreCommand::Add, items, expire).await
    }

    async fn multi_store_values<K: AsRef<str>, V: Encode>(
        &self,
        cmd: StoreCommand,
        items: &[(K, V)],
        expire: Option<Duration>,
    ) -> bool {
        let encoded: Vec<Item> = items
            .iter()
            .filter_map(|(key, value)| {
                let data = log_failure("memcache", "encode", value.encode())?;
                Some(Item::new(key.as_ref(), data))
            })
            .collect();

        if encoded.len() != items.len() {
            return false;
        }
        self.multi_store(cmd, encoded, expire).await
    }

    pub async fn del(&self, key: &str) -> bool {
        log_failure("memcache", "delete", self.try_del(key).await).unwrap_or(false)
    }

    pub async fn try_del(&self, key: &str) -> CacheResult<bool> {
        let new_key = self.pool.build_key(key);
        let mut conn = self.conn_for(&new_key).await?;
        codec::delete(&mut conn, &new_key).await
    }

    /// True only when every key existed and was deleted
    pub async fn mdel<K: AsRef<str>>(&self, keys: &[K]) -> bool {
        let (groups, _) = self.pool.partition_keys("", keys);
        let deleted: usize = self
            .pool
            .fan_out(groups, |pool, addr, keys: Vec<String>| async move {
                let mut conn = pool.acquire(&addr).await?;
                let mut deleted = 0;
                for key in &keys {
                    conn.extend_deadline();
                    if codec::delete(&mut conn, key).await? {
                        deleted += 1;
                    }
                }
                Ok::<_, CacheError>(deleted)
            })
            .await
            .into_iter()
            .sum();

        deleted == keys.len()
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Add `delta` (negative to decrement) and return the new value, 0 on
    /// failure; a missing key starts from zero
    pub async fn incr(&self, key: &str, delta: i64) -> u64 {
        log_failure("memcache", "incr", self.try_incr(key, delta).await).unwrap_or(0)
    }

    pub async fn try_incr(&self, key: &str, delta: i64) -> CacheResult<u64> {
        let new_key = self.pool.build_key(key);
        let mut conn = self.conn_for(&new_key).await?;
        codec::increment(&mut conn, &new_key, delta).await
    }

    /// Fetch one item; its key is returned without the prefix
    pub async fn retrieve(&self, cmd: RetrieveCommand, key: &str) -> CacheResult<Option<Item>> {
        let new_key = self.pool.build_key(key);
        let mut conn = self.conn_for(&new_key).await?;
        let items = codec::retrieve(&mut conn, cmd, &[&new_key]).await?;
        Ok(items.into_iter().next().map(|mut item| {
            item.key = key.to_string();
            item
        }))
    }

    /// Fetch items from every backend concurrently; missing keys and keys
    /// on a failed backend are absent
    pub async fn multi_retrieve<K: AsRef<str>>(&self, cmd: RetrieveCommand, keys: &[K]) -> Vec<Item> {
        let (groups, originals) = self.pool.partition_keys("", keys);
        self.pool
            .fan_out(groups, move |pool, addr, keys: Vec<String>| async move {
                let mut conn = pool.acquire(&addr).await?;
                codec::retrieve(&mut conn, cmd, &keys).await
            })
            .await
            .into_iter()
            .flatten()
            .filter_map(|mut item| {
                item.key = originals.get(&item.key)?.clone();
                Some(item)
            })
            .collect()
    }

    /// Run a storage command; `item.key` is prefixed before sending
    pub async fn store(&self, cmd: StoreCommand, mut item: Item, expire: Option<Duration>) -> CacheResult<bool> {
        item.key = self.pool.build_key(&item.key);
        let mut conn = self.conn_for(&item.key).await?;
        codec::store(&mut conn, cmd, &item, Self::expire_secs(expire)).await
    }

    /// Store every item; true only when all of them were stored
    pub async fn multi_store(&self, cmd: StoreCommand, items: Vec<Item>, expire: Option<Duration>) -> bool {
        let total = items.len();
        let expire = Self::expire_secs(expire);
        let items: Vec<Item> = items
            .into_iter()
            .map(|mut item| {
                item.key = self.pool.build_key(&item.key);
                item
            })
            .collect();

        let groups = self.pool.group_by_addr("", items, |item| item.key.as_str());
        let stored: usize = self
            .pool
            .fan_out(groups, move |pool, addr, items: Vec<Item>| async move {
                let mut conn = pool.acquire(&addr).await?;
                let mut stored = 0;
                for item in &items {
                    conn.extend_deadline();
                    if codec::store(&mut conn, cmd, item, expire).await? {
                        stored += 1;
                    }
                }
                Ok::<_, CacheError>(stored)
            })
            .await
            .into_iter()
            .sum();

        stored == total
    }

    /// Reset the expiry of `key`
    pub async fn touch(&self, key: &str, expire: Duration) -> bool {
        log_failure("memcache", "touch", self.try_touch(key, expire).await).unwrap_or(false)
    }

    pub async fn try_touch(&self, key: &str, expire: Duration) -> CacheResult<bool> {
        let new_key = self.pool.build_key(key);
        let mut conn = self.conn_for(&new_key).await?;
        codec::touch(&mut conn, &new_key, expire.as_secs()).await
    }

    pub async fn stats(&self, addr: &str, args: &[&str]) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.pool.acquire(addr).await?;
        codec::stats(&mut conn, args).await
    }

    /// Invalidate every item on every enabled backend
    pub async fn flush_all(&self) -> bool {
        let groups: HashMap<String, ()> = self.pool.ring_nodes().into_iter().map(|addr| (addr, ())).collect();
        let total = groups.len();
        let flushed = self
            .pool
            .fan_out(groups, |pool, addr, _| async move {
                let mut conn = pool.acquire(&addr).await?;
                codec::flush_all(&mut conn).await
            })
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        flushed == total
    }

    pub async fn version(&self, addr: &str) -> CacheResult<String> {
        let mut conn = self.pool.acquire(addr).await?;
        codec::version(&mut conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeServer, SERVER_ERROR_KEY};
    use tokio_test::assert_ok;

    async fn client_for(servers: &[&FakeServer]) -> Client {
        let options = PoolOptions {
            servers: servers.iter().map(|s| s.addr().to_string()).collect(),
            ..Default::default()
        };
        Client::with_options(options).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let server = FakeServer::memcache().await;
        let client = client_for(&[&server]).await;

        assert!(client.set("name", "ann", None).await);
        assert_eq!(client.get("name").await, Some(Bytes::from("ann")));
        assert_eq!(server.value("pgo_name"), Some(Bytes::from("ann")));
        assert_eq!(server.ttl("pgo_name"), Some(86_400));

        assert!(client.exists("name").await);
        assert!(!client.exists("other").await);
        assert_eq!(client.get("other").await, None);
    }

    #[tokio::test]
    async fn test_store_expires() {
        let server = FakeServer::memcache().await;
        let client = client_for(&[&server]).await;

        let stored = client
            .store(StoreCommand::Set, Item::new("k", "v"), Some(Duration::from_secs(1)))
            .await;
        assert!(assert_ok!(stored));
        let item = assert_ok!(client.retrieve(RetrieveCommand::Get, "k").await).unwrap();
        assert_eq!(item.data, Bytes::from("v"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(client.multi_retrieve(RetrieveCommand::Get, &["k"]).await.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_delete() {
        let server = FakeServer::memcache().await;
        let client = client_for(&[&server]).await;

        assert!(client.add("lock", 1, None).await);
        assert!(!client.add("lock", 2, None).await);
        assert!(client.del("lock").await);
        assert!(!client.del("lock").await);
    }

    #[tokio::test]
    async fn test_incr_seeds_missing_key() {
        let server = FakeServer::memcache().await;
        let client = client_for(&[&server]).await;

        assert_eq!(client.incr("hits", 3).await, 3);
        assert_eq!(client.incr("hits", 4).await, 7);
        assert_eq!(client.incr("hits", -10).await, 0);
        assert_eq!(client.incr("fresh", -2).await, 0);
        assert_eq!(server.value("pgo_fresh"), Some(Bytes::from("0")));
    }

    #[tokio::test]
    async fn test_gets_and_cas() {
        let server = FakeServer::memcache().await;
        let client = client_for(&[&server]).await;
        client.set("doc", "v1", None).await;

        let item = assert_ok!(client.retrieve(RetrieveCommand::Gets, "doc").await).unwrap();
        assert_eq!(item.key, "doc");
        assert!(item.cas_id > 0);

        let mut update = Item::new("doc", "v2");
        update.cas_id = item.cas_id;
        assert!(assert_ok!(client.store(StoreCommand::Cas, update.clone(), None).await));
        // the cas id is stale now
        assert!(!assert_ok!(client.store(StoreCommand::Cas, update, None).await));
        assert_eq!(client.get("doc").await, Some(Bytes::from("v2")));

        assert!(assert_ok!(client.store(StoreCommand::Append, Item::new("doc", "+"), None).await));
        assert_eq!(client.get("doc").await, Some(Bytes::from("v2+")));
    }

    #[tokio::test]
    async fn test_multi_key_across_backends() {
        let a = FakeServer::memcache().await;
        let b = FakeServer::memcache().await;
        let client = client_for(&[&a, &b]).await;

        let items: Vec<(String, usize)> = (0..30).map(|i| (format!("k{}", i), i)).collect();
        assert!(client.mset(&items, None).await);
        assert!(!client.madd(&items, None).await);

        let mut keys: Vec<String> = items.iter().map(|(k, _)| k.clone()).collect();
        keys.push("absent".to_string());
        let values = client.mget(&keys).await;
        assert_eq!(values.len(), 31);
        assert_eq!(values["absent"], None);
        assert_eq!(values["k7"], Some(Bytes::from("7")));

        assert!(a.commands().contains(&"SET".to_string()));
        assert!(b.commands().contains(&"SET".to_string()));

        assert!(client.mdel(&keys[..30]).await);
        assert!(client.mget(&keys).await.values().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_partial_failure_reports_missing() {
        let live = FakeServer::memcache().await;
        let dead = FakeServer::memcache().await;
        let client = client_for(&[&live, &dead]).await;
        dead.stop().await;

        let items: Vec<(String, &str)> = (0..30).map(|i| (format!("k{}", i), "v")).collect();
        assert!(!client.mset(&items, None).await);

        let keys: Vec<&str> = items.iter().map(|(k, _)| k.as_str()).collect();
        let values = client.mget(&keys).await;
        assert_eq!(values.len(), 30);
        let found = values.values().filter(|v| v.is_some()).count();
        assert!(found > 0 && found < 30);
    }

    #[tokio::test]
    async fn test_touch_stats_flush_version() {
        let server = FakeServer::memcache().await;
        let client = client_for(&[&server]).await;
        client.set("a", "1", None).await;

        assert!(client.touch("a", Duration::from_secs(5)).await);
        assert_eq!(server.ttl("pgo_a"), Some(5));
        assert!(!client.touch("b", Duration::from_secs(5)).await);

        let stats = assert_ok!(client.stats(server.addr(), &[]).await);
        assert_eq!(stats["curr_items"], "1");
        assert_eq!(stats["engine"], "fake memcache");

        assert!(client.flush_all().await);
        assert_eq!(client.get("a").await, None);
        assert_eq!(assert_ok!(client.version(server.addr()).await), "1.6.21");
    }

    #[tokio::test]
    async fn test_server_error_discards_connection() {
        let server = FakeServer::memcache().await;
        let client = client_for(&[&server]).await;

        assert!(!client.set(SERVER_ERROR_KEY, "v", None).await);
        assert_eq!(client.pool().idle_count(server.addr()), 0);
        assert!(client.set("fine", "v", None).await);
        assert_eq!(client.pool().idle_count(server.addr()), 1);
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected_locally() {
        let server = FakeServer::memcache().await;
        let client = client_for(&[&server]).await;

        assert!(!client.set("bad key", "v", None).await);
        assert!(server.commands().is_empty());
        assert_eq!(client.pool().idle_count(server.addr()), 1);
    }
}
