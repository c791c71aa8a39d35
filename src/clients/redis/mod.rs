/// Redis client over the shared pool
///
/// Keys are namespaced with the configured prefix. In cluster mode every key
/// is sharded over the hash ring; in master-slave mode writes go to the
/// master and reads to a random slave. Multi-key operations split the keys
/// per backend and run one task per backend.
///
/// The plain methods log failures and return `false`, `None` or `0`; the
/// `try_*` variants return the error instead.
pub mod commands;
pub mod resp;

use crate::clients::{expire_secs, log_failure};
use crate::config::RedisConfig;
use crate::core::connection::Conn;
use crate::core::pool::{Pool, PoolOptions, PooledConn, Protocol};
use crate::core::value::Encode;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use resp::RespValue;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

/// Seconds the master check key lives
const CHECK_KEY_TTL: u64 = 5;

/// RESP behaviour for the pool: authentication, liveness and role checks
#[derive(Debug, Clone, Default)]
pub struct RedisProtocol {
    password: String,
    db: u32,
}

impl RedisProtocol {
    pub fn new(password: impl Into<String>, db: u32) -> Self {
        Self {
            password: password.into(),
            db,
        }
    }
}

#[async_trait]
impl Protocol for RedisProtocol {
    type Handle = Conn;

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self, addr: &str, net_timeout: Duration) -> CacheResult<Conn> {
        Conn::connect(addr, net_timeout).await
    }

    async fn handshake(&self, conn: &mut Conn) -> CacheResult<()> {
        if !self.password.is_empty() {
            resp::call(conn, "AUTH", &[&self.password]).await?;
        }
        if self.db > 0 {
            resp::call(conn, "SELECT", &[&self.db]).await?;
        }
        Ok(())
    }

    async fn keepalive(&self, conn: &mut Conn) -> CacheResult<()> {
        match resp::call(conn, "PING", &[]).await? {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(conn.corrupted(format!("unexpected PING reply: {:?}", other))),
        }
    }

    async fn check_writable(&self, conn: &mut Conn, key: &str) -> CacheResult<()> {
        let reply = resp::call(conn, "SET", &[&key, &1u8, &"EX", &CHECK_KEY_TTL]).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(CacheError::command(format!("unexpected SET reply: {:?}", reply)))
        }
    }

    async fn check_readable(&self, conn: &mut Conn, key: &str) -> CacheResult<()> {
        resp::call(conn, "GET", &[&key]).await.map(|_| ())
    }

    fn is_read_command(&self, cmd: &str) -> bool {
        commands::is_read_command(cmd)
    }
}

/// Redis client
#[derive(Clone)]
pub struct Client {
    pool: Pool<RedisProtocol>,
}

impl Client {
    /// Build a client from its config section
    pub async fn new(config: &RedisConfig) -> CacheResult<Self> {
        let protocol = RedisProtocol::new(config.password.clone(), config.db);
        Self::with_options(protocol, config.pool_options()).await
    }

    pub async fn with_options(protocol: RedisProtocol, options: PoolOptions) -> CacheResult<Self> {
        Ok(Self {
            pool: Pool::new(protocol, options).await?,
        })
    }

    pub fn pool(&self) -> &Pool<RedisProtocol> {
        &self.pool
    }

    async fn conn_for(&self, cmd: &str, key: &str) -> CacheResult<PooledConn<RedisProtocol>> {
        let addr = self.pool.route(cmd, key)?;
        self.pool.acquire(&addr).await
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        log_failure("redis", "GET", self.try_get(key).await).flatten()
    }

    pub async fn try_get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let new_key = self.pool.build_key(key);
        let mut conn = self.conn_for("GET", &new_key).await?;
        Ok(resp::call(&mut conn, "GET", &[&new_key]).await?.into_bytes())
    }

    /// Values of `keys`; keys on an unreachable backend are left out
    pub async fn mget<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, Option<Bytes>> {
        let (groups, originals) = self.pool.partition_keys("MGET", keys);
        let batches = self
            .pool
            .fan_out(groups, |pool, addr, keys: Vec<String>| async move {
                let mut conn = pool.acquire(&addr).await?;
                let args: Vec<&dyn Encode> = keys.iter().map(|k| k as &dyn Encode).collect();
                let values = resp::call(&mut conn, "MGET", &args)
                    .await?
                    .into_array()
                    .ok_or_else(|| CacheError::protocol("MGET reply is not an array"))?;
                Ok::<_, CacheError>(
                    keys.into_iter()
                        .zip(values.into_iter().map(RespValue::into_bytes))
                        .collect::<Vec<_>>(),
                )
            })
            .await;

        batches
            .into_iter()
            .flatten()
            .filter_map(|(key, value)| originals.get(&key).map(|old| (old.clone(), value)))
            .collect()
    }

    /// `SET` with an expiry, `DEFAULT_EXPIRE` when `None`
    pub async fn set<V: Encode>(&self, key: &str, value: V, expire: Option<Duration>) -> bool {
        let result = self.try_set(key, value, expire).await;
        log_failure("redis", "SET", result).unwrap_or(false)
    }

    pub async fn try_set<V: Encode>(&self, key: &str, value: V, expire: Option<Duration>) -> CacheResult<bool> {
        self.store(key, &value, expire, false).await
    }

    /// `SET .. NX`: only stores when the key does not exist yet
    pub async fn add<V: Encode>(&self, key: &str, value: V, expire: Option<Duration>) -> bool {
        let result = self.try_add(key, value, expire).await;
        log_failure("redis", "SET NX", result).unwrap_or(false)
    }

    pub async fn try_add<V: Encode>(&self, key: &str, value: V, expire: Option<Duration>) -> CacheResult<bool> {
        self.store(key, &value, expire, true).await
    }

    async fn store(&self, key: &str, value: &dyn Encode, expire: Option<Duration>, nx: bool) -> CacheResult<bool> {
        let new_key = self.pool.build_key(key);
        let secs = expire_secs(expire.unwrap_or(DEFAULT_EXPIRE));
        let mut conn = self.conn_for("SET", &new_key).await?;

        let reply = if nx {
            resp::call(&mut conn, "SET", &[&new_key, value, &"EX", &secs, &"NX"]).await?
        } else {
            resp::call(&mut conn, "SET", &[&new_key, value, &"EX", &secs]).await?
        };
        Ok(reply.is_ok())
    }

    /// Store every item; true only when all of them were stored
    pub async fn mset<K: AsRef<str>, V: Encode>(&self, items: &[(K, V)], expire: Option<Duration>) -> bool {
        self.multi_store(items, expire, false).await
    }

    pub async fn madd<K: AsRef<str>, V: Encode>(&self, items: &[(K, V)], expire: Option<Duration>) -> bool {
        self.multi_store(items, expire, true).await
    }

    async fn multi_store<K: AsRef<str>, V: Encode>(
        &self,
        items: &[(K, V)],
        expire: Option<Duration>,
        nx: bool,
    ) -> bool {
        let secs = expire_secs(expire.unwrap_or(DEFAULT_EXPIRE));
        let encoded: Vec<(String, Bytes)> = items
            .iter()
            .filter_map(|(key, value)| {
                let encoded = log_failure("redis", "encode", value.encode())?;
                Some((self.pool.build_key(key.as_ref()), encoded))
            })
            .collect();

        let groups = self.pool.group_by_addr("SET", encoded, |(key, _)| key.as_str());
        let stored: usize = self
            .pool
            .fan_out(groups, move |pool, addr, batch: Vec<(String, Bytes)>| async move {
                let mut conn = pool.acquire(&addr).await?;
                for (key, value) in &batch {
                    if nx {
                        resp::write_command(&mut conn, "SET", &[key, value, &"EX", &secs, &"NX"]).await?;
                    } else {
                        resp::write_command(&mut conn, "SET", &[key, value, &"EX", &secs]).await?;
                    }
                }
                conn.flush().await?;

                let mut stored = 0;
                for _ in &batch {
                    match resp::read_reply(&mut conn).await {
                        Ok(reply) if reply.is_ok() => stored += 1,
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => tracing::debug!("redis SET on {} rejected: {}", addr, e),
                    }
                }
                Ok::<_, CacheError>(stored)
            })
            .await
            .into_iter()
            .sum();

        stored == items.len()
    }

    pub async fn del(&self, key: &str) -> bool {
        log_failure("redis", "DEL", self.try_del(key).await).unwrap_or(false)
    }

    pub async fn try_del(&self, key: &str) -> CacheResult<bool> {
        let new_key = self.pool.build_key(key);
        let mut conn = self.conn_for("DEL", &new_key).await?;
        let reply = resp::call(&mut conn, "DEL", &[&new_key]).await?;
        Ok(reply.as_integer() == Some(1))
    }

    /// True only when every key existed and was removed
    pub async fn mdel<K: AsRef<str>>(&self, keys: &[K]) -> bool {
        let (groups, _) = self.pool.partition_keys("DEL", keys);
        let removed: i64 = self
            .pool
            .fan_out(groups, |pool, addr, keys: Vec<String>| async move {
                let mut conn = pool.acquire(&addr).await?;
                let args: Vec<&dyn Encode> = keys.iter().map(|k| k as &dyn Encode).collect();
                let reply = resp::call(&mut conn, "DEL", &args).await?;
                Ok::<_, CacheError>(reply.as_integer().unwrap_or(0))
            })
            .await
            .into_iter()
            .sum();

        removed == keys.len() as i64
    }

    pub async fn exists(&self, key: &str) -> bool {
        log_failure("redis", "EXISTS", self.try_exists(key).await).unwrap_or(false)
    }

    pub async fn try_exists(&self, key: &str) -> CacheResult<bool> {
        let new_key = self.pool.build_key(key);
        let mut conn = self.conn_for("EXISTS", &new_key).await?;
        let reply = resp::call(&mut conn, "EXISTS", &[&new_key]).await?;
        Ok(reply.as_integer() == Some(1))
    }

    /// `INCRBY`; returns the new value, 0 on failure
    pub async fn incr(&self, key: &str, delta: i64) -> i64 {
        log_failure("redis", "INCRBY", self.try_incr(key, delta).await).unwrap_or(0)
    }

    pub async fn try_incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let new_key = self.pool.build_key(key);
        let mut conn = self.conn_for("INCRBY", &new_key).await?;
        let reply = resp::call(&mut conn, "INCRBY", &[&new_key, &delta]).await?;
        reply
            .as_integer()
            .ok_or_else(|| CacheError::protocol(format!("unexpected INCRBY reply: {:?}", reply)))
    }

    pub async fn expire(&self, key: &str, expire: Duration) -> bool {
        let new_key = self.pool.build_key(key);
        let result = async {
            let mut conn = self.conn_for("EXPIRE", &new_key).await?;
            resp::call(&mut conn, "EXPIRE", &[&new_key, &expire_secs(expire)]).await
        }
        .await;
        log_failure("redis", "EXPIRE", result).and_then(|r| r.as_integer()) == Some(1)
    }

    /// Remaining time to live in seconds, `-1` without expiry, `-2` when
    /// missing; `None` on failure
    pub async fn ttl(&self, key: &str) -> Option<i64> {
        let new_key = self.pool.build_key(key);
        let result = async {
            let mut conn = self.conn_for("TTL", &new_key).await?;
            resp::call(&mut conn, "TTL", &[&new_key]).await
        }
        .await;
        log_failure("redis", "TTL", result).and_then(|r| r.as_integer())
    }

    /// Run any known key based command; `key` is prefixed and sent first
    pub async fn do_command(&self, cmd: &str, key: &str, args: &[&dyn Encode]) -> CacheResult<RespValue> {
        let cmd = cmd.to_uppercase();
        if !commands::is_known_command(&cmd) {
            return Err(CacheError::invalid_command(cmd));
        }

        let new_key = self.pool.build_key(key);
        let mut full_args: Vec<&dyn Encode> = Vec::with_capacity(args.len() + 1);
        full_args.push(&new_key);
        full_args.extend_from_slice(args);

        let mut conn = self.conn_for(&cmd, &new_key).await?;
        resp::call(&mut conn, &cmd, &full_args).await
    }

    /// Whether the backend at `addr` answers `PING`
    pub async fn ping(&self, addr: &str) -> bool {
        let result = async {
            let mut conn = self.pool.acquire(addr).await?;
            self.pool.protocol().keepalive(&mut conn).await
        }
        .await;
        log_failure("redis", "PING", result).is_some()
    }
}
