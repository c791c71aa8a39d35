/// Pool shared by the Redis, Memcache and RabbitMq clients
///
/// One pool serves every backend of a client. It keeps a bounded idle list
/// of handles per backend, dials on demand, checks handles that sat idle
/// for too long, and owns the routing state (hash ring or master/slave
/// topology) that the health prober mutates. A handle is whatever the
/// protocol lends out: a socket for the cache clients, a broker channel
/// for RabbitMq.
///
/// All shared state sits behind a single `RwLock` that is never held across
/// an `.await`; I/O always happens on a handle that has been taken out of
/// the idle list first.
use crate::core::ring::HashRing;
use crate::core::router::{PoolMode, Topology};
use crate::core::{parse_servers, ServerInfo};
use crate::error::{CacheError, CacheResult};
use crate::health;
use crate::utils::{host_name, HashKind};
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

const CHECK_KEY_PREFIX: &str = "pgo_master_slave_check_";

/// Something the pool lends out and takes back
pub trait Handle: Send + Sync + 'static {
    /// Backend the handle talks to
    fn addr(&self) -> &str;

    /// A down handle is closed on release instead of parked
    fn is_down(&self) -> bool;

    /// Time since the handle was last parked
    fn idle_for(&self) -> Duration;

    /// Runs every time the handle leaves the pool
    fn lend(&mut self) {}

    /// Runs when the handle goes back to the idle list
    fn park(&mut self);
}

/// Wire level behaviour a pool needs from a backend protocol
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    type Handle: Handle;

    /// Short protocol name used in log lines
    fn name(&self) -> &'static str;

    /// Open a fresh handle to `addr`
    async fn connect(&self, addr: &str, net_timeout: Duration) -> CacheResult<Self::Handle>;

    /// Runs once on every freshly dialed handle
    async fn handshake(&self, _handle: &mut Self::Handle) -> CacheResult<()> {
        Ok(())
    }

    /// Liveness check for a handle that sat idle past `max_idle_time`
    async fn keepalive(&self, handle: &mut Self::Handle) -> CacheResult<()>;

    /// Whether the backend behind `handle` accepts writes
    async fn check_writable(&self, handle: &mut Self::Handle, _key: &str) -> CacheResult<()> {
        self.keepalive(handle).await
    }

    /// Whether the backend behind `handle` serves reads
    async fn check_readable(&self, handle: &mut Self::Handle, _key: &str) -> CacheResult<()> {
        self.keepalive(handle).await
    }

    /// Read commands may be served by slaves in master-slave mode
    fn is_read_command(&self, _cmd: &str) -> bool {
        false
    }
}

/// Pool construction options
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Backend addresses, an address listed several times gains weight
    pub servers: Vec<String>,
    /// Prepended to every key by the clients
    pub prefix: String,
    pub max_idle_conn: usize,
    pub max_idle_time: Duration,
    pub net_timeout: Duration,
    /// 0 disables health probing
    pub probe_interval: Duration,
    pub mode: PoolMode,
    pub hash: HashKind,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            prefix: crate::config::DEFAULT_PREFIX.to_string(),
            max_idle_conn: 10,
            max_idle_time: Duration::from_secs(60),
            net_timeout: Duration::from_secs(1),
            probe_interval: Duration::ZERO,
            mode: PoolMode::Cluster,
            hash: HashKind::Sha1Crc32,
        }
    }
}

/// Routing and idle state guarded by the pool lock
pub(crate) struct PoolState<H> {
    pub(crate) servers: BTreeMap<String, ServerInfo>,
    pub(crate) ring: HashRing,
    pub(crate) topology: Topology,
    pub(crate) idle: FnvHashMap<String, VecDeque<H>>,
    /// Master that went away without a successor being found
    pub(crate) recheck: Option<String>,
}

pub(crate) struct PoolInner<P: Protocol> {
    pub(crate) protocol: P,
    pub(crate) options: PoolOptions,
    pub(crate) state: RwLock<PoolState<P::Handle>>,
    pub(crate) check_key: String,
    dials: AtomicU64,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Protocol> Drop for PoolInner<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.prober.get_mut().take() {
            handle.abort();
        }
    }
}

/// Cheaply cloneable handle to a shared pool
pub struct Pool<P: Protocol> {
    pub(crate) inner: Arc<PoolInner<P>>,
}

impl<P: Protocol> Clone for Pool<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Protocol> Pool<P> {
    /// Build the pool, run the initial topology check and start probing
    pub async fn new(protocol: P, options: PoolOptions) -> CacheResult<Self> {
        let servers = parse_servers(&options.servers);
        if servers.is_empty() {
            return Err(CacheError::Config(crate::config::ConfigError::ValidationError(
                format!("{} pool needs at least one server", protocol.name()),
            )));
        }

        let topology = match options.mode {
            PoolMode::Cluster => Topology::Cluster,
            PoolMode::MasterSlave => Topology::MasterSlave {
                master: None,
                slaves: Vec::new(),
            },
        };

        let state = PoolState {
            servers,
            ring: HashRing::with_hash(options.hash.hash_fn()),
            topology,
            idle: FnvHashMap::default(),
            recheck: None,
        };

        let pool = Self {
            inner: Arc::new(PoolInner {
                protocol,
                options,
                state: RwLock::new(state),
                check_key: format!("{}{}", CHECK_KEY_PREFIX, host_name()),
                dials: AtomicU64::new(0),
                prober: Mutex::new(None),
            }),
        };

        pool.start_check().await?;

        if let Some(interval) = health::clamp_interval(pool.inner.options.probe_interval) {
            let handle = health::spawn_prober(
                Arc::downgrade(&pool.inner),
                interval,
                pool.inner.options.net_timeout,
            );
            *pool.inner.prober.lock() = Some(handle);
        }

        Ok(pool)
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner<P>>) -> Self {
        Self { inner }
    }

    pub fn protocol(&self) -> &P {
        &self.inner.protocol
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn net_timeout(&self) -> Duration {
        self.inner.options.net_timeout
    }

    /// Prefix `key` with the configured namespace
    pub fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.options.prefix, key)
    }

    /// Backend responsible for `key` when running `cmd`
    pub fn route(&self, cmd: &str, key: &str) -> CacheResult<String> {
        let is_read = self.inner.protocol.is_read_command(cmd);
        let state = self.inner.state.read();
        state
            .topology
            .route(&state.ring, key, is_read, None)
            .ok_or(CacheError::NoServerAvailable)
    }

    /// Group `items` by backend; every key after the first is pinned to the
    /// first key's backend when the topology allows it
    pub fn group_by_addr<T, F>(&self, cmd: &str, items: Vec<T>, key_of: F) -> HashMap<String, Vec<T>>
    where
        F: Fn(&T) -> &str,
    {
        let is_read = self.inner.protocol.is_read_command(cmd);
        let state = self.inner.state.read();

        let mut groups: HashMap<String, Vec<T>> = HashMap::new();
        let mut pin: Option<String> = None;
        for item in items {
            match state.topology.route(&state.ring, key_of(&item), is_read, pin.as_deref()) {
                Some(addr) => {
                    if pin.is_none() {
                        pin = Some(addr.clone());
                    }
                    groups.entry(addr).or_default().push(item);
                }
                None => warn!("{}: no server for key {}", self.inner.protocol.name(), key_of(&item)),
            }
        }
        groups
    }

    /// Prefix and partition `keys`; returns backend -> prefixed keys and
    /// prefixed key -> caller key
    pub fn partition_keys<K: AsRef<str>>(
        &self,
        cmd: &str,
        keys: &[K],
    ) -> (HashMap<String, Vec<String>>, HashMap<String, String>) {
        let mut originals = HashMap::with_capacity(keys.len());
        let prefixed: Vec<String> = keys
            .iter()
            .map(|key| {
                let new_key = self.build_key(key.as_ref());
                originals.insert(new_key.clone(), key.as_ref().to_string());
                new_key
            })
            .collect();

        (self.group_by_addr(cmd, prefixed, |k| k.as_str()), originals)
    }

    /// Run `op` once per backend concurrently and collect the batches that
    /// succeeded; failed batches are logged and left out
    pub async fn fan_out<T, R, F, Fut>(&self, groups: HashMap<String, T>, op: F) -> Vec<R>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Pool<P>, String, T) -> Fut,
        Fut: Future<Output = CacheResult<R>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for (addr, batch) in groups {
            let fut = op(self.clone(), addr.clone(), batch);
            tasks.spawn(async move { (addr, fut.await) });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(result))) => results.push(result),
                Ok((addr, Err(e))) => {
                    error!("{}: batch on {} failed: {}", self.inner.protocol.name(), addr, e)
                }
                Err(e) => error!("{}: batch task aborted: {}", self.inner.protocol.name(), e),
            }
        }
        results
    }

    /// Take a handle to `addr` out of the pool, dialing if none is idle
    pub async fn acquire(&self, addr: &str) -> CacheResult<PooledConn<P>> {
        let idle = {
            let mut state = self.inner.state.write();
            state.idle.get_mut(addr).and_then(VecDeque::pop_front)
        };

        if let Some(mut handle) = idle {
            handle.lend();
            if handle.idle_for() < self.inner.options.max_idle_time {
                return Ok(PooledConn::new(self.clone(), handle));
            }

            match self.inner.protocol.keepalive(&mut handle).await {
                Ok(()) if !handle.is_down() => {
                    handle.lend();
                    return Ok(PooledConn::new(self.clone(), handle));
                }
                Ok(()) => debug!("{}: dropping broken handle to {}", self.inner.protocol.name(), addr),
                Err(e) => debug!("{}: dropping stale handle to {}: {}", self.inner.protocol.name(), addr, e),
            }
        }

        let handle = self.dial(addr).await?;
        Ok(PooledConn::new(self.clone(), handle))
    }

    async fn dial(&self, addr: &str) -> CacheResult<P::Handle> {
        self.inner.dials.fetch_add(1, Ordering::Relaxed);
        let protocol = &self.inner.protocol;
        let mut handle = protocol.connect(addr, self.inner.options.net_timeout).await?;
        if let Err(e) = protocol.handshake(&mut handle).await {
            warn!("{}: handshake with {} failed: {}", protocol.name(), addr, e);
            return Err(e);
        }
        handle.lend();
        debug!("{}: dialed {}", protocol.name(), addr);
        Ok(handle)
    }

    fn release(&self, mut handle: P::Handle, force: bool) {
        if force || handle.is_down() {
            debug!("{}: closing handle to {}", self.inner.protocol.name(), handle.addr());
            return;
        }

        let mut state = self.inner.state.write();
        // a server removed from rotation keeps no idle handles
        if state.servers.get(handle.addr()).is_some_and(|s| s.disabled) {
            return;
        }
        let queue = state.idle.entry(handle.addr().to_string()).or_default();
        if queue.len() >= self.inner.options.max_idle_conn {
            return;
        }
        handle.park();
        queue.push_back(handle);
    }

    /// Configured servers with their weight and probe state
    pub fn servers(&self) -> Vec<(String, ServerInfo)> {
        let state = self.inner.state.read();
        state.servers.iter().map(|(a, s)| (a.clone(), s.clone())).collect()
    }

    pub fn topology(&self) -> Topology {
        self.inner.state.read().topology.clone()
    }

    /// Backends currently on the hash ring
    pub fn ring_nodes(&self) -> Vec<String> {
        let state = self.inner.state.read();
        state.ring.nodes().map(|(n, _)| n.to_string()).collect()
    }

    pub fn idle_count(&self, addr: &str) -> usize {
        self.inner.state.read().idle.get(addr).map_or(0, VecDeque::len)
    }

    /// Number of connections dialed since the pool was built
    pub fn dial_count(&self) -> u64 {
        self.inner.dials.load(Ordering::Relaxed)
    }
}

/// A handle on loan from the pool, returned to it on drop
pub struct PooledConn<P: Protocol> {
    pool: Pool<P>,
    handle: Option<P::Handle>,
}

impl<P: Protocol> PooledConn<P> {
    fn new(pool: Pool<P>, handle: P::Handle) -> Self {
        Self {
            pool,
            handle: Some(handle),
        }
    }

    /// Hand the handle back now; `force` closes it instead
    pub fn close(mut self, force: bool) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle, force);
        }
    }

    /// Keep the handle for good; the pool forgets about it
    pub fn detach(mut self) -> Option<P::Handle> {
        self.handle.take()
    }
}

impl<P: Protocol> Deref for PooledConn<P> {
    type Target = P::Handle;

    fn deref(&self) -> &P::Handle {
        self.handle.as_ref().expect("handle exists until released")
    }
}

impl<P: Protocol> DerefMut for PooledConn<P> {
    fn deref_mut(&mut self) -> &mut P::Handle {
        self.handle.as_mut().expect("handle exists until released")
    }
}

impl<P: Protocol> Drop for PooledConn<P> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle, false);
        }
    }
}
