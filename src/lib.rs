pub mod clients;
pub mod config;
pub mod error;
/// Ringpool - pooled Redis, Memcache and RabbitMq clients
///
/// Keys are sharded over a weighted consistent-hash ring. Redis pools can
/// instead run in master-slave mode, where writes go to an elected master and
/// reads to a random slave. A background prober takes unreachable backends
/// out of rotation and brings them back once they answer again. The same
/// pool lends out RabbitMq channels, sharded by op code.
///
/// ```no_run
/// use ringpool::clients::redis::Client;
/// use ringpool::config::RedisConfig;
///
/// # async fn demo() -> ringpool::CacheResult<()> {
/// let client = Client::new(&RedisConfig::default()).await?;
/// client.set("greeting", "hello", None).await;
/// let value = client.get("greeting").await;
/// # Ok(())
/// # }
/// ```
pub mod core;
pub mod health;
pub mod utils;

#[cfg(test)]
mod testutil;

pub use crate::clients::memcache::Client as MemcacheClient;
pub use crate::clients::memory::Client as MemoryClient;
pub use crate::clients::rabbitmq::Client as RabbitMqClient;
pub use crate::clients::redis::Client as RedisClient;
pub use crate::config::Config;
pub use crate::core::pool::{Handle, Pool, PoolOptions, Protocol};
pub use crate::core::ring::HashRing;
pub use crate::core::router::{PoolMode, Topology};
pub use crate::core::value::{Encode, Json};
pub use crate::error::{CacheError, CacheResult};
