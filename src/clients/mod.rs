/// Clients built on the shared pool
pub mod memcache;
pub mod memory;
pub mod rabbitmq;
pub mod redis;

use crate::error::{CacheResult, ErrorSeverity};
use std::time::Duration;

/// Whole seconds for an expiry, never less than one
pub(crate) fn expire_secs(expire: Duration) -> u64 {
    expire.as_secs().max(1)
}

/// Log a failed call at its severity and turn the result into an option
pub(crate) fn log_failure<T>(client: &str, op: &str, result: CacheResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            match e.severity() {
                ErrorSeverity::Critical | ErrorSeverity::Error => {
                    tracing::error!("{} {} failed: {}", client, op, e)
                }
                ErrorSeverity::Warning => tracing::warn!("{} {} failed: {}", client, op, e),
                ErrorSeverity::Info => tracing::info!("{} {} failed: {}", client, op, e),
            }
            None
        }
    }
}
