/// Background health probing for pooled backends
///
/// Every `probe_interval` the prober dials each configured server. A server
/// that stops answering is disabled and removed from routing; one that
/// answers again is re-enabled and added back. Probes of different servers
/// are isolated: a panic while probing one is logged and the cycle goes on.
use crate::core::connection::dial_stream;
use crate::core::pool::{Pool, PoolInner, Protocol};
use crate::core::router::NodeAction;
use crate::error::CacheError;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const MIN_PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Health status of a backend
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy backend
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform health check on a backend address
    async fn check_health(&self, addr: &str) -> HealthStatus;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Considers a backend healthy when it accepts a connection
pub struct TcpChecker {
    check_timeout: Duration,
}

impl TcpChecker {
    pub fn new(check_timeout: Duration) -> Self {
        Self { check_timeout }
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check_health(&self, addr: &str) -> HealthStatus {
        match dial_stream(addr, self.check_timeout).await {
            Ok(_) => HealthStatus::Healthy,
            Err(CacheError::Timeout { .. }) => HealthStatus::Timeout,
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}

/// `None` disables probing, anything else is clamped to a sane range
pub fn clamp_interval(interval: Duration) -> Option<Duration> {
    if interval.is_zero() {
        None
    } else {
        Some(interval.clamp(MIN_PROBE_INTERVAL, MAX_PROBE_INTERVAL))
    }
}

/// Drives membership changes of one pool from health check results
pub struct HealthProber {
    checker: Box<dyn HealthChecker>,
}

impl HealthProber {
    pub fn new(checker: Box<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Probe every configured server once, then retry a lost master
    pub async fn run_cycle<P: Protocol>(&self, pool: &Pool<P>) {
        for (addr, _) in pool.servers() {
            let probe = AssertUnwindSafe(self.probe_server(pool, &addr)).catch_unwind();
            if probe.await.is_err() {
                tracing::error!("Health probe of {} panicked", addr);
            }
        }

        if AssertUnwindSafe(pool.recheck_master()).catch_unwind().await.is_err() {
            tracing::error!("Master recheck panicked");
        }
    }

    async fn probe_server<P: Protocol>(&self, pool: &Pool<P>, addr: &str) {
        let status = match timeout(self.checker.check_timeout(), self.checker.check_health(addr)).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };

        if status.is_healthy() {
            if pool.set_disabled(addr, false) {
                tracing::info!("Backend {} is back", addr);
                pool.check(addr, NodeAction::Add).await;
            }
        } else if pool.set_disabled(addr, true) {
            tracing::warn!("Backend {} is down: {}", addr, status);
            pool.check(addr, NodeAction::Del).await;
        } else {
            tracing::debug!("Backend {} still down: {}", addr, status);
        }
    }
}

/// Run a TCP prober for the pool until the pool is dropped
pub(crate) fn spawn_prober<P: Protocol>(
    pool: Weak<PoolInner<P>>,
    interval: Duration,
    net_timeout: Duration,
) -> JoinHandle<()> {
    let prober = HealthProber::new(Box::new(TcpChecker::new(net_timeout)));

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(inner) = pool.upgrade() else {
                break;
            };
            prober.run_cycle(&Pool::from_inner(inner)).await;
        }
        tracing::debug!("Health prober stopped");
    })
}
