/// Address routing for pooled clients
///
/// Cluster mode shards keys over the hash ring. Master-slave mode sends
/// writes to an elected master and reads to a random slave. A server is
/// considered the master when it accepts a short-lived `SET` of a per-host
/// check key and a slave when it answers a `GET` of that key. This is a
/// writability heuristic, not replication role detection: a writable
/// replica can be elected master.
use crate::core::pool::{Pool, Protocol};
use crate::core::ring::HashRing;
use crate::error::{CacheError, CacheResult};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolMode {
    #[default]
    Cluster,
    MasterSlave,
}

/// Membership change reported by the health prober
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Add,
    Del,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    Cluster,
    MasterSlave {
        master: Option<String>,
        /// A slave appears once per unit of weight
        slaves: Vec<String>,
    },
}

impl Topology {
    /// Pick the backend for `key`; `pin` keeps a multi-key batch on one
    /// master-slave node and is ignored in cluster mode
    pub fn route(&self, ring: &HashRing, key: &str, is_read: bool, pin: Option<&str>) -> Option<String> {
        match self {
            Topology::Cluster => ring.get_node(key).map(str::to_string),
            Topology::MasterSlave { master, slaves } => {
                if let Some(pin) = pin {
                    return Some(pin.to_string());
                }
                if is_read {
                    if let Some(slave) = slaves.choose(&mut rand::thread_rng()) {
                        return Some(slave.clone());
                    }
                }
                master.clone()
            }
        }
    }

    pub fn master(&self) -> Option<&str> {
        match self {
            Topology::MasterSlave { master, .. } => master.as_deref(),
            Topology::Cluster => None,
        }
    }

    pub fn slaves(&self) -> &[String] {
        match self {
            Topology::MasterSlave { slaves, .. } => slaves,
            Topology::Cluster => &[],
        }
    }
}

impl<P: Protocol> Pool<P> {
    /// Initial membership: fill the ring, or elect a master and its slaves
    pub(crate) async fn start_check(&self) -> CacheResult<()> {
        let is_cluster = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            match state.topology {
                Topology::Cluster => {
                    for (addr, info) in state.servers.iter().filter(|(_, s)| !s.disabled) {
                        state.ring.add_node(addr, info.weight);
                    }
                    true
                }
                Topology::MasterSlave { .. } => false,
            }
        };
        if is_cluster {
            return Ok(());
        }

        self.elect_master().await;
        self.collect_slaves().await;

        let topology = self.topology();
        if topology.master().is_none() {
            error!("{}: no master server in master-slave config", self.inner.protocol.name());
            return Err(CacheError::NoServerAvailable);
        }
        if topology.slaves().is_empty() {
            error!("{}: no slave server in master-slave config", self.inner.protocol.name());
            return Err(CacheError::NoServerAvailable);
        }

        info!(
            "{}: master {:?}, slaves {:?}",
            self.inner.protocol.name(),
            topology.master(),
            topology.slaves()
        );
        Ok(())
    }

    /// Mark `addr` as (un)reachable, returns whether the flag changed
    pub(crate) fn set_disabled(&self, addr: &str, disabled: bool) -> bool {
        let mut state = self.inner.state.write();
        match state.servers.get_mut(addr) {
            Some(info) if info.disabled != disabled => {
                info.disabled = disabled;
                true
            }
            _ => false,
        }
    }

    /// Apply a membership change for `addr`
    pub(crate) async fn check(&self, addr: &str, action: NodeAction) {
        let old = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            if action == NodeAction::Del {
                state.idle.remove(addr);
            }
            if let Topology::Cluster = state.topology {
                let weight = state.servers.get(addr).map_or(1, |s| s.weight);
                match action {
                    NodeAction::Add if !state.ring.contains(addr) => state.ring.add_node(addr, weight),
                    NodeAction::Add => {}
                    NodeAction::Del => state.ring.del_node(addr),
                }
                debug!("{}: ring {:?} {}", self.inner.protocol.name(), action, addr);
                return;
            }
            state.topology.clone()
        };

        if old.master() == Some(addr) {
            let new_master = self.elect_master().await;
            let mut state = self.inner.state.write();
            state.recheck = match new_master {
                Some(_) => None,
                None => Some(addr.to_string()),
            };
            if let Topology::MasterSlave { slaves, .. } = &mut state.topology {
                slaves.retain(|s| s != addr && Some(s) != new_master.as_ref());
            }
        } else {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            let weight = state.servers.get(addr).map_or(1, |s| s.weight);
            if let Topology::MasterSlave { master, slaves } = &mut state.topology {
                match action {
                    NodeAction::Add => {
                        // a real slave replaces the master fallback
                        slaves.retain(|s| s != addr && Some(s) != master.as_ref());
                        slaves.extend(std::iter::repeat(addr.to_string()).take(weight));
                    }
                    NodeAction::Del => slaves.retain(|s| s != addr),
                }
            }
        }

        if self.topology().slaves().is_empty() {
            self.elect_master().await;
            self.collect_slaves().await;
        }

        self.log_changes(&old);
    }

    /// Retry master election after the master was lost with no successor
    pub(crate) async fn recheck_master(&self) {
        let needs_master = {
            let state = self.inner.state.read();
            matches!(state.topology, Topology::MasterSlave { .. })
                && (state.recheck.is_some() || state.topology.master().is_none())
        };
        if !needs_master {
            return;
        }

        let old = self.topology();
        let Some(master) = self.elect_master().await else {
            error!("{}: still no master in master-slave config", self.inner.protocol.name());
            return;
        };

        let slaves_empty = {
            let mut state = self.inner.state.write();
            state.recheck = None;
            match &mut state.topology {
                Topology::MasterSlave { slaves, .. } => {
                    slaves.retain(|s| *s != master);
                    slaves.is_empty()
                }
                Topology::Cluster => false,
            }
        };
        if slaves_empty {
            self.collect_slaves().await;
        }

        self.log_changes(&old);
    }

    /// Elect the first enabled server accepting writes, preferring the
    /// current master; clears the master when none does
    async fn elect_master(&self) -> Option<String> {
        let candidates: Vec<String> = {
            let state = self.inner.state.read();
            let current = state.topology.master().map(str::to_string);
            let enabled = state
                .servers
                .iter()
                .filter(|(_, s)| !s.disabled)
                .map(|(a, _)| a.clone());
            match current {
                Some(m) if state.servers.get(&m).is_some_and(|s| !s.disabled) => std::iter::once(m.clone())
                    .chain(enabled.filter(|a| *a != m))
                    .collect(),
                _ => enabled.collect(),
            }
        };

        let mut elected = None;
        for addr in candidates {
            if self.probe_master(&addr).await {
                elected = Some(addr);
                break;
            }
        }

        let mut state = self.inner.state.write();
        if let Topology::MasterSlave { master, .. } = &mut state.topology {
            *master = elected.clone();
        }
        elected
    }

    /// Rebuild the slave list from every enabled non-master server that
    /// answers reads; falls back to the master when none does
    async fn collect_slaves(&self) {
        let (servers, master) = {
            let state = self.inner.state.read();
            let servers: Vec<(String, usize, bool)> = state
                .servers
                .iter()
                .map(|(a, s)| (a.clone(), s.weight, s.disabled))
                .collect();
            (servers, state.topology.master().map(str::to_string))
        };

        let mut slaves = Vec::new();
        if servers.len() == 1 {
            slaves.extend(master.clone());
        } else {
            for (addr, weight, disabled) in &servers {
                if *disabled || Some(addr) == master.as_ref() {
                    continue;
                }
                if self.probe_slave(addr).await {
                    slaves.extend(std::iter::repeat(addr.clone()).take(*weight));
                }
            }
        }

        if slaves.is_empty() {
            if let Some(master) = master {
                if self.probe_slave(&master).await {
                    let weight = servers
                        .iter()
                        .find(|(a, _, _)| *a == master)
                        .map_or(1, |(_, w, _)| *w);
                    slaves.extend(std::iter::repeat(master).take(weight));
                }
            }
        }

        let mut state = self.inner.state.write();
        if let Topology::MasterSlave { slaves: current, .. } = &mut state.topology {
            *current = slaves;
        }
    }

    async fn probe_master(&self, addr: &str) -> bool {
        let result = match self.acquire(addr).await {
            Ok(mut conn) => self.inner.protocol.check_writable(&mut conn, &self.inner.check_key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!("{}: {} rejected as master: {}", self.inner.protocol.name(), addr, e);
        }
        result.is_ok()
    }

    async fn probe_slave(&self, addr: &str) -> bool {
        let result = match self.acquire(addr).await {
            Ok(mut conn) => self.inner.protocol.check_readable(&mut conn, &self.inner.check_key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            debug!("{}: {} rejected as slave: {}", self.inner.protocol.name(), addr, e);
        }
        result.is_ok()
    }

    fn log_changes(&self, old: &Topology) {
        let name = self.inner.protocol.name();
        let new = self.topology();

        match new.master() {
            None => error!("{}: no master server in master-slave config", name),
            Some(master) if old.master() != Some(master) => {
                warn!("{}: master changed from {:?} to {}", name, old.master(), master)
            }
            Some(_) => {}
        }

        if new.slaves().is_empty() {
            error!("{}: no slave server in master-slave config", name);
        } else if old.slaves() != new.slaves() {
            warn!("{}: slaves changed from {:?} to {:?}", name, old.slaves(), new.slaves());
        }
    }
}
