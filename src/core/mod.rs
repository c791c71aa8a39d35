/// Core building blocks shared by the pooled clients
pub mod connection;
pub mod pool;
pub mod ring;
pub mod router;
pub mod value;

use crate::utils::strip_scheme;
use std::collections::BTreeMap;

/// A configured backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Number of times the address was listed
    pub weight: usize,
    /// Set by the health prober while the backend is unreachable
    pub disabled: bool,
}

/// Collapse a server list into addresses with weights; repeated entries
/// add weight and a `scheme://` prefix is dropped
pub fn parse_servers<S: AsRef<str>>(servers: &[S]) -> BTreeMap<String, ServerInfo> {
    let mut parsed: BTreeMap<String, ServerInfo> = BTreeMap::new();
    for server in servers {
        let addr = strip_scheme(server.as_ref().trim());
        if addr.is_empty() {
            continue;
        }
        parsed
            .entry(addr.to_string())
            .or_insert(ServerInfo {
                weight: 0,
                disabled: false,
            })
            .weight += 1;
    }
    parsed
}
