/// Weighted consistent hash ring
///
/// Every node owns `num_spots * num_nodes * weight / total_weight` virtual
/// spots (at least one). The ring is rebuilt from scratch on each membership
/// change; membership only changes on health probe transitions.
use crate::utils::{hash_sha1_crc32, HashFn};
use std::collections::BTreeMap;

pub const DEFAULT_SPOTS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Spot {
    hash: u32,
    node: String,
}

#[derive(Debug, Clone)]
pub struct HashRing {
    num_spots: usize,
    hash_fn: HashFn,
    weights: BTreeMap<String, usize>,
    spots: Vec<Spot>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

impl HashRing {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_SPOTS, hash_sha1_crc32)
    }

    pub fn with_hash(hash_fn: HashFn) -> Self {
        Self::with_options(DEFAULT_SPOTS, hash_fn)
    }

    pub fn with_options(num_spots: usize, hash_fn: HashFn) -> Self {
        Self {
            num_spots: num_spots.max(1),
            hash_fn,
            weights: BTreeMap::new(),
            spots: Vec::new(),
        }
    }

    /// Add `weight` to a node; adding the same node again accumulates weight
    pub fn add_node(&mut self, node: &str, weight: usize) {
        *self.weights.entry(node.to_string()).or_insert(0) += weight.max(1);
        self.rebuild();
    }

    pub fn del_node(&mut self, node: &str) {
        if self.weights.remove(node).is_some() {
            self.rebuild();
        }
    }

    /// Node responsible for `key`, `None` on an empty ring
    pub fn get_node(&self, key: &str) -> Option<&str> {
        match self.weights.len() {
            0 => None,
            1 => self.weights.keys().next().map(String::as_str),
            _ => {
                let hash = (self.hash_fn)(key);
                let idx = self.spots.partition_point(|spot| spot.hash < hash);
                let idx = if idx == self.spots.len() { 0 } else { idx };
                Some(self.spots[idx].node.as_str())
            }
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.weights.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, usize)> {
        self.weights.iter().map(|(n, w)| (n.as_str(), *w))
    }

    pub fn node_count(&self) -> usize {
        self.weights.len()
    }

    pub fn spot_count(&self) -> usize {
        self.spots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    fn rebuild(&mut self) {
        self.spots.clear();

        let total_weight: usize = self.weights.values().sum();
        if total_weight == 0 {
            return;
        }

        let total_spots = (self.num_spots * self.weights.len()) as f64;
        for (node, weight) in &self.weights {
            let spots = (total_spots * *weight as f64 / total_weight as f64).round() as usize;
            for i in 0..spots.max(1) {
                self.spots.push(Spot {
                    hash: (self.hash_fn)(&format!("{}:{}", node, i)),
                    node: node.clone(),
                });
            }
        }

        self.spots
            .sort_unstable_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.node.cmp(&b.node)));
        tracing::trace!(
            "hash ring rebuilt with {} nodes and {} spots",
            self.weights.len(),
            self.spots.len()
        );
    }
}
