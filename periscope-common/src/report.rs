//! Mergeable topology reports
//!
//! A report is a set of named topologies, each a map of node id to node.
//! Nodes only hold last-writer-wins registers and sets, so merging is
//! associative, commutative and idempotent: folding the same report in twice
//! never inflates anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Well-known topology names
pub mod topology {
    pub const HOST: &str = "host";
    pub const PROCESS: &str = "process";
    pub const ENDPOINT: &str = "endpoint";
    pub const CONTAINER: &str = "container";
}

/// A timestamped value; the later timestamp wins on merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestEntry {
    pub timestamp: DateTime<Utc>,
    pub value: String,
}

impl LatestEntry {
    fn merge(&mut self, other: &LatestEntry) {
        // Ties are broken on the value so the result does not depend on
        // merge order.
        if (other.timestamp, &other.value) > (self.timestamp, &self.value) {
            *self = other.clone();
        }
    }
}

/// One node in a topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub latest: BTreeMap<String, LatestEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sets: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub adjacency: BTreeSet<String>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set a latest value, keeping the newer one if the key already exists
    pub fn with_latest(
        mut self,
        key: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: impl Into<String>,
    ) -> Self {
        let entry = LatestEntry {
            timestamp,
            value: value.into(),
        };
        self.latest
            .entry(key.into())
            .and_modify(|e| e.merge(&entry))
            .or_insert(entry);
        self
    }

    pub fn with_set(
        mut self,
        key: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.sets
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn with_adjacent(mut self, id: impl Into<String>) -> Self {
        self.adjacency.insert(id.into());
        self
    }

    /// Get the current value of a latest register
    pub fn latest_value(&self, key: &str) -> Option<&str> {
        self.latest.get(key).map(|e| e.value.as_str())
    }

    pub fn merge(&mut self, other: &Node) {
        for (key, entry) in &other.latest {
            self.latest
                .entry(key.clone())
                .and_modify(|e| e.merge(entry))
                .or_insert_with(|| entry.clone());
        }
        for (key, values) in &other.sets {
            self.sets
                .entry(key.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
        self.adjacency.extend(other.adjacency.iter().cloned());
    }
}

/// A named collection of nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
}

impl Topology {
    pub fn add_node(&mut self, node: Node) {
        match self.nodes.get_mut(&node.id) {
            Some(existing) => existing.merge(&node),
            None => {
                self.nodes.insert(node.id.clone(), node);
            }
        }
    }

    pub fn merge(&mut self, other: &Topology) {
        for node in other.nodes.values() {
            match self.nodes.get_mut(&node.id) {
                Some(existing) => existing.merge(node),
                None => {
                    self.nodes.insert(node.id.clone(), node.clone());
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A snapshot of observed state produced by a probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub topologies: BTreeMap<String, Topology>,
    /// Set on reports published out-of-band, ahead of the regular interval
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shortcut: bool,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a topology by name
    pub fn topology_mut(&mut self, name: &str) -> &mut Topology {
        self.topologies.entry(name.to_string()).or_default()
    }

    pub fn topology(&self, name: &str) -> Option<&Topology> {
        self.topologies.get(name)
    }

    /// Look up a node in the named topology
    pub fn node(&self, topology: &str, id: &str) -> Option<&Node> {
        self.topologies.get(topology)?.nodes.get(id)
    }

    /// Merge `other` into `self` in place
    pub fn merge(&mut self, other: &Report) {
        self.ts = match (self.ts, other.ts) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for (name, topology) in &other.topologies {
            self.topologies
                .entry(name.clone())
                .or_default()
                .merge(topology);
        }
        self.shortcut |= other.shortcut;
    }

    /// Return a new report holding the merge of `self` and `other`
    pub fn merged(&self, other: &Report) -> Report {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Total number of nodes across all topologies
    pub fn node_count(&self) -> usize {
        self.topologies.values().map(Topology::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topologies.values().all(Topology::is_empty)
    }
}
