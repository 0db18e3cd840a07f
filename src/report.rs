// report.rs - Per-tick report data model: topologies of mergeable nodes

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

// Node metadata keys.
pub const ADDR: &str = "addr";
pub const PORT: &str = "port";
pub const CONNTRACKED: &str = "conntracked";
pub const EBPF: &str = "eBPF";
pub const PROCSPIED: &str = "procspied";
pub const REVERSE_DNS_NAMES: &str = "reverse_dns_names";
pub const SNOOPED_DNS_NAMES: &str = "snooped_dns_names";
pub const PID: &str = "pid";
pub const HOST_NODE_ID: &str = "host_node_id";
pub const NAME: &str = "name";
pub const CMDLINE: &str = "cmdline";

/// Host node id: `<hostId>;<host>`.
pub fn make_host_node_id(host_id: &str) -> String {
    format!("{};<host>", host_id)
}

/// Endpoint node id: `endpoint;<hostId>;<netns>;<addr>;<port>`.
pub fn make_endpoint_node_id(host_id: &str, netns: &str, addr: &str, port: u16) -> String {
    format!("endpoint;{};{};{};{}", host_id, netns, addr, port)
}

/// Process node id: `process;<hostId>;<pid>`.
pub fn make_process_node_id(host_id: &str, pid: i32) -> String {
    format!("process;{};{}", host_id, pid)
}

/// Edge metadata is empty in this core; per-edge metrics are an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EdgeMetadata {}

/// A topology node: latest attributes, string sets, and outgoing edges.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub latest: BTreeMap<String, String>,
    pub sets: BTreeMap<String, BTreeSet<String>>,
    pub adjacency: BTreeMap<String, EdgeMetadata>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            latest: BTreeMap::new(),
            sets: BTreeMap::new(),
            adjacency: BTreeMap::new(),
        }
    }

    pub fn with_latest(mut self, key: &str, value: impl Into<String>) -> Self {
        self.latest.insert(key.to_string(), value.into());
        self
    }

    pub fn with_latests<I>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.latest.extend(pairs);
        self
    }

    /// Union `names` into the set stored under `key`.
    pub fn with_set<I>(mut self, key: &str, names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.sets.entry(key.to_string()).or_default().extend(names);
        self
    }

    /// Record an outgoing edge to `to`.
    pub fn with_edge(mut self, to: &str, md: EdgeMetadata) -> Self {
        self.adjacency.insert(to.to_string(), md);
        self
    }
}

/// A set of nodes keyed by id. Adding a node with an existing id merges the
/// two: latest attributes overwrite, sets union, adjacency unions.
#[derive(Debug, Default, Serialize)]
pub struct Topology {
    pub nodes: BTreeMap<String, Node>,
}

impl Topology {
    pub fn add_node(&mut self, node: Node) {
        match self.nodes.get_mut(&node.id) {
            Some(existing) => {
                existing.latest.extend(node.latest);
                for (key, names) in node.sets {
                    existing.sets.entry(key).or_default().extend(names);
                }
                existing.adjacency.extend(node.adjacency);
            }
            None => {
                self.nodes.insert(node.id.clone(), node);
            }
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// One report per tick. The connection tracker populates `endpoint`; the
/// reporter loop populates `process` and the host node.
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub endpoint: Topology,
    pub process: Topology,
    pub host: Topology,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }
}
