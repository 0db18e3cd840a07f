// tracker/mod.rs - Connection tracker orchestration: source selection, priming,
// per-tick reporting

pub mod conntrack;
pub mod ebpf;
pub mod four_tuple;
pub mod procspy;
pub mod resolver;
pub mod snoop;

use crate::report::{self, EdgeMetadata, Node, Report};
use anyhow::{anyhow, Result};
use conntrack::ConntrackFlowWalker;
use ebpf::{EbpfTracker, EventTracker};
use four_tuple::FourTuple;
use log::{debug, warn};
use procspy::{ConnectionScanner, SyncConnectionScanner};
use resolver::ReverseResolver;
use snoop::DnsSnooper;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

type NodeInfo = BTreeMap<String, String>;

/// Configuration for the connection tracker; see the probe CLI for the
/// user-facing knobs.
pub struct TrackerConfig {
    /// Stamped into every endpoint node id.
    pub host_id: String,
    pub host_name: String,
    /// Whether the proc scanner attributes sockets to PIDs.
    pub spy_procs: bool,
    /// Enable the conntrack flow walker.
    pub use_conntrack: bool,
    /// Enable periodic /proc scanning.
    pub walk_proc: bool,
    /// Prefer the eBPF source.
    pub use_ebpf_conn: bool,
    /// Root of the proc filesystem, overridable for tests.
    pub proc_root: PathBuf,
    /// conntrack subprocess pipe buffer.
    pub buffer_size: usize,
    /// Injected proc scanner; a SyncConnectionScanner over `proc_root` is
    /// constructed when absent and needed.
    pub scanner: Option<Box<dyn ConnectionScanner>>,
    /// Injected snooped-DNS name source, read-only here.
    pub dns_snooper: Option<Arc<dyn DnsSnooper>>,
}

/// Fuses the configured connection sources into endpoint nodes and directed
/// edges, one report per tick.
///
/// With `use_ebpf_conn` the kprobe tracker is primed once from a conntrack
/// walk plus a /proc scan and then serves every tick alone; otherwise each
/// tick walks conntrack flows and /proc connections directly.
pub struct ConnectionTracker {
    conf: TrackerConfig,
    flow_walker: Option<ConntrackFlowWalker>,
    ebpf_tracker: EventTracker,
    reverse_resolver: ReverseResolver,
}

impl ConnectionTracker {
    pub fn new(mut conf: TrackerConfig) -> Self {
        if conf.scanner.is_none() && (conf.walk_proc || conf.use_ebpf_conn) {
            conf.scanner = Some(Box::new(SyncConnectionScanner::new(conf.proc_root.clone())));
        }

        if conf.use_ebpf_conn {
            let ebpf_tracker = match EbpfTracker::new() {
                Ok(mut tracker) => {
                    Self::prime(&mut tracker, &mut conf);
                    EventTracker::Ebpf(tracker)
                }
                Err(e) => {
                    warn!(
                        "ebpf tracker unavailable, recording zero connections: {}",
                        e
                    );
                    EventTracker::Noop
                }
            };
            return Self {
                conf,
                flow_walker: None,
                ebpf_tracker,
                reverse_resolver: ReverseResolver::new(),
            };
        }

        let flow_walker = if conf.use_conntrack {
            match ConntrackFlowWalker::new(conf.buffer_size, &[]) {
                Ok(walker) => Some(walker),
                Err(e) => {
                    warn!("conntrack walker unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            conf,
            flow_walker,
            ebpf_tracker: EventTracker::Noop,
            reverse_resolver: ReverseResolver::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_event_tracker(conf: TrackerConfig, ebpf_tracker: EventTracker) -> Self {
        Self {
            conf,
            flow_walker: None,
            ebpf_tracker,
            reverse_resolver: ReverseResolver::new(),
        }
    }

    /// One-time priming of the kprobe tracker: a single conntrack walk for
    /// direction canonicalization, a single /proc scan synthesized as prior
    /// connects/accepts, then perf reading begins.
    fn prime(tracker: &mut EbpfTracker, conf: &mut TrackerConfig) {
        let mut seen_tuples: HashMap<String, FourTuple> = HashMap::new();
        if conf.use_conntrack {
            match ConntrackFlowWalker::new(conf.buffer_size, &[]) {
                Ok(walker) => {
                    walker.walk_flows(|flow| {
                        let tuple = flow.canonical_tuple();
                        seen_tuples.insert(tuple.key(), tuple);
                    });
                    walker.stop();
                }
                Err(e) => debug!("priming without conntrack: {}", e),
            }
        }

        match conf.scanner.take() {
            Some(scanner) => {
                match scanner.connections(conf.spy_procs) {
                    Ok(conns) => tracker.feed_initial_connections(conns, &seen_tuples),
                    Err(e) => {
                        warn!("initial proc scan failed: {}", e);
                        tracker.feed_initial_connections_empty();
                    }
                }
                // The eBPF source replaces per-tick scanning entirely.
                scanner.stop();
            }
            None => tracker.feed_initial_connections_empty(),
        }

        tracker.start();
    }

    /// Populate `rpt` with this tick's endpoint nodes and edges.
    pub fn report_connections(&self, rpt: &mut Report) -> Result<()> {
        let host_node_id = report::make_host_node_id(&self.conf.host_id);

        if self.conf.use_ebpf_conn {
            return self.perform_ebpf_walk(rpt, &host_node_id);
        }

        // Tuples seen by conntrack this tick teach the /proc walk which
        // direction a connection really runs.
        let mut seen_tuples: HashMap<String, FourTuple> = HashMap::new();
        self.perform_flow_walk(rpt, &mut seen_tuples);
        if self.conf.walk_proc {
            self.perform_proc_walk(rpt, &host_node_id, &seen_tuples)?;
        }
        Ok(())
    }

    fn perform_ebpf_walk(&self, rpt: &mut Report, host_node_id: &str) -> Result<()> {
        let tracker = match &self.ebpf_tracker {
            // Failed init was already warned about; degraded mode records
            // zero connections.
            EventTracker::Noop => return Ok(()),
            EventTracker::Ebpf(tracker) => tracker,
        };
        if tracker.has_died() {
            return Err(anyhow!("ebpf tracker died"));
        }

        tracker.walk_connections(|conn| {
            let mut from_info = node_info(&[(report::PROCSPIED, "true"), (report::EBPF, "true")]);
            let to_info = node_info(&[(report::PROCSPIED, "true"), (report::EBPF, "true")]);
            if conn.pid > 0 {
                from_info.insert(report::PID.to_string(), conn.pid.to_string());
                from_info.insert(report::HOST_NODE_ID.to_string(), host_node_id.to_string());
            }

            // Incoming tuples are oriented server→client; edges always run
            // client→server, with the origin info following the local side.
            if conn.incoming {
                self.add_connection(rpt, conn.tuple.reversed(), &conn.net_ns, to_info, from_info);
            } else {
                self.add_connection(rpt, conn.tuple, &conn.net_ns, from_info, to_info);
            }
        });
        Ok(())
    }

    fn perform_flow_walk(&self, rpt: &mut Report, seen_tuples: &mut HashMap<String, FourTuple>) {
        let walker = match &self.flow_walker {
            Some(walker) => walker,
            None => return,
        };
        let extra = node_info(&[(report::CONNTRACKED, "true")]);
        walker.walk_flows(|flow| {
            let tuple = flow.canonical_tuple();
            seen_tuples.insert(tuple.key(), tuple);
            self.add_connection(rpt, tuple, "", extra.clone(), extra.clone());
        });
    }

    fn perform_proc_walk(
        &self,
        rpt: &mut Report,
        host_node_id: &str,
        seen_tuples: &HashMap<String, FourTuple>,
    ) -> Result<()> {
        let scanner = match &self.conf.scanner {
            Some(scanner) => scanner,
            None => return Ok(()),
        };
        let conns = scanner.connections(self.conf.spy_procs)?;

        for conn in conns {
            let mut tuple = FourTuple::new(
                conn.local_addr,
                conn.remote_addr,
                conn.local_port,
                conn.remote_port,
            );
            let namespace_id = if conn.net_namespace_id > 0 {
                conn.net_namespace_id.to_string()
            } else {
                String::new()
            };

            let mut from_info = node_info(&[(report::PROCSPIED, "true")]);
            let mut to_info = node_info(&[(report::PROCSPIED, "true")]);
            if conn.pid > 0 {
                from_info.insert(report::PID.to_string(), conn.pid.to_string());
                from_info.insert(report::HOST_NODE_ID.to_string(), host_node_id.to_string());
            }

            // If conntrack saw this connection we know its real direction;
            // otherwise guess that the lower-numbered port is the listener.
            let canonical = seen_tuples.get(&tuple.key());
            if canonical.map_or(tuple.from_port < tuple.to_port, |c| *c != tuple) {
                tuple.reverse();
                std::mem::swap(&mut from_info, &mut to_info);
            }
            self.add_connection(rpt, tuple, &namespace_id, from_info, to_info);
        }
        Ok(())
    }

    fn add_connection(
        &self,
        rpt: &mut Report,
        tuple: FourTuple,
        namespace_id: &str,
        extra_from: NodeInfo,
        extra_to: NodeInfo,
    ) {
        let to_node =
            self.make_endpoint_node(namespace_id, tuple.to_addr, tuple.to_port, extra_to);
        let from_node = self
            .make_endpoint_node(namespace_id, tuple.from_addr, tuple.from_port, extra_from)
            .with_edge(&to_node.id, EdgeMetadata::default());
        rpt.endpoint.add_node(from_node);
        rpt.endpoint.add_node(to_node);
    }

    fn make_endpoint_node(
        &self,
        namespace_id: &str,
        addr: Ipv4Addr,
        port: u16,
        extra: NodeInfo,
    ) -> Node {
        let addr_str = addr.to_string();
        let mut node = Node::new(report::make_endpoint_node_id(
            &self.conf.host_id,
            namespace_id,
            &addr_str,
            port,
        ))
        .with_latest(report::ADDR, addr_str)
        .with_latest(report::PORT, port.to_string());

        if let Some(snooper) = &self.conf.dns_snooper {
            let names = snooper.cached_names_for_ip(addr);
            if !names.is_empty() {
                node = node.with_set(report::SNOOPED_DNS_NAMES, names);
            }
        }
        if let Some(names) = self.reverse_resolver.get(addr) {
            node = node.with_set(report::REVERSE_DNS_NAMES, names);
        }
        node.with_latests(extra)
    }

    /// Tear down every source this tracker owns.
    pub fn stop(&mut self) {
        self.ebpf_tracker.stop();
        if let Some(walker) = self.flow_walker.take() {
            walker.stop();
        }
        self.reverse_resolver.stop();
        if let Some(scanner) = self.conf.scanner.take() {
            scanner.stop();
        }
    }
}

fn node_info(pairs: &[(&str, &str)]) -> NodeInfo {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
