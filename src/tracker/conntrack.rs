// tracker/conntrack.rs - conntrack event-stream walker for short-lived flows

use crate::tracker::four_tuple::FourTuple;
use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// One direction of a conntrack flow entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
}

/// A kernel flow-table entry. `original` is the initiator's view; `reply`
/// is the kernel's answer path and differs from it under NAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub id: u32,
    pub original: FlowTuple,
    pub reply: FlowTuple,
    pub alive: bool,
}

impl Flow {
    /// Canonical client→server tuple. When the original destination differs
    /// from the reply source, DNAT rewrote the flow; the reply side reversed
    /// recovers the real server endpoint.
    pub fn canonical_tuple(&self) -> FourTuple {
        if self.original.dst != self.reply.src {
            FourTuple::new(
                self.reply.dst,
                self.reply.src,
                self.reply.dport,
                self.reply.sport,
            )
        } else {
            FourTuple::new(
                self.original.src,
                self.original.dst,
                self.original.sport,
                self.original.dport,
            )
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowEvent {
    New,
    Update,
    Destroy,
}

/// The flow table proper, separated from the subprocess plumbing so the
/// NEW → UPDATE → DESTROY → removed lifecycle is testable on its own.
#[derive(Default)]
struct FlowTable {
    flows: HashMap<u32, Flow>,
}

impl FlowTable {
    fn apply(&mut self, event: FlowEvent, flow: Flow) {
        match event {
            FlowEvent::New | FlowEvent::Update => {
                self.flows.insert(flow.id, flow);
            }
            FlowEvent::Destroy => match self.flows.get_mut(&flow.id) {
                Some(existing) => existing.alive = false,
                // Missed the NEW; the flow still surfaces exactly once.
                None => {
                    self.flows.insert(flow.id, flow);
                }
            },
        }
    }

    /// Invoke `f` for every flow observed since the last walk, including one
    /// terminal not-alive call per destroyed flow, then drop the dead ones.
    fn walk(&mut self, f: &mut dyn FnMut(&Flow)) {
        for flow in self.flows.values() {
            f(flow);
        }
        self.flows.retain(|_, flow| flow.alive);
    }
}

/// Long-poll subscription to `conntrack -E -o id -p tcp`, catching TCP flows
/// too short-lived to ever appear in a /proc scan.
pub struct ConntrackFlowWalker {
    table: Arc<Mutex<FlowTable>>,
    child: Mutex<Child>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConntrackFlowWalker {
    /// Spawn the subscription. `extra_args` is for walker variants such as
    /// the NAT mapper's `--any-nat`.
    pub fn new(buffer_size: usize, extra_args: &[&str]) -> Result<Self> {
        let mut cmd = Command::new("conntrack");
        cmd.args(["-E", "-o", "id", "-p", "tcp"])
            .args(extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null());

        let mut child = cmd.spawn().context("failed to spawn conntrack")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("conntrack stdout unavailable"))?;

        let table = Arc::new(Mutex::new(FlowTable::default()));
        let reader_table = Arc::clone(&table);
        let reader = thread::spawn(move || {
            let lines = BufReader::with_capacity(buffer_size, stdout).lines();
            for line in lines {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error!("conntrack: event stream read failed: {}", e);
                        break;
                    }
                };
                match parse_flow_line(&line) {
                    Some((event, flow)) => reader_table
                        .lock()
                        .expect("flow table lock poisoned")
                        .apply(event, flow),
                    None => debug!("conntrack: skipping line {:?}", line),
                }
            }
            info!("conntrack: event stream ended");
        });

        Ok(Self {
            table,
            child: Mutex::new(child),
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Walk all flows observed since the last walk; destroyed flows get one
    /// terminal call and are then forgotten.
    pub fn walk_flows(&self, mut f: impl FnMut(&Flow)) {
        self.table
            .lock()
            .expect("flow table lock poisoned")
            .walk(&mut f);
    }

    /// Terminate the subprocess and drain the reader.
    pub fn stop(&self) {
        {
            let mut child = self.child.lock().expect("conntrack child lock poisoned");
            if let Err(e) = child.kill() {
                debug!("conntrack: kill: {}", e);
            }
            let _ = child.wait();
        }
        if let Some(reader) = self
            .reader
            .lock()
            .expect("conntrack reader lock poisoned")
            .take()
        {
            let _ = reader.join();
        }
    }
}

impl Drop for ConntrackFlowWalker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parse one `conntrack -E -o id` event line, e.g.
///
/// ```text
///     [NEW] tcp      6 120 SYN_SENT src=10.0.0.1 dst=10.0.0.2 sport=1000 \
///         dport=80 [UNREPLIED] src=10.0.0.2 dst=10.0.0.1 sport=80 dport=1000 id=12345
/// ```
///
/// The first src/dst/sport/dport group is the original direction, the second
/// the reply. Non-TCP lines return None.
fn parse_flow_line(line: &str) -> Option<(FlowEvent, Flow)> {
    let mut tokens = line.split_whitespace();

    let event = match tokens.next()? {
        "[NEW]" => FlowEvent::New,
        "[UPDATE]" => FlowEvent::Update,
        "[DESTROY]" => FlowEvent::Destroy,
        _ => return None,
    };
    if tokens.next()? != "tcp" {
        return None;
    }

    let mut srcs: Vec<Ipv4Addr> = Vec::with_capacity(2);
    let mut dsts: Vec<Ipv4Addr> = Vec::with_capacity(2);
    let mut sports: Vec<u16> = Vec::with_capacity(2);
    let mut dports: Vec<u16> = Vec::with_capacity(2);
    let mut id: Option<u32> = None;

    for token in tokens {
        if let Some((key, value)) = token.split_once('=') {
            match key {
                "src" => srcs.push(value.parse().ok()?),
                "dst" => dsts.push(value.parse().ok()?),
                "sport" => sports.push(value.parse().ok()?),
                "dport" => dports.push(value.parse().ok()?),
                "id" => id = value.parse().ok(),
                _ => {}
            }
        }
    }

    if srcs.len() != 2 || dsts.len() != 2 || sports.len() != 2 || dports.len() != 2 {
        return None;
    }

    Some((
        event,
        Flow {
            id: id?,
            original: FlowTuple {
                src: srcs[0],
                dst: dsts[0],
                sport: sports[0],
                dport: dports[0],
            },
            reply: FlowTuple {
                src: srcs[1],
                dst: dsts[1],
                sport: sports[1],
                dport: dports[1],
            },
            alive: event != FlowEvent::Destroy,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEW_LINE: &str = "    [NEW] tcp      6 120 SYN_SENT src=10.0.0.1 dst=10.0.0.2 sport=1000 dport=80 [UNREPLIED] src=10.0.0.2 dst=10.0.0.1 sport=80 dport=1000 id=12345";
    const DESTROY_LINE: &str = "[DESTROY] tcp      6 src=10.0.0.1 dst=10.0.0.2 sport=1000 dport=80 packets=5 bytes=300 src=10.0.0.2 dst=10.0.0.1 sport=80 dport=1000 packets=4 bytes=200 [ASSURED] id=12345";

    #[test]
    fn test_parse_new_event() {
        let (event, flow) = parse_flow_line(NEW_LINE).unwrap();
        assert_eq!(event, FlowEvent::New);
        assert_eq!(flow.id, 12345);
        assert!(flow.alive);
        assert_eq!(flow.original.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(flow.original.dport, 80);
        assert_eq!(flow.reply.src, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(flow.reply.sport, 80);
    }

    #[test]
    fn test_parse_destroy_event_is_not_alive() {
        let (event, flow) = parse_flow_line(DESTROY_LINE).unwrap();
        assert_eq!(event, FlowEvent::Destroy);
        assert!(!flow.alive);
    }

    #[test]
    fn test_parse_rejects_non_tcp_and_garbage() {
        assert!(parse_flow_line(
            "    [NEW] udp      17 30 src=10.0.0.1 dst=10.0.0.2 sport=53 dport=53 src=10.0.0.2 dst=10.0.0.1 sport=53 dport=53 id=7"
        )
        .is_none());
        assert!(parse_flow_line("conntrack v1.4.6 (conntrack-tools)").is_none());
        // Missing the reply group.
        assert!(parse_flow_line(
            "    [NEW] tcp      6 120 SYN_SENT src=10.0.0.1 dst=10.0.0.2 sport=1000 dport=80 id=9"
        )
        .is_none());
    }

    #[test]
    fn test_canonical_tuple_unfolds_dnat() {
        let flow = Flow {
            id: 1,
            original: FlowTuple {
                src: Ipv4Addr::new(1, 2, 3, 4),
                dst: Ipv4Addr::new(5, 6, 7, 8),
                sport: 1000,
                dport: 80,
            },
            reply: FlowTuple {
                src: Ipv4Addr::new(9, 10, 11, 12),
                dst: Ipv4Addr::new(1, 2, 3, 4),
                sport: 80,
                dport: 1000,
            },
            alive: true,
        };
        assert_eq!(
            flow.canonical_tuple(),
            FourTuple::new(
                Ipv4Addr::new(1, 2, 3, 4),
                Ipv4Addr::new(9, 10, 11, 12),
                1000,
                80
            )
        );
    }

    #[test]
    fn test_canonical_tuple_without_nat_keeps_original() {
        let (_, flow) = parse_flow_line(NEW_LINE).unwrap();
        assert_eq!(
            flow.canonical_tuple(),
            FourTuple::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 1000, 80)
        );
    }

    #[test]
    fn test_flow_lifecycle_destroyed_flow_surfaces_once() {
        let mut table = FlowTable::default();
        let (event, flow) = parse_flow_line(NEW_LINE).unwrap();
        table.apply(event, flow);

        let mut walked = Vec::new();
        table.walk(&mut |f| walked.push(*f));
        assert_eq!(walked.len(), 1);
        assert!(walked[0].alive);

        let (event, flow) = parse_flow_line(DESTROY_LINE).unwrap();
        table.apply(event, flow);

        walked.clear();
        table.walk(&mut |f| walked.push(*f));
        assert_eq!(walked.len(), 1);
        assert!(!walked[0].alive);

        walked.clear();
        table.walk(&mut |f| walked.push(*f));
        assert!(walked.is_empty());
    }

    #[test]
    fn test_destroy_without_new_still_surfaces() {
        let mut table = FlowTable::default();
        let (event, flow) = parse_flow_line(DESTROY_LINE).unwrap();
        table.apply(event, flow);

        let mut walked = Vec::new();
        table.walk(&mut |f| walked.push(*f));
        assert_eq!(walked.len(), 1);
        assert!(!walked[0].alive);

        walked.clear();
        table.walk(&mut |f| walked.push(*f));
        assert!(walked.is_empty());
    }

    #[test]
    fn test_destroy_preserves_established_tuples() {
        let mut table = FlowTable::default();
        let (event, flow) = parse_flow_line(NEW_LINE).unwrap();
        table.apply(event, flow);

        // The table keeps the tuples it already knows and only flips liveness.
        let (event, destroy) = parse_flow_line(DESTROY_LINE).unwrap();
        table.apply(event, destroy);

        let mut walked = Vec::new();
        table.walk(&mut |f| walked.push(*f));
        assert_eq!(walked[0].original, flow.original);
        assert_eq!(walked[0].reply, flow.reply);
    }
}
