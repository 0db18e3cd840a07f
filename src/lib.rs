//! netprobe - host-side connection observation core
//!
//! Fuses three TCP connection sources (an eBPF kprobe stream, a conntrack
//! flow walker and a /proc scanner) into de-duplicated,
//! direction-canonicalized endpoint edges, and maintains the host's process
//! set from netlink proc-connector events. One report per tick.

pub mod process;
pub mod report;
pub mod tracker;
