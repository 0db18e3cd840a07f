// tracker/procspy.rs - /proc/net/tcp snapshot scanner with PID and netns attribution

use anyhow::{Context, Result};
use log::debug;
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// TCP_ESTABLISHED in the `st` column of /proc/net/tcp.
const STATE_ESTABLISHED: &str = "01";

/// One established TCP socket as seen by the kernel, attributed to the
/// owning process when inode resolution succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcConnection {
    pub local_addr: Ipv4Addr,
    pub remote_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
    /// 0 when inode→PID resolution failed or was skipped.
    pub pid: u32,
    /// inode of /proc/<pid>/ns/net; 0 when unknown.
    pub net_namespace_id: u64,
}

/// The lazy connection sequence a scan yields.
pub type ProcConnections = Box<dyn Iterator<Item = ProcConnection> + Send>;

/// Source of per-tick connection snapshots. The orchestrator only depends on
/// this seam, so tests and alternative scanners (e.g. a background caching
/// walker) can be injected.
pub trait ConnectionScanner: Send {
    fn connections(&self, spy_procs: bool) -> Result<ProcConnections>;

    /// Release background resources, if any.
    fn stop(&self) {}
}

/// One-shot synchronous scanner over a /proc root.
pub struct SyncConnectionScanner {
    proc_root: PathBuf,
}

impl SyncConnectionScanner {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl ConnectionScanner for SyncConnectionScanner {
    fn connections(&self, spy_procs: bool) -> Result<ProcConnections> {
        let tcp_path = self.proc_root.join("net/tcp");
        let content = fs::read_to_string(&tcp_path)
            .with_context(|| format!("failed to open {}", tcp_path.display()))?;

        // The fd walk is the expensive part; do it once up front so row
        // parsing stays a cheap per-item step.
        let owners = if spy_procs {
            SocketOwners::scan(&self.proc_root)
        } else {
            SocketOwners::default()
        };

        let rows: Vec<String> = content.lines().skip(1).map(str::to_string).collect();
        Ok(Box::new(ProcConnectionIter {
            rows: rows.into_iter(),
            owners,
        }))
    }
}

/// Lazy single-pass iterator over scanned connections. Malformed rows and
/// non-established sockets are skipped silently.
pub struct ProcConnectionIter {
    rows: std::vec::IntoIter<String>,
    owners: SocketOwners,
}

impl Iterator for ProcConnectionIter {
    type Item = ProcConnection;

    fn next(&mut self) -> Option<ProcConnection> {
        for row in self.rows.by_ref() {
            if let Some(conn) = parse_row(&row, &self.owners) {
                return Some(conn);
            }
        }
        None
    }
}

/// Socket inode → owning PID, plus each PID's network namespace.
#[derive(Default)]
struct SocketOwners {
    inode_to_pid: HashMap<u64, u32>,
    pid_netns: HashMap<u32, u64>,
}

impl SocketOwners {
    /// Walk /proc/<pid>/fd/* resolving `socket:[<inode>]` links, and record
    /// each PID's netns from /proc/<pid>/ns/net. Unreadable processes are
    /// skipped (they exited, or we lack permission).
    fn scan(proc_root: &Path) -> Self {
        let mut owners = Self::default();

        let entries = match fs::read_dir(proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("procspy: cannot read {}: {}", proc_root.display(), e);
                return owners;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let pid = match path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                Some(pid) if pid > 0 => pid,
                _ => continue,
            };

            if let Some(netns) = read_net_namespace(&path) {
                owners.pid_netns.insert(pid, netns);
            }

            let fd_entries = match fs::read_dir(path.join("fd")) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for fd_entry in fd_entries.flatten() {
                if let Ok(link) = fs::read_link(fd_entry.path()) {
                    if let Some(inode) = link.to_str().and_then(extract_socket_inode) {
                        owners.inode_to_pid.insert(inode, pid);
                    }
                }
            }
        }

        owners
    }
}

fn parse_row(line: &str, owners: &SocketOwners) -> Option<ProcConnection> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }
    if parts[3] != STATE_ESTABLISHED {
        return None;
    }

    let (local_addr, local_port) = parse_hex_address(parts[1])?;
    let (remote_addr, remote_port) = parse_hex_address(parts[2])?;
    let inode: u64 = parts[9].parse().ok()?;

    let pid = owners.inode_to_pid.get(&inode).copied().unwrap_or(0);
    let net_namespace_id = owners.pid_netns.get(&pid).copied().unwrap_or(0);

    Some(ProcConnection {
        local_addr,
        remote_addr,
        local_port,
        remote_port,
        pid,
        net_namespace_id,
    })
}

/// Parse the kernel's `AABBCCDD:PPPP` socket address format: the address is
/// a little-endian hex u32, the port big-endian hex.
fn parse_hex_address(hex_addr: &str) -> Option<(Ipv4Addr, u16)> {
    let (ip_hex, port_hex) = hex_addr.split_once(':')?;
    if ip_hex.len() != 8 {
        // 32-hex-digit rows are IPv6; this scanner is IPv4-only.
        return None;
    }
    let ip_bits = u32::from_str_radix(ip_hex, 16).ok()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    Some((Ipv4Addr::from(ip_bits.to_le_bytes()), port))
}

fn extract_socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Read the netns inode from the `net:[<inode>]` symlink target of
/// /proc/<pid>/ns/net.
fn read_net_namespace(pid_dir: &Path) -> Option<u64> {
    let link = fs::read_link(pid_dir.join("ns/net")).ok()?;
    link.to_str()?
        .strip_prefix("net:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_parse_hex_address_is_little_endian() {
        // 0100007F = 127.0.0.1, port 0x0050 = 80
        let (addr, port) = parse_hex_address("0100007F:0050").unwrap();
        assert_eq!(addr, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(port, 80);
    }

    #[test]
    fn test_parse_hex_address_rejects_ipv6_rows() {
        assert!(parse_hex_address("00000000000000000000000001000000:0050").is_none());
        assert!(parse_hex_address("garbage").is_none());
    }

    #[test]
    fn test_extract_socket_inode() {
        assert_eq!(extract_socket_inode("socket:[31337]"), Some(31337));
        assert_eq!(extract_socket_inode("pipe:[42]"), None);
        assert_eq!(extract_socket_inode("socket:[nope]"), None);
    }

    #[test]
    fn test_skips_non_established_rows() {
        let owners = SocketOwners::default();
        // st=0A is LISTEN
        let listen = "   0: 0100007F:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 31337 1 0000000000000000 100 0 0 10 0";
        assert!(parse_row(listen, &owners).is_none());
    }

    fn fixture_proc() -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "netprobe-procspy-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = fs::remove_dir_all(&root);

        fs::create_dir_all(root.join("net")).unwrap();
        fs::create_dir_all(root.join("123/fd")).unwrap();
        fs::create_dir_all(root.join("123/ns")).unwrap();

        // One established connection (inode 31337) and one listener.
        let tcp = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   \
                   0: 0100007F:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 99 1 0000000000000000 100 0 0 10 0\n   \
                   1: 0200000A:D431 0100000A:0050 01 00000000:00000000 00:00000000 00000000     0        0 31337 1 0000000000000000 20 4 30 10 -1\n";
        fs::write(root.join("net/tcp"), tcp).unwrap();

        symlink("socket:[31337]", root.join("123/fd/4")).unwrap();
        symlink("net:[4026531957]", root.join("123/ns/net")).unwrap();
        root
    }

    #[test]
    fn test_scan_resolves_pid_and_netns() {
        let root = fixture_proc();
        let scanner = SyncConnectionScanner::new(&root);

        let conns: Vec<ProcConnection> = scanner.connections(true).unwrap().collect();
        assert_eq!(conns.len(), 1);

        let conn = conns[0];
        assert_eq!(conn.local_addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(conn.local_port, 54321);
        assert_eq!(conn.remote_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(conn.remote_port, 80);
        assert_eq!(conn.pid, 123);
        assert_eq!(conn.net_namespace_id, 4026531957);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_scan_without_spy_procs_leaves_pid_zero() {
        let root = fixture_proc();
        let scanner = SyncConnectionScanner::new(&root);

        let conns: Vec<ProcConnection> = scanner.connections(false).unwrap().collect();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].pid, 0);
        assert_eq!(conns[0].net_namespace_id, 0);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_missing_proc_net_tcp_is_an_error() {
        let scanner = SyncConnectionScanner::new("/nonexistent-proc-root");
        assert!(scanner.connections(false).is_err());
    }
}
