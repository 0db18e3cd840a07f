// process/mod.rs - Authoritative process set fed by the netlink proc connector

use anyhow::{anyhow, Result};
use log::{debug, error, info};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

// <linux/connector.h>
const CN_IDX_PROC: u32 = 0x1;
const CN_VAL_PROC: u32 = 0x1;

// <linux/cn_proc.h>
const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_DONE: u16 = 0x3;
/// struct cn_msg: id (idx, val), seq, ack, len, flags.
const CN_MSG_LEN: usize = 20;
/// struct proc_event header: what, cpu, timestamp_ns.
const EVENT_HDR_LEN: usize = 16;

/// A single process. Only the constant details live here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: i32,
    pub name: String,
    pub cmdline: String,
}

#[derive(Default)]
struct ConnectorState {
    active_pids: HashMap<i32, Process>,
    buffered_pids: Vec<Process>,
}

impl ConnectorState {
    fn insert(&mut self, pid: i32, proc_root: &Path) {
        let (name, cmdline) = get_cmdline(proc_root, pid);
        self.active_pids.insert(pid, Process { pid, name, cmdline });
    }

    fn exit(&mut self, pid: i32) {
        // An EXIT without a prior FORK is ignored.
        if let Some(process) = self.active_pids.remove(&pid) {
            self.buffered_pids.push(process);
        }
    }

    /// Active processes first, then processes that exited since the last
    /// walk; the exited ones then age out.
    fn walk(&mut self, f: &mut dyn FnMut(&Process)) {
        for process in self.active_pids.values() {
            f(process);
        }
        for process in &self.buffered_pids {
            f(process);
        }
        self.buffered_pids.clear();
    }

    /// Handle one NLMSG_DONE payload: cn_msg header, proc_event header,
    /// then the event-specific struct.
    fn handle_event(&mut self, data: &[u8], proc_root: &Path) {
        let what = match read_u32(data, CN_MSG_LEN) {
            Some(what) => what,
            None => return,
        };
        let body = CN_MSG_LEN + EVENT_HDR_LEN;

        match what {
            PROC_EVENT_FORK => {
                // parent_pid, parent_tgid, child_pid, child_tgid
                if let Some(child_tgid) = read_u32(data, body + 12) {
                    self.insert(child_tgid as i32, proc_root);
                }
            }
            PROC_EVENT_EXEC => {
                // process_pid, process_tgid
                if let Some(tgid) = read_u32(data, body + 4) {
                    self.insert(tgid as i32, proc_root);
                }
            }
            PROC_EVENT_EXIT => {
                if let Some(tgid) = read_u32(data, body + 4) {
                    self.exit(tgid as i32);
                }
            }
            _ => {}
        }
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_ne_bytes(bytes.try_into().ok()?))
}

/// Name and command line for a PID. The name is the first NUL-separated
/// element of cmdline; `(unknown)` when the read fails.
fn get_cmdline(proc_root: &Path, pid: i32) -> (String, String) {
    match fs::read(proc_root.join(pid.to_string()).join("cmdline")) {
        Ok(buf) => {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..end]).to_string();
            let cmdline = String::from_utf8_lossy(&buf)
                .replace('\0', " ")
                .trim_end()
                .to_string();
            (name, cmdline)
        }
        Err(_) => ("(unknown)".to_string(), String::new()),
    }
}

/// Split one received datagram into netlink messages and apply the
/// NLMSG_DONE ones to the state.
fn handle_datagram(state: &mut ConnectorState, buf: &[u8], proc_root: &Path) {
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let len = match read_u32(buf, offset) {
            Some(len) => len as usize,
            None => return,
        };
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return;
        }
        if read_u16(buf, offset + 4) == Some(NLMSG_DONE) {
            state.handle_event(&buf[offset + NLMSG_HDRLEN..offset + len], proc_root);
        }
        // Netlink messages are 4-byte aligned.
        offset += (len + 3) & !3;
    }
}

/// Maintains the process set from proc-connector FORK/EXEC/EXIT events,
/// seeded with an initial /proc scan. Setup failure degrades to a
/// non-running connector exposing an empty set.
pub struct ProcessConnector {
    running: bool,
    proc_root: PathBuf,
    state: Arc<RwLock<ConnectorState>>,
    sock_fd: i32,
    stopping: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessConnector {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        let proc_root = proc_root.into();
        let state = Arc::new(RwLock::new(ConnectorState::default()));

        let stopping = Arc::new(AtomicBool::new(false));
        let sock_fd = match open_and_subscribe() {
            Ok(fd) => fd,
            Err(e) => {
                error!("proc connector disabled: {}", e);
                return Self {
                    running: false,
                    proc_root,
                    state,
                    sock_fd: -1,
                    stopping,
                    reader: None,
                };
            }
        };

        // Seed the set before consuming updates.
        {
            let mut state = state.write().expect("proc connector lock poisoned");
            if let Ok(entries) = fs::read_dir(&proc_root) {
                for entry in entries.flatten() {
                    if let Some(pid) = entry
                        .file_name()
                        .to_str()
                        .and_then(|s| s.parse::<i32>().ok())
                    {
                        state.insert(pid, &proc_root);
                    }
                }
            }
            info!(
                "proc connector initialized ({} processes)",
                state.active_pids.len()
            );
        }

        let reader_state = Arc::clone(&state);
        let reader_root = proc_root.clone();
        let reader_stopping = Arc::clone(&stopping);
        let reader =
            thread::spawn(move || receive_loop(sock_fd, reader_state, reader_root, reader_stopping));

        Self {
            running: true,
            proc_root,
            state,
            sock_fd,
            stopping,
            reader: Some(reader),
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    #[allow(dead_code)]
    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    /// Visit every active process plus those that exited since the last
    /// walk, draining the latter.
    pub fn walk(&self, mut f: impl FnMut(&Process)) {
        self.state
            .write()
            .expect("proc connector lock poisoned")
            .walk(&mut f);
    }

    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            // The receive timeout bounds how long the reader stays blocked.
            let _ = reader.join();
        }
        if self.sock_fd >= 0 {
            unsafe { libc::close(self.sock_fd) };
            self.sock_fd = -1;
        }
        self.running = false;
    }
}

impl Drop for ProcessConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open an AF_NETLINK/NETLINK_CONNECTOR socket bound to CN_IDX_PROC and send
/// the PROC_CN_MCAST_LISTEN subscription.
fn open_and_subscribe() -> Result<i32> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM,
            libc::NETLINK_CONNECTOR,
        )
    };
    if fd < 0 {
        return Err(anyhow!("socket: {}", io::Error::last_os_error()));
    }

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_pid = std::process::id();
    addr.nl_groups = CN_IDX_PROC;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(anyhow!("bind: {}", err));
    }

    // A receive timeout keeps the reader responsive to stop().
    let timeout = libc::timeval {
        tv_sec: 1,
        tv_usec: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(anyhow!("setsockopt(SO_RCVTIMEO): {}", err));
    }

    if let Err(e) = send_listen(fd) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// nlmsghdr + cn_msg + u32 PROC_CN_MCAST_LISTEN, host byte order throughout.
fn send_listen(fd: i32) -> Result<()> {
    let total = NLMSG_HDRLEN + CN_MSG_LEN + 4;
    let mut msg = Vec::with_capacity(total);

    // struct nlmsghdr
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
    msg.extend_from_slice(&1u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&std::process::id().to_ne_bytes());

    // struct cn_msg
    msg.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    msg.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // ack
    msg.extend_from_slice(&4u16.to_ne_bytes()); // len
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags

    msg.extend_from_slice(&PROC_CN_MCAST_LISTEN.to_ne_bytes());

    let mut dest: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    dest.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    dest.nl_groups = CN_IDX_PROC;

    let sent = unsafe {
        libc::sendto(
            fd,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
            0,
            &dest as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(anyhow!("sendto: {}", io::Error::last_os_error()));
    }
    Ok(())
}

fn receive_loop(
    fd: i32,
    state: Arc<RwLock<ConnectorState>>,
    proc_root: PathBuf,
    stopping: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 4096];
    while !stopping.load(Ordering::SeqCst) {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n <= 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) {
                continue;
            }
            debug!("proc connector: recv ended: {}", err);
            return;
        }
        let mut state = state.write().expect("proc connector lock poisoned");
        handle_datagram(&mut state, &buf[..n as usize], &proc_root);
    }
}
