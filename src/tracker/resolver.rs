// tracker/resolver.rs - Background reverse-DNS resolution with a shared cache

use crossbeam::channel::{self, Sender, TrySendError};
use dashmap::DashMap;
use dns_lookup::lookup_addr;
use log::debug;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const QUEUE_DEPTH: usize = 64;

/// Resolves addresses to names off the reporting path. `get` never blocks:
/// a cache miss enqueues the address and reports nothing this tick; a later
/// tick picks the answer up. Failed lookups are cached as empty so the same
/// dead address is not retried every tick.
pub struct ReverseResolver {
    cache: Arc<DashMap<Ipv4Addr, Vec<String>>>,
    queue: Option<Sender<Ipv4Addr>>,
    worker: Option<JoinHandle<()>>,
}

impl ReverseResolver {
    pub fn new() -> Self {
        let cache: Arc<DashMap<Ipv4Addr, Vec<String>>> = Arc::new(DashMap::new());
        let (tx, rx) = channel::bounded::<Ipv4Addr>(QUEUE_DEPTH);

        let worker_cache = Arc::clone(&cache);
        let worker = thread::spawn(move || {
            for addr in rx.iter() {
                if worker_cache.contains_key(&addr) {
                    continue;
                }
                let names = match lookup_addr(&IpAddr::V4(addr)) {
                    Ok(name) => vec![name],
                    Err(e) => {
                        debug!("reverse resolver: {}: {}", addr, e);
                        Vec::new()
                    }
                };
                worker_cache.insert(addr, names);
            }
        });

        Self {
            cache,
            queue: Some(tx),
            worker: Some(worker),
        }
    }

    /// Names already resolved for `addr`, if any. A miss schedules a
    /// background lookup; when the queue is full the address is dropped and
    /// retried on a later tick.
    pub fn get(&self, addr: Ipv4Addr) -> Option<Vec<String>> {
        if let Some(names) = self.cache.get(&addr) {
            if names.is_empty() {
                return None;
            }
            return Some(names.clone());
        }

        if let Some(queue) = &self.queue {
            match queue.try_send(addr) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("reverse resolver: queue full, dropping {}", addr),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        None
    }

    pub fn stop(&mut self) {
        // Dropping the sender ends the worker's receive loop.
        self.queue = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for ReverseResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReverseResolver {
    fn drop(&mut self) {
        self.stop();
    }
}
