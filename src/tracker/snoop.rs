// tracker/snoop.rs - Seam for externally snooped DNS names

use std::net::Ipv4Addr;

/// Read-only source of DNS names observed on the wire for an address.
/// Snooping itself lives outside this core; endpoint nodes merely attach
/// whatever the snooper has cached.
pub trait DnsSnooper: Send + Sync {
    fn cached_names_for_ip(&self, addr: Ipv4Addr) -> Vec<String>;
}
