// tracker/four_tuple.rs - Direction-aware TCP four-tuple value type

use std::fmt;
use std::net::Ipv4Addr;

/// The two (addr, port) endpoints of a TCP connection, oriented from → to.
/// Identity deliberately excludes liveness; whether a connection is still
/// alive travels separately alongside the tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub from_addr: Ipv4Addr,
    pub to_addr: Ipv4Addr,
    pub from_port: u16,
    pub to_port: u16,
}

impl FourTuple {
    pub fn new(from_addr: Ipv4Addr, to_addr: Ipv4Addr, from_port: u16, to_port: u16) -> Self {
        Self {
            from_addr,
            to_addr,
            from_port,
            to_port,
        }
    }

    /// Orientation-independent identifier: the two `addr:port` halves joined
    /// in lexicographic order. Used to look a tuple up when its direction is
    /// unknown.
    pub fn key(&self) -> String {
        let mut halves = [
            format!("{}:{}", self.from_addr, self.from_port),
            format!("{}:{}", self.to_addr, self.to_port),
        ];
        halves.sort();
        halves.join(" ")
    }

    /// Flip the direction of the tuple in place.
    pub fn reverse(&mut self) {
        std::mem::swap(&mut self.from_addr, &mut self.to_addr);
        std::mem::swap(&mut self.from_port, &mut self.to_port);
    }

    /// A copy of the tuple with the direction flipped.
    pub fn reversed(&self) -> Self {
        let mut t = *self;
        t.reverse();
        t
    }
}

impl fmt::Display for FourTuple {
    /// Oriented form `from:fp-to:tp`; the open-connection map key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.from_addr, self.from_port, self.to_addr, self.to_port
        )
    }
}
