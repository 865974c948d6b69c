//! Peer routing: the router seam, balancers and the peer index TTL.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

mod memory;
mod p2p;

pub use memory::MemoryRouter;
pub use p2p::P2pRouter;

/// How long an advertised key stays discoverable without re-advertisement.
/// The advertisement engine resyncs one minute before this lapses.
pub const KEY_TTL: Duration = Duration::from_secs(10 * 60);

/// A consumable ordered sequence of peer addresses.
///
/// Balancers are consumed by a single fetch attempt and are not shared
/// across threads.
pub trait Balancer: Send {
    /// Append an address, ignoring duplicates.
    fn add(&mut self, addr: SocketAddr);

    /// The next address, cycling over the set. `None` iff the balancer is
    /// empty.
    fn next(&mut self) -> Option<SocketAddr>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Round-robin balancer preserving first-insertion order.
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    peers: Vec<SocketAddr>,
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_peers<I: IntoIterator<Item = SocketAddr>>(peers: I) -> Self {
        let mut rr = Self::new();
        for peer in peers {
            rr.add(peer);
        }
        rr
    }
}

impl Balancer for RoundRobin {
    fn add(&mut self, addr: SocketAddr) {
        if !self.peers.contains(&addr) {
            self.peers.push(addr);
        }
    }

    fn next(&mut self) -> Option<SocketAddr> {
        if self.peers.is_empty() {
            return None;
        }
        let addr = self.peers[self.cursor % self.peers.len()];
        self.cursor = (self.cursor + 1) % self.peers.len();
        Some(addr)
    }

    fn len(&self) -> usize {
        self.peers.len()
    }
}

/// Resolution and advertisement against the peer index.
///
/// Implementations are safe for concurrent callers. Advertising is
/// best-effort per key; partial failures aggregate into one joined error.
#[async_trait]
pub trait Router: Send + Sync {
    /// True once the router has at least one routable entry.
    async fn ready(&self) -> Result<bool>;

    /// A balancer over up to `count` peers that recently advertised `key`.
    /// Absence yields an empty balancer, never an error.
    async fn lookup(&self, key: &str, count: usize) -> Result<Box<dyn Balancer>>;

    /// Announce that this node holds `keys`. Idempotent; re-advertising
    /// refreshes the TTL.
    async fn advertise(&self, keys: &[String]) -> Result<()>;
}
