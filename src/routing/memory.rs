//! In-memory router for single-node and test deployments.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::routing::{Balancer, RoundRobin, Router};
use crate::Result;

/// Router backed by a process-local map from key to peer addresses.
///
/// Readers observe a consistent snapshot of each key's list; within a key
/// the addresses are unique and keep first-insertion order.
pub struct MemoryRouter {
    resolver: RwLock<HashMap<String, Vec<SocketAddr>>>,
    self_addr: SocketAddr,
}

impl MemoryRouter {
    pub fn new(resolver: HashMap<String, Vec<SocketAddr>>, self_addr: SocketAddr) -> Self {
        Self {
            resolver: RwLock::new(resolver),
            self_addr,
        }
    }

    /// Record that `addr` holds the content addressed by `key`.
    pub fn add(&self, key: &str, addr: SocketAddr) {
        let mut resolver = self.resolver.write().expect("router lock poisoned");
        let peers = resolver.entry(key.to_owned()).or_default();
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }

    /// Snapshot of the peer list for `key`.
    pub fn get(&self, key: &str) -> Option<Vec<SocketAddr>> {
        self.resolver
            .read()
            .expect("router lock poisoned")
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl Router for MemoryRouter {
    async fn ready(&self) -> Result<bool> {
        Ok(!self.resolver.read().expect("router lock poisoned").is_empty())
    }

    async fn lookup(&self, key: &str, count: usize) -> Result<Box<dyn Balancer>> {
        let resolver = self.resolver.read().expect("router lock poisoned");
        let peers = resolver.get(key).into_iter().flatten();
        Ok(Box::new(RoundRobin::from_peers(
            peers.take(count).copied(),
        )))
    }

    async fn advertise(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.add(key, self.self_addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn router() -> MemoryRouter {
        MemoryRouter::new(HashMap::new(), addr(5000))
    }

    #[tokio::test]
    async fn test_ready() {
        let r = router();
        assert!(!r.ready().await.unwrap());
        r.add("key", addr(1));
        assert!(r.ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_advertise_adds_self() {
        let r = router();
        r.advertise(&["a".to_owned(), "b".to_owned()]).await.unwrap();
        assert_eq!(r.get("a").unwrap(), vec![addr(5000)]);
        assert_eq!(r.get("b").unwrap(), vec![addr(5000)]);
        // Re-advertising is idempotent.
        r.advertise(&["a".to_owned()]).await.unwrap();
        assert_eq!(r.get("a").unwrap(), vec![addr(5000)]);
    }

    #[tokio::test]
    async fn test_add_keeps_insertion_order() {
        let r = router();
        r.add("key", addr(3));
        r.add("key", addr(1));
        r.add("key", addr(2));
        r.add("key", addr(1));
        assert_eq!(r.get("key").unwrap(), vec![addr(3), addr(1), addr(2)]);
    }

    #[tokio::test]
    async fn test_lookup() {
        let r = router();
        let mut balancer = r.lookup("missing", 3).await.unwrap();
        assert!(balancer.next().is_none());

        for port in 1..=5 {
            r.add("key", addr(port));
        }
        let mut balancer = r.lookup("key", 3).await.unwrap();
        assert_eq!(balancer.len(), 3);
        assert_eq!(balancer.next(), Some(addr(1)));
        assert_eq!(balancer.next(), Some(addr(2)));
        assert_eq!(balancer.next(), Some(addr(3)));
        assert_eq!(balancer.next(), Some(addr(1)));
    }
}
