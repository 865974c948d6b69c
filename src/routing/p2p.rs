//! Distributed peer index backed by a Kademlia DHT.
//!
//! Keys are advertised as provider records; the index offers no removal,
//! records lapse when their TTL expires. The swarm runs on a background
//! task owned by a command channel, so router calls never touch libp2p
//! state directly.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use futures::stream::StreamExt;
use libp2p::{
    identify, kad,
    multiaddr::Protocol,
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    Multiaddr, PeerId,
};
use sha2::{Digest as _, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::routing::{Balancer, RoundRobin, Router, KEY_TTL};
use crate::Error;
use crate::Result as MeshResult;

/// Combined behaviour for the peer index
#[derive(NetworkBehaviour)]
struct MirrorBehaviour {
    kademlia: kad::Behaviour<kad::store::MemoryStore>,
    identify: identify::Behaviour,
}

impl MirrorBehaviour {
    fn new(keypair: &libp2p::identity::Keypair) -> Self {
        let local_peer_id = PeerId::from(keypair.public());

        let mut kad_config = kad::Config::default();
        kad_config.set_query_timeout(std::time::Duration::from_secs(60));
        kad_config.set_provider_record_ttl(Some(KEY_TTL));
        let store = kad::store::MemoryStore::new(local_peer_id);
        let kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);

        let identify = identify::Behaviour::new(identify::Config::new(
            "/mirrormesh/1.0.0".to_string(),
            keypair.public(),
        ));

        Self { kademlia, identify }
    }
}

/// Router command for async operations
#[derive(Debug)]
enum RouterCommand {
    Advertise {
        keys: Vec<String>,
        response: oneshot::Sender<MeshResult<()>>,
    },
    Lookup {
        key: String,
        count: usize,
        response: oneshot::Sender<Vec<SocketAddr>>,
    },
    Ready {
        response: oneshot::Sender<bool>,
    },
}

/// One in-flight provider query.
struct PendingLookup {
    count: usize,
    response: oneshot::Sender<Vec<SocketAddr>>,
}

/// State owned by the swarm task.
struct SwarmTask {
    swarm: Swarm<MirrorBehaviour>,
    registry_port: u16,
    // Last known IP per peer, learned from identify exchanges.
    peer_ips: HashMap<PeerId, IpAddr>,
    pending_lookups: HashMap<kad::QueryId, PendingLookup>,
}

/// Map a peer key onto a Kademlia record key.
fn record_key(key: &str) -> kad::RecordKey {
    kad::RecordKey::new(&Sha256::digest(key.as_bytes()))
}

/// Extract an IP from a multiaddr, if it carries one.
fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

/// Peer index router over a libp2p Kademlia swarm.
///
/// Every node in the fleet serves its registry on the same port, so a
/// provider resolves to `<peer ip>:<registry port>`.
pub struct P2pRouter {
    command_tx: mpsc::UnboundedSender<RouterCommand>,
    _task: tokio::task::JoinHandle<()>,
}

impl P2pRouter {
    pub async fn new(p2p_port: u16, registry_port: u16, bootstrap: Vec<Multiaddr>) -> MeshResult<Self> {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();

        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default().nodelay(true),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|e| Error::routing(e.to_string()))?
            .with_behaviour(|key| MirrorBehaviour::new(key))
            .map_err(|e| Error::routing(e.to_string()))?
            .build();

        swarm
            .behaviour_mut()
            .kademlia
            .set_mode(Some(kad::Mode::Server));

        let local_peer_id = *swarm.local_peer_id();
        tracing::info!("starting peer index with peer ID: {local_peer_id}");

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{p2p_port}").parse()?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| Error::routing(e.to_string()))?;

        // Seed the routing table with the bootstrap peers and dial them.
        // Addresses must carry the peer id: /ip4/../tcp/../p2p/<peer-id>.
        let mut bootstrapped = 0;
        for addr in bootstrap {
            let Some(peer_id) = addr.iter().find_map(|proto| match proto {
                Protocol::P2p(peer_id) => Some(peer_id),
                _ => None,
            }) else {
                tracing::warn!("bootstrap address {addr} does not contain a peer ID, skipping");
                continue;
            };
            let mut addr_without_p2p = addr.clone();
            addr_without_p2p.pop();
            swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr_without_p2p);
            if let Err(err) = swarm.dial(addr.clone()) {
                tracing::warn!("failed to dial bootstrap peer {addr}: {err}");
            } else {
                bootstrapped += 1;
            }
        }
        if bootstrapped > 0 {
            if let Err(err) = swarm.behaviour_mut().kademlia.bootstrap() {
                tracing::warn!("bootstrap failed: {err}");
            }
        }

        let mut task = SwarmTask {
            swarm,
            registry_port,
            peer_ips: HashMap::new(),
            pending_lookups: HashMap::new(),
        };
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = task.swarm.select_next_some() => {
                        task.handle_swarm_event(event);
                    }
                    command = command_rx.recv() => {
                        let Some(command) = command else { break };
                        task.handle_command(command);
                    }
                }
            }
        });

        Ok(Self {
            command_tx,
            _task: handle,
        })
    }
}

impl SwarmTask {
    fn handle_swarm_event(&mut self, event: SwarmEvent<MirrorBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(MirrorBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                if let Some(ip) = info.listen_addrs.iter().find_map(multiaddr_ip) {
                    self.peer_ips.insert(peer_id, ip);
                }
            }
            SwarmEvent::Behaviour(MirrorBehaviourEvent::Kademlia(
                kad::Event::OutboundQueryProgressed { id, result, .. },
            )) => match result {
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    self.finish_lookup(id, providers.into_iter().collect());
                }
                kad::QueryResult::GetProviders(Ok(
                    kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    self.finish_lookup(id, Vec::new());
                }
                kad::QueryResult::GetProviders(Err(err)) => {
                    tracing::debug!("get providers failed: {err}");
                    self.finish_lookup(id, Vec::new());
                }
                _ => {}
            },
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                tracing::debug!("connected to peer: {peer_id}");
                if let Some(ip) = multiaddr_ip(endpoint.get_remote_address()) {
                    self.peer_ips.entry(peer_id).or_insert(ip);
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                tracing::debug!("disconnected from peer: {peer_id}");
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("peer index listening on: {address}");
            }
            _ => {}
        }
    }

    fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Advertise { keys, response } => {
                let mut errs = Vec::new();
                for key in keys {
                    if let Err(err) = self
                        .swarm
                        .behaviour_mut()
                        .kademlia
                        .start_providing(record_key(&key))
                    {
                        errs.push(Error::routing(format!(
                            "could not provide key {key}: {err}"
                        )));
                    }
                }
                let _ = response.send(Error::join(errs));
            }
            RouterCommand::Lookup {
                key,
                count,
                response,
            } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(record_key(&key));
                self.pending_lookups
                    .insert(query_id, PendingLookup { count, response });
            }
            RouterCommand::Ready { response } => {
                let has_peers = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .kbuckets()
                    .next()
                    .is_some();
                let _ = response.send(has_peers);
            }
        }
    }

    /// Answer a pending lookup with the providers resolved to registry
    /// addresses. Providers without a known IP, and this node itself, are
    /// dropped.
    fn finish_lookup(&mut self, id: kad::QueryId, providers: Vec<PeerId>) {
        let Some(pending) = self.pending_lookups.remove(&id) else {
            return;
        };
        let local_peer_id = *self.swarm.local_peer_id();
        let addrs: Vec<SocketAddr> = providers
            .into_iter()
            .filter(|peer| *peer != local_peer_id)
            .filter_map(|peer| self.peer_ips.get(&peer).copied())
            .map(|ip| SocketAddr::new(ip, self.registry_port))
            .take(pending.count)
            .collect();
        let _ = pending.response.send(addrs);
    }
}

#[async_trait::async_trait]
impl Router for P2pRouter {
    async fn ready(&self) -> MeshResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RouterCommand::Ready { response: tx })
            .map_err(|e| Error::routing(e.to_string()))?;
        Ok(rx.await?)
    }

    async fn lookup(&self, key: &str, count: usize) -> MeshResult<Box<dyn Balancer>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RouterCommand::Lookup {
                key: key.to_owned(),
                count,
                response: tx,
            })
            .map_err(|e| Error::routing(e.to_string()))?;
        let addrs = rx.await?;
        Ok(Box::new(RoundRobin::from_peers(addrs)))
    }

    async fn advertise(&self, keys: &[String]) -> MeshResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RouterCommand::Advertise {
                keys: keys.to_vec(),
                response: tx,
            })
            .map_err(|e| Error::routing(e.to_string()))?;
        rx.await?
    }
}
