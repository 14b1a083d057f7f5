//! Peer and path lookup.
//!
//! The topology store itself (persistence, path scoring) is a collaborator;
//! the core consumes it through the [`Topology`] trait. [`InMemoryTopology`]
//! is a complete single-process implementation suitable for tests and
//! embedders that keep peer state elsewhere.

use crate::path::{DatagramSink, Path};
use crate::peer::Peer;
use dashmap::DashMap;
use meshwire_crypto::Identity;
use meshwire_proto::Address;
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub trait Topology: Send + Sync {
    /// Look up or create the path object for `(local_socket, from)`.
    fn path(&self, local_socket: i64, from: SocketAddr) -> Arc<Path>;

    fn peer(&self, address: Address) -> Option<Arc<Peer>>;

    /// Insert a peer, returning the canonical instance (the existing one if
    /// the address was already present).
    fn add_peer(&self, peer: Arc<Peer>) -> Arc<Peer>;

    /// The designated root peer used for identity lookups.
    fn root(&self) -> Option<Arc<Peer>>;

    fn is_root(&self, identity: &Identity) -> bool;

    /// Whether a cipher-`NONE` packet from `from` carrying `trusted_path_id`
    /// may be accepted without cryptographic authentication.
    fn should_inbound_path_be_trusted(&self, from: SocketAddr, trusted_path_id: u64) -> bool;
}

/// In-memory topology backed by concurrent maps.
pub struct InMemoryTopology {
    paths: DashMap<(i64, SocketAddr), Arc<Path>>,
    peers: DashMap<Address, Arc<Peer>>,
    root: RwLock<Option<Arc<Peer>>>,
    trusted_paths: RwLock<Vec<(u64, IpAddr)>>,
    sink: Arc<dyn DatagramSink>,
}

impl InMemoryTopology {
    pub fn new(sink: Arc<dyn DatagramSink>) -> Self {
        InMemoryTopology {
            paths: DashMap::new(),
            peers: DashMap::new(),
            root: RwLock::new(None),
            trusted_paths: RwLock::new(Vec::new()),
            sink,
        }
    }

    /// Install `peer` as the root (adding it to the peer set as well).
    pub fn set_root(&self, peer: Arc<Peer>) {
        self.add_peer(Arc::clone(&peer));
        *self.root.write() = Some(peer);
    }

    /// Administratively trust cipher-`NONE` traffic from `ip` under `id`.
    pub fn trust_path(&self, id: u64, ip: IpAddr) {
        self.trusted_paths.write().push((id, ip));
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl Topology for InMemoryTopology {
    fn path(&self, local_socket: i64, from: SocketAddr) -> Arc<Path> {
        self.paths
            .entry((local_socket, from))
            .or_insert_with(|| Arc::new(Path::new(local_socket, from, Arc::clone(&self.sink))))
            .clone()
    }

    fn peer(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.get(&address).map(|p| Arc::clone(&p))
    }

    fn add_peer(&self, peer: Arc<Peer>) -> Arc<Peer> {
        self.peers
            .entry(peer.address())
            .or_insert(peer)
            .clone()
    }

    fn root(&self) -> Option<Arc<Peer>> {
        self.root.read().clone()
    }

    fn is_root(&self, identity: &Identity) -> bool {
        self.root
            .read()
            .as_ref()
            .is_some_and(|root| root.identity() == identity)
    }

    fn should_inbound_path_be_trusted(&self, from: SocketAddr, trusted_path_id: u64) -> bool {
        self.trusted_paths
            .read()
            .iter()
            .any(|&(id, ip)| id == trusted_path_id && ip == from.ip())
    }
}
