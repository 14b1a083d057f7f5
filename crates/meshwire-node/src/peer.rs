//! Remote peer state held by the topology.

use crate::path::Path;
use meshwire_crypto::{Identity, SymmetricKey};
use meshwire_proto::{Address, Verb};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Version advertised by a peer's HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteVersion {
    pub protocol: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

/// A known remote node: its identity, the derived long-term pairwise key, and
/// liveness bookkeeping.
pub struct Peer {
    identity: Identity,
    key: SymmetricKey,
    last_received: AtomicI64,
    remote_version: RwLock<Option<RemoteVersion>>,
    preferred_path: RwLock<Option<Arc<Path>>>,
}

impl Peer {
    pub fn new(identity: Identity, key: SymmetricKey) -> Self {
        Peer {
            identity,
            key,
            last_received: AtomicI64::new(0),
            remote_version: RwLock::new(None),
            preferred_path: RwLock::new(None),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Record receipt of an authenticated packet. A direct (zero-hop) path
    /// becomes the preferred reply path.
    pub fn received(&self, path: &Arc<Path>, hops: u8, _packet_id: u64, _verb: Verb, now: i64) {
        self.last_received.store(now, Ordering::Relaxed);
        if hops == 0 {
            *self.preferred_path.write() = Some(Arc::clone(path));
        }
    }

    pub fn last_received(&self) -> i64 {
        self.last_received.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> Option<Arc<Path>> {
        self.preferred_path.read().clone()
    }

    pub fn set_remote_version(&self, version: RemoteVersion) {
        *self.remote_version.write() = Some(version);
    }

    pub fn remote_version(&self) -> Option<RemoteVersion> {
        *self.remote_version.read()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("address", &self.address())
            .field("last_received", &self.last_received())
            .finish()
    }
}
