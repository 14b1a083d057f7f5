//! Runtime environment: the bundle of collaborators the dispatcher works
//! against, plus default implementations for the optional ones.

use crate::path::Path;
use crate::topology::Topology;
use crate::tracer::{LogTracer, Tracer};
use dashmap::DashMap;
use meshwire_crypto::Identity;
use meshwire_proto::{Address, BufPool, Dictionary};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clock and admission decisions owned by the embedding node.
pub trait NodeEnv: Send + Sync {
    /// Milliseconds since the UNIX epoch.
    fn now(&self) -> i64;

    /// Gate for the expensive identity validation performed on first
    /// contact. Returning false drops the HELLO.
    fn rate_gate_identity_verification(&self, now: i64, from: SocketAddr) -> bool;
}

/// Learns our external surface address from zero-hop HELLOs.
pub trait SelfAwareness: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn iam(
        &self,
        reporter: &Identity,
        local_socket: i64,
        reporter_addr: SocketAddr,
        surface_addr: SocketAddr,
        reporter_is_trusted: bool,
        now: i64,
    );
}

/// Forwarding hook for packets not addressed to this node. Forwarding policy
/// belongs to the peer-forwarding subsystem; the default does nothing.
pub trait Relay: Send + Sync {
    fn relay(&self, path: &Arc<Path>, destination: Address, data: &[u8], now: i64);
}

/// The virtual Ethernet layer. VL1 hands fully assembled packets to these
/// hooks; their semantics are out of scope here.
pub trait Vl2: Send + Sync {
    fn frame(&self, path: &Arc<Path>, peer: &Arc<crate::peer::Peer>, packet: &[u8], authenticated: bool);
    fn ext_frame(&self, path: &Arc<Path>, peer: &Arc<crate::peer::Peer>, packet: &[u8], authenticated: bool);
    fn multicast_like(&self, path: &Arc<Path>, peer: &Arc<crate::peer::Peer>, packet: &[u8], authenticated: bool);
    fn multicast_gather(&self, path: &Arc<Path>, peer: &Arc<crate::peer::Peer>, packet: &[u8], authenticated: bool);
    fn multicast(&self, path: &Arc<Path>, peer: &Arc<crate::peer::Peer>, packet: &[u8], authenticated: bool);
    fn network_credentials(&self, path: &Arc<Path>, peer: &Arc<crate::peer::Peer>, packet: &[u8], authenticated: bool);
    fn network_config_request(&self, path: &Arc<Path>, peer: &Arc<crate::peer::Peer>, packet: &[u8], authenticated: bool);
    fn network_config(&self, path: &Arc<Path>, peer: &Arc<crate::peer::Peer>, packet: &[u8], authenticated: bool);
}

/// No-op self-awareness for nodes that do not track their surface.
#[derive(Debug, Default)]
pub struct NullSelfAwareness;

impl SelfAwareness for NullSelfAwareness {
    fn iam(
        &self,
        _reporter: &Identity,
        _local_socket: i64,
        _reporter_addr: SocketAddr,
        _surface_addr: SocketAddr,
        _reporter_is_trusted: bool,
        _now: i64,
    ) {
    }
}

/// Relay that drops everything (leaf-node behavior).
#[derive(Debug, Default)]
pub struct NullRelay;

impl Relay for NullRelay {
    fn relay(&self, _path: &Arc<Path>, _destination: Address, _data: &[u8], _now: i64) {}
}

/// VL2 layer that ignores all traffic.
#[derive(Debug, Default)]
pub struct NullVl2;

macro_rules! null_vl2_hook {
    ($name:ident) => {
        fn $name(
            &self,
            _path: &Arc<Path>,
            _peer: &Arc<crate::peer::Peer>,
            _packet: &[u8],
            _authenticated: bool,
        ) {
        }
    };
}

impl Vl2 for NullVl2 {
    null_vl2_hook!(frame);
    null_vl2_hook!(ext_frame);
    null_vl2_hook!(multicast_like);
    null_vl2_hook!(multicast_gather);
    null_vl2_hook!(multicast);
    null_vl2_hook!(network_credentials);
    null_vl2_hook!(network_config_request);
    null_vl2_hook!(network_config);
}

/// Sliding-window limiter for first-contact identity validation, keyed by
/// source IP.
pub struct IdentityRateGate {
    limit: usize,
    window_ms: i64,
    buckets: DashMap<IpAddr, VecDeque<i64>>,
}

impl IdentityRateGate {
    pub fn new(limit: usize, window_ms: i64) -> Self {
        IdentityRateGate {
            limit,
            window_ms,
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, now: i64, from: SocketAddr) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut bucket = self.buckets.entry(from.ip()).or_default();
        while let Some(&front) = bucket.front() {
            if now - front > self.window_ms {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() >= self.limit {
            return false;
        }
        bucket.push_back(now);
        true
    }
}

impl Default for IdentityRateGate {
    fn default() -> Self {
        // A handful of untrusted identity validations per address per
        // second is plenty for bootstrap and harmless under flood.
        IdentityRateGate::new(4, 1000)
    }
}

/// Wall-clock [`NodeEnv`] with the default rate gate.
#[derive(Default)]
pub struct SystemNodeEnv {
    gate: IdentityRateGate,
}

impl SystemNodeEnv {
    pub fn new(gate: IdentityRateGate) -> Self {
        SystemNodeEnv { gate }
    }
}

impl NodeEnv for SystemNodeEnv {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }

    fn rate_gate_identity_verification(&self, now: i64, from: SocketAddr) -> bool {
        self.gate.check(now, from)
    }
}

/// Everything the ingress pipeline needs to run.
pub struct RuntimeEnv {
    /// Our identity, including the private key.
    pub identity: Identity,
    pub topology: Arc<dyn Topology>,
    pub node: Arc<dyn NodeEnv>,
    pub self_awareness: Arc<dyn SelfAwareness>,
    pub tracer: Arc<dyn Tracer>,
    pub vl2: Arc<dyn Vl2>,
    pub relay: Arc<dyn Relay>,
    pub pool: BufPool,
    /// Metadata advertised in our OK(HELLO) replies.
    pub node_metadata: Dictionary,
}

impl RuntimeEnv {
    /// Environment with default collaborators for everything optional.
    pub fn new(identity: Identity, topology: Arc<dyn Topology>) -> Self {
        RuntimeEnv {
            identity,
            topology,
            node: Arc::new(SystemNodeEnv::default()),
            self_awareness: Arc::new(NullSelfAwareness),
            tracer: Arc::new(LogTracer),
            vl2: Arc::new(NullVl2),
            relay: Arc::new(NullRelay),
            pool: BufPool::new(128),
            node_metadata: Dictionary::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_gate_limits_per_window() {
        let gate = IdentityRateGate::new(2, 1000);
        let from: SocketAddr = "192.0.2.1:9993".parse().expect("addr");
        assert!(gate.check(0, from));
        assert!(gate.check(10, from));
        assert!(!gate.check(20, from));
        // Other addresses are unaffected.
        let other: SocketAddr = "192.0.2.2:9993".parse().expect("addr");
        assert!(gate.check(20, other));
        // The window slides.
        assert!(gate.check(1011, from));
    }
}
