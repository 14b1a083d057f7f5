//! The Meshwire VL1 ingress pipeline.
//!
//! This crate turns raw datagrams into authenticated, decompressed,
//! verb-dispatched messages from known peers. The entry point is
//! [`Vl1::on_remote_packet`]; everything the pipeline needs from the
//! embedding node (peer storage, clock, egress, observability, the virtual
//! Ethernet layer) comes in through the collaborator traits bundled in
//! [`RuntimeEnv`].

pub mod armor;
pub mod hello;
pub mod path;
pub mod peer;
pub mod runtime;
pub mod topology;
pub mod tracer;
pub mod vl1;
pub mod whois;

pub use armor::{armor, armor_trusted, dearmor_salsa2012, verify_poly1305_none, ArmorError, CipherSuite};
pub use hello::{build_hello, parse_ok_hello, OkHello, HELLO_FIXED_LENGTH};
pub use path::{DatagramSink, Path};
pub use peer::{Peer, RemoteVersion};
pub use runtime::{
    IdentityRateGate, NodeEnv, NullRelay, NullSelfAwareness, NullVl2, Relay, RuntimeEnv,
    SelfAwareness, SystemNodeEnv, Vl2,
};
pub use topology::{InMemoryTopology, Topology};
pub use tracer::{DropReason, DropRecord, LogTracer, RecordingTracer, Tracer};
pub use vl1::{
    Vl1, ERROR_HEADER_LENGTH, OK_HEADER_LENGTH, PROTOCOL_VERSION, PROTOCOL_VERSION_HMAC_REQUIRED,
    PROTOCOL_VERSION_MIN, VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION,
};
pub use whois::{
    PendingPacket, WhoisQueue, MAX_PENDING_PACKETS_PER_SOURCE, MAX_WHOIS_RETRIES,
    WHOIS_RETRY_DELAY_MS,
};
