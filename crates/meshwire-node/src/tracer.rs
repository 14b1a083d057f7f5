//! Observability hooks.
//!
//! Every dropped packet produces exactly one trace event carrying a closed
//! drop reason plus a stable 32-bit code identifying the call site, so field
//! reports can be matched to code without symbolication. Producing an event
//! never blocks the packet path.

use meshwire_crypto::Identity;
use meshwire_proto::Verb;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;

/// Closed taxonomy of packet drop causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MalformedPacket,
    MacFailed,
    NotTrustedPath,
    InvalidObject,
    InvalidCompressedData,
    PeerTooOld,
    RateLimitExceeded,
    UnrecognizedVerb,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DropReason::MalformedPacket => "malformed packet",
            DropReason::MacFailed => "MAC check failed",
            DropReason::NotTrustedPath => "path is not trusted",
            DropReason::InvalidObject => "invalid embedded object",
            DropReason::InvalidCompressedData => "invalid compressed data",
            DropReason::PeerTooOld => "peer protocol too old",
            DropReason::RateLimitExceeded => "rate limit exceeded",
            DropReason::UnrecognizedVerb => "unrecognized verb",
        };
        f.write_str(name)
    }
}

/// Sink for packet-path diagnostics. Implementations must be cheap and
/// thread-safe; they are called from every I/O worker.
pub trait Tracer: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn incoming_packet_dropped(
        &self,
        code: u32,
        packet_id: u64,
        network_id: u64,
        identity: Option<&Identity>,
        path_addr: Option<SocketAddr>,
        hops: u8,
        verb: Verb,
        reason: DropReason,
    );

    fn unexpected_error(&self, code: u32, message: &str);
}

/// Forwards trace events to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn incoming_packet_dropped(
        &self,
        code: u32,
        packet_id: u64,
        network_id: u64,
        identity: Option<&Identity>,
        path_addr: Option<SocketAddr>,
        hops: u8,
        verb: Verb,
        reason: DropReason,
    ) {
        tracing::debug!(
            target: "meshwire::vl1",
            code = format_args!("{code:08x}"),
            packet_id,
            network_id,
            peer = %identity.map(|id| id.address().to_string()).unwrap_or_default(),
            path = %path_addr.map(|a| a.to_string()).unwrap_or_default(),
            hops,
            verb = %verb,
            "dropped packet: {reason}"
        );
    }

    fn unexpected_error(&self, code: u32, message: &str) {
        tracing::warn!(
            target: "meshwire::vl1",
            code = format_args!("{code:08x}"),
            "unexpected error: {message}"
        );
    }
}

/// A single recorded drop event.
#[derive(Debug, Clone)]
pub struct DropRecord {
    pub code: u32,
    pub packet_id: u64,
    pub peer: Option<meshwire_proto::Address>,
    pub path_addr: Option<SocketAddr>,
    pub hops: u8,
    pub verb: Verb,
    pub reason: DropReason,
}

/// Tracer retaining events in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    drops: Mutex<Vec<DropRecord>>,
    errors: Mutex<Vec<(u32, String)>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drops(&self) -> Vec<DropRecord> {
        self.drops.lock().clone()
    }

    pub fn errors(&self) -> Vec<(u32, String)> {
        self.errors.lock().clone()
    }

    pub fn drop_count(&self) -> usize {
        self.drops.lock().len()
    }
}

impl Tracer for RecordingTracer {
    fn incoming_packet_dropped(
        &self,
        code: u32,
        packet_id: u64,
        _network_id: u64,
        identity: Option<&Identity>,
        path_addr: Option<SocketAddr>,
        hops: u8,
        verb: Verb,
        reason: DropReason,
    ) {
        self.drops.lock().push(DropRecord {
            code,
            packet_id,
            peer: identity.map(Identity::address),
            path_addr,
            hops,
            verb,
            reason,
        });
    }

    fn unexpected_error(&self, code: u32, message: &str) {
        self.errors.lock().push((code, message.to_string()));
    }
}
