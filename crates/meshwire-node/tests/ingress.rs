//! End-to-end exercises of the ingress pipeline: raw datagrams in, verb
//! handlers and armored replies out, against an in-memory topology and a
//! captured datagram sink.

use meshwire_crypto::{hmac_sha384, kbkdf_hmac_sha384, secure_eq, Identity, SymmetricKey, HMAC_SHA384_LENGTH, KDF_LABEL_HELLO_HMAC};
use meshwire_node::{
    armor, build_hello, dearmor_salsa2012, parse_ok_hello, CipherSuite, DatagramSink, DropReason,
    InMemoryTopology, NodeEnv, Path, Peer, RecordingTracer, RuntimeEnv, SelfAwareness, Topology,
    Vl1, Vl2, MAX_WHOIS_RETRIES, OK_HEADER_LENGTH, PROTOCOL_VERSION, WHOIS_RETRY_DELAY_MS,
};
use meshwire_proto::wire::{IDX_VERB, MAX_INCOMING_FRAGMENTS_PER_PATH};
use meshwire_proto::{
    fragment_packet, write_header, Address, BufPool, Dictionary, Slice, SliceVector, Verb,
    ADDRESS_LENGTH, FRAGMENT_INDICATOR, HEADER_SIZE, PAYLOAD_START, VERB_FLAG_COMPRESSED,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CollectingSink {
    sent: Mutex<Vec<(i64, SocketAddr, Vec<u8>)>>,
}

impl CollectingSink {
    fn sent(&self) -> Vec<(i64, SocketAddr, Vec<u8>)> {
        self.sent.lock().clone()
    }

    fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl DatagramSink for CollectingSink {
    fn send(&self, local_socket: i64, to: SocketAddr, data: &[u8]) -> bool {
        self.sent.lock().push((local_socket, to, data.to_vec()));
        true
    }
}

#[derive(Default)]
struct RecordingVl2 {
    calls: Mutex<Vec<(&'static str, Vec<u8>, bool)>>,
}

impl RecordingVl2 {
    fn calls(&self) -> Vec<(&'static str, Vec<u8>, bool)> {
        self.calls.lock().clone()
    }
}

macro_rules! record_vl2 {
    ($name:ident) => {
        fn $name(&self, _path: &Arc<Path>, _peer: &Arc<Peer>, packet: &[u8], authenticated: bool) {
            self.calls
                .lock()
                .push((stringify!($name), packet.to_vec(), authenticated));
        }
    };
}

impl Vl2 for RecordingVl2 {
    record_vl2!(frame);
    record_vl2!(ext_frame);
    record_vl2!(multicast_like);
    record_vl2!(multicast_gather);
    record_vl2!(multicast);
    record_vl2!(network_credentials);
    record_vl2!(network_config_request);
    record_vl2!(network_config);
}

struct ManualClock {
    now: AtomicI64,
}

impl NodeEnv for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }

    fn rate_gate_identity_verification(&self, _now: i64, _from: SocketAddr) -> bool {
        true
    }
}

#[derive(Default)]
struct RecordingSelfAwareness {
    reports: Mutex<Vec<(Address, SocketAddr, SocketAddr)>>,
}

impl SelfAwareness for RecordingSelfAwareness {
    fn iam(
        &self,
        reporter: &Identity,
        _local_socket: i64,
        reporter_addr: SocketAddr,
        surface_addr: SocketAddr,
        _reporter_is_trusted: bool,
        _now: i64,
    ) {
        self.reports
            .lock()
            .push((reporter.address(), reporter_addr, surface_addr));
    }
}

struct Fixture {
    vl1: Vl1,
    sink: Arc<CollectingSink>,
    topology: Arc<InMemoryTopology>,
    tracer: Arc<RecordingTracer>,
    vl2: Arc<RecordingVl2>,
    clock: Arc<ManualClock>,
    sa: Arc<RecordingSelfAwareness>,
    our: Identity,
}

impl Fixture {
    fn new() -> Fixture {
        let our = Identity::generate();
        let sink = Arc::new(CollectingSink::default());
        let topology = Arc::new(InMemoryTopology::new(sink.clone()));
        let tracer = Arc::new(RecordingTracer::new());
        let vl2 = Arc::new(RecordingVl2::default());
        let clock = Arc::new(ManualClock {
            now: AtomicI64::new(10_000),
        });
        let sa = Arc::new(RecordingSelfAwareness::default());
        let env = RuntimeEnv {
            identity: our.clone(),
            topology: topology.clone(),
            node: clock.clone(),
            self_awareness: sa.clone(),
            tracer: tracer.clone(),
            vl2: vl2.clone(),
            relay: Arc::new(meshwire_node::NullRelay),
            pool: BufPool::new(256),
            node_metadata: Dictionary::new(),
        };
        Fixture {
            vl1: Vl1::new(Arc::new(env)),
            sink,
            topology,
            tracer,
            vl2,
            clock,
            sa,
            our,
        }
    }

    fn now(&self) -> i64 {
        self.clock.now.load(Ordering::Relaxed)
    }

    fn pool(&self) -> &BufPool {
        &self.vl1.env().pool
    }

    fn deliver_from(&self, from: SocketAddr, datagram: &[u8]) {
        let mut buf = self.pool().get().expect("pool buffer for delivery");
        buf.bytes_mut()[..datagram.len()].copy_from_slice(datagram);
        self.vl1.on_remote_packet(1, from, buf, datagram.len());
    }

    /// Generate a remote identity, derive the pairwise key, and register the
    /// peer in the topology.
    fn known_peer(&self) -> (Identity, SymmetricKey, Arc<Peer>) {
        let identity = Identity::generate();
        let key = identity.agree(&self.our.public_only()).expect("agree");
        let peer = self
            .topology
            .add_peer(Arc::new(Peer::new(identity.public_only(), key.clone())));
        (identity, key, peer)
    }

    /// Build an armored whole packet from `source` to us.
    fn armored_packet(
        &self,
        source: Address,
        key: &SymmetricKey,
        verb: Verb,
        payload: &[u8],
        suite: CipherSuite,
    ) -> Vec<u8> {
        let mut pkt = vec![0u8; HEADER_SIZE];
        write_header(
            &mut pkt,
            meshwire_proto::next_packet_id(),
            self.our.address(),
            source,
            0,
            verb,
        )
        .expect("header");
        pkt.extend_from_slice(payload);
        armor(&mut pkt, key, suite).expect("armor");
        pkt
    }

    fn dearmor_reply(&self, wire: &[u8], key: &SymmetricKey) -> Vec<u8> {
        let mut buf = self.pool().get().expect("pool");
        buf.bytes_mut()[..wire.len()].copy_from_slice(wire);
        let mut v = SliceVector::new();
        v.push(Slice::new(buf, 0, wire.len()).expect("slice"))
            .expect("push");
        dearmor_salsa2012(v, self.pool(), key)
            .expect("reply dearmors")
            .data()
            .to_vec()
    }
}

fn addr(s: &str) -> SocketAddr {
    s.parse().expect("socket address")
}

#[test]
fn keepalive_changes_nothing() {
    let fx = Fixture::new();
    fx.deliver_from(addr("203.0.113.5:9993"), &[0x55, 0x01, 0x02]);
    assert_eq!(fx.tracer.drop_count(), 0);
    assert!(fx.tracer.errors().is_empty());
    assert!(fx.sink.sent().is_empty());
    assert!(fx.vl2.calls().is_empty());
    assert_eq!(fx.pool().outstanding(), 0);
}

#[test]
fn unknown_peer_hello_admits_and_replies() {
    let fx = Fixture::new();
    let remote = Identity::generate();
    let key = remote.agree(&fx.our.public_only()).expect("agree");
    let surface = addr("198.51.100.20:41000");
    let mut metadata = Dictionary::new();
    metadata.set("name", b"testnode".to_vec()).expect("set");

    let hello = build_hello(
        &remote,
        fx.our.address(),
        &key,
        Some(&surface),
        &metadata,
        777_001,
    )
    .expect("hello");
    let hello_packet_id = u64::from_be_bytes(hello[..8].try_into().expect("id"));

    fx.deliver_from(addr("198.51.100.7:9993"), &hello);

    // The sender is now a known peer.
    let peer = fx
        .topology
        .peer(remote.address())
        .expect("peer admitted to topology");
    assert_eq!(peer.identity(), &remote.public_only());
    assert_eq!(
        peer.remote_version().expect("version recorded").protocol,
        PROTOCOL_VERSION
    );

    // Our surface address was learned from the zero-hop HELLO.
    let reports = fx.sa.reports.lock().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, remote.address());
    assert_eq!(reports[0].2, surface);

    // Exactly one OK went back, armored under the pairwise key.
    let sent = fx.sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, addr("198.51.100.7:9993"));
    let reply = fx.dearmor_reply(&sent[0].2, &key);
    let ok = parse_ok_hello(&reply).expect("OK(HELLO) parses");
    assert_eq!(ok.in_re_packet_id, hello_packet_id);
    assert_eq!(ok.timestamp_echo, 777_001);
    assert_eq!(ok.protocol, PROTOCOL_VERSION);
    assert_eq!(ok.observed_addr, Some(addr("198.51.100.7:9993")));

    // The reply carries a valid HMAC for the OK direction.
    let boundary = reply.len() - HMAC_SHA384_LENGTH;
    let hmac_key = kbkdf_hmac_sha384(&key, KDF_LABEL_HELLO_HMAC, 0, 1);
    let expected = hmac_sha384(hmac_key.as_bytes(), &reply[OK_HEADER_LENGTH..boundary]);
    assert!(secure_eq(&expected, &reply[boundary..]));

    assert_eq!(fx.tracer.drop_count(), 0);
}

#[test]
fn replayed_hello_reuses_stored_key() {
    let fx = Fixture::new();
    let remote = Identity::generate();
    let key = remote.agree(&fx.our.public_only()).expect("agree");
    let hello = build_hello(&remote, fx.our.address(), &key, None, &Dictionary::new(), 5)
        .expect("hello");

    fx.deliver_from(addr("198.51.100.7:9993"), &hello);
    fx.sink.clear();
    fx.deliver_from(addr("198.51.100.7:9993"), &hello);

    assert_eq!(fx.topology.peer_count(), 1);
    assert_eq!(fx.sink.sent().len(), 1, "second HELLO still answered");
    assert_eq!(fx.tracer.drop_count(), 0);
}

#[test]
fn fragmented_frame_reaches_vl2_once() {
    let fx = Fixture::new();
    let (identity, key, _) = fx.known_peer();
    let payload: Vec<u8> = (0..4096u32).map(|x| (x * 31) as u8).collect();
    let wire = fx.armored_packet(
        identity.address(),
        &key,
        Verb::Frame,
        &payload,
        CipherSuite::Poly1305Salsa2012,
    );

    let frags = fragment_packet(&wire, 1500).expect("fragment");
    assert_eq!(frags.len(), 3);
    let from = addr("192.0.2.33:9993");
    for index in [2usize, 0, 1] {
        fx.deliver_from(from, &frags[index]);
    }

    let calls = fx.vl2.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "frame");
    assert!(calls[0].2, "frame arrived authenticated");
    assert_eq!(&calls[0].1[PAYLOAD_START..], payload.as_slice());
    assert_eq!(fx.tracer.drop_count(), 0);

    // Straggler copies arriving after the message completed are silently
    // dropped, not reassembled into a second delivery.
    fx.deliver_from(from, &frags[1]);
    fx.deliver_from(from, &frags[0]);
    assert_eq!(fx.vl2.calls().len(), 1);
    assert_eq!(fx.tracer.drop_count(), 0);
    assert_eq!(fx.pool().outstanding(), 0);
}

#[test]
fn tampered_echo_drops_with_mac_failed() {
    let fx = Fixture::new();
    let (identity, key, _) = fx.known_peer();
    let mut wire = fx.armored_packet(
        identity.address(),
        &key,
        Verb::Echo,
        b"are you there",
        CipherSuite::Poly1305Salsa2012,
    );
    wire[PAYLOAD_START + 4] ^= 0x10;

    fx.deliver_from(addr("192.0.2.34:9993"), &wire);

    let drops = fx.tracer.drops();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].reason, DropReason::MacFailed);
    assert!(fx.sink.sent().is_empty(), "no OK reply for a forged ECHO");
    assert!(fx.vl2.calls().is_empty());
}

#[test]
fn echo_replies_with_payload() {
    let fx = Fixture::new();
    let (identity, key, _) = fx.known_peer();
    let wire = fx.armored_packet(
        identity.address(),
        &key,
        Verb::Echo,
        b"ping payload",
        CipherSuite::Poly1305Salsa2012,
    );
    let echo_packet_id = u64::from_be_bytes(wire[..8].try_into().expect("id"));

    fx.deliver_from(addr("192.0.2.35:9993"), &wire);

    let sent = fx.sink.sent();
    assert_eq!(sent.len(), 1);
    let reply = fx.dearmor_reply(&sent[0].2, &key);
    assert_eq!(reply[27] & 0x1f, Verb::Ok.code());
    assert_eq!(reply[HEADER_SIZE], Verb::Echo.code());
    assert_eq!(
        u64::from_be_bytes(reply[HEADER_SIZE + 1..OK_HEADER_LENGTH].try_into().expect("id")),
        echo_packet_id
    );
    assert_eq!(&reply[OK_HEADER_LENGTH..], b"ping payload");
}

#[test]
fn compressed_frame_is_inflated_before_dispatch() {
    let fx = Fixture::new();
    let (identity, key, _) = fx.known_peer();
    let payload = vec![0x5au8; 2000];
    let compressed = lz4_flex::block::compress(&payload);

    let mut pkt = vec![0u8; HEADER_SIZE];
    write_header(
        &mut pkt,
        meshwire_proto::next_packet_id(),
        fx.our.address(),
        identity.address(),
        0,
        Verb::Frame,
    )
    .expect("header");
    pkt[IDX_VERB] |= VERB_FLAG_COMPRESSED;
    pkt.extend_from_slice(&compressed);
    armor(&mut pkt, &key, CipherSuite::Poly1305Salsa2012).expect("armor");

    fx.deliver_from(addr("192.0.2.36:9993"), &pkt);

    let calls = fx.vl2.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(&calls[0].1[PAYLOAD_START..], payload.as_slice());
    assert_eq!(
        calls[0].1[IDX_VERB] & VERB_FLAG_COMPRESSED,
        0,
        "compressed flag cleared after inflation"
    );
}

#[test]
fn loopback_source_is_dropped_silently() {
    let fx = Fixture::new();
    let key = SymmetricKey::from_bytes([3u8; 48]);
    let wire = fx.armored_packet(
        fx.our.address(),
        &key,
        Verb::Frame,
        b"echoed back at us",
        CipherSuite::Poly1305Salsa2012,
    );
    fx.deliver_from(addr("192.0.2.37:9993"), &wire);

    assert_eq!(fx.tracer.drop_count(), 0);
    assert!(fx.vl2.calls().is_empty());
    assert_eq!(fx.vl1.whois_pending(), 0);
}

#[test]
fn trusted_path_gates_cipher_none() {
    let fx = Fixture::new();
    let (identity, _key, _) = fx.known_peer();
    fx.topology.trust_path(4242, "10.1.1.1".parse().expect("ip"));

    let mut pkt = vec![0u8; HEADER_SIZE];
    write_header(
        &mut pkt,
        meshwire_proto::next_packet_id(),
        fx.our.address(),
        identity.address(),
        0,
        Verb::Frame,
    )
    .expect("header");
    pkt.extend_from_slice(b"over the trusted wire");
    meshwire_node::armor_trusted(&mut pkt, 4242).expect("stamp");

    // Wrong source address: refused.
    fx.deliver_from(addr("10.9.9.9:9993"), &pkt);
    let drops = fx.tracer.drops();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].reason, DropReason::NotTrustedPath);
    assert!(fx.vl2.calls().is_empty());

    // Matching id and address: passes without cryptography.
    fx.deliver_from(addr("10.1.1.1:9993"), &pkt);
    let calls = fx.vl2.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].2);
}

#[test]
fn unknown_verb_is_traced() {
    let fx = Fixture::new();
    let (identity, key, _) = fx.known_peer();
    let wire = fx.armored_packet(
        identity.address(),
        &key,
        Verb::Unknown(29),
        b"",
        CipherSuite::Poly1305Salsa2012,
    );
    fx.deliver_from(addr("192.0.2.38:9993"), &wire);
    let drops = fx.tracer.drops();
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].reason, DropReason::UnrecognizedVerb);
}

#[test]
fn duplicate_fragment_flood_is_bounded() {
    let fx = Fixture::new();
    let from = addr("192.0.2.40:9993");

    // One hundred copies of the same continuation fragment.
    let mut frag = Vec::new();
    frag.extend_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
    frag.extend_from_slice(&fx.our.address().to_bytes());
    frag.push(FRAGMENT_INDICATOR);
    frag.push((3 << 4) | 1); // fragment 1 of 3
    frag.push(0);
    frag.extend_from_slice(&[0xcc; 600]);
    for _ in 0..100 {
        fx.deliver_from(from, &frag);
    }
    // Only the first copy is retained.
    assert_eq!(fx.pool().outstanding(), 1);

    // A burst of unrelated single-fragment assemblies on the same path stays
    // within the per-path budget via eviction.
    for i in 0..(MAX_INCOMING_FRAGMENTS_PER_PATH as u64 * 3) {
        let mut other = frag.clone();
        other[..8].copy_from_slice(&(0x9000_0000_0000_0000u64 + i).to_be_bytes());
        fx.deliver_from(from, &other);
    }
    assert!(fx.pool().outstanding() <= MAX_INCOMING_FRAGMENTS_PER_PATH + 1);
    assert!(fx.vl2.calls().is_empty());
}

#[test]
fn whois_deferral_and_retry_cadence() {
    let fx = Fixture::new();

    // Install a root with a live path so WHOIS requests have somewhere to go.
    let root_identity = Identity::generate();
    let root_key = root_identity.agree(&fx.our.public_only()).expect("agree");
    let root_peer = Arc::new(Peer::new(root_identity.public_only(), root_key.clone()));
    fx.topology.set_root(root_peer.clone());
    let root_addr = addr("203.0.113.1:9993");
    let root_path = fx.topology.path(1, root_addr);
    root_peer.received(&root_path, 0, 0, Verb::Nop, fx.now());

    // An encrypted FRAME from a stranger gets parked, not processed.
    let stranger = Identity::generate();
    let stranger_key = stranger.agree(&fx.our.public_only()).expect("agree");
    let wire = fx.armored_packet(
        stranger.address(),
        &stranger_key,
        Verb::Frame,
        b"too early",
        CipherSuite::Poly1305Salsa2012,
    );
    let t0 = fx.now();
    fx.deliver_from(addr("192.0.2.50:9993"), &wire);

    assert!(fx.vl2.calls().is_empty());
    assert_eq!(fx.vl1.whois_pending(), 1);
    assert!(fx.sink.sent().is_empty());

    // Before the retry delay: silence.
    fx.vl1.tick(t0 + WHOIS_RETRY_DELAY_MS - 1);
    assert!(fx.sink.sent().is_empty());

    // At the delay: exactly one WHOIS to the root naming the stranger.
    fx.vl1.tick(t0 + WHOIS_RETRY_DELAY_MS);
    let sent = fx.sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, root_addr);
    let whois = fx.dearmor_reply(&sent[0].2, &root_key);
    assert_eq!(whois[27] & 0x1f, Verb::Whois.code());
    let listed: Vec<&[u8]> = whois[PAYLOAD_START..].chunks_exact(ADDRESS_LENGTH).collect();
    assert_eq!(listed, vec![&stranger.address().to_bytes()[..]]);

    // Ticking immediately again emits nothing.
    fx.vl1.tick(t0 + WHOIS_RETRY_DELAY_MS + 1);
    assert_eq!(fx.sink.sent().len(), 1);

    // Entries give up after the retry budget.
    let mut t = t0 + WHOIS_RETRY_DELAY_MS;
    for _ in 1..MAX_WHOIS_RETRIES {
        t += WHOIS_RETRY_DELAY_MS;
        fx.vl1.tick(t);
    }
    t += WHOIS_RETRY_DELAY_MS;
    fx.vl1.tick(t);
    assert_eq!(fx.vl1.whois_pending(), 0);
    assert_eq!(fx.sink.sent().len(), MAX_WHOIS_RETRIES as usize);
}

#[test]
fn parked_packet_is_replayed_after_hello() {
    let fx = Fixture::new();
    let stranger = Identity::generate();
    let key = stranger.agree(&fx.our.public_only()).expect("agree");

    let frame = fx.armored_packet(
        stranger.address(),
        &key,
        Verb::Frame,
        b"deferred frame",
        CipherSuite::Poly1305Salsa2012,
    );
    let from = addr("192.0.2.60:9993");
    fx.deliver_from(from, &frame);
    assert_eq!(fx.vl1.whois_pending(), 1);
    assert!(fx.vl2.calls().is_empty());

    // The stranger introduces itself; admission drains the parked packet.
    let hello = build_hello(&stranger, fx.our.address(), &key, None, &Dictionary::new(), 9)
        .expect("hello");
    fx.deliver_from(from, &hello);

    assert_eq!(fx.vl1.whois_pending(), 0);
    let calls = fx.vl2.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "frame");
    assert_eq!(&calls[0].1[PAYLOAD_START..], b"deferred frame");
}

#[test]
fn poly1305_none_verb_survives_to_dispatch() {
    // POLY1305_NONE authenticates without enciphering, so the verb must be
    // dispatchable directly off the wire bytes.
    let fx = Fixture::new();
    let (identity, key, _) = fx.known_peer();
    let wire = fx.armored_packet(
        identity.address(),
        &key,
        Verb::Echo,
        b"clear but signed",
        CipherSuite::Poly1305None,
    );
    assert_eq!(wire[27] & 0x1f, Verb::Echo.code());

    fx.deliver_from(addr("192.0.2.61:9993"), &wire);
    let sent = fx.sink.sent();
    assert_eq!(sent.len(), 1);
    let reply = fx.dearmor_reply(&sent[0].2, &key);
    assert_eq!(&reply[OK_HEADER_LENGTH..], b"clear but signed");
}
