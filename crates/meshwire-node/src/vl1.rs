//! The VL1 ingress pipeline.
//!
//! [`Vl1::on_remote_packet`] is the single entry point for raw datagrams. It
//! classifies fragments versus heads, drives the defragmenter, applies the
//! cipher suite, decompresses flagged payloads, and dispatches by verb:
//! transport verbs locally, virtual Ethernet verbs to the VL2 collaborator.
//! It may be called concurrently from any number of I/O workers; nothing in
//! the pipeline blocks or suspends.
//!
//! A corrupt packet must never take the node down: every per-packet failure
//! is a traced drop, and a catch-all boundary converts anything unexpected
//! into an `unexpected_error` trace.

use crate::armor::{armor, dearmor_salsa2012, verify_poly1305_none, ArmorError, CipherSuite};
use crate::path::Path;
use crate::peer::{Peer, RemoteVersion};
use crate::runtime::RuntimeEnv;
use crate::tracer::DropReason;
use crate::whois::WhoisQueue;
use meshwire_crypto::{hmac_sha384, kbkdf_hmac_sha384, secure_eq, Identity, HMAC_SHA384_LENGTH, KDF_LABEL_HELLO_HMAC};
use meshwire_proto::wire::IDX_VERB;
use meshwire_proto::{
    next_packet_id, write_header, Assembled, Buf, Defragmenter, FragmentHeader, PacketHeader,
    Slice, SliceVector, Verb, ADDRESS_LENGTH, FRAGMENT_HEADER_SIZE, FRAGMENT_INDICATOR,
    FRAGMENT_INDICATOR_INDEX, HEADER_SIZE, MAX_INCOMING_FRAGMENTS_PER_PATH, MAX_PACKET_LENGTH,
    MIN_FRAGMENT_LENGTH, MIN_PACKET_LENGTH, PAYLOAD_START, VERB_FLAG_COMPRESSED,
};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Protocol version we speak and advertise.
pub const PROTOCOL_VERSION: u8 = 11;

/// Oldest protocol version we accept a HELLO from.
pub const PROTOCOL_VERSION_MIN: u8 = 8;

/// Protocol version from which the HELLO/OK HMAC layer is mandatory.
pub const PROTOCOL_VERSION_HMAC_REQUIRED: u8 = 11;

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_REVISION: u16 = 0;

/// Size of the OK header: packet header plus in-re verb and in-re packet id.
pub const OK_HEADER_LENGTH: usize = HEADER_SIZE + 1 + 8;

/// Size of the ERROR header: OK header plus the error code byte.
pub const ERROR_HEADER_LENGTH: usize = OK_HEADER_LENGTH + 1;

pub(crate) type PathKey = (i64, SocketAddr);

enum DecompressError {
    PoolExhausted,
    Invalid,
}

/// The ingress pipeline. One instance per node; shared across I/O workers.
pub struct Vl1 {
    pub(crate) env: Arc<RuntimeEnv>,
    defrag: Defragmenter<PathKey>,
    pub(crate) whois: WhoisQueue,
}

impl Vl1 {
    pub fn new(env: Arc<RuntimeEnv>) -> Self {
        Vl1 {
            env,
            defrag: Defragmenter::new(),
            whois: WhoisQueue::new(),
        }
    }

    pub fn env(&self) -> &RuntimeEnv {
        &self.env
    }

    /// Feed one received datagram into the pipeline. `data` is a pool buffer
    /// the I/O layer filled with `len` bytes.
    pub fn on_remote_packet(&self, local_socket: i64, from: SocketAddr, data: Buf, len: usize) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.ingest(local_socket, from, data, len);
        }));
        if outcome.is_err() {
            self.env
                .tracer
                .unexpected_error(0x6a1b_90d4, "panic while processing an inbound packet");
        }
    }

    /// Drive pending WHOIS retries. Call this from the node's housekeeping
    /// loop.
    pub fn tick(&self, now: i64) {
        self.send_pending_whois(now);
    }

    /// Re-process every packet parked for `source` now that its identity is
    /// known. The HELLO admission path calls this; so does the WHOIS
    /// resolution handler.
    pub fn peer_resolved(&self, source: meshwire_proto::Address, now: i64) {
        for pending in self.whois.take(source) {
            let mut pktv = SliceVector::new();
            if pktv.push(pending.packet).is_ok() {
                self.process_packet(pktv, &pending.path, now);
            }
        }
    }

    /// Number of sources with packets parked awaiting identity.
    pub fn whois_pending(&self) -> usize {
        self.whois.pending_sources()
    }

    fn ingest(&self, local_socket: i64, from: SocketAddr, data: Buf, len: usize) {
        let now = self.env.node.now();
        let path = self.env.topology.path(local_socket, from);
        path.received(now);

        // Anything below the fragment header size is a keepalive.
        if len < MIN_FRAGMENT_LENGTH || len > data.bytes().len() {
            return;
        }

        let pktv = if data.bytes()[FRAGMENT_INDICATOR_INDEX] == FRAGMENT_INDICATOR {
            let fh = match FragmentHeader::parse(&data.bytes()[..len]) {
                Ok(fh) => fh,
                Err(_) => return,
            };
            if fh.destination != self.env.identity.address() {
                self.env
                    .relay
                    .relay(&path, fh.destination, &data.bytes()[..len], now);
                return;
            }
            let slice = match Slice::new(data, FRAGMENT_HEADER_SIZE, len) {
                Ok(slice) => slice,
                Err(_) => return,
            };
            match self.defrag.assemble(
                fh.packet_id,
                slice,
                fh.fragment_no,
                fh.total_fragments,
                now,
                (local_socket, from),
                MAX_INCOMING_FRAGMENTS_PER_PATH,
            ) {
                Ok(Assembled::Complete(v)) => v,
                Ok(Assembled::Pending) | Err(_) => return,
            }
        } else {
            if len < MIN_PACKET_LENGTH {
                return;
            }
            let ph = match PacketHeader::parse(&data.bytes()[..len]) {
                Ok(ph) => ph,
                Err(_) => return,
            };
            if ph.destination != self.env.identity.address() {
                self.env
                    .relay
                    .relay(&path, ph.destination, &data.bytes()[..len], now);
                return;
            }
            if ph.is_fragmented() {
                let slice = match Slice::new(data, 0, len) {
                    Ok(slice) => slice,
                    Err(_) => return,
                };
                match self.defrag.assemble(
                    ph.packet_id,
                    slice,
                    0,
                    0,
                    now,
                    (local_socket, from),
                    MAX_INCOMING_FRAGMENTS_PER_PATH,
                ) {
                    Ok(Assembled::Complete(v)) => v,
                    Ok(Assembled::Pending) | Err(_) => return,
                }
            } else {
                let slice = match Slice::new(data, 0, len) {
                    Ok(slice) => slice,
                    Err(_) => return,
                };
                let mut v = SliceVector::new();
                if v.push(slice).is_err() {
                    return;
                }
                v
            }
        };

        self.process_packet(pktv, &path, now);
    }

    pub(crate) fn process_packet(&self, pktv: SliceVector, path: &Arc<Path>, now: i64) {
        if pktv.first().map(Slice::len).unwrap_or(0) < HEADER_SIZE {
            self.env
                .tracer
                .unexpected_error(0x3f82_ce10, "empty or undersized packet vector");
            return;
        }
        let header = match pktv.first().map(|s| PacketHeader::parse(s.data())) {
            Some(Ok(header)) => header,
            _ => return,
        };
        let hops = header.hops();
        let packet_size = pktv.total_len();

        // A packet claiming to come from ourselves is a loop or a spoof.
        if header.source == self.env.identity.address() {
            return;
        }

        let peer = self.env.topology.peer(header.source);
        if packet_size > MAX_PACKET_LENGTH {
            self.drop_packet(
                0x81d0_44ba,
                &header,
                peer.as_deref(),
                path,
                hops,
                Verb::Nop,
                DropReason::MalformedPacket,
            );
            return;
        }

        // Unknown senders may only deliver a HELLO, and only under a cipher
        // whose verb byte is readable pre-authentication. Everything else
        // waits for a WHOIS round-trip.
        let cipher = header.cipher_code();
        let unknown_peer_hello = (cipher == CipherSuite::Poly1305None.code()
            || cipher == CipherSuite::TrustedNone.code())
            && header.verb() == Verb::Hello;
        if peer.is_none() && !unknown_peer_hello {
            let assembled = match pktv.assemble(&self.env.pool) {
                Some(slice) => slice,
                None => {
                    self.env
                        .tracer
                        .unexpected_error(0xc2a9_7f05, "buffer pool exhausted while queueing");
                    return;
                }
            };
            if assembled.len() < MIN_PACKET_LENGTH {
                self.drop_packet(
                    0x54dd_0b21,
                    &header,
                    None,
                    path,
                    hops,
                    Verb::Nop,
                    DropReason::MalformedPacket,
                );
                return;
            }
            self.whois
                .enqueue(header.source, Arc::clone(path), assembled, now);
            return;
        }

        let mut authenticated = false;
        let pkt = match CipherSuite::from_code(cipher) {
            Some(CipherSuite::Poly1305None) => {
                let assembled = match pktv.assemble(&self.env.pool) {
                    Some(slice) => slice,
                    None => {
                        self.env
                            .tracer
                            .unexpected_error(0x19be_6632, "buffer pool exhausted");
                        return;
                    }
                };
                if assembled.len() < MIN_PACKET_LENGTH {
                    self.drop_packet(
                        0x9cc1_05f8,
                        &header,
                        peer.as_deref(),
                        path,
                        hops,
                        Verb::Nop,
                        DropReason::MalformedPacket,
                    );
                    return;
                }
                if let Some(peer) = &peer {
                    match verify_poly1305_none(assembled.data(), peer.key()) {
                        Ok(()) => authenticated = true,
                        Err(ArmorError::MacFailed) => {
                            self.drop_packet(
                                0xe4b8_21c3,
                                &header,
                                Some(peer.as_ref()),
                                path,
                                hops,
                                Verb::Nop,
                                DropReason::MacFailed,
                            );
                            return;
                        }
                        Err(_) => {
                            self.drop_packet(
                                0x77aa_d1e0,
                                &header,
                                Some(peer.as_ref()),
                                path,
                                hops,
                                Verb::Nop,
                                DropReason::MalformedPacket,
                            );
                            return;
                        }
                    }
                }
                assembled
            }
            Some(CipherSuite::Poly1305Salsa2012) => {
                let peer = match &peer {
                    Some(peer) => peer,
                    None => {
                        self.drop_packet(
                            0xb07c_9210,
                            &header,
                            None,
                            path,
                            hops,
                            Verb::Nop,
                            DropReason::MacFailed,
                        );
                        return;
                    }
                };
                match dearmor_salsa2012(pktv, &self.env.pool, peer.key()) {
                    Ok(slice) => {
                        authenticated = true;
                        slice
                    }
                    Err(ArmorError::MacFailed) => {
                        self.drop_packet(
                            0xa6f1_3d48,
                            &header,
                            Some(peer.as_ref()),
                            path,
                            hops,
                            Verb::Nop,
                            DropReason::MacFailed,
                        );
                        return;
                    }
                    Err(ArmorError::OutOfMemory) => {
                        self.env
                            .tracer
                            .unexpected_error(0x0d5e_88c7, "buffer pool exhausted while dearmoring");
                        return;
                    }
                    Err(_) => {
                        self.drop_packet(
                            0x2e90_1b7f,
                            &header,
                            Some(peer.as_ref()),
                            path,
                            hops,
                            Verb::Nop,
                            DropReason::MalformedPacket,
                        );
                        return;
                    }
                }
            }
            Some(CipherSuite::TrustedNone) => {
                let assembled = match pktv.assemble(&self.env.pool) {
                    Some(slice) => slice,
                    None => {
                        self.env
                            .tracer
                            .unexpected_error(0x5f30_aa92, "buffer pool exhausted");
                        return;
                    }
                };
                if assembled.len() < MIN_PACKET_LENGTH {
                    self.drop_packet(
                        0x40e7_c554,
                        &header,
                        peer.as_deref(),
                        path,
                        hops,
                        Verb::Nop,
                        DropReason::MalformedPacket,
                    );
                    return;
                }
                if self
                    .env
                    .topology
                    .should_inbound_path_be_trusted(path.address(), header.trusted_path_id())
                {
                    authenticated = true;
                    assembled
                } else {
                    self.drop_packet(
                        0x8c14_72db,
                        &header,
                        peer.as_deref(),
                        path,
                        hops,
                        Verb::Nop,
                        DropReason::NotTrustedPath,
                    );
                    return;
                }
            }
            None => {
                self.drop_packet(
                    0xd3b5_60ee,
                    &header,
                    peer.as_deref(),
                    path,
                    hops,
                    Verb::Nop,
                    DropReason::InvalidObject,
                );
                return;
            }
        };

        // The packet is contiguous now; re-read the header, since the verb
        // byte may just have been deciphered.
        let header = match PacketHeader::parse(pkt.data()) {
            Ok(header) => header,
            Err(_) => return,
        };
        let verb = header.verb();

        let pkt = if header.is_compressed() {
            if !authenticated {
                self.drop_packet(
                    0x1fb4_9e06,
                    &header,
                    peer.as_deref(),
                    path,
                    hops,
                    verb,
                    DropReason::MalformedPacket,
                );
                return;
            }
            match self.decompress(&pkt) {
                Ok(slice) => slice,
                Err(DecompressError::PoolExhausted) => {
                    self.env
                        .tracer
                        .unexpected_error(0xae02_7c61, "buffer pool exhausted while decompressing");
                    return;
                }
                Err(DecompressError::Invalid) => {
                    self.drop_packet(
                        0x66c8_1d39,
                        &header,
                        peer.as_deref(),
                        path,
                        hops,
                        verb,
                        DropReason::InvalidCompressedData,
                    );
                    return;
                }
            }
        } else {
            pkt
        };

        self.dispatch(verb, header, pkt, peer, path, hops, authenticated, now);
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        verb: Verb,
        header: PacketHeader,
        pkt: Slice,
        peer: Option<Arc<Peer>>,
        path: &Arc<Path>,
        hops: u8,
        authenticated: bool,
        now: i64,
    ) {
        if verb == Verb::Hello {
            self.handle_hello(path, peer, pkt, now);
            return;
        }

        // Every verb except HELLO requires both a known peer and a passed
        // authentication stage.
        let peer = match peer {
            Some(peer) => peer,
            None => return,
        };
        if !authenticated {
            self.drop_packet(
                0xf1d2_3a88,
                &header,
                Some(peer.as_ref()),
                path,
                hops,
                verb,
                DropReason::MacFailed,
            );
            return;
        }

        let data = pkt.data();
        match verb {
            Verb::Nop => {}
            Verb::Error => self.handle_error(&header, &peer, path, hops, data),
            Verb::Ok => self.handle_ok(&header, &peer, path, hops, data, now),
            Verb::Whois => self.handle_whois(&header, &peer, path, data, now),
            Verb::Echo => self.handle_echo(&header, &peer, path, data, now),
            Verb::Rendezvous | Verb::PushDirectPaths | Verb::UserMessage | Verb::Encap => {
                // Parsed and acknowledged; their semantics live outside the
                // ingress core.
                tracing::debug!(
                    target: "meshwire::vl1",
                    verb = %verb,
                    peer = %peer.address(),
                    "verb received and ignored by ingress core"
                );
            }
            Verb::Frame => self.env.vl2.frame(path, &peer, data, authenticated),
            Verb::ExtFrame => self.env.vl2.ext_frame(path, &peer, data, authenticated),
            Verb::MulticastLike => self.env.vl2.multicast_like(path, &peer, data, authenticated),
            Verb::MulticastGather => {
                self.env.vl2.multicast_gather(path, &peer, data, authenticated)
            }
            Verb::Multicast => self.env.vl2.multicast(path, &peer, data, authenticated),
            Verb::NetworkCredentials => {
                self.env.vl2.network_credentials(path, &peer, data, authenticated)
            }
            Verb::NetworkConfigRequest => {
                self.env
                    .vl2
                    .network_config_request(path, &peer, data, authenticated)
            }
            Verb::NetworkConfig => self.env.vl2.network_config(path, &peer, data, authenticated),
            Verb::Hello => {}
            Verb::Unknown(_) => {
                self.drop_packet(
                    0x70be_114c,
                    &header,
                    Some(peer.as_ref()),
                    path,
                    hops,
                    verb,
                    DropReason::UnrecognizedVerb,
                );
                return;
            }
        }

        peer.received(path, hops, header.packet_id, verb, now);
    }

    fn decompress(&self, pkt: &Slice) -> Result<Slice, DecompressError> {
        let mut out = self.env.pool.get().ok_or(DecompressError::PoolExhausted)?;
        let produced = {
            let (head, body) = out.bytes_mut().split_at_mut(PAYLOAD_START);
            head.copy_from_slice(&pkt.data()[..PAYLOAD_START]);
            head[IDX_VERB] &= !VERB_FLAG_COMPRESSED;
            lz4_flex::block::decompress_into(
                &pkt.data()[PAYLOAD_START..],
                &mut body[..MAX_PACKET_LENGTH - PAYLOAD_START],
            )
            .map_err(|_| DecompressError::Invalid)?
        };
        Slice::new(out, 0, PAYLOAD_START + produced).map_err(|_| DecompressError::Invalid)
    }

    fn handle_error(&self, header: &PacketHeader, peer: &Arc<Peer>, path: &Arc<Path>, hops: u8, data: &[u8]) {
        if data.len() < ERROR_HEADER_LENGTH {
            self.drop_packet(
                0x4c99_e02d,
                header,
                Some(peer.as_ref()),
                path,
                hops,
                Verb::Error,
                DropReason::MalformedPacket,
            );
            return;
        }
        let in_re_verb = Verb::from_wire(data[HEADER_SIZE]);
        let error_code = data[OK_HEADER_LENGTH];
        tracing::debug!(
            target: "meshwire::vl1",
            peer = %peer.address(),
            in_re = %in_re_verb,
            code = error_code,
            "peer reported an error"
        );
    }

    fn handle_ok(
        &self,
        header: &PacketHeader,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        hops: u8,
        data: &[u8],
        now: i64,
    ) {
        if data.len() < OK_HEADER_LENGTH {
            self.drop_packet(
                0x0b67_f7a4,
                header,
                Some(peer.as_ref()),
                path,
                hops,
                Verb::Ok,
                DropReason::MalformedPacket,
            );
            return;
        }
        let in_re_verb = Verb::from_wire(data[HEADER_SIZE]);
        match in_re_verb {
            Verb::Hello => self.handle_ok_hello(header, peer, path, hops, data),
            Verb::Whois => self.handle_ok_whois(header, peer, path, hops, data, now),
            _ => {}
        }
    }

    fn handle_ok_hello(
        &self,
        header: &PacketHeader,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        hops: u8,
        data: &[u8],
    ) {
        // timestamp echo (8) + protocol, major, minor (1 each) + revision (2)
        if data.len() < OK_HEADER_LENGTH + 13 {
            self.drop_packet(
                0x92d5_3c1b,
                header,
                Some(peer.as_ref()),
                path,
                hops,
                Verb::Ok,
                DropReason::MalformedPacket,
            );
            return;
        }
        let at = OK_HEADER_LENGTH + 8;
        let protocol = data[at];
        let major = data[at + 1];
        let minor = data[at + 2];
        let revision = u16::from_be_bytes([data[at + 3], data[at + 4]]);
        if protocol >= PROTOCOL_VERSION_HMAC_REQUIRED {
            // For modern peers the reply body must carry a valid HMAC keyed
            // for the OK direction.
            let hmac_key = kbkdf_hmac_sha384(peer.key(), KDF_LABEL_HELLO_HMAC, 0, 1);
            let verified = data.len() >= OK_HEADER_LENGTH + HMAC_SHA384_LENGTH && {
                let boundary = data.len() - HMAC_SHA384_LENGTH;
                let expected = hmac_sha384(hmac_key.as_bytes(), &data[OK_HEADER_LENGTH..boundary]);
                secure_eq(&expected, &data[boundary..])
            };
            if !verified {
                self.drop_packet(
                    0xcd71_6e9f,
                    header,
                    Some(peer.as_ref()),
                    path,
                    hops,
                    Verb::Ok,
                    DropReason::MacFailed,
                );
                return;
            }
        }
        peer.set_remote_version(RemoteVersion {
            protocol,
            major,
            minor,
            revision,
        });
    }

    fn handle_ok_whois(
        &self,
        header: &PacketHeader,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        hops: u8,
        data: &[u8],
        now: i64,
    ) {
        let mut cursor = &data[OK_HEADER_LENGTH..];
        while !cursor.is_empty() {
            let identity = match Identity::from_wire(&mut cursor) {
                Ok(identity) => identity,
                Err(_) => {
                    self.drop_packet(
                        0x35a0_8dc2,
                        header,
                        Some(peer.as_ref()),
                        path,
                        hops,
                        Verb::Ok,
                        DropReason::InvalidObject,
                    );
                    return;
                }
            };
            if !identity.locally_validate() {
                self.drop_packet(
                    0xe9f4_4071,
                    header,
                    Some(peer.as_ref()),
                    path,
                    hops,
                    Verb::Ok,
                    DropReason::InvalidObject,
                );
                return;
            }
            let key = match self.env.identity.agree(&identity) {
                Ok(key) => key,
                Err(_) => continue,
            };
            let address = identity.address();
            self.env
                .topology
                .add_peer(Arc::new(Peer::new(identity, key)));
            self.peer_resolved(address, now);
        }
    }

    fn handle_whois(
        &self,
        header: &PacketHeader,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        data: &[u8],
        now: i64,
    ) {
        for chunk in data[PAYLOAD_START..].chunks_exact(ADDRESS_LENGTH) {
            let queried = match meshwire_proto::Address::from_bytes(chunk) {
                Some(address) => address,
                None => continue,
            };
            let found = match self.env.topology.peer(queried) {
                Some(found) => found,
                None => continue,
            };
            let mut out = vec![0u8; HEADER_SIZE];
            if write_header(
                &mut out,
                next_packet_id(),
                peer.address(),
                self.env.identity.address(),
                0,
                Verb::Ok,
            )
            .is_err()
            {
                return;
            }
            out.push(Verb::Whois.code());
            out.extend_from_slice(&header.packet_id.to_be_bytes());
            found.identity().to_wire(&mut out);
            if armor(&mut out, peer.key(), CipherSuite::Poly1305Salsa2012).is_ok() {
                path.send(&out, now);
            }
        }
    }

    fn handle_echo(
        &self,
        header: &PacketHeader,
        peer: &Arc<Peer>,
        path: &Arc<Path>,
        data: &[u8],
        now: i64,
    ) {
        let mut out = vec![0u8; HEADER_SIZE];
        if write_header(
            &mut out,
            next_packet_id(),
            peer.address(),
            self.env.identity.address(),
            0,
            Verb::Ok,
        )
        .is_err()
        {
            return;
        }
        out.push(Verb::Echo.code());
        out.extend_from_slice(&header.packet_id.to_be_bytes());
        out.extend_from_slice(&data[PAYLOAD_START..]);
        if out.len() > MAX_PACKET_LENGTH {
            return;
        }
        if armor(&mut out, peer.key(), CipherSuite::Poly1305Salsa2012).is_ok() {
            path.send(&out, now);
        }
    }

    pub(crate) fn send_pending_whois(&self, now: i64) {
        let root = match self.env.topology.root() {
            Some(root) => root,
            None => return,
        };
        let root_path = match root.path() {
            Some(path) => path,
            None => return,
        };

        let due = self.whois.due(now);
        if due.is_empty() {
            return;
        }

        let per_packet = (MAX_PACKET_LENGTH - 1 - HEADER_SIZE) / ADDRESS_LENGTH;
        for chunk in due.chunks(per_packet) {
            let mut out = vec![0u8; HEADER_SIZE];
            if write_header(
                &mut out,
                next_packet_id(),
                root.address(),
                self.env.identity.address(),
                0,
                Verb::Whois,
            )
            .is_err()
            {
                return;
            }
            for address in chunk {
                out.extend_from_slice(&address.to_bytes());
            }
            if armor(&mut out, root.key(), CipherSuite::Poly1305Salsa2012).is_ok() {
                root_path.send(&out, now);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn drop_packet(
        &self,
        code: u32,
        header: &PacketHeader,
        peer: Option<&Peer>,
        path: &Arc<Path>,
        hops: u8,
        verb: Verb,
        reason: DropReason,
    ) {
        self.env.tracer.incoming_packet_dropped(
            code,
            header.packet_id,
            0,
            peer.map(Peer::identity),
            Some(path.address()),
            hops,
            verb,
            reason,
        );
    }
}
