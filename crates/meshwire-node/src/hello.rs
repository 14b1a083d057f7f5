//! The HELLO exchange: how an unknown sender becomes a known peer.
//!
//! HELLO is the only verb accepted from a sender we cannot yet authenticate,
//! so it carries its own proof chain: the embedded identity must match the
//! source address, the Poly1305 MAC is re-verified under the key derived from
//! that identity, and modern peers must additionally pass an HMAC-SHA-384
//! keyed by a KBKDF of the pairwise key. Only after all of that does the
//! expensive first-contact identity validation run, behind a per-address rate
//! gate. Admission ends with an armored OK reply and a drain of any packets
//! that were parked waiting for this sender's identity.
//!
//! Body layout after the packet header: protocol version (1), major (1),
//! minor (1), revision (2), timestamp (8), identity, surface endpoint, then
//! an optional Salsa20/12-encrypted trailer of `u16` legacy length, `u16`
//! dictionary length + dictionary, `u16` additional-field length, and a
//! 48-byte HMAC.

use crate::armor::{armor, verify_poly1305_none, CipherSuite};
use crate::path::Path;
use crate::peer::{Peer, RemoteVersion};
use crate::tracer::DropReason;
use crate::vl1::{
    Vl1, OK_HEADER_LENGTH, PROTOCOL_VERSION, PROTOCOL_VERSION_HMAC_REQUIRED, PROTOCOL_VERSION_MIN,
    VERSION_MAJOR, VERSION_MINOR, VERSION_REVISION,
};
use meshwire_crypto::{
    crypt_section, hmac_sha384, kbkdf_hmac_sha384, secure_eq, Identity, SymmetricKey,
    HMAC_SHA384_LENGTH, KDF_LABEL_HELLO_HMAC,
};
use meshwire_proto::{
    decode_endpoint, encode_endpoint, next_packet_id, write_header, Address, Dictionary,
    PacketHeader, Slice, Verb, ENCRYPTED_SECTION_START, HEADER_SIZE, MAX_PACKET_LENGTH,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Fixed-size HELLO prefix: packet header plus version fields and timestamp.
pub const HELLO_FIXED_LENGTH: usize = HEADER_SIZE + 1 + 1 + 1 + 2 + 8;

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// IV for the HELLO trailer: the packet's first eight bytes with the low
/// three bits of the last one cleared.
fn trailer_iv(packet: &[u8]) -> [u8; 8] {
    let mut iv = [0u8; 8];
    iv.copy_from_slice(&packet[..8]);
    iv[7] &= 0xf8;
    iv
}

impl Vl1 {
    pub(crate) fn handle_hello(
        &self,
        path: &Arc<Path>,
        peer: Option<Arc<Peer>>,
        mut pkt: Slice,
        now: i64,
    ) {
        let packet_size = pkt.len();
        if packet_size < HELLO_FIXED_LENGTH {
            self.drop_hello(0x71c0_58a2, 0, None, path, 0, DropReason::MalformedPacket);
            return;
        }
        let header = match PacketHeader::parse(pkt.data()) {
            Ok(header) => header,
            Err(_) => return,
        };
        let hops = header.hops();
        let packet_id = header.packet_id;

        let protocol = pkt.data()[HEADER_SIZE];
        if protocol < PROTOCOL_VERSION_MIN {
            self.drop_hello(
                0x02e7_91cd,
                packet_id,
                None,
                path,
                hops,
                DropReason::PeerTooOld,
            );
            return;
        }
        let major = pkt.data()[HEADER_SIZE + 1];
        let minor = pkt.data()[HEADER_SIZE + 2];
        let revision = u16::from_be_bytes([pkt.data()[HEADER_SIZE + 3], pkt.data()[HEADER_SIZE + 4]]);
        let timestamp: [u8; 8] = match pkt.data()[HEADER_SIZE + 5..HELLO_FIXED_LENGTH].try_into() {
            Ok(bytes) => bytes,
            Err(_) => return,
        };

        let mut cursor = &pkt.data()[HELLO_FIXED_LENGTH..packet_size];
        let identity = match Identity::from_wire(&mut cursor) {
            Ok(identity) => identity,
            Err(_) => {
                self.drop_hello(
                    0xba44_e310,
                    packet_id,
                    None,
                    path,
                    hops,
                    DropReason::InvalidObject,
                );
                return;
            }
        };
        let mut ptr = packet_size - cursor.len();

        if header.source != identity.address() {
            self.drop_hello(
                0x5d2f_a67b,
                packet_id,
                None,
                path,
                hops,
                DropReason::MacFailed,
            );
            return;
        }

        // Long-term pairwise key: reuse the stored one when the sender is
        // already known under the same identity, otherwise agree fresh.
        let (mut peer, key) = match peer {
            Some(existing) if existing.identity() == &identity => {
                let key = existing.key().clone();
                (Some(existing), key)
            }
            _ => match self.env.identity.agree(&identity) {
                Ok(key) => (None, key),
                Err(_) => {
                    self.drop_hello(
                        0x38c6_02f9,
                        packet_id,
                        Some(&identity),
                        path,
                        hops,
                        DropReason::MacFailed,
                    );
                    return;
                }
            },
        };

        // The dispatcher could not check the MAC for an unknown sender; do it
        // now under the key this identity implies.
        if verify_poly1305_none(pkt.data(), &key).is_err() {
            self.drop_hello(
                0xc90d_7713,
                packet_id,
                Some(&identity),
                path,
                hops,
                DropReason::MacFailed,
            );
            return;
        }

        let mut surface = None;
        if ptr < packet_size {
            let mut cursor = &pkt.data()[ptr..packet_size];
            surface = match decode_endpoint(&mut cursor) {
                Ok(surface) => surface,
                Err(_) => {
                    self.drop_hello(
                        0x1e83_b042,
                        packet_id,
                        Some(&identity),
                        path,
                        hops,
                        DropReason::InvalidObject,
                    );
                    return;
                }
            };
            ptr = packet_size - cursor.len();
        }

        let mut hmac_verified = false;
        if ptr < packet_size {
            // The trailer is enciphered directly under the long-term key; a
            // privacy measure more than a secrecy one.
            let iv = trailer_iv(pkt.data());
            crypt_section(&key, &iv, &mut pkt.data_mut()[ptr..packet_size]);

            let legacy = match read_u16(pkt.data(), ptr) {
                Some(legacy) => legacy as usize,
                None => {
                    self.drop_hello(
                        0x90f2_6c1e,
                        packet_id,
                        Some(&identity),
                        path,
                        hops,
                        DropReason::MalformedPacket,
                    );
                    return;
                }
            };
            ptr += 2 + legacy;
            if ptr > packet_size {
                self.drop_hello(
                    0x44b9_d05a,
                    packet_id,
                    Some(&identity),
                    path,
                    hops,
                    DropReason::MalformedPacket,
                );
                return;
            }

            if ptr < packet_size {
                let dictionary_len = match read_u16(pkt.data(), ptr) {
                    Some(len) => len as usize,
                    None => {
                        self.drop_hello(
                            0xfa07_3b61,
                            packet_id,
                            Some(&identity),
                            path,
                            hops,
                            DropReason::MalformedPacket,
                        );
                        return;
                    }
                };
                let dictionary_start = ptr + 2;
                ptr = dictionary_start + dictionary_len;
                if ptr > packet_size {
                    self.drop_hello(
                        0x6d58_20c4,
                        packet_id,
                        Some(&identity),
                        path,
                        hops,
                        DropReason::InvalidObject,
                    );
                    return;
                }

                let additional = match read_u16(pkt.data(), ptr) {
                    Some(len) => len as usize,
                    None => {
                        self.drop_hello(
                            0x23cb_9e87,
                            packet_id,
                            Some(&identity),
                            path,
                            hops,
                            DropReason::MalformedPacket,
                        );
                        return;
                    }
                };
                ptr += 2 + additional;
                if ptr > packet_size {
                    self.drop_hello(
                        0xb1a6_44f0,
                        packet_id,
                        Some(&identity),
                        path,
                        hops,
                        DropReason::MalformedPacket,
                    );
                    return;
                }

                if ptr + HMAC_SHA384_LENGTH <= packet_size {
                    let hmac_key = kbkdf_hmac_sha384(&key, KDF_LABEL_HELLO_HMAC, 0, 0);
                    let expected = hmac_sha384(
                        hmac_key.as_bytes(),
                        &pkt.data()[ENCRYPTED_SECTION_START..ptr],
                    );
                    if !secure_eq(&expected, &pkt.data()[ptr..ptr + HMAC_SHA384_LENGTH]) {
                        self.drop_hello(
                            0x09ef_57d8,
                            packet_id,
                            Some(&identity),
                            path,
                            hops,
                            DropReason::MacFailed,
                        );
                        return;
                    }
                    hmac_verified = true;
                }

                if dictionary_len > 0
                    && Dictionary::decode(
                        &pkt.data()[dictionary_start..dictionary_start + dictionary_len],
                    )
                    .is_err()
                {
                    self.drop_hello(
                        0x7cd4_1a2f,
                        packet_id,
                        Some(&identity),
                        path,
                        hops,
                        DropReason::InvalidObject,
                    );
                    return;
                }
            }
        }

        // The second authentication layer is not optional for modern peers.
        if !hmac_verified && protocol >= PROTOCOL_VERSION_HMAC_REQUIRED {
            self.drop_hello(
                0xe210_c6b5,
                packet_id,
                Some(&identity),
                path,
                hops,
                DropReason::MacFailed,
            );
            return;
        }

        if peer.is_none() {
            if !self
                .env
                .node
                .rate_gate_identity_verification(now, path.address())
            {
                self.drop_hello(
                    0x57a8_f143,
                    packet_id,
                    Some(&identity),
                    path,
                    hops,
                    DropReason::RateLimitExceeded,
                );
                return;
            }
            if !identity.locally_validate() {
                self.drop_hello(
                    0x8f01_bd6c,
                    packet_id,
                    Some(&identity),
                    path,
                    hops,
                    DropReason::InvalidObject,
                );
                return;
            }
            let admitted = Arc::new(Peer::new(identity.clone(), key.clone()));
            peer = Some(self.env.topology.add_peer(admitted));
        }
        let peer = match peer {
            Some(peer) => peer,
            None => return,
        };

        if hops == 0 {
            if let Some(surface) = surface {
                self.env.self_awareness.iam(
                    &identity,
                    path.local_socket(),
                    path.address(),
                    surface,
                    self.env.topology.is_root(&identity),
                    now,
                );
            }
        }

        let reply = build_ok_hello(
            &self.env.identity,
            &identity,
            &key,
            packet_id,
            &timestamp,
            protocol,
            path.address(),
            &self.env.node_metadata,
        );
        if let Some(reply) = reply {
            path.send(&reply, now);
        }

        peer.set_remote_version(RemoteVersion {
            protocol,
            major,
            minor,
            revision,
        });
        peer.received(path, hops, packet_id, Verb::Hello, now);
        self.peer_resolved(identity.address(), now);
    }

    fn drop_hello(
        &self,
        code: u32,
        packet_id: u64,
        identity: Option<&Identity>,
        path: &Arc<Path>,
        hops: u8,
        reason: DropReason,
    ) {
        self.env.tracer.incoming_packet_dropped(
            code,
            packet_id,
            0,
            identity,
            Some(path.address()),
            hops,
            Verb::Hello,
            reason,
        );
    }
}

/// Build an armored HELLO announcing `our` identity to `destination`.
///
/// `key` is the pairwise key already agreed with the destination; the packet
/// is authenticated with `POLY1305_NONE` so the receiver can check it before
/// it knows us.
pub fn build_hello(
    our: &Identity,
    destination: Address,
    key: &SymmetricKey,
    surface: Option<&SocketAddr>,
    metadata: &Dictionary,
    timestamp: i64,
) -> Option<Vec<u8>> {
    let mut out = vec![0u8; HEADER_SIZE];
    write_header(
        &mut out,
        next_packet_id(),
        destination,
        our.address(),
        0,
        Verb::Hello,
    )
    .ok()?;
    out.push(PROTOCOL_VERSION);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    out.extend_from_slice(&VERSION_REVISION.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    our.to_wire(&mut out);
    encode_endpoint(surface, &mut out);

    let trailer_start = out.len();
    out.extend_from_slice(&0u16.to_be_bytes());
    let dictionary = metadata.encode();
    out.extend_from_slice(&(dictionary.len() as u16).to_be_bytes());
    out.extend_from_slice(&dictionary);
    out.extend_from_slice(&0u16.to_be_bytes());

    let hmac_key = kbkdf_hmac_sha384(key, KDF_LABEL_HELLO_HMAC, 0, 0);
    let hmac = hmac_sha384(hmac_key.as_bytes(), &out[ENCRYPTED_SECTION_START..]);
    out.extend_from_slice(&hmac);
    if out.len() > MAX_PACKET_LENGTH {
        return None;
    }

    let iv = trailer_iv(&out);
    let end = out.len();
    crypt_section(key, &iv, &mut out[trailer_start..end]);

    armor(&mut out, key, CipherSuite::Poly1305None).ok()?;
    Some(out)
}

/// Build the armored OK reply to a HELLO.
#[allow(clippy::too_many_arguments)]
fn build_ok_hello(
    our: &Identity,
    their: &Identity,
    key: &SymmetricKey,
    in_re_packet_id: u64,
    timestamp_echo: &[u8; 8],
    their_protocol: u8,
    observed_addr: SocketAddr,
    metadata: &Dictionary,
) -> Option<Vec<u8>> {
    let mut out = vec![0u8; HEADER_SIZE];
    write_header(
        &mut out,
        next_packet_id(),
        their.address(),
        our.address(),
        0,
        Verb::Ok,
    )
    .ok()?;
    out.push(Verb::Hello.code());
    out.extend_from_slice(&in_re_packet_id.to_be_bytes());
    out.extend_from_slice(timestamp_echo);
    out.push(PROTOCOL_VERSION);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    out.extend_from_slice(&VERSION_REVISION.to_be_bytes());
    encode_endpoint(Some(&observed_addr), &mut out);

    if their_protocol >= PROTOCOL_VERSION_HMAC_REQUIRED {
        out.extend_from_slice(&0u16.to_be_bytes());
        let dictionary = metadata.encode();
        out.extend_from_slice(&(dictionary.len() as u16).to_be_bytes());
        out.extend_from_slice(&dictionary);
        out.extend_from_slice(&0u16.to_be_bytes());

        if out.len() + HMAC_SHA384_LENGTH > MAX_PACKET_LENGTH {
            return None;
        }
        let hmac_key = kbkdf_hmac_sha384(key, KDF_LABEL_HELLO_HMAC, 0, 1);
        let hmac = hmac_sha384(hmac_key.as_bytes(), &out[OK_HEADER_LENGTH..]);
        out.extend_from_slice(&hmac);
    }

    armor(&mut out, key, CipherSuite::Poly1305Salsa2012).ok()?;
    Some(out)
}

/// Decoded OK(HELLO) reply body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkHello {
    pub in_re_packet_id: u64,
    pub timestamp_echo: u64,
    pub protocol: u8,
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub observed_addr: Option<SocketAddr>,
}

/// Parse a dearmored OK(HELLO). Returns `None` for anything structurally
/// wrong; HMAC verification is the caller's business.
pub fn parse_ok_hello(data: &[u8]) -> Option<OkHello> {
    if data.len() < OK_HEADER_LENGTH + 13 || data.get(HEADER_SIZE).copied()? != Verb::Hello.code() {
        return None;
    }
    let in_re_packet_id = u64::from_be_bytes(data[HEADER_SIZE + 1..OK_HEADER_LENGTH].try_into().ok()?);
    let at = OK_HEADER_LENGTH;
    let timestamp_echo = u64::from_be_bytes(data[at..at + 8].try_into().ok()?);
    let protocol = data[at + 8];
    let major = data[at + 9];
    let minor = data[at + 10];
    let revision = u16::from_be_bytes([data[at + 11], data[at + 12]]);
    let mut cursor = &data[at + 13..];
    let observed_addr = decode_endpoint(&mut cursor).ok()?;
    Some(OkHello {
        in_re_packet_id,
        timestamp_echo,
        protocol,
        major,
        minor,
        revision,
        observed_addr,
    })
}
