//! On-wire packet and fragment layouts.
//!
//! Every datagram is either a whole packet (or the head of a fragmented one),
//! beginning with a 28-byte [`PacketHeader`], or a continuation fragment,
//! beginning with a 16-byte [`FragmentHeader`]. The two are distinguished by
//! the byte at [`FRAGMENT_INDICATOR_INDEX`]: a packet header carries the first
//! source-address byte there, and source addresses never start with `0xff`.
//!
//! All multi-byte integers are big-endian.

use crate::address::{Address, ADDRESS_LENGTH};
use crate::verb::{Verb, VERB_FLAG_COMPRESSED};
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, RngCore};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Maximum size of a fully reassembled packet.
pub const MAX_PACKET_LENGTH: usize = 16384;

/// Size of the packet header; also the minimum size of a whole packet.
pub const HEADER_SIZE: usize = 28;
pub const MIN_PACKET_LENGTH: usize = HEADER_SIZE;

/// Size of a fragment header; datagrams shorter than this are keepalives.
pub const FRAGMENT_HEADER_SIZE: usize = 16;
pub const MIN_FRAGMENT_LENGTH: usize = FRAGMENT_HEADER_SIZE;

/// Offset of the fragment indicator byte (first source-address byte in a
/// packet header).
pub const FRAGMENT_INDICATOR_INDEX: usize = 13;
pub const FRAGMENT_INDICATOR: u8 = 0xff;

/// Offset at which the authenticated (and, for the encrypting cipher suite,
/// encrypted) section begins: the verb byte and everything after it.
pub const ENCRYPTED_SECTION_START: usize = 27;

/// Offset of the first payload byte after the verb.
pub const PAYLOAD_START: usize = HEADER_SIZE;

/// Most fragments a single packet may be split into.
pub const MAX_FRAGMENTS: usize = 16;

/// In-flight fragment budget for a single path before the oldest assembly
/// on that path is evicted.
pub const MAX_INCOMING_FRAGMENTS_PER_PATH: usize = 32;

pub const FLAG_FRAGMENTED: u8 = 0x40;
pub const FLAGS_HOPS_MASK: u8 = 0x07;
pub const FLAGS_CIPHER_SHIFT: u8 = 3;
pub const FLAGS_CIPHER_MASK: u8 = 0x03;
pub const MAX_HOPS: u8 = 7;

// Field offsets within the packet header.
pub const IDX_PACKET_ID: usize = 0;
pub const IDX_DESTINATION: usize = 8;
pub const IDX_SOURCE: usize = 13;
pub const IDX_FLAGS: usize = 18;
pub const IDX_MAC: usize = 19;
pub const IDX_VERB: usize = 27;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short for header")]
    Truncated,
    #[error("endpoint encoding is not recognized")]
    BadEndpoint,
    #[error("packet exceeds protocol size limits")]
    TooLong,
}

/// Decoded view of the fixed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_id: u64,
    pub destination: Address,
    pub source: Address,
    pub flags: u8,
    pub mac: [u8; 8],
    pub verb_byte: u8,
}

impl PacketHeader {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[IDX_PACKET_ID..IDX_PACKET_ID + 8]);
        let mut mac = [0u8; 8];
        mac.copy_from_slice(&data[IDX_MAC..IDX_MAC + 8]);
        Ok(PacketHeader {
            packet_id: u64::from_be_bytes(id),
            destination: Address::from_bytes(&data[IDX_DESTINATION..]).ok_or(WireError::Truncated)?,
            source: Address::from_bytes(&data[IDX_SOURCE..]).ok_or(WireError::Truncated)?,
            flags: data[IDX_FLAGS],
            mac,
            verb_byte: data[IDX_VERB],
        })
    }

    pub fn hops(&self) -> u8 {
        self.flags & FLAGS_HOPS_MASK
    }

    pub fn cipher_code(&self) -> u8 {
        (self.flags >> FLAGS_CIPHER_SHIFT) & FLAGS_CIPHER_MASK
    }

    pub fn is_fragmented(&self) -> bool {
        self.flags & FLAG_FRAGMENTED != 0
    }

    pub fn verb(&self) -> Verb {
        Verb::from_wire(self.verb_byte)
    }

    pub fn is_compressed(&self) -> bool {
        self.verb_byte & VERB_FLAG_COMPRESSED != 0
    }

    /// Trusted-path id carried in the MAC field by the `NONE` cipher suite.
    pub fn trusted_path_id(&self) -> u64 {
        u64::from_be_bytes(self.mac)
    }
}

/// Decoded view of a fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub packet_id: u64,
    pub destination: Address,
    pub fragment_no: u8,
    pub total_fragments: u8,
    pub hops: u8,
}

impl FragmentHeader {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < FRAGMENT_HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[0..8]);
        let counts = data[14];
        Ok(FragmentHeader {
            packet_id: u64::from_be_bytes(id),
            destination: Address::from_bytes(&data[8..]).ok_or(WireError::Truncated)?,
            fragment_no: counts & 0x0f,
            total_fragments: counts >> 4,
            hops: data[15] & FLAGS_HOPS_MASK,
        })
    }
}

/// Write a packet header into the first [`HEADER_SIZE`] bytes of `out`.
/// The MAC field is zeroed; armoring fills it in.
pub fn write_header(
    out: &mut [u8],
    packet_id: u64,
    destination: Address,
    source: Address,
    flags: u8,
    verb: Verb,
) -> Result<(), WireError> {
    if out.len() < HEADER_SIZE {
        return Err(WireError::Truncated);
    }
    out[IDX_PACKET_ID..IDX_PACKET_ID + 8].copy_from_slice(&packet_id.to_be_bytes());
    destination.copy_to(&mut out[IDX_DESTINATION..]);
    source.copy_to(&mut out[IDX_SOURCE..]);
    out[IDX_FLAGS] = flags;
    out[IDX_MAC..IDX_MAC + 8].fill(0);
    out[IDX_VERB] = verb.code();
    Ok(())
}

/// Split an assembled (and already armored) packet into wire datagrams no
/// larger than `mtu`: the head keeps the packet header with
/// [`FLAG_FRAGMENTED`] set, and every continuation gets a fragment header
/// carrying the index and total count.
///
/// Returns `None` if the packet cannot be carried in [`MAX_FRAGMENTS`]
/// datagrams of the given size.
pub fn fragment_packet(packet: &[u8], mtu: usize) -> Option<Vec<Vec<u8>>> {
    if packet.len() < HEADER_SIZE || mtu <= FRAGMENT_HEADER_SIZE || mtu <= HEADER_SIZE {
        return None;
    }
    if packet.len() <= mtu {
        return Some(vec![packet.to_vec()]);
    }

    let head_len = mtu;
    let chunk = mtu - FRAGMENT_HEADER_SIZE;
    let rest = packet.len() - head_len;
    let total = 1 + rest.div_ceil(chunk);
    if total > MAX_FRAGMENTS {
        return None;
    }

    let mut out = Vec::with_capacity(total);
    let mut head = packet[..head_len].to_vec();
    head[IDX_FLAGS] |= FLAG_FRAGMENTED;
    out.push(head);

    let mut offset = head_len;
    let mut index = 1u8;
    while offset < packet.len() {
        let end = (offset + chunk).min(packet.len());
        let mut frag = Vec::with_capacity(FRAGMENT_HEADER_SIZE + (end - offset));
        frag.extend_from_slice(&packet[IDX_PACKET_ID..IDX_PACKET_ID + 8]);
        frag.extend_from_slice(&packet[IDX_DESTINATION..IDX_DESTINATION + ADDRESS_LENGTH]);
        frag.push(FRAGMENT_INDICATOR);
        frag.push(((total as u8) << 4) | index);
        frag.push(packet[IDX_FLAGS] & FLAGS_HOPS_MASK);
        frag.extend_from_slice(&packet[offset..end]);
        out.push(frag);
        offset = end;
        index += 1;
    }
    Some(out)
}

static PACKET_ID_COUNTER: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(OsRng.next_u64()));

/// Produce a packet id. Ids are unique within a process lifetime (a randomly
/// seeded counter); they double as the stream-cipher IV, so reuse under the
/// same key would be a confidentiality failure.
pub fn next_packet_id() -> u64 {
    PACKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet(len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; len];
        write_header(
            &mut pkt,
            0x0102_0304_0506_0708,
            Address::from_u64(0xaa_bbcc_ddee),
            Address::from_u64(0x11_2233_4455),
            0,
            Verb::Frame,
        )
        .expect("header");
        for (i, b) in pkt.iter_mut().enumerate().skip(PAYLOAD_START) {
            *b = i as u8;
        }
        pkt
    }

    #[test]
    fn header_roundtrip() {
        let pkt = sample_packet(64);
        let header = PacketHeader::parse(&pkt).expect("parse");
        assert_eq!(header.packet_id, 0x0102_0304_0506_0708);
        assert_eq!(header.destination, Address::from_u64(0xaa_bbcc_ddee));
        assert_eq!(header.source, Address::from_u64(0x11_2233_4455));
        assert_eq!(header.verb(), Verb::Frame);
        assert!(!header.is_fragmented());
        assert!(!header.is_compressed());
    }

    #[test]
    fn rejects_short_header() {
        assert_eq!(
            PacketHeader::parse(&[0u8; HEADER_SIZE - 1]),
            Err(WireError::Truncated)
        );
    }

    #[test]
    fn fragment_header_fields() {
        let pkt = sample_packet(2000);
        let frags = fragment_packet(&pkt, 700).expect("fragment");
        assert_eq!(frags.len(), 3);

        let head = PacketHeader::parse(&frags[0]).expect("head");
        assert!(head.is_fragmented());

        for (i, frag) in frags.iter().enumerate().skip(1) {
            assert_eq!(frag[FRAGMENT_INDICATOR_INDEX], FRAGMENT_INDICATOR);
            let fh = FragmentHeader::parse(frag).expect("fragment header");
            assert_eq!(fh.packet_id, head.packet_id);
            assert_eq!(fh.destination, head.destination);
            assert_eq!(fh.fragment_no as usize, i);
            assert_eq!(fh.total_fragments as usize, frags.len());
        }
    }

    #[test]
    fn fragments_reassemble_to_original() {
        let pkt = sample_packet(2000);
        let frags = fragment_packet(&pkt, 700).expect("fragment");
        let mut rebuilt = frags[0].clone();
        rebuilt[IDX_FLAGS] &= !FLAG_FRAGMENTED;
        for frag in &frags[1..] {
            rebuilt.extend_from_slice(&frag[FRAGMENT_HEADER_SIZE..]);
        }
        assert_eq!(rebuilt, pkt);
    }

    #[test]
    fn oversized_fragmentation_is_refused() {
        let pkt = sample_packet(MAX_PACKET_LENGTH);
        assert!(fragment_packet(&pkt, 100).is_none());
    }

    #[test]
    fn packet_ids_are_distinct() {
        let a = next_packet_id();
        let b = next_packet_id();
        assert_ne!(a, b);
    }
}
