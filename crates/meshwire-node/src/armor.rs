//! Cipher-suite authentication and decryption of whole packets.
//!
//! The MAC construction is encrypt-then-MAC: the Poly1305 tag covers the
//! wire bytes of the encrypted section (ciphertext under
//! `POLY1305_SALSA2012`, plaintext under `POLY1305_NONE`), keyed by the head
//! of the per-packet keystream. Dearmoring a fragmented packet never builds a
//! contiguous ciphertext copy: slices are first nudged onto 64-byte cipher
//! block boundaries (the headroom every pool buffer reserves exists for this
//! shift), then deciphered slice by slice straight into the output buffer,
//! and the tag is checked against the ciphertext still held by the slices.

use meshwire_crypto::{
    crypt_payload, crypt_payload_into, derive_packet_key, packet_mac, packet_mac_key, secure_eq,
    PacketMac, SymmetricKey, SALSA20_BLOCK_SIZE,
};
use meshwire_proto::wire::{IDX_FLAGS, IDX_MAC};
use meshwire_proto::{
    BufPool, Slice, SliceVector, ENCRYPTED_SECTION_START, FLAG_FRAGMENTED, HEADER_SIZE,
    MAX_PACKET_LENGTH, MIN_PACKET_LENGTH,
};
use thiserror::Error;

/// Recognized cipher suites, encoded in bits 3-4 of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// Poly1305 authentication over a plaintext payload.
    Poly1305None,
    /// Poly1305 authentication with a Salsa20/12-enciphered payload.
    Poly1305Salsa2012,
    /// No cryptography; authorization comes from a trusted-path id.
    TrustedNone,
}

impl CipherSuite {
    pub fn from_code(code: u8) -> Option<CipherSuite> {
        match code {
            0 => Some(CipherSuite::Poly1305None),
            1 => Some(CipherSuite::Poly1305Salsa2012),
            2 => Some(CipherSuite::TrustedNone),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            CipherSuite::Poly1305None => 0,
            CipherSuite::Poly1305Salsa2012 => 1,
            CipherSuite::TrustedNone => 2,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArmorError {
    #[error("packet MAC verification failed")]
    MacFailed,
    #[error("buffer pool exhausted")]
    OutOfMemory,
    #[error("packet too short to armor")]
    TooShort,
    #[error("packet exceeds protocol size limits")]
    TooLong,
}

fn iv_of(packet: &[u8]) -> [u8; 8] {
    let mut iv = [0u8; 8];
    iv.copy_from_slice(&packet[..8]);
    iv
}

/// Verify the Poly1305 tag of a contiguous, plaintext-payload packet.
pub fn verify_poly1305_none(packet: &[u8], key: &SymmetricKey) -> Result<(), ArmorError> {
    if packet.len() < MIN_PACKET_LENGTH {
        return Err(ArmorError::TooShort);
    }
    let per_packet = derive_packet_key(key, packet, packet.len()).ok_or(ArmorError::TooShort)?;
    let mac_key = packet_mac_key(&per_packet, &iv_of(packet));
    let tag = packet_mac(&mac_key, &packet[ENCRYPTED_SECTION_START..]);
    if secure_eq(&tag[..8], &packet[IDX_MAC..IDX_MAC + 8]) {
        Ok(())
    } else {
        Err(ArmorError::MacFailed)
    }
}

/// Authenticate and decrypt a (possibly fragmented) `POLY1305_SALSA2012`
/// packet into a fresh contiguous slice.
pub fn dearmor_salsa2012(
    mut pktv: SliceVector,
    pool: &BufPool,
    key: &SymmetricKey,
) -> Result<Slice, ArmorError> {
    let packet_size = pktv.total_len();
    if packet_size > MAX_PACKET_LENGTH {
        return Err(ArmorError::TooLong);
    }
    let head_len = pktv.first().map(Slice::len).unwrap_or(0);
    if head_len < HEADER_SIZE {
        return Err(ArmorError::TooShort);
    }

    pktv.align_to_blocks(SALSA20_BLOCK_SIZE);

    let head = match pktv.first() {
        Some(head) => head.data(),
        None => return Err(ArmorError::TooShort),
    };
    let per_packet = derive_packet_key(key, head, packet_size).ok_or(ArmorError::TooShort)?;
    let iv = iv_of(head);
    let mac_key = packet_mac_key(&per_packet, &iv);
    let wire_mac: [u8; 8] = head[IDX_MAC..IDX_MAC + 8]
        .try_into()
        .map_err(|_| ArmorError::TooShort)?;

    let mut out = pool.get().ok_or(ArmorError::OutOfMemory)?;
    {
        let out_bytes = out.bytes_mut();
        let mut at = 0usize;
        for (i, slice) in pktv.iter().enumerate() {
            let data = if i == 0 {
                out_bytes[..ENCRYPTED_SECTION_START]
                    .copy_from_slice(&slice.data()[..ENCRYPTED_SECTION_START]);
                &slice.data()[ENCRYPTED_SECTION_START..]
            } else {
                slice.data()
            };
            if !crypt_payload_into(
                &per_packet,
                &iv,
                at as u64,
                data,
                &mut out_bytes[ENCRYPTED_SECTION_START + at..ENCRYPTED_SECTION_START + at + data.len()],
            ) {
                return Err(ArmorError::TooShort);
            }
            at += data.len();
        }
    }

    // The ciphertext is still in the fragment slices; the tag covers it.
    let mut mac = PacketMac::new(&mac_key);
    for (i, slice) in pktv.iter().enumerate() {
        if i == 0 {
            mac.update(&slice.data()[ENCRYPTED_SECTION_START..]);
        } else {
            mac.update(slice.data());
        }
    }
    if !secure_eq(&mac.finalize()[..8], &wire_mac) {
        return Err(ArmorError::MacFailed);
    }

    Slice::new(out, 0, packet_size).map_err(|_| ArmorError::TooShort)
}

/// Armor an outbound packet in place: stamp the cipher bits (hop count
/// zeroed), encrypt if the suite calls for it, and write the MAC.
pub fn armor(packet: &mut [u8], key: &SymmetricKey, suite: CipherSuite) -> Result<(), ArmorError> {
    if packet.len() < MIN_PACKET_LENGTH {
        return Err(ArmorError::TooShort);
    }
    packet[IDX_FLAGS] =
        (packet[IDX_FLAGS] & FLAG_FRAGMENTED) | (suite.code() << 3);

    let size = packet.len();
    let per_packet = derive_packet_key(key, packet, size).ok_or(ArmorError::TooShort)?;
    let iv = iv_of(packet);
    let mac_key = packet_mac_key(&per_packet, &iv);

    if suite == CipherSuite::Poly1305Salsa2012 {
        crypt_payload(&per_packet, &iv, 0, &mut packet[ENCRYPTED_SECTION_START..]);
    }

    let tag = packet_mac(&mac_key, &packet[ENCRYPTED_SECTION_START..]);
    packet[IDX_MAC..IDX_MAC + 8].copy_from_slice(&tag[..8]);
    Ok(())
}

/// Stamp a cipher-`NONE` packet with its trusted-path id.
pub fn armor_trusted(packet: &mut [u8], trusted_path_id: u64) -> Result<(), ArmorError> {
    if packet.len() < MIN_PACKET_LENGTH {
        return Err(ArmorError::TooShort);
    }
    packet[IDX_FLAGS] =
        (packet[IDX_FLAGS] & FLAG_FRAGMENTED) | (CipherSuite::TrustedNone.code() << 3);
    packet[IDX_MAC..IDX_MAC + 8].copy_from_slice(&trusted_path_id.to_be_bytes());
    Ok(())
}
