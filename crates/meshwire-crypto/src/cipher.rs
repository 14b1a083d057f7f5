//! Per-packet Salsa20/12 + Poly1305 primitives.
//!
//! Each packet is protected under a key derived from the long-term pairwise
//! key and the packet header, so a valid MAC also proves knowledge of the
//! long-term key. The keystream is partitioned: the first 32 bytes become the
//! one-time Poly1305 key, and payload bytes are enciphered starting at
//! keystream offset [`PAYLOAD_KEYSTREAM_OFFSET`]. Payload offsets are
//! absolute, which lets the caller decrypt a packet slice by slice.

use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::{Block, Poly1305};
use salsa20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use salsa20::Salsa12;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Length of a long-term pairwise key.
pub const SECRET_KEY_LENGTH: usize = 48;

/// Length of the one-time Poly1305 key taken from the keystream head.
pub const POLY1305_KEY_LENGTH: usize = 32;

/// Length of a full Poly1305 tag; packets carry the low 8 bytes.
pub const POLY1305_MAC_LENGTH: usize = 16;

/// Salsa20 block size; slice decryption is seeked in these units.
pub const SALSA20_BLOCK_SIZE: usize = 64;

/// Keystream offset at which payload encipherment begins. Block 0 is
/// reserved for the MAC key.
pub const PAYLOAD_KEYSTREAM_OFFSET: u64 = 64;

/// A long-term pairwise symmetric key. Zeroed on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SymmetricKey([u8; SECRET_KEY_LENGTH]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_LENGTH]) -> Self {
        SymmetricKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Derive the per-packet key: the long-term key XORed with the packet id,
/// destination, and source bytes, the flags byte with its mutable bits
/// masked (hop count and the fragmented bit both change between armoring
/// and dearmoring), and the packet's total size.
///
/// `header` must hold at least the first 19 packet bytes.
pub fn derive_packet_key(
    long_term: &SymmetricKey,
    header: &[u8],
    packet_size: usize,
) -> Option<SymmetricKey> {
    if header.len() < 19 {
        return None;
    }
    let mut out = *long_term.as_bytes();
    for i in 0..18 {
        out[i] ^= header[i];
    }
    out[18] ^= header[18] & 0xb8;
    out[19] ^= packet_size as u8;
    out[20] ^= (packet_size >> 8) as u8;
    Some(SymmetricKey(out))
}

fn stream(key: &SymmetricKey, iv: &[u8; 8]) -> Salsa12 {
    let mut salsa_key = [0u8; 32];
    salsa_key.copy_from_slice(&key.as_bytes()[..32]);
    let cipher = Salsa12::new(&salsa_key.into(), iv.into());
    salsa_key.zeroize();
    cipher
}

/// One-time Poly1305 key for a packet: the first 32 keystream bytes.
pub fn packet_mac_key(key: &SymmetricKey, iv: &[u8; 8]) -> [u8; POLY1305_KEY_LENGTH] {
    let mut out = [0u8; POLY1305_KEY_LENGTH];
    stream(key, iv).apply_keystream(&mut out);
    out
}

/// Encipher or decipher payload bytes in place. `payload_offset` is the byte
/// distance from the start of the packet's encrypted section.
pub fn crypt_payload(key: &SymmetricKey, iv: &[u8; 8], payload_offset: u64, data: &mut [u8]) {
    let mut cipher = stream(key, iv);
    cipher.seek(PAYLOAD_KEYSTREAM_OFFSET + payload_offset);
    cipher.apply_keystream(data);
}

/// Decipher `src` into `dst` without touching `src`. Offsets as in
/// [`crypt_payload`]. Returns false if the lengths differ.
pub fn crypt_payload_into(
    key: &SymmetricKey,
    iv: &[u8; 8],
    payload_offset: u64,
    src: &[u8],
    dst: &mut [u8],
) -> bool {
    if src.len() != dst.len() {
        return false;
    }
    let mut cipher = stream(key, iv);
    cipher.seek(PAYLOAD_KEYSTREAM_OFFSET + payload_offset);
    cipher.apply_keystream_b2b(src, dst).is_ok()
}

/// Raw Salsa20/12 over an arbitrary IV, used for the HELLO trailing section
/// (which is keyed directly by the long-term key, not a per-packet key).
pub fn crypt_section(key: &SymmetricKey, iv: &[u8; 8], data: &mut [u8]) {
    stream(key, iv).apply_keystream(data);
}

/// Incremental Poly1305 over non-contiguous input.
///
/// The RustCrypto hasher consumes whole 16-byte blocks; this carries the
/// partial block across `update` calls so a packet spread over several slices
/// MACs identically to its concatenation.
pub struct PacketMac {
    state: Poly1305,
    pending: [u8; POLY1305_MAC_LENGTH],
    pending_len: usize,
}

impl PacketMac {
    pub fn new(key: &[u8; POLY1305_KEY_LENGTH]) -> Self {
        PacketMac {
            state: Poly1305::new(key.into()),
            pending: [0u8; POLY1305_MAC_LENGTH],
            pending_len: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = data.len().min(POLY1305_MAC_LENGTH - self.pending_len);
            self.pending[self.pending_len..self.pending_len + take]
                .copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < POLY1305_MAC_LENGTH {
                return;
            }
            self.state.update(&[Block::from(self.pending)]);
            self.pending_len = 0;
        }
        let full = data.len() - data.len() % POLY1305_MAC_LENGTH;
        for chunk in data[..full].chunks_exact(POLY1305_MAC_LENGTH) {
            self.state.update(&[Block::clone_from_slice(chunk)]);
        }
        let rest = &data[full..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    pub fn finalize(self) -> [u8; POLY1305_MAC_LENGTH] {
        self.state
            .compute_unpadded(&self.pending[..self.pending_len])
            .into()
    }
}

/// One-shot Poly1305 over contiguous input.
pub fn packet_mac(key: &[u8; POLY1305_KEY_LENGTH], data: &[u8]) -> [u8; POLY1305_MAC_LENGTH] {
    Poly1305::new(key.into()).compute_unpadded(data).into()
}

/// Constant-time equality for MAC and HMAC comparison.
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
