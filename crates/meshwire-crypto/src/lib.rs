//! Cryptographic primitives for the Meshwire VL1 transport: the per-packet
//! Salsa20/12 + Poly1305 armor construction, the HMAC-SHA-384 key derivation
//! used by the HELLO exchange, and address-bound node identities.
//!
//! These are building blocks; the cipher-suite logic that applies them to
//! whole packets lives in `meshwire-node`.

pub mod cipher;
pub mod identity;
pub mod kdf;

pub use cipher::{
    crypt_payload, crypt_payload_into, crypt_section, derive_packet_key, packet_mac,
    packet_mac_key, secure_eq, PacketMac, SymmetricKey, PAYLOAD_KEYSTREAM_OFFSET,
    POLY1305_KEY_LENGTH, POLY1305_MAC_LENGTH, SALSA20_BLOCK_SIZE, SECRET_KEY_LENGTH,
};
pub use identity::{Identity, IdentityError, IDENTITY_TYPE_X25519, IDENTITY_WIRE_LENGTH};
pub use kdf::{hmac_sha384, kbkdf_hmac_sha384, HmacSha384, HMAC_SHA384_LENGTH, KDF_LABEL_HELLO_HMAC};
