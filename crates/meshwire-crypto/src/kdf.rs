//! HMAC-SHA-384 and the counter-mode key derivation used by the HELLO
//! exchange's second authentication layer.

use crate::cipher::{SymmetricKey, SECRET_KEY_LENGTH};
use hmac::{Hmac, Mac};
use sha2::Sha384;

pub type HmacSha384 = Hmac<Sha384>;

/// Output length of HMAC-SHA-384.
pub const HMAC_SHA384_LENGTH: usize = 48;

/// KBKDF label for the HELLO/OK HMAC keys. Iteration 0 keys the inbound
/// HELLO HMAC, iteration 1 the OK reply HMAC.
pub const KDF_LABEL_HELLO_HMAC: u8 = b'H';

pub fn hmac_sha384(key: &[u8], message: &[u8]) -> [u8; HMAC_SHA384_LENGTH] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha384::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Single-block NIST SP 800-108 counter-mode KBKDF over HMAC-SHA-384.
///
/// The fixed input is `iteration || "mw" || label || 0x00 || context ||
/// output bits`; one HMAC block covers the full 48-byte subkey.
pub fn kbkdf_hmac_sha384(
    key: &SymmetricKey,
    label: u8,
    context: u8,
    iteration: u32,
) -> SymmetricKey {
    let mut message = [0u8; 13];
    message[..4].copy_from_slice(&iteration.to_be_bytes());
    message[4] = b'm';
    message[5] = b'w';
    message[6] = label;
    message[7] = 0;
    message[8] = context;
    message[9..13].copy_from_slice(&((SECRET_KEY_LENGTH as u32) * 8).to_be_bytes());
    SymmetricKey::from_bytes(hmac_sha384(key.as_bytes(), &message))
}
