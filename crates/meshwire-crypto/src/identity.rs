//! Node identities.
//!
//! An identity binds a 40-bit address to an x25519 public key: the address is
//! the head of the key's SHA-384 digest, so anyone can check the binding and
//! nobody can claim an address without producing a matching key. Two nodes
//! derive their long-term pairwise key by x25519 agreement expanded through
//! HKDF-SHA-384.

use crate::cipher::{SymmetricKey, SECRET_KEY_LENGTH};
use bytes::Buf;
use hkdf::Hkdf;
use meshwire_proto::{Address, ADDRESS_LENGTH};
use rand::rngs::OsRng;
use sha2::{Digest, Sha384};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Wire type byte for x25519 identities.
pub const IDENTITY_TYPE_X25519: u8 = 1;

pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Serialized identity length: address + type byte + public key.
pub const IDENTITY_WIRE_LENGTH: usize = ADDRESS_LENGTH + 1 + PUBLIC_KEY_LENGTH;

const AGREEMENT_INFO: &[u8] = b"meshwire vl1 pairwise key";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is truncated")]
    Truncated,
    #[error("unsupported identity type {0}")]
    UnsupportedType(u8),
    #[error("identity has no private key")]
    MissingSecret,
    #[error("key agreement produced a degenerate secret")]
    DegenerateSecret,
}

/// A node identity; may or may not carry the private half.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    public: [u8; PUBLIC_KEY_LENGTH],
    secret: Option<StaticSecret>,
}

impl Identity {
    /// Generate a fresh identity with its private key.
    pub fn generate() -> Identity {
        loop {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret).to_bytes();
            let address = derive_address(&public);
            if address.is_valid() {
                return Identity {
                    address,
                    public,
                    secret: Some(secret),
                };
            }
        }
    }

    /// The nil sentinel used where no identity is known.
    pub fn nil() -> Identity {
        Identity {
            address: Address::NIL,
            public: [0u8; PUBLIC_KEY_LENGTH],
            secret: None,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.address.is_nil()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.public
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// The public half only, for storing or forwarding.
    pub fn public_only(&self) -> Identity {
        Identity {
            address: self.address,
            public: self.public,
            secret: None,
        }
    }

    /// Check the address/key binding. This is the expensive first-contact
    /// validation; callers rate-limit it.
    pub fn locally_validate(&self) -> bool {
        self.address.is_valid() && derive_address(&self.public) == self.address
    }

    /// Derive the long-term pairwise key with `other`. Requires our private
    /// key; rejects degenerate (non-contributory) exchanges.
    pub fn agree(&self, other: &Identity) -> Result<SymmetricKey, IdentityError> {
        let secret = self.secret.as_ref().ok_or(IdentityError::MissingSecret)?;
        let shared = secret.diffie_hellman(&PublicKey::from(other.public));
        if !shared.was_contributory() {
            return Err(IdentityError::DegenerateSecret);
        }
        let mut okm = [0u8; SECRET_KEY_LENGTH];
        Hkdf::<Sha384>::new(None, shared.as_bytes())
            .expand(AGREEMENT_INFO, &mut okm)
            .map_err(|_| IdentityError::DegenerateSecret)?;
        Ok(SymmetricKey::from_bytes(okm))
    }

    pub fn to_wire(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_bytes());
        out.push(IDENTITY_TYPE_X25519);
        out.extend_from_slice(&self.public);
    }

    /// Decode an identity, advancing `buf` past it. The binding is not
    /// validated here; call [`Identity::locally_validate`] before trusting
    /// a first-contact identity.
    pub fn from_wire(buf: &mut &[u8]) -> Result<Identity, IdentityError> {
        if buf.remaining() < IDENTITY_WIRE_LENGTH {
            return Err(IdentityError::Truncated);
        }
        let mut addr_bytes = [0u8; ADDRESS_LENGTH];
        buf.copy_to_slice(&mut addr_bytes);
        let address = Address::from_bytes(&addr_bytes).ok_or(IdentityError::Truncated)?;
        let kind = buf.get_u8();
        if kind != IDENTITY_TYPE_X25519 {
            return Err(IdentityError::UnsupportedType(kind));
        }
        let mut public = [0u8; PUBLIC_KEY_LENGTH];
        buf.copy_to_slice(&mut public);
        Ok(Identity {
            address,
            public,
            secret: None,
        })
    }
}

fn derive_address(public: &[u8; PUBLIC_KEY_LENGTH]) -> Address {
    let digest = Sha384::digest(public);
    Address::from_bytes(&digest).unwrap_or(Address::NIL)
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.public == other.public
    }
}

impl Eq for Identity {}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_validates() {
        let id = Identity::generate();
        assert!(id.has_secret());
        assert!(id.locally_validate());
        assert!(!Identity::nil().locally_validate());
    }

    #[test]
    fn wire_roundtrip_drops_secret() {
        let id = Identity::generate();
        let mut wire = Vec::new();
        id.to_wire(&mut wire);
        assert_eq!(wire.len(), IDENTITY_WIRE_LENGTH);

        let mut cursor = wire.as_slice();
        let decoded = Identity::from_wire(&mut cursor).expect("decode");
        assert!(cursor.is_empty());
        assert_eq!(decoded, id);
        assert!(!decoded.has_secret());
        assert!(decoded.locally_validate());
    }

    #[test]
    fn tampered_binding_fails_validation() {
        let id = Identity::generate();
        let mut wire = Vec::new();
        id.to_wire(&mut wire);
        wire[0] ^= 0x01; // perturb the address
        let decoded = Identity::from_wire(&mut wire.as_slice()).expect("decode");
        assert!(!decoded.locally_validate());
    }

    #[test]
    fn agreement_is_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        let k_ab = a.agree(&b.public_only()).expect("a->b");
        let k_ba = b.agree(&a.public_only()).expect("b->a");
        assert_eq!(k_ab.as_bytes(), k_ba.as_bytes());

        let c = Identity::generate();
        let k_ac = a.agree(&c).expect("a->c");
        assert_ne!(k_ab.as_bytes(), k_ac.as_bytes());
    }

    #[test]
    fn agreement_requires_secret() {
        let a = Identity::generate().public_only();
        let b = Identity::generate();
        assert!(matches!(a.agree(&b), Err(IdentityError::MissingSecret)));
    }

    #[test]
    fn rejects_unknown_wire_type() {
        let id = Identity::generate();
        let mut wire = Vec::new();
        id.to_wire(&mut wire);
        wire[ADDRESS_LENGTH] = 9;
        assert_eq!(
            Identity::from_wire(&mut wire.as_slice()),
            Err(IdentityError::UnsupportedType(9))
        );
    }
}
