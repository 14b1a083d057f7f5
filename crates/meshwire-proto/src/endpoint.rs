//! Compact socket-address encoding used inside HELLO and OK bodies.
//!
//! Type byte (`0` none, `4` IPv4, `6` IPv6), raw address bytes, then the
//! port big-endian.

use crate::wire::WireError;
use bytes::Buf;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const ENDPOINT_TYPE_NIL: u8 = 0;
pub const ENDPOINT_TYPE_IPV4: u8 = 4;
pub const ENDPOINT_TYPE_IPV6: u8 = 6;

pub fn encode_endpoint(addr: Option<&SocketAddr>, out: &mut Vec<u8>) {
    match addr {
        None => out.push(ENDPOINT_TYPE_NIL),
        Some(SocketAddr::V4(v4)) => {
            out.push(ENDPOINT_TYPE_IPV4);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            out.push(ENDPOINT_TYPE_IPV6);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

/// Decode an endpoint, advancing `buf` past it.
pub fn decode_endpoint(buf: &mut &[u8]) -> Result<Option<SocketAddr>, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated);
    }
    match buf.get_u8() {
        ENDPOINT_TYPE_NIL => Ok(None),
        ENDPOINT_TYPE_IPV4 => {
            if buf.remaining() < 6 {
                return Err(WireError::Truncated);
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(Some(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(octets)),
                port,
            )))
        }
        ENDPOINT_TYPE_IPV6 => {
            if buf.remaining() < 18 {
                return Err(WireError::Truncated);
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            let port = buf.get_u16();
            Ok(Some(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        _ => Err(WireError::BadEndpoint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: Option<SocketAddr>) {
        let mut out = Vec::new();
        encode_endpoint(addr.as_ref(), &mut out);
        let mut cursor = out.as_slice();
        assert_eq!(decode_endpoint(&mut cursor).expect("decode"), addr);
        assert!(cursor.is_empty());
    }

    #[test]
    fn roundtrips_all_forms() {
        roundtrip(None);
        roundtrip(Some("192.0.2.7:9993".parse().expect("v4")));
        roundtrip(Some("[2001:db8::1]:4000".parse().expect("v6")));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut cursor: &[u8] = &[9u8, 0, 0];
        assert_eq!(
            decode_endpoint(&mut cursor),
            Err(WireError::BadEndpoint)
        );
    }

    #[test]
    fn rejects_truncation() {
        let mut cursor: &[u8] = &[ENDPOINT_TYPE_IPV4, 1, 2];
        assert_eq!(decode_endpoint(&mut cursor), Err(WireError::Truncated));
    }
}
