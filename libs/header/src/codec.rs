//! Address header frame encoding and decoding.
//!
//! Wire format:
//! - 1 byte type/flag (low nibble = address type, `0x10` = auth trailer follows)
//! - address: 4 bytes (IPv4), 16 bytes (IPv6) or 1 length byte + name (domain)
//! - 2 bytes port, big-endian
//! - 10 bytes auth trailer, only when the flag is set
//!
//! Decoding never assumes the frame is the whole buffer. The caller gets the
//! number of bytes the frame occupied and treats the rest as payload.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use sha2::{Digest, Sha256};

use crate::address::{Address, DomainName};
use crate::HeaderError;

/// Address type: IPv4.
pub const ATYP_IPV4: u8 = 0x01;

/// Address type: length-prefixed domain name.
pub const ATYP_DOMAIN: u8 = 0x03;

/// Address type: IPv6.
pub const ATYP_IPV6: u8 = 0x04;

/// Set on the type byte when an auth trailer follows the port.
pub const AUTH_FLAG: u8 = 0x10;

/// Selects the address type from the type byte.
pub const ADDRESS_MASK: u8 = 0x0F;

/// Length of the auth trailer.
pub const AUTH_TAG_LEN: usize = 10;

/// Longest possible frame: domain of 255 bytes plus trailer.
pub const MAX_HEADER_LEN: usize = 1 + 1 + 255 + 2 + AUTH_TAG_LEN;

/// Keyed primitive that produces the auth trailer over the header bytes.
pub trait HeaderAuth: Send + Sync {
    /// Compute the trailer for `header` (type byte through port).
    fn tag(&self, header: &[u8]) -> [u8; AUTH_TAG_LEN];
}

/// Trailer built from `SHA-256(key || header)` truncated to 10 bytes.
#[derive(Clone)]
pub struct KeyedSha256 {
    key: Vec<u8>,
}

impl KeyedSha256 {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl fmt::Debug for KeyedSha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedSha256")
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl HeaderAuth for KeyedSha256 {
    fn tag(&self, header: &[u8]) -> [u8; AUTH_TAG_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(header);
        let digest = hasher.finalize();

        let mut tag = [0u8; AUTH_TAG_LEN];
        tag.copy_from_slice(&digest[..AUTH_TAG_LEN]);
        tag
    }
}

/// A successfully decoded header frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Destination address.
    pub address: Address,
    /// Bytes occupied by the frame, trailer included.
    pub consumed: usize,
    /// Auth trailer, present when the flag was set.
    pub auth_tag: Option<[u8; AUTH_TAG_LEN]>,
}

impl Decoded {
    pub fn auth_flag(&self) -> bool {
        self.auth_tag.is_some()
    }

    /// Check the trailer against the frame bytes in `buf`.
    ///
    /// `buf` must be the buffer this frame was decoded from. Frames without a
    /// trailer never verify.
    pub fn verify(&self, buf: &[u8], auth: &dyn HeaderAuth) -> bool {
        let Some(tag) = self.auth_tag else {
            return false;
        };
        let Some(header_len) = self.consumed.checked_sub(AUTH_TAG_LEN) else {
            return false;
        };
        let Some(header) = buf.get(..header_len) else {
            return false;
        };

        let expected = auth.tag(header);
        expected
            .iter()
            .zip(tag.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Encoded length of a frame for `address`.
pub fn encoded_len(address: &Address, with_auth: bool) -> usize {
    let body = match address {
        Address::V4(..) => 4,
        Address::V6(..) => 16,
        Address::Domain(name, _) => 1 + name.len(),
    };
    let trailer = if with_auth { AUTH_TAG_LEN } else { 0 };
    1 + body + 2 + trailer
}

/// Encode `address` into a header frame.
///
/// With `auth` set the flag bit is raised and the trailer appended.
pub fn encode(address: &Address, auth: Option<&dyn HeaderAuth>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(address, auth.is_some()));
    let flag = if auth.is_some() { AUTH_FLAG } else { 0 };

    match address {
        Address::V4(ip, port) => {
            buf.push(ATYP_IPV4 | flag);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::V6(ip, port) => {
            buf.push(ATYP_IPV6 | flag);
            buf.extend_from_slice(&ip.octets());
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(name, port) => {
            buf.push(ATYP_DOMAIN | flag);
            // DomainName guarantees the length fits
            buf.push(name.len() as u8);
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    if let Some(auth) = auth {
        let tag = auth.tag(&buf);
        buf.extend_from_slice(&tag);
    }

    buf
}

/// Decode a header frame from the front of `buf`.
///
/// Trailing bytes are left alone; `consumed` tells where they start.
pub fn decode(buf: &[u8]) -> Result<Decoded, HeaderError> {
    let Some(&type_byte) = buf.first() else {
        return Err(HeaderError::Truncated {
            needed: 1,
            available: 0,
        });
    };

    if type_byte & !(ADDRESS_MASK | AUTH_FLAG) != 0 {
        return Err(HeaderError::UnknownAddressType(type_byte));
    }

    let (address, header_len) = match type_byte & ADDRESS_MASK {
        ATYP_IPV4 => {
            need(buf, 1 + 4 + 2)?;
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            (Address::V4(ip, port), 7)
        }
        ATYP_IPV6 => {
            need(buf, 1 + 16 + 2)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            (Address::V6(Ipv6Addr::from(octets), port), 19)
        }
        ATYP_DOMAIN => {
            need(buf, 2)?;
            let name_len = buf[1] as usize;
            let end = 2 + name_len;
            need(buf, end + 2)?;
            let name =
                std::str::from_utf8(&buf[2..end]).map_err(|_| HeaderError::InvalidDomain)?;
            let port = u16::from_be_bytes([buf[end], buf[end + 1]]);
            (Address::Domain(DomainName::new(name)?, port), end + 2)
        }
        _ => return Err(HeaderError::UnknownAddressType(type_byte)),
    };

    if type_byte & AUTH_FLAG == 0 {
        return Ok(Decoded {
            address,
            consumed: header_len,
            auth_tag: None,
        });
    }

    let consumed = header_len + AUTH_TAG_LEN;
    need(buf, consumed)?;
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&buf[header_len..consumed]);

    Ok(Decoded {
        address,
        consumed,
        auth_tag: Some(tag),
    })
}

fn need(buf: &[u8], needed: usize) -> Result<(), HeaderError> {
    if buf.len() < needed {
        return Err(HeaderError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key() -> KeyedSha256 {
        KeyedSha256::new(b"correct horse".to_vec())
    }

    #[test]
    fn test_encode_ipv4() {
        let addr = Address::V4(Ipv4Addr::new(10, 0, 0, 1), 443);
        let encoded = encode(&addr, None);

        assert_eq!(encoded, vec![ATYP_IPV4, 10, 0, 0, 1, 0x01, 0xBB]);
        assert_eq!(encoded.len(), encoded_len(&addr, false));
    }

    #[test]
    fn test_encode_domain() {
        let addr = Address::domain("example.com", 80).unwrap();
        let encoded = encode(&addr, None);

        assert_eq!(encoded[0], ATYP_DOMAIN);
        assert_eq!(encoded[1], 11);
        assert_eq!(&encoded[2..13], b"example.com");
        assert_eq!(&encoded[13..], &[0x00, 0x50]);
    }

    #[test]
    fn test_encode_with_auth() {
        let addr = Address::V6("2001:db8::2".parse().unwrap(), 8388);
        let encoded = encode(&addr, Some(&key()));

        assert_eq!(encoded[0], ATYP_IPV6 | AUTH_FLAG);
        assert_eq!(encoded.len(), 1 + 16 + 2 + AUTH_TAG_LEN);

        let decoded = decode(&encoded).unwrap();
        assert!(decoded.auth_flag());
        assert!(decoded.verify(&encoded, &key()));
        assert!(!decoded.verify(&encoded, &KeyedSha256::new(b"wrong".to_vec())));
    }

    #[test]
    fn test_verify_rejects_tampered_header() {
        let addr = Address::V4(Ipv4Addr::new(1, 2, 3, 4), 56);
        let mut encoded = encode(&addr, Some(&key()));
        encoded[4] ^= 0xFF;

        let decoded = decode(&encoded).unwrap();
        assert!(!decoded.verify(&encoded, &key()));
    }

    #[test]
    fn test_verify_hand_built_frame_shorter_than_tag() {
        let decoded = Decoded {
            address: Address::V4(Ipv4Addr::LOCALHOST, 80),
            consumed: 5,
            auth_tag: Some([0u8; AUTH_TAG_LEN]),
        };
        assert!(!decoded.verify(&[0u8; 32], &key()));
    }

    #[test]
    fn test_decode_leaves_payload() {
        let addr = Address::domain("relay.test", 8080).unwrap();
        let mut buf = encode(&addr, None);
        let header_len = buf.len();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n");

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.address, addr);
        assert_eq!(decoded.consumed, header_len);
        assert_eq!(&buf[decoded.consumed..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(
            decode(&[]),
            Err(HeaderError::Truncated {
                needed: 1,
                available: 0
            })
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        for type_byte in [0x00, 0x02, 0x05, 0x0F, 0x12, 0x21, 0x81] {
            let buf = [type_byte, 1, 2, 3, 4, 0, 56];
            assert_eq!(
                decode(&buf),
                Err(HeaderError::UnknownAddressType(type_byte)),
                "type byte {:#04x}",
                type_byte
            );
        }
    }

    #[test]
    fn test_decode_domain_length_past_end() {
        // Declares 200 bytes of name but carries only 3
        let buf = [ATYP_DOMAIN, 200, b'a', b'b', b'c'];
        assert_eq!(
            decode(&buf),
            Err(HeaderError::Truncated {
                needed: 204,
                available: 5
            })
        );
    }

    #[test]
    fn test_decode_missing_trailer() {
        let addr = Address::V4(Ipv4Addr::LOCALHOST, 1080);
        let encoded = encode(&addr, Some(&key()));

        let err = decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(err.is_malformed());
        assert!(matches!(err, HeaderError::Truncated { .. }));
    }

    #[test]
    fn test_decode_invalid_utf8_domain() {
        let buf = [ATYP_DOMAIN, 2, 0xFF, 0xFE, 0x00, 0x50];
        assert_eq!(decode(&buf), Err(HeaderError::InvalidDomain));
    }

    fn arb_address() -> impl Strategy<Value = Address> {
        prop_oneof![
            (any::<[u8; 4]>(), any::<u16>()).prop_map(|(o, p)| Address::V4(Ipv4Addr::from(o), p)),
            (any::<[u8; 16]>(), any::<u16>())
                .prop_map(|(o, p)| Address::V6(Ipv6Addr::from(o), p)),
            ("[a-z0-9.-]{0,255}", any::<u16>())
                .prop_map(|(name, p)| Address::domain(name, p).unwrap()),
        ]
    }

    proptest! {
        #[test]
        fn prop_round_trip(addr in arb_address(), with_auth in any::<bool>()) {
            let auth = key();
            let auth_ref: Option<&dyn HeaderAuth> = if with_auth { Some(&auth) } else { None };
            let encoded = encode(&addr, auth_ref);
            let decoded = decode(&encoded).unwrap();

            prop_assert_eq!(&decoded.address, &addr);
            prop_assert_eq!(decoded.auth_flag(), with_auth);
            prop_assert_eq!(decoded.consumed, encoded.len());
            prop_assert_eq!(decoded.consumed, encoded_len(&addr, with_auth));
        }

        #[test]
        fn prop_truncated_prefix_fails(addr in arb_address(), with_auth in any::<bool>()) {
            let auth = key();
            let auth_ref: Option<&dyn HeaderAuth> = if with_auth { Some(&auth) } else { None };
            let encoded = encode(&addr, auth_ref);

            for cut in 0..encoded.len() {
                let err = decode(&encoded[..cut]).unwrap_err();
                let is_truncated = matches!(err, HeaderError::Truncated { .. });
                prop_assert!(is_truncated);
            }
        }
    }
}
