//! # shroud-header
//!
//! The destination-address header exchanged between relay endpoints.
//!
//! A relay connection starts with a compact binary frame naming where traffic
//! should go: an IPv4 address, an IPv6 address or a domain name, plus a port
//! and an optional auth trailer. Both endpoints must agree on this format
//! byte for byte, so it lives in its own crate with no runtime dependencies.
//!
//! ## Round-trip law
//!
//! For every address `a`, `decode(&encode(&a, auth))` yields `a` again, the
//! same auth flag, and `consumed == encode(..).len()`.

mod address;
mod codec;
mod error;
mod selftest;

pub use address::{Address, DomainName, MAX_DOMAIN_LEN};
pub use codec::{
    decode, encode, encoded_len, Decoded, HeaderAuth, KeyedSha256, ADDRESS_MASK, ATYP_DOMAIN,
    ATYP_IPV4, ATYP_IPV6, AUTH_FLAG, AUTH_TAG_LEN, MAX_HEADER_LEN,
};
pub use error::HeaderError;
pub use selftest::{header_self_test, SelfTestFailure};
