//! Startup self-test of the header codec against fixed vectors.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{decode, encode, Address};

/// Port used by both reference vectors.
const TEST_PORT: u16 = 56;

/// A reference vector that did not survive encode + decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfTestFailure {
    pub input: Address,
    /// What decoding produced, or `None` if it failed outright.
    pub output: Option<Address>,
}

impl std::fmt::Display for SelfTestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.output {
            Some(output) => write!(f, "{} --> {}", self.input, output),
            None => write!(f, "{} --> (decode failed)", self.input),
        }
    }
}

/// Round-trip the IPv6 and IPv4 reference addresses through the codec.
///
/// Returns every vector that failed.
pub fn header_self_test() -> Result<(), Vec<SelfTestFailure>> {
    let v6 = Ipv6Addr::new(0x2001, 0x0db8, 0x85a3, 0, 0, 0x8a2e, 0x1010, 0x2020);
    let v4 = Ipv4Addr::new(1, 2, 3, 4);

    let mut failures = Vec::new();

    let input = Address::V6(v6, TEST_PORT);
    let output = decode(&encode(&input, None)).ok().map(|d| d.address);
    if output.as_ref() != Some(&input) {
        failures.push(SelfTestFailure { input, output });
    }

    let input = Address::V4(v4, TEST_PORT);
    let output = decode(&encode(&input, None)).ok().map(|d| d.address);
    let matches = output
        .as_ref()
        .is_some_and(|out| out.first_ip() == Some(IpAddr::V4(v4)) && out.port() == TEST_PORT);
    if !matches {
        failures.push(SelfTestFailure { input, output });
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}
