//! Destination addresses carried in the relay header.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::HeaderError;

/// Longest domain name the single length byte can describe.
pub const MAX_DOMAIN_LEN: usize = u8::MAX as usize;

/// A host name whose byte length fits the wire length prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainName(String);

impl DomainName {
    /// Create a domain name, rejecting names longer than 255 bytes.
    pub fn new(name: impl Into<String>) -> Result<Self, HeaderError> {
        let name = name.into();
        if name.len() > MAX_DOMAIN_LEN {
            return Err(HeaderError::DomainTooLong(name.len()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in bytes. Always fits in a `u8`.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A network endpoint a relay forwards traffic to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address and port.
    V4(Ipv4Addr, u16),
    /// IPv6 address and port.
    V6(Ipv6Addr, u16),
    /// Host name (resolved by whoever connects) and port.
    Domain(DomainName, u16),
}

impl Address {
    /// Build a domain address, checking the name length.
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self, HeaderError> {
        Ok(Address::Domain(DomainName::new(name)?, port))
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::V4(_, port) | Address::V6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    /// The literal IP of this address, if it has one.
    ///
    /// Domain addresses return `None`; resolving them is the connecting
    /// side's job.
    pub fn first_ip(&self) -> Option<IpAddr> {
        match self {
            Address::V4(ip, _) => Some(IpAddr::V4(*ip)),
            Address::V6(ip, _) => Some(IpAddr::V6(*ip)),
            Address::Domain(..) => None,
        }
    }

    /// Socket address for literal IP variants.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.first_ip().map(|ip| SocketAddr::new(ip, self.port()))
    }

    /// Host part as text, without brackets or port.
    pub fn host(&self) -> String {
        match self {
            Address::V4(ip, _) => ip.to_string(),
            Address::V6(ip, _) => ip.to_string(),
            Address::Domain(name, _) => name.as_str().to_string(),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::V4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Address::V6(*v6.ip(), v6.port()),
        }
    }
}

impl From<(IpAddr, u16)> for Address {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        SocketAddr::new(ip, port).into()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::V6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

impl FromStr for Address {
    type Err = HeaderError;

    /// Parse `ip:port`, `[ipv6]:port` or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(HeaderError::InvalidAddress(format!("missing port in '{}'", s)));
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| HeaderError::InvalidAddress(format!("invalid port in '{}'", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(HeaderError::InvalidAddress(format!("missing host in '{}'", s)));
        }

        match host.parse::<IpAddr>() {
            Ok(ip) => Ok((ip, port).into()),
            Err(_) => Address::domain(host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_length_limit() {
        assert!(DomainName::new("a".repeat(255)).is_ok());
        assert_eq!(
            DomainName::new("a".repeat(256)),
            Err(HeaderError::DomainTooLong(256))
        );
    }

    #[test]
    fn test_parse_variants() {
        let v4: Address = "1.2.3.4:56".parse().unwrap();
        assert_eq!(v4, Address::V4(Ipv4Addr::new(1, 2, 3, 4), 56));

        let v6: Address = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(v6.first_ip(), Some("2001:db8::1".parse().unwrap()));
        assert_eq!(v6.port(), 443);

        let domain: Address = "example.com:80".parse().unwrap();
        assert_eq!(domain, Address::domain("example.com", 80).unwrap());
        assert!(domain.first_ip().is_none());
    }

    #[test]
    fn test_parse_invalid() {
        assert!("example.com".parse::<Address>().is_err());
        assert!("example.com:99999".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
    }

    #[test]
    fn test_display() {
        let v6 = Address::V6("::1".parse().unwrap(), 8388);
        assert_eq!(v6.to_string(), "[::1]:8388");
        assert_eq!(v6.host(), "::1");

        let domain = Address::domain("relay.test", 8080).unwrap();
        assert_eq!(domain.to_string(), "relay.test:8080");
    }
}
