//! Error types for header encoding and decoding.

use thiserror::Error;

/// Errors produced while building addresses or decoding header frames.
///
/// Every decode failure is a malformed header from the peer's side; see
/// [`HeaderError::is_malformed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// The buffer ends before the frame declared by its type byte does.
    #[error("header truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The type byte does not name IPv4, IPv6 or a domain name.
    #[error("unknown address type {0:#04x}")]
    UnknownAddressType(u8),

    /// The domain name bytes are not valid UTF-8.
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,

    /// A domain name does not fit the single length byte.
    #[error("domain name is {0} bytes long (max 255)")]
    DomainTooLong(usize),

    /// A textual address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl HeaderError {
    /// Whether this error came from decoding peer-supplied bytes.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            HeaderError::Truncated { .. }
                | HeaderError::UnknownAddressType(_)
                | HeaderError::InvalidDomain
        )
    }
}
