//! PROXY protocol header handling.
//!
//! Load balancers in front of the broker prepend a PROXY protocol header to
//! each TCP stream so the original client endpoints survive the extra hop.
//! This library provides helpers for:
//! - Probing whether a buffer holds a complete header yet
//! - Parsing v1 (text) and v2 (binary) headers
//! - Encoding headers, mostly for load-balancer simulations in tests
//!
//! Wire formats follow the HAProxy PROXY protocol document
//! (<https://www.haproxy.org/download/2.9/doc/proxy-protocol.txt>).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

mod v1;
mod v2;

pub use v1::V1_MAX_LEN;
pub use v2::{V2_HEADER_LEN, V2_SIGNATURE};

/// Errors produced while parsing a header that starts with a PROXY signature.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyHeaderError {
    /// The buffer ends before the header does.
    #[error("header truncated after {available} bytes")]
    Truncated { available: usize },

    /// A v1 line ran past the protocol maximum without a CRLF.
    #[error("v1 header exceeds {max} bytes without CRLF")]
    LineTooLong { max: usize },

    /// A v1 line is not well formed.
    #[error("invalid v1 header: {0}")]
    InvalidV1(String),

    /// The v2 version nibble is not 2.
    #[error("unsupported v2 version: {0:#x}")]
    UnsupportedVersion(u8),

    /// The v2 command nibble is neither LOCAL nor PROXY.
    #[error("unsupported v2 command: {0:#x}")]
    UnsupportedCommand(u8),

    /// The v2 family/transport byte is not defined by the protocol.
    #[error("unsupported v2 address family: {0:#x}")]
    UnsupportedFamily(u8),

    /// The v2 address block is shorter than its family requires.
    #[error("address block too short for family {family:#x}: {len} bytes")]
    AddressBlockTooShort { family: u8, len: usize },
}

/// PROXY protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

impl Version {
    /// Numeric version as carried in connection metadata.
    pub fn number(self) -> u8 {
        match self {
            Version::V1 => 1,
            Version::V2 => 2,
        }
    }
}

/// Header command.
///
/// v1 has no command field; its `UNKNOWN` protocol is reported as `Local`
/// because both mean "use the real connection endpoints".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Proxy,
    Local,
}

/// Endpoints carried by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyAddresses {
    /// Original client address and port.
    pub source: SocketAddr,
    /// Address and port the client connected to.
    pub destination: SocketAddr,
}

impl ProxyAddresses {
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source,
            destination,
        }
    }
}

/// A parsed (or to-be-encoded) PROXY protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: Version,
    pub command: Command,
    /// `None` when the header does not carry usable inet endpoints
    /// (v1 `UNKNOWN`, v2 `LOCAL`, `UNSPEC` or `UNIX` families).
    pub addresses: Option<ProxyAddresses>,
}

impl ProxyHeader {
    /// A v1 `TCP4`/`TCP6` header.
    pub fn v1(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            version: Version::V1,
            command: Command::Proxy,
            addresses: Some(ProxyAddresses::new(source, destination)),
        }
    }

    /// A v2 `PROXY` header over a stream transport.
    pub fn v2(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            version: Version::V2,
            command: Command::Proxy,
            addresses: Some(ProxyAddresses::new(source, destination)),
        }
    }

    /// A header telling the receiver to use the real connection endpoints.
    pub fn local(version: Version) -> Self {
        Self {
            version,
            command: Command::Local,
            addresses: None,
        }
    }

    /// Generate the header bytes that precede application data.
    pub fn encode(&self) -> Vec<u8> {
        match self.version {
            Version::V1 => v1::encode(self),
            Version::V2 => v2::encode(self),
        }
    }
}

/// Outcome of [`probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The bytes so far could still be the start of a header that has not
    /// fully arrived; more bytes are needed before deciding.
    Incomplete,
    /// Enough bytes are present to decide: either a whole header, or bytes
    /// that cannot start one.
    Complete,
}

/// Check whether `data` is enough to decide if (and where) a header ends.
///
/// Never fails; malformed input is reported as `Complete` so the caller
/// moves on to [`parse`], which describes what is wrong.
pub fn probe(data: &[u8]) -> Probe {
    if data.is_empty() {
        return Probe::Incomplete;
    }

    match signature_match(data) {
        SignatureMatch::Partial => Probe::Incomplete,
        SignatureMatch::V1 => v1::probe(data),
        SignatureMatch::V2 => v2::probe(data),
        SignatureMatch::None => Probe::Complete,
    }
}

/// Parse a header from the start of `data`.
///
/// Returns `Ok(None)` when `data` does not start with a PROXY signature,
/// otherwise the header and the number of bytes it occupies. Bytes past that
/// length belong to the application.
pub fn parse(data: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyHeaderError> {
    match signature_match(data) {
        SignatureMatch::None => Ok(None),
        SignatureMatch::Partial => Err(ProxyHeaderError::Truncated {
            available: data.len(),
        }),
        SignatureMatch::V1 => v1::parse(data).map(Some),
        SignatureMatch::V2 => v2::parse(data).map(Some),
    }
}

enum SignatureMatch {
    None,
    Partial,
    V1,
    V2,
}

fn signature_match(data: &[u8]) -> SignatureMatch {
    if data.is_empty() {
        return SignatureMatch::Partial;
    }

    for (signature, full) in [
        (v1::V1_PREFIX, SignatureMatch::V1),
        (&V2_SIGNATURE[..], SignatureMatch::V2),
    ] {
        let n = data.len().min(signature.len());
        if data[..n] == signature[..n] {
            return if n < signature.len() {
                SignatureMatch::Partial
            } else {
                full
            };
        }
    }

    SignatureMatch::None
}

/// Extract IPv4 from an IPv6 address if it's a mapped or compatible address.
pub(crate) fn extract_v4_from_v6(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = addr.octets();

    // IPv4-mapped: first 10 bytes zero, bytes 10-11 are 0xff
    if octets[..10].iter().all(|&b| b == 0) && octets[10] == 0xff && octets[11] == 0xff {
        return Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ));
    }

    // IPv4-compatible: first 12 bytes zero (deprecated but still handled)
    if octets[..12].iter().all(|&b| b == 0) {
        return Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ));
    }

    None
}

/// Bring both endpoints into one family; headers cannot mix families.
pub(crate) fn same_family(source: SocketAddr, destination: SocketAddr) -> (IpAddr, IpAddr) {
    match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V6(dst)) => (
            IpAddr::V4(src),
            IpAddr::V4(extract_v4_from_v6(dst).unwrap_or(Ipv4Addr::UNSPECIFIED)),
        ),
        (IpAddr::V6(src), IpAddr::V4(dst)) => (
            IpAddr::V4(extract_v4_from_v6(src).unwrap_or(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V4(dst),
        ),
        (src, dst) => (src, dst),
    }
}
