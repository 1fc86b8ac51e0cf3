//! Connection metadata and proxy header decoding.
//!
//! [`ConnectionDetails`] is what the broker sees about a client: either the
//! raw socket endpoints, or the endpoints a load balancer reported in a
//! PROXY protocol header. Decoding is pluggable through [`Decoder`];
//! [`ProxyHeaderDecoder`] is the default.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use frontdoor_proxy_header::ProxyHeader;
use serde::Serialize;
use tracing::{debug, warn};

use super::handoff::Ancillary;

pub use frontdoor_proxy_header::Probe;

/// Endpoints of the raw transport connection.
///
/// For WebSocket connections these are the endpoints of the TCP socket that
/// carried the HTTP upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

impl ConnectionInfo {
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            local_addr,
        }
    }
}

/// Resolved client endpoints handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub source_address: IpAddr,
    pub source_port: u16,
    pub destination_address: IpAddr,
    pub destination_port: u16,
    /// 0 when no PROXY header was involved, otherwise 1 or 2.
    pub proxy_header_version: u8,
    /// Whether the endpoints came from operator-inserted proxy information
    /// rather than from the socket.
    pub via_proxy_header: bool,
}

impl ConnectionDetails {
    /// Details taken from the socket alone.
    pub fn from_socket(info: &ConnectionInfo) -> Self {
        Self {
            source_address: info.peer_addr.ip(),
            source_port: info.peer_addr.port(),
            destination_address: info.local_addr.ip(),
            destination_port: info.local_addr.port(),
            proxy_header_version: 0,
            via_proxy_header: false,
        }
    }

    /// Details from a parsed header, falling back to `local` endpoints when
    /// the header carries none (v1 `UNKNOWN`, v2 `LOCAL`).
    pub fn from_header(header: &ProxyHeader, local: &ConnectionDetails) -> Self {
        match header.addresses {
            Some(addresses) => Self {
                source_address: addresses.source.ip(),
                source_port: addresses.source.port(),
                destination_address: addresses.destination.ip(),
                destination_port: addresses.destination.port(),
                proxy_header_version: header.version.number(),
                via_proxy_header: true,
            },
            None => Self {
                proxy_header_version: header.version.number(),
                ..local.clone()
            },
        }
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.source_address, self.source_port)
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.destination_address, self.destination_port)
    }
}

/// Derives details from the raw transport; overridable per listener.
pub type DeriveLocalDetails = Arc<dyn Fn(&ConnectionInfo) -> ConnectionDetails + Send + Sync>;

/// The default [`DeriveLocalDetails`].
pub fn derive_local_details(info: &ConnectionInfo) -> ConnectionDetails {
    ConnectionDetails::from_socket(info)
}

/// Everything a decoder may look at besides the leading bytes.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    pub info: &'a ConnectionInfo,
    pub ancillary: &'a Ancillary,
    /// Transport-derived details, the answer when there is no header.
    pub local: &'a ConnectionDetails,
}

/// Result of a decode: resolved details and the length of the header that
/// was recognized. Bytes past `header_len` are application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub details: ConnectionDetails,
    pub header_len: usize,
}

impl Decoded {
    /// No header: details as given, nothing consumed.
    pub fn passthrough(details: ConnectionDetails) -> Self {
        Self {
            details,
            header_len: 0,
        }
    }
}

/// Decodes an optional proxy header from the first bytes of a connection.
///
/// Called at most once per connection. Implementations must not block and
/// must not fail: absent or malformed headers produce transport-derived
/// details with `header_len == 0`.
pub trait Decoder: Send + Sync + 'static {
    /// Whether `data` is enough to decide. Returning
    /// [`Probe::Incomplete`] makes the sniffer wait for more bytes (up to its
    /// configured limit) before calling [`Decoder::decode`].
    fn probe(&self, data: &[u8]) -> Probe {
        let _ = data;
        Probe::Complete
    }

    fn decode(&self, ctx: &DecodeContext<'_>, data: &[u8]) -> Decoded;
}

/// Header carrying the client address when a reverse proxy terminates HTTP.
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Default decoder: PROXY protocol v1/v2, then forwarding headers of a
/// WebSocket upgrade request, then socket details.
///
/// Malformed headers fall back to socket details and nothing is consumed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyHeaderDecoder;

impl Decoder for ProxyHeaderDecoder {
    fn probe(&self, data: &[u8]) -> Probe {
        frontdoor_proxy_header::probe(data)
    }

    fn decode(&self, ctx: &DecodeContext<'_>, data: &[u8]) -> Decoded {
        match frontdoor_proxy_header::parse(data) {
            Ok(Some((header, header_len))) => {
                debug!(
                    version = header.version.number(),
                    header_len = header_len,
                    "Proxy header decoded"
                );
                Decoded {
                    details: ConnectionDetails::from_header(&header, ctx.local),
                    header_len,
                }
            }
            Ok(None) => Decoded::passthrough(
                forwarded_details(ctx).unwrap_or_else(|| ctx.local.clone()),
            ),
            Err(e) => {
                warn!(
                    peer_addr = %ctx.info.peer_addr,
                    error = %e,
                    "Malformed proxy header, using socket details"
                );
                Decoded::passthrough(ctx.local.clone())
            }
        }
    }
}

/// Source address from `X-Real-IP` or the first `X-Forwarded-For` hop.
fn forwarded_details(ctx: &DecodeContext<'_>) -> Option<ConnectionDetails> {
    let Ancillary::Upgrade(request) = ctx.ancillary else {
        return None;
    };

    let real_ip = request
        .headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    let forwarded_for = || {
        request
            .headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
    };

    let source_address: IpAddr = real_ip.or_else(forwarded_for)?.parse().ok()?;

    Some(ConnectionDetails {
        source_address,
        via_proxy_header: true,
        ..ctx.local.clone()
    })
}
