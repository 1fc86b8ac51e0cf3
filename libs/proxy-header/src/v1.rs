//! PROXY protocol v1 (human-readable) headers.
//!
//! A single CRLF-terminated ASCII line:
//! `PROXY <TCP4|TCP6|UNKNOWN> <src addr> <dst addr> <src port> <dst port>\r\n`

use std::net::{IpAddr, SocketAddr};

use crate::{same_family, Command, Probe, ProxyAddresses, ProxyHeader, ProxyHeaderError, Version};

/// Longest legal v1 line including the CRLF (TCP6 with maximal fields).
pub const V1_MAX_LEN: usize = 107;

pub(crate) const V1_PREFIX: &[u8] = b"PROXY ";

fn find_crlf(data: &[u8]) -> Option<usize> {
    let window = &data[..data.len().min(V1_MAX_LEN)];
    window.windows(2).position(|w| w == b"\r\n")
}

pub(crate) fn probe(data: &[u8]) -> Probe {
    if find_crlf(data).is_some() || data.len() >= V1_MAX_LEN {
        Probe::Complete
    } else {
        Probe::Incomplete
    }
}

pub(crate) fn parse(data: &[u8]) -> Result<(ProxyHeader, usize), ProxyHeaderError> {
    let Some(end) = find_crlf(data) else {
        if data.len() >= V1_MAX_LEN {
            return Err(ProxyHeaderError::LineTooLong { max: V1_MAX_LEN });
        }
        return Err(ProxyHeaderError::Truncated {
            available: data.len(),
        });
    };

    let line = std::str::from_utf8(&data[..end])
        .map_err(|_| ProxyHeaderError::InvalidV1("line is not ASCII".to_string()))?;
    let fields: Vec<&str> = line.split(' ').collect();

    let header = match fields.get(1).copied() {
        // Anything may follow UNKNOWN; the receiver must ignore it.
        Some("UNKNOWN") => ProxyHeader::local(Version::V1),
        Some(proto @ ("TCP4" | "TCP6")) => {
            let [_, _, src, dst, src_port, dst_port] = fields.as_slice() else {
                return Err(ProxyHeaderError::InvalidV1(format!(
                    "expected 6 fields, found {}",
                    fields.len()
                )));
            };

            let src_ip = parse_ip(src)?;
            let dst_ip = parse_ip(dst)?;
            let wants_v4 = proto == "TCP4";
            if src_ip.is_ipv4() != wants_v4 || dst_ip.is_ipv4() != wants_v4 {
                return Err(ProxyHeaderError::InvalidV1(format!(
                    "address family does not match {}",
                    proto
                )));
            }

            ProxyHeader {
                version: Version::V1,
                command: Command::Proxy,
                addresses: Some(ProxyAddresses::new(
                    SocketAddr::new(src_ip, parse_port(src_port)?),
                    SocketAddr::new(dst_ip, parse_port(dst_port)?),
                )),
            }
        }
        Some(other) => {
            return Err(ProxyHeaderError::InvalidV1(format!(
                "unknown protocol {:?}",
                other
            )))
        }
        None => return Err(ProxyHeaderError::InvalidV1("missing protocol".to_string())),
    };

    Ok((header, end + 2))
}

fn parse_ip(field: &str) -> Result<IpAddr, ProxyHeaderError> {
    field
        .parse()
        .map_err(|_| ProxyHeaderError::InvalidV1(format!("invalid address {:?}", field)))
}

fn parse_port(field: &str) -> Result<u16, ProxyHeaderError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyHeaderError::InvalidV1(format!(
            "invalid port {:?}",
            field
        )));
    }
    field
        .parse()
        .map_err(|_| ProxyHeaderError::InvalidV1(format!("invalid port {:?}", field)))
}

pub(crate) fn encode(header: &ProxyHeader) -> Vec<u8> {
    let addresses = match (header.command, header.addresses) {
        (Command::Proxy, Some(addresses)) => addresses,
        _ => return b"PROXY UNKNOWN\r\n".to_vec(),
    };

    let (src_ip, dst_ip) = same_family(addresses.source, addresses.destination);
    let proto = if src_ip.is_ipv4() { "TCP4" } else { "TCP6" };

    format!(
        "PROXY {} {} {} {} {}\r\n",
        proto,
        src_ip,
        dst_ip,
        addresses.source.port(),
        addresses.destination.port()
    )
    .into_bytes()
}
