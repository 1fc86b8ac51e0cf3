//! PROXY protocol v2 (binary) headers.
//!
//! Wire format:
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length (big endian)
//! - variable: addresses and ports, then optional TLVs

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{same_family, Command, Probe, ProxyAddresses, ProxyHeader, ProxyHeaderError, Version};

/// PROXY protocol v2 signature (12 bytes).
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Fixed part of a v2 header: signature, version/command, family, length.
pub const V2_HEADER_LEN: usize = 16;

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (for health checks, etc.).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

const AF_UNSPEC: u8 = 0x00;
const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;
const AF_UNIX: u8 = 0x30;

const TRANSPORT_STREAM: u8 = 0x01;
const TRANSPORT_DGRAM: u8 = 0x02;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Length of UNIX address block (108 + 108 bytes).
const UNIX_ADDR_LEN: usize = 216;

fn declared_len(data: &[u8]) -> usize {
    u16::from_be_bytes([data[14], data[15]]) as usize
}

pub(crate) fn probe(data: &[u8]) -> Probe {
    if data.len() < V2_HEADER_LEN || data.len() < V2_HEADER_LEN + declared_len(data) {
        Probe::Incomplete
    } else {
        Probe::Complete
    }
}

pub(crate) fn parse(data: &[u8]) -> Result<(ProxyHeader, usize), ProxyHeaderError> {
    if data.len() < V2_HEADER_LEN {
        return Err(ProxyHeaderError::Truncated {
            available: data.len(),
        });
    }

    let version_command = data[12];
    let family_protocol = data[13];
    let addr_len = declared_len(data);
    let total = V2_HEADER_LEN + addr_len;

    // Verify we have enough data
    if data.len() < total {
        return Err(ProxyHeaderError::Truncated {
            available: data.len(),
        });
    }

    if version_command >> 4 != 0x2 {
        return Err(ProxyHeaderError::UnsupportedVersion(version_command >> 4));
    }

    let command = match version_command {
        VERSION_COMMAND_PROXY => Command::Proxy,
        VERSION_COMMAND_LOCAL => Command::Local,
        other => return Err(ProxyHeaderError::UnsupportedCommand(other & 0x0F)),
    };

    let family = family_protocol & 0xF0;
    let transport = family_protocol & 0x0F;
    if transport > TRANSPORT_DGRAM || (family == AF_UNSPEC && transport != 0) {
        return Err(ProxyHeaderError::UnsupportedFamily(family_protocol));
    }

    let block = &data[V2_HEADER_LEN..total];
    let addresses = match family {
        AF_UNSPEC => None,
        AF_INET => {
            if block.len() < IPV4_ADDR_LEN as usize {
                return Err(ProxyHeaderError::AddressBlockTooShort {
                    family: family_protocol,
                    len: block.len(),
                });
            }
            let src_ip = Ipv4Addr::new(block[0], block[1], block[2], block[3]);
            let dst_ip = Ipv4Addr::new(block[4], block[5], block[6], block[7]);
            let src_port = u16::from_be_bytes([block[8], block[9]]);
            let dst_port = u16::from_be_bytes([block[10], block[11]]);
            Some(ProxyAddresses::new(
                SocketAddr::new(IpAddr::V4(src_ip), src_port),
                SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            ))
        }
        AF_INET6 => {
            if block.len() < IPV6_ADDR_LEN as usize {
                return Err(ProxyHeaderError::AddressBlockTooShort {
                    family: family_protocol,
                    len: block.len(),
                });
            }
            let mut src_octets = [0u8; 16];
            src_octets.copy_from_slice(&block[0..16]);
            let mut dst_octets = [0u8; 16];
            dst_octets.copy_from_slice(&block[16..32]);
            let src_port = u16::from_be_bytes([block[32], block[33]]);
            let dst_port = u16::from_be_bytes([block[34], block[35]]);
            Some(ProxyAddresses::new(
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
            ))
        }
        AF_UNIX => {
            if block.len() < UNIX_ADDR_LEN {
                return Err(ProxyHeaderError::AddressBlockTooShort {
                    family: family_protocol,
                    len: block.len(),
                });
            }
            None
        }
        _ => return Err(ProxyHeaderError::UnsupportedFamily(family_protocol)),
    };

    // LOCAL connections carry no meaningful endpoints even if a block is present.
    let addresses = match command {
        Command::Proxy => addresses,
        Command::Local => None,
    };

    Ok((
        ProxyHeader {
            version: Version::V2,
            command,
            addresses,
        },
        total,
    ))
}

pub(crate) fn encode(header: &ProxyHeader) -> Vec<u8> {
    let addresses = match (header.command, header.addresses) {
        (Command::Proxy, Some(addresses)) => addresses,
        _ => {
            let mut buf = Vec::with_capacity(V2_HEADER_LEN);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(VERSION_COMMAND_LOCAL);
            buf.push(AF_UNSPEC);
            buf.extend_from_slice(&0u16.to_be_bytes());
            return buf;
        }
    };

    let ProxyAddresses {
        source,
        destination,
    } = addresses;

    match same_family(source, destination) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let mut buf = Vec::with_capacity(V2_HEADER_LEN + IPV4_ADDR_LEN as usize);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(VERSION_COMMAND_PROXY);
            buf.push(AF_INET | TRANSPORT_STREAM);
            buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());
            buf.extend_from_slice(&src_ip.octets());
            buf.extend_from_slice(&dst_ip.octets());
            buf.extend_from_slice(&source.port().to_be_bytes());
            buf.extend_from_slice(&destination.port().to_be_bytes());
            buf
        }
        (src_ip, dst_ip) => {
            let src_ip = as_v6(src_ip);
            let dst_ip = as_v6(dst_ip);
            let mut buf = Vec::with_capacity(V2_HEADER_LEN + IPV6_ADDR_LEN as usize);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(VERSION_COMMAND_PROXY);
            buf.push(AF_INET6 | TRANSPORT_STREAM);
            buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());
            buf.extend_from_slice(&src_ip.octets());
            buf.extend_from_slice(&dst_ip.octets());
            buf.extend_from_slice(&source.port().to_be_bytes());
            buf.extend_from_slice(&destination.port().to_be_bytes());
            buf
        }
    }
}

fn as_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse as parse_any;

    #[test]
    fn test_encode_ipv4() {
        let header = ProxyHeader::v2(
            "192.168.1.1:12345".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        );

        let encoded = header.encode();

        // Should be 28 bytes: 12 signature + 4 header + 12 addresses
        assert_eq!(encoded.len(), 28);
        assert_eq!(&encoded[..12], &V2_SIGNATURE);
        assert_eq!(encoded[12], VERSION_COMMAND_PROXY);
        assert_eq!(encoded[13], AF_INET | TRANSPORT_STREAM);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 12);

        let (parsed, consumed) = parse_any(&encoded).unwrap().unwrap();
        assert_eq!(consumed, 28);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_encode_ipv6() {
        let header = ProxyHeader::v2(
            "[2001:db8::1]:12345".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );

        let encoded = header.encode();

        // Should be 52 bytes: 12 signature + 4 header + 36 addresses
        assert_eq!(encoded.len(), 52);
        assert_eq!(encoded[13], AF_INET6 | TRANSPORT_STREAM);
        assert_eq!(u16::from_be_bytes([encoded[14], encoded[15]]), 36);

        let (parsed, consumed) = parse_any(&encoded).unwrap().unwrap();
        assert_eq!(consumed, 52);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_local_command_consumes_block_without_addresses() {
        let mut encoded = ProxyHeader::v2(
            "192.168.1.1:12345".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        )
        .encode();
        encoded[12] = VERSION_COMMAND_LOCAL;
        encoded.extend_from_slice(b"payload");

        let (parsed, consumed) = parse_any(&encoded).unwrap().unwrap();
        assert_eq!(parsed.command, Command::Local);
        assert!(parsed.addresses.is_none());
        assert_eq!(&encoded[consumed..], b"payload");

        let local = ProxyHeader::local(Version::V2).encode();
        assert_eq!(local.len(), V2_HEADER_LEN);
        let (parsed, consumed) = parse_any(&local).unwrap().unwrap();
        assert_eq!(parsed, ProxyHeader::local(Version::V2));
        assert_eq!(consumed, V2_HEADER_LEN);
    }

    #[test]
    fn test_tlvs_are_skipped() {
        let mut encoded = ProxyHeader::v2(
            "192.168.1.1:12345".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        )
        .encode();
        // PP2_TYPE_NOOP TLV with 3 bytes of value
        let tlv = [0x04, 0x00, 0x03, 0xAA, 0xBB, 0xCC];
        encoded.extend_from_slice(&tlv);
        encoded[14..16].copy_from_slice(&(12u16 + tlv.len() as u16).to_be_bytes());
        encoded.extend_from_slice(b"MQTT");

        let (parsed, consumed) = parse_any(&encoded).unwrap().unwrap();
        assert_eq!(consumed, 28 + tlv.len());
        assert_eq!(
            parsed.addresses.unwrap().source,
            "192.168.1.1:12345".parse().unwrap()
        );
        assert_eq!(&encoded[consumed..], b"MQTT");
    }

    #[test]
    fn test_mixed_families_are_normalized() {
        let header = ProxyHeader::v2(
            "192.168.1.1:1000".parse().unwrap(),
            "[::ffff:10.0.0.1]:443".parse().unwrap(),
        );
        let (parsed, _) = parse_any(&header.encode()).unwrap().unwrap();
        assert_eq!(
            parsed.addresses.unwrap().destination,
            "10.0.0.1:443".parse().unwrap()
        );
    }

    #[test]
    fn test_probe_waits_for_address_block() {
        let encoded = ProxyHeader::v2(
            "[2001:db8::1]:12345".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        )
        .encode();

        for end in 1..encoded.len() {
            assert_eq!(crate::probe(&encoded[..end]), Probe::Incomplete, "end={}", end);
        }
        assert_eq!(crate::probe(&encoded), Probe::Complete);
    }

    #[test]
    fn test_parse_invalid() {
        let mut bad_version = ProxyHeader::local(Version::V2).encode();
        bad_version[12] = 0x11;
        assert_eq!(
            parse_any(&bad_version),
            Err(ProxyHeaderError::UnsupportedVersion(0x1))
        );

        let mut bad_command = ProxyHeader::local(Version::V2).encode();
        bad_command[12] = 0x2F;
        assert_eq!(
            parse_any(&bad_command),
            Err(ProxyHeaderError::UnsupportedCommand(0xF))
        );

        let mut short_block = ProxyHeader::v2(
            "192.168.1.1:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
        )
        .encode();
        short_block[14..16].copy_from_slice(&4u16.to_be_bytes());
        assert_eq!(
            parse_any(&short_block),
            Err(ProxyHeaderError::AddressBlockTooShort {
                family: AF_INET | TRANSPORT_STREAM,
                len: 4
            })
        );

        assert_eq!(
            parse_any(&V2_SIGNATURE),
            Err(ProxyHeaderError::Truncated { available: 12 })
        );
    }
}
