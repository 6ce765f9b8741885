//! Network addresses and the chain's magic bytes.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::codec::{self, Decode, Encode};
use crate::error::CodecError;

/// Network magic bytes. Distinguishes the wire protocol of one chain from another, the
/// same role `bitcoin::network::Magic` plays for Bitcoin.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Magic(pub u32);

/// Chain this node participates in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn magic(&self) -> Magic {
        // These values have no relationship to any real network; they only need to be
        // stable and distinct so peers on different chains refuse each other's frames.
        match self {
            Network::Mainnet => Magic(0xD9_B4_BE_F9),
            Network::Testnet => Magic(0x0B_11_09_07),
            Network::Regtest => Magic(0xFA_BF_B5_DA),
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 9999,
            Network::Testnet => 19999,
            Network::Regtest => 29999,
        }
    }
}

/// Service flags advertised by a peer, a bitfield like Bitcoin's `ServiceFlags`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct ServiceFlags(pub u64);

impl ServiceFlags {
    pub const NONE: ServiceFlags = ServiceFlags(0);
    pub const NETWORK: ServiceFlags = ServiceFlags(1 << 0);

    pub fn has(&self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ServiceFlags {
    type Output = ServiceFlags;
    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

/// A 16-byte (IPv6, with IPv4-mapped encoding), 16-bit-port, 64-bit-service peer address.
///
/// Invariant: port != 0 and the IP is not all-zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub services: ServiceFlags,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(socket_addr: SocketAddr, services: ServiceFlags) -> Self {
        Self {
            services,
            ip: ipv4_mapped_bytes(socket_addr.ip()),
            port: socket_addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(canonical_ip(self.ip), self.port)
    }

    /// An address is well-formed iff the port is non-zero and the IP isn't all-zero.
    pub fn is_valid(&self) -> bool {
        self.port != 0 && !is_all_zero(&self.ip)
    }
}

/// [`NetworkAddress`] plus a 32-bit seconds-since-epoch timestamp, as carried in `addr`
/// messages and persisted by the address manager.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimestampedAddress {
    pub timestamp: u32,
    pub addr: NetworkAddress,
}

fn ipv4_mapped_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Canonicalize an IPv4-mapped IPv6 address back down to dotted-quad, matching the
/// `Connection::remote_address()` contract (§4.5).
pub fn canonical_ip(octets: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(octets);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

pub fn is_all_zero(ip: &[u8; 16]) -> bool {
    ip.iter().all(|b| *b == 0)
}

pub fn map_v4(addr: Ipv4Addr) -> [u8; 16] {
    addr.to_ipv6_mapped().octets()
}

impl Encode for NetworkAddress {
    fn encode(&self, out: &mut Vec<u8>) {
        self.services.0.encode(out);
        out.extend_from_slice(&self.ip);
        out.extend_from_slice(&self.port.to_be_bytes());
    }
}

impl Decode for NetworkAddress {
    fn decode(cur: &mut codec::Cursor) -> Result<Self, CodecError> {
        let services = ServiceFlags(u64::decode(cur)?);
        let ip = cur.take_array::<16>()?;
        let port = u16::from_be_bytes(cur.take_array::<2>()?);
        Ok(Self { services, ip, port })
    }
}

impl Encode for TimestampedAddress {
    fn encode(&self, out: &mut Vec<u8>) {
        self.timestamp.encode(out);
        self.addr.encode(out);
    }
}

impl Decode for TimestampedAddress {
    fn decode(cur: &mut codec::Cursor) -> Result<Self, CodecError> {
        let timestamp = u32::decode(cur)?;
        let addr = NetworkAddress::decode(cur)?;
        Ok(Self { timestamp, addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_address_round_trips() {
        let addr = NetworkAddress::new("127.0.0.1:9999".parse().unwrap(), ServiceFlags::NETWORK);
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        let mut cur = codec::Cursor::new(&buf);
        let decoded = NetworkAddress::decode(&mut cur).unwrap();
        assert_eq!(addr, decoded);
        assert!(decoded.is_valid());
    }

    #[test]
    fn zero_port_and_zero_ip_are_invalid() {
        let zero_port = NetworkAddress {
            services: ServiceFlags::NONE,
            ip: [1u8; 16],
            port: 0,
        };
        assert!(!zero_port.is_valid());

        let zero_ip = NetworkAddress {
            services: ServiceFlags::NONE,
            ip: [0u8; 16],
            port: 1,
        };
        assert!(!zero_ip.is_valid());
    }
}
