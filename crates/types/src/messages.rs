//! `NetworkMessage` (the payload carried by every frame) and the `version` handshake payload.
use crate::codec::{self, decode_var_str, decode_vec, encode_var_str, encode_vec, Cursor, Decode, Encode};
use crate::error::CodecError;
use crate::header::{BlockHash, BlockHeader};
use crate::network::{NetworkAddress, ServiceFlags, TimestampedAddress};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: i32 = 1;
/// Sent in every `version` message's `user_agent` field.
pub const USER_AGENT: &str = concat!("/hdr:", env!("CARGO_PKG_VERSION"), "/");

/// Inventory item type tag. Only `MSG_BLOCK` is meaningful; the chain is headers-only so
/// there is no `MSG_TX`.
pub const MSG_BLOCK: u32 = 2;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub item_type: u32,
    pub hash: BlockHash,
}

impl InventoryItem {
    pub fn block(hash: BlockHash) -> Self {
        Self {
            item_type: MSG_BLOCK,
            hash,
        }
    }

    pub fn is_block(&self) -> bool {
        self.item_type == MSG_BLOCK
    }
}

impl Encode for InventoryItem {
    fn encode(&self, out: &mut Vec<u8>) {
        self.item_type.encode(out);
        self.hash.encode(out);
    }
}

impl Decode for InventoryItem {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let item_type = u32::decode(cur)?;
        let hash = BlockHash::decode(cur)?;
        Ok(Self { item_type, hash })
    }
}

/// The `version` handshake payload (§6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Encode for VersionPayload {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.services.0.encode(out);
        self.timestamp.encode(out);
        self.addr_recv.encode(out);
        self.addr_from.encode(out);
        self.nonce.encode(out);
        encode_var_str(&self.user_agent, out);
        self.start_height.encode(out);
        self.relay.encode(out);
    }
}

impl Decode for VersionPayload {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        Ok(Self {
            version: i32::decode(cur)?,
            services: ServiceFlags(u64::decode(cur)?),
            timestamp: i64::decode(cur)?,
            addr_recv: NetworkAddress::decode(cur)?,
            addr_from: NetworkAddress::decode(cur)?,
            nonce: u64::decode(cur)?,
            user_agent: decode_var_str(cur)?,
            start_height: i32::decode(cur)?,
            relay: bool::decode(cur)?,
        })
    }
}

/// `getheaders` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersPayload {
    pub version: u32,
    pub locator: Vec<BlockHash>,
    pub hash_stop: BlockHash,
}

impl Encode for GetHeadersPayload {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        encode_vec(&self.locator, out);
        self.hash_stop.encode(out);
    }
}

impl Decode for GetHeadersPayload {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let version = u32::decode(cur)?;
        // A locator is bounded by how tall a chain can realistically get; this cap just
        // keeps a malformed/hostile message from forcing a huge allocation.
        let locator = decode_vec(cur, 2_000)?;
        let hash_stop = BlockHash::decode(cur)?;
        Ok(Self {
            version,
            locator,
            hash_stop,
        })
    }
}

/// The commands used by the core (§6.1), plus `Unknown` for forward-compatible payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    GetHeaders(GetHeadersPayload),
    Headers(Vec<BlockHeader>),
    Inv(Vec<InventoryItem>),
    Addr(Vec<TimestampedAddress>),
    GetAddr,
    Unknown { command: String, payload: Vec<u8> },
}

/// Maximum headers accepted or sent in a single `headers` message (§6.1, §9).
pub const MAX_HEADERS_SIZE: usize = 2000;
/// Maximum addresses accepted in a single `addr` message.
pub const MAX_ADDR_SIZE: usize = 1000;
/// Maximum inventory items accepted in a single `inv` message.
pub const MAX_INV_SIZE: usize = 50_000;

impl NetworkMessage {
    pub fn command(&self) -> &str {
        match self {
            Self::Version(_) => "version",
            Self::Verack => "verack",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::GetHeaders(_) => "getheaders",
            Self::Headers(_) => "headers",
            Self::Inv(_) => "inv",
            Self::Addr(_) => "addr",
            Self::GetAddr => "getaddr",
            Self::Unknown { command, .. } => command.as_str(),
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Version(payload) => payload.encode(&mut out),
            Self::Verack | Self::GetAddr => {}
            Self::Ping(nonce) | Self::Pong(nonce) => nonce.encode(&mut out),
            Self::GetHeaders(payload) => payload.encode(&mut out),
            Self::Headers(headers) => encode_vec(headers, &mut out),
            Self::Inv(items) => encode_vec(items, &mut out),
            Self::Addr(addrs) => encode_vec(addrs, &mut out),
            Self::Unknown { payload, .. } => out.extend_from_slice(payload),
        }
        out
    }

    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(payload);
        let message = match command {
            "version" => Self::Version(VersionPayload::decode(&mut cur)?),
            "verack" => Self::Verack,
            "ping" => Self::Ping(u64::decode(&mut cur)?),
            "pong" => Self::Pong(u64::decode(&mut cur)?),
            "getheaders" => Self::GetHeaders(GetHeadersPayload::decode(&mut cur)?),
            "headers" => Self::Headers(decode_vec(&mut cur, MAX_HEADERS_SIZE + 1)?),
            "inv" => Self::Inv(decode_vec(&mut cur, MAX_INV_SIZE)?),
            "addr" => Self::Addr(decode_vec(&mut cur, MAX_ADDR_SIZE)?),
            "getaddr" => Self::GetAddr,
            other => {
                return Ok(Self::Unknown {
                    command: other.to_string(),
                    payload: payload.to_vec(),
                })
            }
        };
        if command != "headers" && command != "inv" && command != "addr" && cur.remaining() != 0 {
            return Err(CodecError::TrailingBytes(cur.remaining()));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkAddress;

    fn addr() -> NetworkAddress {
        NetworkAddress::new("127.0.0.1:9999".parse().unwrap(), ServiceFlags::NETWORK)
    }

    #[test]
    fn version_round_trips() {
        let payload = VersionPayload {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NETWORK,
            timestamp: 1_700_000_000,
            addr_recv: addr(),
            addr_from: addr(),
            nonce: 0xdead_beef,
            user_agent: USER_AGENT.to_string(),
            start_height: 100,
            relay: true,
        };
        let msg = NetworkMessage::Version(payload.clone());
        let bytes = msg.encode_payload();
        let decoded = NetworkMessage::decode_payload("version", &bytes).unwrap();
        assert_eq!(decoded, NetworkMessage::Version(payload));
    }

    #[test]
    fn ping_pong_round_trip() {
        let msg = NetworkMessage::Ping(7);
        let bytes = msg.encode_payload();
        assert_eq!(
            NetworkMessage::decode_payload("ping", &bytes).unwrap(),
            msg
        );
    }

    #[test]
    fn getheaders_round_trips_with_locator() {
        let payload = GetHeadersPayload {
            version: 1,
            locator: vec![BlockHash([1u8; 32]), BlockHash([2u8; 32])],
            hash_stop: BlockHash::ZERO,
        };
        let msg = NetworkMessage::GetHeaders(payload.clone());
        let bytes = msg.encode_payload();
        assert_eq!(
            NetworkMessage::decode_payload("getheaders", &bytes).unwrap(),
            NetworkMessage::GetHeaders(payload)
        );
    }

    #[test]
    fn unknown_command_is_preserved_verbatim() {
        let bytes = vec![1, 2, 3];
        let decoded = NetworkMessage::decode_payload("mempool", &bytes).unwrap();
        match decoded {
            NetworkMessage::Unknown { command, payload } => {
                assert_eq!(command, "mempool");
                assert_eq!(payload, bytes);
            }
            _ => panic!("expected Unknown"),
        }
    }
}
