//! Wire types shared between the reactor, the header-sync coordinator and the peer manager:
//! the message frame, the handshake/`getheaders`/`headers`/`inv`/`addr` payloads, the fixed
//! 100-byte block header and its work arithmetic, and per-peer permission flags.

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod messages;
pub mod network;
pub mod permissions;

pub use codec::{Decode, Encode};
pub use error::CodecError;
pub use frame::{checksum, MessageHeader, RawNetworkMessage, COMMAND_LEN, HEADER_LEN, MAX_MESSAGE_SIZE};
pub use header::{build_locator, work_from_bits, BlockHash, BlockHeader, Work, BLOCK_HEADER_SIZE};
pub use messages::{
    GetHeadersPayload, InventoryItem, NetworkMessage, VersionPayload, MAX_ADDR_SIZE,
    MAX_HEADERS_SIZE, MAX_INV_SIZE, MSG_BLOCK, PROTOCOL_VERSION, USER_AGENT,
};
pub use network::{Magic, Network, NetworkAddress, ServiceFlags, TimestampedAddress};
pub use permissions::PermissionFlags;
