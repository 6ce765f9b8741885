//! The 24-byte message frame: magic, command, length, checksum (§3, §6.1).
use bitcoin_hashes::{sha256d, Hash as _};

use crate::codec::{Cursor, Decode, Encode};
use crate::error::CodecError;
use crate::messages::NetworkMessage;
use crate::network::Magic;

/// ASCII command, NUL-padded to 12 bytes.
pub const COMMAND_LEN: usize = 12;
/// `magic`(4) + `command`(12) + `length`(4) + `checksum`(4).
pub const HEADER_LEN: usize = 24;
/// No single message's payload may exceed this, regardless of what its `length` field claims.
/// A `headers` batch capped at 2000 entries is comfortably under this; anything larger is
/// either a bug or a hostile peer and gets rejected before the allocation happens.
pub const MAX_MESSAGE_SIZE: u32 = 4 * 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: Magic,
    pub command: [u8; COMMAND_LEN],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn command_str(&self) -> String {
        let end = self.command.iter().position(|b| *b == 0).unwrap_or(COMMAND_LEN);
        String::from_utf8_lossy(&self.command[..end]).into_owned()
    }

    fn command_bytes(command: &str) -> [u8; COMMAND_LEN] {
        let mut bytes = [0u8; COMMAND_LEN];
        let src = command.as_bytes();
        let n = src.len().min(COMMAND_LEN);
        bytes[..n].copy_from_slice(&src[..n]);
        bytes
    }
}

/// First 4 bytes of double-SHA256(payload), the checksum carried in every frame header.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d::Hash::hash(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.into_inner()[..4]);
    out
}

impl Encode for MessageHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.magic.0.encode(out);
        out.extend_from_slice(&self.command);
        self.length.encode(out);
        out.extend_from_slice(&self.checksum);
    }
}

impl Decode for MessageHeader {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let magic = Magic(u32::decode(cur)?);
        let command = cur.take_array::<COMMAND_LEN>()?;
        let length = u32::decode(cur)?;
        let checksum = cur.take_array::<4>()?;
        Ok(Self {
            magic,
            command,
            length,
            checksum,
        })
    }
}

/// A fully framed `magic ∥ command ∥ length ∥ checksum ∥ payload` message, ready to hand to
/// the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNetworkMessage {
    pub magic: Magic,
    pub payload: NetworkMessage,
}

impl RawNetworkMessage {
    pub fn encode(&self) -> Vec<u8> {
        let body = self.payload.encode_payload();
        let header = MessageHeader {
            magic: self.magic,
            command: MessageHeader::command_bytes(self.payload.command()),
            length: body.len() as u32,
            checksum: checksum(&body),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        header.encode(&mut out);
        out.extend_from_slice(&body);
        out
    }

    /// Parse one framed message from the front of `buf`, if a complete one is buffered.
    ///
    /// Returns `Ok(None)` when fewer than `HEADER_LEN` bytes are available, or when the header
    /// is complete but the payload it declares hasn't fully arrived yet - both are "come back
    /// with more bytes", not errors. Returns `Ok(Some((message, consumed)))` on success, where
    /// `consumed` is the number of bytes of `buf` the caller should drop. A bad checksum, an
    /// oversized `length`, or a malformed payload are hard errors: the caller should disconnect
    /// the peer rather than wait for more bytes.
    pub fn decode_partial(buf: &[u8]) -> Result<Option<(Self, usize)>, CodecError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut cur = Cursor::new(&buf[..HEADER_LEN]);
        let header = MessageHeader::decode(&mut cur)?;

        if header.length > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(header.length));
        }

        let total = HEADER_LEN + header.length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let body = &buf[HEADER_LEN..total];
        if checksum(body) != header.checksum {
            return Err(CodecError::ChecksumMismatch);
        }

        let payload = NetworkMessage::decode_payload(&header.command_str(), body)?;
        Ok(Some((
            Self {
                magic: header.magic,
                payload,
            },
            total,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_first_four_bytes_of_double_sha256() {
        let payload = b"hello";
        let expected = sha256d::Hash::hash(payload).into_inner();
        assert_eq!(checksum(payload), expected[..4]);
    }

    #[test]
    fn command_round_trips_through_fixed_width_bytes() {
        let bytes = MessageHeader::command_bytes("getheaders");
        let header = MessageHeader {
            magic: Magic(1),
            command: bytes,
            length: 0,
            checksum: [0; 4],
        };
        assert_eq!(header.command_str(), "getheaders");
    }

    #[test]
    fn message_header_round_trips() {
        let header = MessageHeader {
            magic: Magic(0xDEADBEEF),
            command: MessageHeader::command_bytes("ping"),
            length: 8,
            checksum: [1, 2, 3, 4],
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = MessageHeader::decode_all(&buf).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn decode_partial_waits_for_a_full_frame() {
        let raw = RawNetworkMessage {
            magic: Magic(0xD9B4BEF9),
            payload: NetworkMessage::Ping(42),
        };
        let bytes = raw.encode();

        assert!(RawNetworkMessage::decode_partial(&bytes[..HEADER_LEN]).unwrap().is_none());
        assert!(RawNetworkMessage::decode_partial(&bytes[..bytes.len() - 1])
            .unwrap()
            .is_none());

        let (decoded, consumed) = RawNetworkMessage::decode_partial(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, raw);
    }

    #[test]
    fn decode_partial_rejects_bad_checksum() {
        let raw = RawNetworkMessage {
            magic: Magic(0xD9B4BEF9),
            payload: NetworkMessage::Ping(42),
        };
        let mut bytes = raw.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert_eq!(
            RawNetworkMessage::decode_partial(&bytes),
            Err(CodecError::ChecksumMismatch)
        );
    }

    #[test]
    fn decode_partial_rejects_oversized_length() {
        let mut header = MessageHeader {
            magic: Magic(1),
            command: MessageHeader::command_bytes("headers"),
            length: MAX_MESSAGE_SIZE + 1,
            checksum: [0; 4],
        };
        header.length = MAX_MESSAGE_SIZE + 1;
        let mut buf = Vec::new();
        header.encode(&mut buf);

        assert_eq!(
            RawNetworkMessage::decode_partial(&buf),
            Err(CodecError::MessageTooLarge(MAX_MESSAGE_SIZE + 1))
        );
    }
}
