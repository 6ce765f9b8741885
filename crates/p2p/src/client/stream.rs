//! Message stream utilities.
use hdr_types::{CodecError, RawNetworkMessage};

/// Receive-buffer flood cap (§4.6): one more byte past this and the peer is disconnected rather
/// than let an unresponsive or malicious peer pin arbitrary amounts of unparsed data in memory.
pub const DEFAULT_RECV_FLOOD_SIZE: usize = 5 * 1024 * 1024;

/// Message stream decoder.
///
/// Turns a raw byte stream into framed [`RawNetworkMessage`]s, accumulating partial frames
/// across reads.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
}

impl Decoder {
    /// Create a new stream decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
        }
    }

    /// Input bytes into the decoder. Returns an error if the accumulated, not-yet-parsed buffer
    /// would exceed [`DEFAULT_RECV_FLOOD_SIZE`].
    pub fn input(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if self.unparsed.len() + bytes.len() > DEFAULT_RECV_FLOOD_SIZE {
            return Err(CodecError::MessageTooLarge(bytes.len() as u32));
        }
        self.unparsed.extend_from_slice(bytes);
        Ok(())
    }

    /// Decode and return the next message. Returns [`None`] if nothing was decoded yet.
    pub fn decode_next(&mut self) -> Result<Option<RawNetworkMessage>, CodecError> {
        match RawNetworkMessage::decode_partial(&self.unparsed)? {
            Some((msg, consumed)) => {
                self.unparsed.drain(..consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_next_returns_none_until_a_full_frame_arrives() {
        let mut decoder = Decoder::new(256);
        decoder.input(&[0u8; 10]).unwrap();
        assert!(decoder.decode_next().unwrap().is_none());
    }

    #[test]
    fn input_rejects_once_the_flood_cap_would_be_exceeded() {
        let mut decoder = Decoder::new(8);
        let chunk = vec![0u8; DEFAULT_RECV_FLOOD_SIZE];
        decoder.input(&chunk).unwrap();
        assert!(decoder.input(&[0u8; 1]).is_err());
    }
}
