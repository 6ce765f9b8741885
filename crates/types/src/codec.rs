//! Hand-written little-endian wire codec.
//!
//! The teacher's `p2p.rs` leans on `bitcoin::consensus::{Encodable, Decodable}` because its
//! wire messages are Bitcoin's own types. This chain's wire format diverges from Bitcoin's
//! (100-byte fixed headers carrying a `randomx_hash`, a project-owned `version`/`verack`
//! handshake payload, etc.), so messages here get their own small `Encode`/`Decode` traits
//! instead.
use crate::error::CodecError;

/// A read-only cursor over an in-memory buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Eof {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

/// Types that can be written to the wire.
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Types that can be parsed from the wire. Parsing never consumes a partial
/// multi-byte primitive; callers that only have a prefix of the buffer get `Eof`.
pub trait Decode: Sized {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError>;

    fn decode_all(buf: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(buf);
        let value = Self::decode(&mut cur)?;
        if cur.remaining() != 0 {
            return Err(CodecError::TrailingBytes(cur.remaining()));
        }
        Ok(value)
    }
}

macro_rules! impl_int {
    ($t:ty) => {
        impl Encode for $t {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
        impl Decode for $t {
            fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
                const N: usize = std::mem::size_of::<$t>();
                Ok(<$t>::from_le_bytes(cur.take_array::<N>()?))
            }
        }
    };
}

impl_int!(u8);
impl_int!(u16);
impl_int!(u32);
impl_int!(u64);
impl_int!(i32);
impl_int!(i64);

impl Encode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(if *self { 1 } else { 0 });
    }
}

impl Decode for bool {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        Ok(cur.take_array::<1>()?[0] != 0)
    }
}

impl Encode for [u8; 32] {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl Decode for [u8; 32] {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        cur.take_array::<32>()
    }
}

/// CompactSize / `var_int`, the same variable-length integer scheme Bitcoin uses.
pub fn encode_var_int(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

pub fn decode_var_int(cur: &mut Cursor) -> Result<u64, CodecError> {
    let prefix = cur.take_array::<1>()?[0];
    Ok(match prefix {
        0xFD => u16::from_le_bytes(cur.take_array::<2>()?) as u64,
        0xFE => u32::from_le_bytes(cur.take_array::<4>()?) as u64,
        0xFF => u64::from_le_bytes(cur.take_array::<8>()?),
        _ => prefix as u64,
    })
}

/// `var_int` length, followed by raw UTF-8 bytes.
pub fn encode_var_str(s: &str, out: &mut Vec<u8>) {
    encode_var_int(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

/// Caps the user-agent length well below any frame-size limit, so a hostile peer can't use
/// the string length prefix alone to force a large allocation.
pub const MAX_VAR_STR_LEN: usize = 4096;

pub fn decode_var_str(cur: &mut Cursor) -> Result<String, CodecError> {
    let len = decode_var_int(cur)?;
    if len as usize > MAX_VAR_STR_LEN {
        return Err(CodecError::StringTooLong(len as usize));
    }
    let bytes = cur.take(len as usize)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

pub fn encode_vec<T: Encode>(items: &[T], out: &mut Vec<u8>) {
    encode_var_int(items.len() as u64, out);
    for item in items {
        item.encode(out);
    }
}

pub fn decode_vec<T: Decode>(cur: &mut Cursor, max_len: usize) -> Result<Vec<T>, CodecError> {
    let len = decode_var_int(cur)?;
    if len as usize > max_len {
        return Err(CodecError::Eof { needed: 0 });
    }
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(T::decode(cur)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_round_trips_all_size_classes() {
        for value in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            let mut buf = Vec::new();
            encode_var_int(value, &mut buf);
            let mut cur = Cursor::new(&buf);
            assert_eq!(decode_var_int(&mut cur).unwrap(), value);
        }
    }

    #[test]
    fn var_str_round_trips() {
        let mut buf = Vec::new();
        encode_var_str("node/1.0", &mut buf);
        let mut cur = Cursor::new(&buf);
        assert_eq!(decode_var_str(&mut cur).unwrap(), "node/1.0");
    }
}
