//! The 100-byte fixed block header (§6.1) and chain-work arithmetic.
//!
//! The header format intentionally has no `tx_count` field (the chain is headers-only) and
//! carries a `randomx_hash` commitment instead of Bitcoin's SHA-256d PoW; evaluating that
//! commitment is the RandomX evaluator's job, out of this crate's scope (§1).
use bitcoin_hashes::{sha256d, Hash as _};

use crate::codec::{self, Cursor, Decode, Encode};
use crate::error::CodecError;

/// A double-SHA256 block identity hash. The PoW commitment itself lives in
/// [`BlockHeader::randomx_hash`] and is checked by the external RandomX evaluator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Bitcoin-style reversed hex display.
        for byte in self.0.iter().rev() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Encode for BlockHash {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl Decode for BlockHash {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        Ok(BlockHash(cur.take_array::<32>()?))
    }
}

/// Total accumulated proof-of-work, as a big number represented by a `u128`. Bitcoin Core
/// uses a 256-bit `arith_uint256`; `u128` is ample headroom for this chain's difficulty
/// range and keeps the arithmetic in plain Rust integers.
pub type Work = u128;

/// Fixed 100-byte block header: `version`(4) + `prev_block`(32) + `miner_address`(20) +
/// `time`(4) + `bits`(4) + `nonce`(4) + `randomx_hash`(32) = 100 bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: BlockHash,
    pub miner_address: [u8; 20],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub randomx_hash: [u8; 32],
}

pub const BLOCK_HEADER_SIZE: usize = 100;

impl BlockHeader {
    /// Block identity hash: double-SHA256 over the serialized header.
    pub fn block_hash(&self) -> BlockHash {
        let bytes = self.encode_to_vec();
        BlockHash(sha256d::Hash::hash(&bytes).into_inner())
    }

    /// `GetBlockProof`-style work estimate from compact `bits`, mirroring Bitcoin Core's
    /// `chainparams`-independent formula: `work = 2^256 / (target + 1)`, truncated to fit
    /// this crate's `u128` chain-work representation.
    pub fn work(&self) -> Work {
        work_from_bits(self.bits)
    }
}

/// Expand the compact `bits` encoding into a work value. Saturates rather than overflowing
/// on pathological (near-zero-difficulty) inputs, since those only arise from a malicious
/// or corrupt header and should never panic the sync path.
pub fn work_from_bits(bits: u32) -> Work {
    let target = expand_compact(bits);
    if target == 0 {
        return 0;
    }
    // 2^128 / (target + 1), approximating Bitcoin's 2^256 formula at our u128 chain-work width.
    let numerator = u128::MAX;
    numerator / target.saturating_add(1)
}

fn expand_compact(bits: u32) -> u128 {
    let exponent = (bits >> 24) as u32;
    let mantissa = (bits & 0x00FF_FFFF) as u128;

    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        let shift = 8 * (exponent.saturating_sub(3));
        if shift >= 128 {
            u128::MAX
        } else {
            mantissa.saturating_mul(1u128 << shift)
        }
    }
}

impl Encode for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.prev_block.encode(out);
        out.extend_from_slice(&self.miner_address);
        self.time.encode(out);
        self.bits.encode(out);
        self.nonce.encode(out);
        out.extend_from_slice(&self.randomx_hash);
    }
}

impl Decode for BlockHeader {
    fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let version = i32::decode(cur)?;
        let prev_block = BlockHash::decode(cur)?;
        let miner_address = cur.take_array::<20>()?;
        let time = u32::decode(cur)?;
        let bits = u32::decode(cur)?;
        let nonce = u32::decode(cur)?;
        let randomx_hash = cur.take_array::<32>()?;
        Ok(Self {
            version,
            prev_block,
            miner_address,
            time,
            bits,
            nonce,
            randomx_hash,
        })
    }
}

/// A `getheaders`/locator-style exponentially thinning list of hashes.
///
/// `step(offset)` must return the hash `offset` blocks back from the starting point, or
/// `None` once `offset` runs past genesis. The first 10 entries are consecutive (`offset`
/// 0, 1, 2, ...); past that the gap between entries doubles each time, so a locator stays
/// short even for a very tall chain.
pub fn build_locator(mut step: impl FnMut(usize) -> Option<BlockHash>) -> Vec<BlockHash> {
    let mut locator = Vec::new();
    let mut index = 0usize;
    let mut step_size = 1usize;

    loop {
        match step(index) {
            Some(hash) => locator.push(hash),
            None => break,
        }
        if locator.len() >= 10 {
            step_size *= 2;
        }
        index += step_size;
    }
    locator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: BlockHash([7u8; 32]),
            miner_address: [9u8; 20],
            time: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce,
            randomx_hash: [3u8; 32],
        }
    }

    #[test]
    fn header_round_trips_and_is_exactly_100_bytes() {
        let header = sample_header(42);
        let bytes = header.encode_to_vec();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);
        let decoded = BlockHeader::decode_all(&bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn distinct_headers_hash_differently() {
        let a = sample_header(1);
        let b = sample_header(2);
        assert_ne!(a.block_hash(), b.block_hash());
    }

    #[test]
    fn work_increases_as_bits_tighten() {
        let easy = work_from_bits(0x1d00ffff);
        let hard = work_from_bits(0x1c00ffff);
        assert!(hard > easy);
    }

    #[test]
    fn locator_is_consecutive_near_tip_then_thins_out() {
        let tip_height = 30usize;
        let hash_at = |height: usize| BlockHash([height as u8; 32]);
        let locator = build_locator(|offset| {
            if offset > tip_height {
                None
            } else {
                Some(hash_at(tip_height - offset))
            }
        });

        assert_eq!(locator[0], hash_at(tip_height));
        assert_eq!(locator[1], hash_at(tip_height - 1));
        assert_eq!(locator[9], hash_at(tip_height - 9));
        // Past the 10th entry the gap doubles, so the next entry is 2 blocks further back.
        assert_eq!(locator[10], hash_at(tip_height - 11));
        assert!(locator.len() < tip_height);
    }

    #[test]
    fn locator_stops_at_genesis() {
        let locator = build_locator(|offset| if offset == 0 { Some(BlockHash::ZERO) } else { None });
        assert_eq!(locator, vec![BlockHash::ZERO]);
    }
}
