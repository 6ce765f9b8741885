//! The `Chainstate` interface (§6.2): header validation, chain selection, and block-index
//! storage are owned by a collaborator outside this crate (`ChainstateManager`, out of scope
//! per §1). This module defines the narrow trait the header-sync coordinator (§4.9) drives,
//! plus a minimal in-memory implementation used by tests and simulated scenarios.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use hdr_types::{build_locator, BlockHash, BlockHeader, Network, Work};

use crate::fsm::handler::PeerId;

/// An entry in the block tree (§9's design note): immutable once inserted. `height` and
/// `chain_work` are fixed at insertion time and never mutated — they're recomputed from the
/// parent, never updated in place, so a handle to one never goes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIndex {
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub height: i32,
    pub chain_work: Work,
}

/// Chain-wide parameters a [`Chainstate`] implementation is configured with.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub genesis_hash: BlockHash,
    pub pow_limit: u32,
    fixed_seeds: Vec<SocketAddr>,
}

impl ChainParams {
    pub fn new(network: Network, genesis_hash: BlockHash, pow_limit: u32, fixed_seeds: Vec<SocketAddr>) -> Self {
        Self {
            network,
            genesis_hash,
            pow_limit,
            fixed_seeds,
        }
    }

    /// Hardcoded bootstrap peers, consulted when AddrMan is empty at startup (§4.12).
    pub fn fixed_seeds(&self) -> &[SocketAddr] {
        &self.fixed_seeds
    }
}

/// Why [`Chainstate::accept_block_header`] rejected a header (§4.9.3 step 11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// `prev_block` isn't a known header. Callers stash the header in the orphan cache.
    PrevBlkNotFound,
    /// Already known and valid. Benign, never scored.
    DuplicateOfValid,
    /// Already known and previously marked invalid.
    DuplicateOfInvalid,
    HighHash,
    BadDiffbits,
    TimeTooOld,
    TimeTooNew,
    BadVersion,
    BadPrevblk,
    BadGenesis,
    GenesisViaAccept,
}

impl RejectReason {
    /// Reasons that count as "an invalid header" for per-peer dedup/scoring purposes
    /// (§4.9.3 step 11's third bullet) as opposed to the benign duplicate/orphan cases.
    pub fn is_invalid_header(&self) -> bool {
        !matches!(self, Self::PrevBlkNotFound | Self::DuplicateOfValid | Self::DuplicateOfInvalid)
    }
}

/// The narrow view of block/header validation and chain selection the p2p core consumes
/// (§6.2). Implemented in production by `ChainstateManager`, out of this crate's scope;
/// implemented here by [`MemoryChainstate`] for tests.
pub trait Chainstate: Send {
    fn tip(&self) -> Option<BlockIndex>;
    fn get_block_at_height(&self, height: i32) -> Option<BlockIndex>;
    fn lookup_block_index(&self, hash: &BlockHash) -> Option<BlockIndex>;
    /// The full header body for a known hash, for replying to `getheaders` (§4.9.4). Separate
    /// from [`Chainstate::lookup_block_index`] since the index itself only carries the summary
    /// a reorg needs, not the wire-format bytes.
    fn get_header(&self, hash: &BlockHash) -> Option<BlockHeader>;
    fn is_on_active_chain(&self, idx: &BlockIndex) -> bool;
    /// Locator hashes, walking back from `from` (or the active tip's parent if `None`, per
    /// §4.9.2's `pprev_of_tip` rule) to genesis.
    fn get_locator(&self, from: Option<&BlockIndex>) -> Vec<BlockHash>;
    fn get_chain_height(&self) -> i32;
    fn is_initial_block_download(&self) -> bool;
    /// Validate and insert one header. `min_pow_checked` lets a caller that already verified
    /// cheap PoW commitment (§4.9.3 step 7) skip re-checking it here.
    fn accept_block_header(&mut self, header: &BlockHeader, min_pow_checked: bool) -> Result<BlockIndex, RejectReason>;
    fn try_add_block_index_candidate(&mut self, idx: &BlockIndex);
    /// Re-evaluate the active chain against all candidates. Returns `false` on failure
    /// (callers clear their sync peer in that case, per §4.9.3 step 12).
    fn activate_best_chain(&mut self) -> bool;
    /// Cheap, stateless PoW-commitment sanity check over a whole batch (§4.9.3 step 7).
    fn check_headers_pow(&self, batch: &[BlockHeader]) -> bool;
    /// The anti-DoS low-work threshold (§4.9.3 step 9), effectively zero during IBD.
    fn anti_dos_work_threshold(&self) -> Work;
    /// Stash an orphan header against a peer's bounded cache. Returns `false` if that peer's
    /// cache is already at capacity (§4.9.3 step 11's first bullet).
    fn add_orphan_header(&mut self, header: BlockHeader, peer: PeerId) -> bool;
    fn params(&self) -> &ChainParams;
}

/// Per-peer cap on orphan headers awaiting their parent (§4.9.3 step 11, §7).
pub const MAX_ORPHANS_PER_PEER: usize = 100;

/// A minimal, arena-style in-memory [`Chainstate`]. Good enough to drive the header-sync
/// coordinator's tests and the end-to-end scenarios (§8); not a substitute for the real
/// `ChainstateManager`, which additionally enforces full PoW/consensus validity.
pub struct MemoryChainstate {
    params: ChainParams,
    index: HashMap<BlockHash, BlockIndex>,
    headers: HashMap<BlockHash, BlockHeader>,
    invalid: HashSet<BlockHash>,
    candidates: HashSet<BlockHash>,
    active_tip: BlockHash,
    /// Active-chain height -> hash, used for locator construction and `get_block_at_height`.
    active_by_height: HashMap<i32, BlockHash>,
    orphans: HashMap<PeerId, Vec<BlockHeader>>,
    ibd: bool,
}

impl MemoryChainstate {
    /// Start a fresh chain with just `genesis` at height 0.
    pub fn new(params: ChainParams, genesis: BlockHeader) -> Self {
        let hash = genesis.block_hash();
        let genesis_idx = BlockIndex {
            hash,
            prev_hash: BlockHash::ZERO,
            height: 0,
            chain_work: genesis.work(),
        };
        let mut index = HashMap::new();
        index.insert(hash, genesis_idx);
        let mut headers = HashMap::new();
        headers.insert(hash, genesis);
        let mut active_by_height = HashMap::new();
        active_by_height.insert(0, hash);

        Self {
            params,
            index,
            headers,
            invalid: HashSet::new(),
            candidates: HashSet::new(),
            active_tip: hash,
            active_by_height,
            orphans: HashMap::new(),
            ibd: true,
        }
    }

    /// Force initial-block-download state, for tests that want to exercise post-IBD paths.
    pub fn set_ibd(&mut self, ibd: bool) {
        self.ibd = ibd;
    }

    fn active_tip_index(&self) -> BlockIndex {
        self.index[&self.active_tip]
    }
}

impl Chainstate for MemoryChainstate {
    fn tip(&self) -> Option<BlockIndex> {
        Some(self.active_tip_index())
    }

    fn get_block_at_height(&self, height: i32) -> Option<BlockIndex> {
        self.active_by_height.get(&height).and_then(|h| self.index.get(h)).copied()
    }

    fn lookup_block_index(&self, hash: &BlockHash) -> Option<BlockIndex> {
        self.index.get(hash).copied()
    }

    fn get_header(&self, hash: &BlockHash) -> Option<BlockHeader> {
        self.headers.get(hash).copied()
    }

    fn is_on_active_chain(&self, idx: &BlockIndex) -> bool {
        self.active_by_height.get(&idx.height) == Some(&idx.hash)
    }

    fn get_locator(&self, from: Option<&BlockIndex>) -> Vec<BlockHash> {
        let start = match from {
            Some(idx) => *idx,
            None => {
                // pprev_of_tip (§4.9.2): the tip's parent, guaranteeing a non-empty reply
                // even when our tip matches the peer's.
                let tip = self.active_tip_index();
                self.index.get(&tip.prev_hash).copied().unwrap_or(tip)
            }
        };
        let mut locator = build_locator(|offset| {
            let height = start.height - offset as i32;
            if height < 0 {
                None
            } else {
                self.active_by_height.get(&height).copied()
            }
        });
        if locator.last() != Some(&self.params.genesis_hash) {
            locator.push(self.params.genesis_hash);
        }
        locator
    }

    fn get_chain_height(&self) -> i32 {
        self.active_tip_index().height
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd
    }

    fn accept_block_header(&mut self, header: &BlockHeader, min_pow_checked: bool) -> Result<BlockIndex, RejectReason> {
        let hash = header.block_hash();

        // Checked ahead of `index`: a header that failed validation is never inserted into the
        // index (its height/chain_work would be meaningless), so only `invalid` remembers it.
        if self.invalid.contains(&hash) {
            return Err(RejectReason::DuplicateOfInvalid);
        }
        if self.index.contains_key(&hash) {
            return Err(RejectReason::DuplicateOfValid);
        }

        if header.prev_block.is_zero() {
            // Only genesis may have an all-zero parent, and genesis never arrives through
            // this path (it's seeded at construction).
            self.invalid.insert(hash);
            return Err(RejectReason::GenesisViaAccept);
        }

        let Some(prev) = self.index.get(&header.prev_block).copied() else {
            return Err(RejectReason::PrevBlkNotFound);
        };

        if header.version < 1 {
            self.invalid.insert(hash);
            return Err(RejectReason::BadVersion);
        }
        if header.bits == 0 || header.bits > self.params.pow_limit {
            self.invalid.insert(hash);
            return Err(RejectReason::BadDiffbits);
        }
        if !min_pow_checked && !self.check_headers_pow(std::slice::from_ref(header)) {
            self.invalid.insert(hash);
            return Err(RejectReason::HighHash);
        }

        let block_index = BlockIndex {
            hash,
            prev_hash: header.prev_block,
            height: prev.height + 1,
            chain_work: prev.chain_work.saturating_add(header.work()),
        };
        self.index.insert(hash, block_index);
        self.headers.insert(hash, *header);
        Ok(block_index)
    }

    fn try_add_block_index_candidate(&mut self, idx: &BlockIndex) {
        self.candidates.insert(idx.hash);
    }

    fn activate_best_chain(&mut self) -> bool {
        let current = self.active_tip_index();
        let best = self
            .candidates
            .iter()
            .filter_map(|hash| self.index.get(hash))
            .chain(std::iter::once(&current))
            .max_by_key(|idx| idx.chain_work)
            .copied();

        let Some(best) = best else {
            return false;
        };
        if best.hash == self.active_tip {
            return true;
        }

        // Rebuild the active-chain height index by walking the new tip back to its most
        // recent common ancestor with the current one.
        let mut chain = Vec::new();
        let mut cursor = best;
        loop {
            chain.push(cursor);
            if cursor.hash == self.params.genesis_hash {
                break;
            }
            match self.index.get(&cursor.prev_hash) {
                Some(parent) => cursor = *parent,
                None => break,
            }
        }
        self.active_by_height.clear();
        for entry in chain {
            self.active_by_height.insert(entry.height, entry.hash);
        }
        self.active_tip = best.hash;
        self.candidates.remove(&best.hash);
        true
    }

    fn check_headers_pow(&self, batch: &[BlockHeader]) -> bool {
        batch.iter().all(|h| h.bits != 0 && h.bits <= self.params.pow_limit)
    }

    fn anti_dos_work_threshold(&self) -> Work {
        if self.ibd {
            0
        } else {
            self.active_tip_index().chain_work / 2
        }
    }

    fn add_orphan_header(&mut self, header: BlockHeader, peer: PeerId) -> bool {
        let entry = self.orphans.entry(peer).or_default();
        if entry.len() >= MAX_ORPHANS_PER_PEER {
            return false;
        }
        entry.push(header);
        true
    }

    fn params(&self) -> &ChainParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: BlockHash::ZERO,
            miner_address: [0u8; 20],
            time: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 0,
            randomx_hash: [0u8; 32],
        }
    }

    fn child(prev: BlockHash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            miner_address: [1u8; 20],
            time: 1_700_000_100 + nonce,
            bits: 0x1d00ffff,
            nonce,
            randomx_hash: [0u8; 32],
        }
    }

    fn chain() -> (MemoryChainstate, BlockHash) {
        let genesis = genesis();
        let genesis_hash = genesis.block_hash();
        let params = ChainParams::new(Network::Regtest, genesis_hash, 0x1d00ffff, Vec::new());
        (MemoryChainstate::new(params, genesis), genesis_hash)
    }

    #[test]
    fn accepts_a_connecting_header_and_extends_the_tip() {
        let (mut cs, genesis_hash) = chain();
        let h1 = child(genesis_hash, 1);
        let idx = cs.accept_block_header(&h1, false).unwrap();
        assert_eq!(idx.height, 1);
        cs.try_add_block_index_candidate(&idx);
        assert!(cs.activate_best_chain());
        assert_eq!(cs.tip().unwrap().hash, h1.block_hash());
    }

    #[test]
    fn rejects_unknown_parent_as_orphan_candidate() {
        let (mut cs, _genesis) = chain();
        let orphan = child(BlockHash([9u8; 32]), 7);
        assert_eq!(cs.accept_block_header(&orphan, false), Err(RejectReason::PrevBlkNotFound));
    }

    #[test]
    fn duplicate_of_valid_header_is_benign() {
        let (mut cs, genesis_hash) = chain();
        let h1 = child(genesis_hash, 1);
        cs.accept_block_header(&h1, false).unwrap();
        assert_eq!(cs.accept_block_header(&h1, false), Err(RejectReason::DuplicateOfValid));
    }

    #[test]
    fn duplicate_of_an_invalid_header_is_reported_as_such() {
        let (mut cs, genesis_hash) = chain();
        let mut bad = child(genesis_hash, 1);
        bad.version = 0;
        assert_eq!(cs.accept_block_header(&bad, false), Err(RejectReason::BadVersion));
        assert_eq!(cs.accept_block_header(&bad, false), Err(RejectReason::DuplicateOfInvalid));
    }

    #[test]
    fn heavier_side_chain_becomes_active_on_activate() {
        let (mut cs, genesis_hash) = chain();
        let a1 = child(genesis_hash, 1);
        let a1_idx = cs.accept_block_header(&a1, false).unwrap();
        cs.try_add_block_index_candidate(&a1_idx);
        cs.activate_best_chain();

        // A heavier fork at the same height should take over once activated.
        let mut heavier = child(genesis_hash, 2);
        heavier.bits = 0x1c00ffff; // tighter target, more work
        let heavier_idx = cs.accept_block_header(&heavier, false).unwrap();
        cs.try_add_block_index_candidate(&heavier_idx);
        cs.activate_best_chain();

        assert_eq!(cs.tip().unwrap().hash, heavier.block_hash());
        assert!(cs.is_on_active_chain(&heavier_idx));
        assert!(!cs.is_on_active_chain(&a1_idx));
    }

    #[test]
    fn orphan_cache_is_capped_per_peer() {
        let (mut cs, _genesis) = chain();
        let peer: PeerId = "127.0.0.1:9999".parse().unwrap();
        for i in 0..MAX_ORPHANS_PER_PEER {
            assert!(cs.add_orphan_header(child(BlockHash([i as u8; 32]), i as u32), peer));
        }
        assert!(!cs.add_orphan_header(child(BlockHash([255; 32]), 255), peer));
    }

    #[test]
    fn locator_ends_in_genesis() {
        let (mut cs, genesis_hash) = chain();
        let mut prev = genesis_hash;
        for i in 1..20u32 {
            let h = child(prev, i);
            let idx = cs.accept_block_header(&h, false).unwrap();
            cs.try_add_block_index_candidate(&idx);
            cs.activate_best_chain();
            prev = h.block_hash();
        }
        let locator = cs.get_locator(None);
        assert_eq!(*locator.last().unwrap(), genesis_hash);
    }
}
