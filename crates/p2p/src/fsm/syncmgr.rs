//! Header-sync coordinator (§4.9): selects a single outbound sync peer, drives the
//! `getheaders`/`headers` exchange against it, and answers peers' own `getheaders` requests
//! out of the active chain.
use hdr_types::{BlockHash, BlockHeader, GetHeadersPayload, PROTOCOL_VERSION, MAX_HEADERS_SIZE};

use crate::chainstate::{Chainstate, RejectReason};
use crate::fsm::banmgr::BanManager;
use crate::fsm::handler::{DisconnectReason, PeerId};
use crate::fsm::output::{Connect, Disconnect as OutputDisconnect, SetTimer, Wire};
use crate::fsm::peermgr::{
    PeerManager, PENALTY_INVALID_HEADER, PENALTY_INVALID_POW, PENALTY_NON_CONTINUOUS_HEADERS,
    PENALTY_OVERSIZED_MESSAGE, PENALTY_TOO_MANY_ORPHANS,
};
use crate::net::{LocalDuration, LocalTime};

/// How long without progress from the sync peer before it's considered stalling and replaced
/// with another candidate (§4.9.1).
pub const HEADERS_STALLING_TIMEOUT: LocalDuration = LocalDuration::from_secs(120);

/// An event emitted by the header-sync coordinator.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new sync peer was chosen, and a `getheaders` sent to it.
    SyncPeerSelected { addr: PeerId },
    /// The sync peer disconnected; a replacement was chosen if one was available.
    SyncPeerDisconnected { addr: PeerId },
    /// One or more headers from a `headers` message were accepted.
    HeadersReceived { from: PeerId, count: usize, height: i32 },
    /// A header was rejected outright (as opposed to stashed as an orphan).
    HeaderRejected { from: PeerId, reason: &'static str },
    /// The active chain height the sync peer brought us to, with nothing more to request.
    Synced { height: i32 },
    /// The sync peer stopped making progress within [`HEADERS_STALLING_TIMEOUT`].
    Stalling { addr: PeerId },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::SyncPeerSelected { addr } => write!(f, "{}: selected as sync peer", addr),
            Event::SyncPeerDisconnected { addr } => write!(f, "{}: sync peer disconnected", addr),
            Event::HeadersReceived { from, count, height } => {
                write!(f, "{}: accepted {} header(s), height now {}", from, count, height)
            }
            Event::HeaderRejected { from, reason } => write!(f, "{}: rejected header ({})", from, reason),
            Event::Synced { height } => write!(f, "synced to height {}", height),
            Event::Stalling { addr } => write!(f, "{}: sync peer stalling", addr),
        }
    }
}

/// The narrow slice of peer-manager behavior the coordinator needs to score and disconnect
/// misbehaving peers, kept separate from [`PeerManager`]'s own upstream type parameter so this
/// module doesn't need to be generic over it too.
pub trait PeerScoring {
    fn misbehaving(&mut self, addr: &PeerId, penalty: u32, ban: &mut BanManager, now: LocalTime) -> bool;
    fn note_unconnecting_headers(&mut self, addr: &PeerId) -> Option<u32>;
    fn note_invalid_header(&mut self, addr: &PeerId, hash: BlockHash) -> bool;
    fn disconnect_peer(&mut self, addr: PeerId, reason: DisconnectReason);
}

impl<U: Wire<crate::fsm::peermgr::Event> + SetTimer + Connect + OutputDisconnect> PeerScoring for PeerManager<U> {
    fn misbehaving(&mut self, addr: &PeerId, penalty: u32, ban: &mut BanManager, now: LocalTime) -> bool {
        PeerManager::misbehaving(self, addr, penalty, ban, now)
    }

    fn note_unconnecting_headers(&mut self, addr: &PeerId) -> Option<u32> {
        PeerManager::note_unconnecting_headers(self, addr)
    }

    fn note_invalid_header(&mut self, addr: &PeerId, hash: BlockHash) -> bool {
        PeerManager::note_invalid_header(self, addr, hash)
    }

    fn disconnect_peer(&mut self, addr: PeerId, reason: DisconnectReason) {
        PeerManager::disconnect(self, addr, reason)
    }
}

fn reject_name(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::PrevBlkNotFound => "prev-blk-not-found",
        RejectReason::DuplicateOfValid => "duplicate-of-valid",
        RejectReason::DuplicateOfInvalid => "duplicate-of-invalid",
        RejectReason::HighHash => "high-hash",
        RejectReason::BadDiffbits => "bad-diffbits",
        RejectReason::TimeTooOld => "time-too-old",
        RejectReason::TimeTooNew => "time-too-new",
        RejectReason::BadVersion => "bad-version",
        RejectReason::BadPrevblk => "bad-prevblk",
        RejectReason::BadGenesis => "bad-genesis",
        RejectReason::GenesisViaAccept => "genesis-via-accept",
    }
}

/// Drives header synchronization against a single chosen peer at a time (§4.9.1).
pub struct SyncManager<C, U> {
    chainstate: C,
    sync_peer: Option<PeerId>,
    last_progress: Option<LocalTime>,
    upstream: U,
}

impl<C: Chainstate, U: Wire<Event> + SetTimer> SyncManager<C, U> {
    pub fn new(chainstate: C, upstream: U) -> Self {
        Self {
            chainstate,
            sync_peer: None,
            last_progress: None,
            upstream,
        }
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.sync_peer
    }

    pub fn is_synced(&self) -> bool {
        !self.chainstate.is_initial_block_download()
    }

    /// Whether `hash` is a block we haven't heard of yet, used by the block-relay coordinator
    /// to decide whether an `inv` announcement is worth a `getheaders` trigger (§4.10.3).
    pub fn lookup_unknown(&self, hash: &BlockHash) -> bool {
        self.chainstate.lookup_block_index(hash).is_none()
    }

    /// The active tip's hash, used by the block-relay coordinator to announce it to peers
    /// (§4.10, §4.12's periodic/per-peer tip announcement).
    pub fn tip_hash(&self) -> Option<BlockHash> {
        self.chainstate.tip().map(|idx| idx.hash)
    }

    /// Called once a peer's handshake completes. Only outbound, negotiated peers are eligible
    /// to become the sync peer (§4.9.1); a feeler or inbound connection never is.
    pub fn peer_negotiated(&mut self, addr: PeerId, is_outbound: bool, now: LocalTime) {
        if is_outbound && self.sync_peer.is_none() {
            self.set_sync_peer(addr, now);
        }
    }

    /// Called for every disconnecting peer; replaces the sync peer if it was the one that left.
    pub fn peer_disconnected(&mut self, addr: &PeerId, candidates: &[PeerId], now: LocalTime) {
        if self.sync_peer.as_ref() != Some(addr) {
            return;
        }
        self.sync_peer = None;
        self.upstream.event(Event::SyncPeerDisconnected { addr: *addr });
        if let Some(&next) = candidates.iter().find(|a| *a != addr) {
            self.set_sync_peer(next, now);
        }
    }

    /// Periodic tick: pick up a sync peer if we have none, or replace a stalling one
    /// (§4.9.1, §7).
    pub fn received_wake(&mut self, candidates: &[PeerId], now: LocalTime) {
        match self.sync_peer {
            Some(addr) => {
                let last = self.last_progress.unwrap_or(now);
                if now.duration_since(last) >= HEADERS_STALLING_TIMEOUT {
                    self.upstream.event(Event::Stalling { addr });
                    self.sync_peer = None;
                    if let Some(&next) = candidates.iter().find(|a| **a != addr) {
                        self.set_sync_peer(next, now);
                    }
                }
            }
            None => {
                if let Some(&addr) = candidates.first() {
                    self.set_sync_peer(addr, now);
                }
            }
        }
        self.upstream.set_timer(HEADERS_STALLING_TIMEOUT);
    }

    fn set_sync_peer(&mut self, addr: PeerId, now: LocalTime) {
        self.sync_peer = Some(addr);
        self.last_progress = Some(now);
        self.request_headers(addr);
        self.upstream.event(Event::SyncPeerSelected { addr });
    }

    fn request_headers(&mut self, addr: PeerId) {
        let locator = self.chainstate.get_locator(None);
        self.upstream.get_headers(
            addr,
            GetHeadersPayload {
                version: PROTOCOL_VERSION as u32,
                locator,
                hash_stop: BlockHash::ZERO,
            },
        );
    }

    /// Turn an `inv` block announcement into a `getheaders` request (§4.10.3). During initial
    /// block download only the designated sync peer's announcements are honored, adopting the
    /// announcer as sync peer if none is set yet; once synced, any peer's announcement triggers
    /// a request.
    pub fn handle_inv_announcement(&mut self, from: PeerId, now: LocalTime) {
        if self.chainstate.is_initial_block_download() {
            match self.sync_peer {
                None => self.set_sync_peer(from, now),
                Some(addr) if addr == from => self.request_headers(from),
                Some(_) => {}
            }
        } else {
            self.request_headers(from);
        }
    }

    /// Answer a peer's own `getheaders` request (§4.9.4): walk its locator to the highest
    /// hash we recognize on the active chain, and reply with what comes after it, capped at
    /// [`MAX_HEADERS_SIZE`] and honoring `hash_stop`.
    pub fn received_get_headers(&mut self, from: PeerId, payload: GetHeadersPayload) {
        let fork_point = payload.locator.iter().find_map(|hash| {
            self.chainstate
                .lookup_block_index(hash)
                .filter(|idx| self.chainstate.is_on_active_chain(idx))
        });

        let start_height = fork_point.map(|idx| idx.height + 1).unwrap_or(0);
        let tip_height = self.chainstate.get_chain_height();

        let mut reply = Vec::new();
        let mut height = start_height;
        while height <= tip_height && reply.len() < MAX_HEADERS_SIZE {
            let Some(idx) = self.chainstate.get_block_at_height(height) else {
                break;
            };
            if idx.hash == payload.hash_stop {
                break;
            }
            let Some(header) = self.chainstate.get_header(&idx.hash) else {
                break;
            };
            reply.push(header);
            height += 1;
        }
        self.upstream.headers(from, reply);
    }

    /// The full 13-step `headers` message handler (§4.9.3): IBD gating, oversize/continuity/PoW
    /// checks, per-header acceptance with misbehavior scoring, chain re-activation, and the
    /// follow-up `getheaders` for a still-incomplete batch.
    pub fn received_headers<P: PeerScoring>(
        &mut self,
        from: &PeerId,
        headers: Vec<BlockHeader>,
        peers: &mut P,
        ban: &mut BanManager,
        candidates: &[PeerId],
        now: LocalTime,
    ) {
        // Step 1: IBD gating. Only the designated sync peer may push a large batch while we're
        // still catching up — other peers' large batches are silently ignored (no penalty),
        // since during IBD we can't yet tell an honest racing peer from a DoS attempt.
        if self.chainstate.is_initial_block_download()
            && headers.len() > 2
            && self.sync_peer.as_ref() != Some(from)
        {
            return;
        }

        // Step 2: skip-DoS-checks heuristic. If the batch's last header is already known and on
        // the active chain (not merely a side chain — that distinction is this implementation's
        // deliberate tightening over the historic behavior), treat re-announcements as benign;
        // this covers a peer re-sending after a local invalidate.
        let skip_dos_checks = headers.last().is_some_and(|h| {
            self.chainstate
                .lookup_block_index(&h.block_hash())
                .is_some_and(|idx| self.chainstate.is_on_active_chain(&idx))
        });

        // Step 3: progress tracking, regardless of what the batch turns out to contain.
        if self.sync_peer.as_ref() == Some(from) {
            self.last_progress = Some(now);
        }

        // Step 4: an empty batch means the peer has nothing more to offer; free the sync-peer
        // slot so the next maintenance tick can pick a (possibly different) candidate.
        if headers.is_empty() {
            if self.sync_peer.as_ref() == Some(from) {
                self.upstream.event(Event::Synced { height: self.chainstate.get_chain_height() });
                self.sync_peer = None;
            }
            return;
        }

        // Step 5: oversize.
        if headers.len() > MAX_HEADERS_SIZE {
            if peers.misbehaving(from, PENALTY_OVERSIZED_MESSAGE, ban, now) {
                peers.disconnect_peer(*from, DisconnectReason::PeerMisbehaving("oversized headers message"));
            }
            if self.sync_peer.as_ref() == Some(from) {
                self.sync_peer = None;
            }
            return;
        }

        // Step 6: first-prev connectivity. An orphan batch doesn't clear the sync peer — we
        // keep it and ask again, in case the missing parent arrives through another path.
        let first = &headers[0];
        if !first.prev_block.is_zero() && self.chainstate.lookup_block_index(&first.prev_block).is_none() {
            if let Some(penalty) = peers.note_unconnecting_headers(from) {
                if peers.misbehaving(from, penalty, ban, now) {
                    peers.disconnect_peer(*from, DisconnectReason::PeerMisbehaving("too many unconnecting headers"));
                    return;
                }
            }
            self.request_headers(*from);
            return;
        }

        // Step 7: cheap PoW commitment check.
        if !self.chainstate.check_headers_pow(&headers) {
            if peers.misbehaving(from, PENALTY_INVALID_POW, ban, now) {
                peers.disconnect_peer(*from, DisconnectReason::PeerMisbehaving("invalid proof-of-work commitment"));
            }
            if self.sync_peer.as_ref() == Some(from) {
                self.sync_peer = None;
            }
            return;
        }

        // Step 8: continuity.
        for pair in headers.windows(2) {
            if pair[1].prev_block != pair[0].block_hash() {
                if peers.misbehaving(from, PENALTY_NON_CONTINUOUS_HEADERS, ban, now) {
                    peers.disconnect_peer(*from, DisconnectReason::PeerMisbehaving("non-continuous headers"));
                }
                if self.sync_peer.as_ref() == Some(from) {
                    self.sync_peer = None;
                }
                return;
            }
        }

        // Step 9: anti-DoS low-work gate, skipped entirely when step 2's heuristic fired.
        if !skip_dos_checks {
            let batch_work: u128 = headers.iter().map(|h| h.work()).fold(0u128, |acc, w| acc.saturating_add(w));
            let prev_work = self
                .chainstate
                .lookup_block_index(&first.prev_block)
                .map(|idx| idx.chain_work)
                .unwrap_or(0);
            let total_work = prev_work.saturating_add(batch_work);
            if total_work < self.chainstate.anti_dos_work_threshold() {
                if headers.len() < MAX_HEADERS_SIZE {
                    // The peer has exhausted its chain. Non-punitive: keep it as sync peer.
                    return;
                }
                // A full batch below threshold may still be a prefix of a heavier chain.
                self.request_headers(*from);
                return;
            }
        }

        // Step 10 (last_batch_size) is implicit in `headers.len()`, consulted in step 13 below.
        // Step 11: accept each header.
        let mut accepted = 0usize;
        for header in &headers {
            match self.chainstate.accept_block_header(header, false) {
                Ok(idx) => {
                    self.chainstate.try_add_block_index_candidate(&idx);
                    accepted += 1;
                }
                Err(RejectReason::PrevBlkNotFound) => {
                    if !self.chainstate.add_orphan_header(*header, *from) {
                        peers.misbehaving(from, PENALTY_TOO_MANY_ORPHANS, ban, now);
                    }
                    break;
                }
                Err(RejectReason::DuplicateOfValid) => continue,
                Err(RejectReason::DuplicateOfInvalid) => {
                    if skip_dos_checks {
                        continue;
                    }
                    if peers.note_invalid_header(from, header.block_hash())
                        && peers.misbehaving(from, PENALTY_INVALID_HEADER, ban, now)
                    {
                        peers.disconnect_peer(*from, DisconnectReason::PeerMisbehaving("duplicate of known-invalid header"));
                    }
                    continue;
                }
                Err(reason) => {
                    if peers.note_invalid_header(from, header.block_hash())
                        && peers.misbehaving(from, PENALTY_INVALID_HEADER, ban, now)
                    {
                        peers.disconnect_peer(*from, DisconnectReason::PeerMisbehaving("invalid header"));
                    }
                    self.upstream.event(Event::HeaderRejected { from: *from, reason: reject_name(reason) });
                    if self.sync_peer.as_ref() == Some(from) {
                        self.sync_peer = None;
                    }
                    return;
                }
            }
        }

        if accepted > 0 {
            self.last_progress = Some(now);
            self.upstream.event(Event::HeadersReceived {
                from: *from,
                count: accepted,
                height: self.chainstate.get_chain_height(),
            });
        }

        // Step 12.
        if !self.chainstate.activate_best_chain() {
            self.sync_peer = None;
            if let Some(&next) = candidates.first() {
                self.set_sync_peer(next, now);
            }
            return;
        }

        // Step 13: a full batch signals more is available; a partial one leaves the sync peer
        // set so an INV-triggered request can reuse it, without consulting tip age.
        if headers.len() == MAX_HEADERS_SIZE {
            self.request_headers(*from);
        } else if self.sync_peer.as_ref() == Some(from) {
            self.upstream.event(Event::Synced { height: self.chainstate.get_chain_height() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::chainstate::{ChainParams, MemoryChainstate};
    use hdr_types::{BlockHash, Network};

    #[derive(Default, Clone)]
    struct MockUpstream {
        get_headers_sent: Rc<RefCell<Vec<(PeerId, GetHeadersPayload)>>>,
        headers_sent: Rc<RefCell<Vec<(PeerId, Vec<BlockHeader>)>>>,
        events: Rc<RefCell<Vec<Event>>>,
        timers: Rc<RefCell<Vec<LocalDuration>>>,
    }

    impl SetTimer for MockUpstream {
        fn set_timer(&self, duration: LocalDuration) -> &Self {
            self.timers.borrow_mut().push(duration);
            self
        }
    }

    impl Wire<Event> for MockUpstream {
        fn event(&self, event: Event) {
            self.events.borrow_mut().push(event);
        }
        fn version(&mut self, _addr: PeerId, _msg: hdr_types::VersionPayload) {}
        fn verack(&mut self, _addr: PeerId) -> &mut Self {
            self
        }
        fn ping(&mut self, _addr: PeerId, _nonce: u64) -> &Self {
            self
        }
        fn pong(&mut self, _addr: PeerId, _nonce: u64) -> &Self {
            self
        }
        fn get_addr(&mut self, _addr: PeerId) {}
        fn addr(&mut self, _addr: PeerId, _addrs: Vec<hdr_types::TimestampedAddress>) {}
        fn get_headers(&mut self, addr: PeerId, payload: GetHeadersPayload) {
            self.get_headers_sent.borrow_mut().push((addr, payload));
        }
        fn headers(&mut self, addr: PeerId, headers: Vec<BlockHeader>) {
            self.headers_sent.borrow_mut().push((addr, headers));
        }
        fn inv(&mut self, _addr: PeerId, _items: Vec<hdr_types::InventoryItem>) {}
    }

    #[derive(Default)]
    struct MockPeers {
        disconnected: Vec<(PeerId, String)>,
        unconnecting_penalty: Option<u32>,
        invalid_header_first_time: bool,
    }

    impl PeerScoring for MockPeers {
        fn misbehaving(&mut self, _addr: &PeerId, _penalty: u32, _ban: &mut BanManager, _now: LocalTime) -> bool {
            false
        }
        fn note_unconnecting_headers(&mut self, _addr: &PeerId) -> Option<u32> {
            self.unconnecting_penalty
        }
        fn note_invalid_header(&mut self, _addr: &PeerId, _hash: BlockHash) -> bool {
            self.invalid_header_first_time
        }
        fn disconnect_peer(&mut self, addr: PeerId, reason: DisconnectReason) {
            self.disconnected.push((addr, reason.to_string()));
        }
    }

    fn peer(port: u16) -> PeerId {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

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

    fn chainstate() -> (MemoryChainstate, BlockHash) {
        let genesis = genesis();
        let genesis_hash = genesis.block_hash();
        let params = ChainParams::new(Network::Regtest, genesis_hash, 0x1d00ffff, Vec::new());
        (MemoryChainstate::new(params, genesis), genesis_hash)
    }

    #[test]
    fn negotiating_an_outbound_peer_selects_it_as_sync_peer_and_requests_headers() {
        let (cs, _genesis) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());

        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        assert_eq!(mgr.sync_peer(), Some(peer(1)));
        assert_eq!(upstream.get_headers_sent.borrow().len(), 1);
        assert!(matches!(upstream.events.borrow().last(), Some(Event::SyncPeerSelected { .. })));
    }

    #[test]
    fn inbound_peers_never_become_the_sync_peer() {
        let (cs, _genesis) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());

        mgr.peer_negotiated(peer(1), false, LocalTime::from_secs(0));

        assert_eq!(mgr.sync_peer(), None);
        assert!(upstream.get_headers_sent.borrow().is_empty());
    }

    #[test]
    fn accepting_a_connecting_header_advances_the_chain_and_requests_more_if_batch_is_full() {
        let (cs, genesis_hash) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());
        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        let mut peers = MockPeers::default();
        let mut ban = BanManager::new();
        let h1 = child(genesis_hash, 1);

        mgr.received_headers(&peer(1), vec![h1], &mut peers, &mut ban, &[peer(1)], LocalTime::from_secs(1));

        assert!(matches!(upstream.events.borrow().last(), Some(Event::Synced { height: 1 })));
        assert!(peers.disconnected.is_empty());
    }

    #[test]
    fn an_oversized_headers_message_is_rejected_without_touching_chainstate() {
        let (cs, genesis_hash) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream);
        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        let mut peers = MockPeers::default();
        let mut ban = BanManager::new();
        let batch: Vec<BlockHeader> = (0..(MAX_HEADERS_SIZE as u32 + 1)).map(|i| child(genesis_hash, i)).collect();

        mgr.received_headers(&peer(1), batch, &mut peers, &mut ban, &[peer(1)], LocalTime::from_secs(1));

        assert_eq!(mgr.chainstate.get_chain_height(), 0);
    }

    #[test]
    fn an_orphan_batch_is_stashed_and_a_fresh_getheaders_is_sent() {
        let (cs, _genesis) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());
        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        let mut peers = MockPeers::default();
        let mut ban = BanManager::new();
        let orphan = child(BlockHash([9u8; 32]), 7);

        let sent_before = upstream.get_headers_sent.borrow().len();
        mgr.received_headers(&peer(1), vec![orphan], &mut peers, &mut ban, &[peer(1)], LocalTime::from_secs(1));

        assert!(upstream.get_headers_sent.borrow().len() > sent_before);
    }

    #[test]
    fn inv_from_a_non_sync_peer_is_ignored_during_ibd() {
        let (cs, _genesis) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());
        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        let sent_before = upstream.get_headers_sent.borrow().len();
        mgr.handle_inv_announcement(peer(2), LocalTime::from_secs(1));
        assert_eq!(upstream.get_headers_sent.borrow().len(), sent_before);
    }

    #[test]
    fn inv_from_any_peer_triggers_getheaders_once_synced() {
        let (mut cs, _genesis) = chainstate();
        cs.set_ibd(false);
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());

        let sent_before = upstream.get_headers_sent.borrow().len();
        mgr.handle_inv_announcement(peer(3), LocalTime::from_secs(1));
        assert!(upstream.get_headers_sent.borrow().len() > sent_before);
    }

    #[test]
    fn received_get_headers_replies_from_the_fork_point_honoring_hash_stop() {
        let (mut cs, genesis_hash) = chainstate();
        let h1 = child(genesis_hash, 1);
        let idx1 = cs.accept_block_header(&h1, false).unwrap();
        cs.try_add_block_index_candidate(&idx1);
        cs.activate_best_chain();
        let h2 = child(h1.block_hash(), 2);
        let idx2 = cs.accept_block_header(&h2, false).unwrap();
        cs.try_add_block_index_candidate(&idx2);
        cs.activate_best_chain();

        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());

        mgr.received_get_headers(
            peer(2),
            GetHeadersPayload {
                version: PROTOCOL_VERSION as u32,
                locator: vec![genesis_hash],
                hash_stop: BlockHash::ZERO,
            },
        );

        let (addr, headers) = upstream.headers_sent.borrow()[0].clone();
        assert_eq!(addr, peer(2));
        assert_eq!(headers, vec![h1, h2]);
    }

    #[test]
    fn a_large_batch_from_a_non_sync_peer_is_silently_ignored_during_ibd() {
        let (cs, genesis_hash) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());
        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        let mut peers = MockPeers::default();
        let mut ban = BanManager::new();
        let batch = vec![child(genesis_hash, 1), child(genesis_hash, 2), child(genesis_hash, 3)];

        mgr.received_headers(&peer(2), batch, &mut peers, &mut ban, &[peer(1), peer(2)], LocalTime::from_secs(1));

        assert_eq!(mgr.chainstate.get_chain_height(), 0);
        assert!(peers.disconnected.is_empty());
        assert_eq!(mgr.sync_peer(), Some(peer(1)));
    }

    #[test]
    fn a_small_batch_from_a_non_sync_peer_is_still_processed_during_ibd() {
        let (cs, genesis_hash) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());
        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        let mut peers = MockPeers::default();
        let mut ban = BanManager::new();
        let h1 = child(genesis_hash, 1);
        let h2 = child(h1.block_hash(), 2);
        let batch = vec![h1, h2];

        mgr.received_headers(&peer(2), batch, &mut peers, &mut ban, &[peer(1), peer(2)], LocalTime::from_secs(1));

        assert_eq!(mgr.chainstate.get_chain_height(), 2);
    }

    #[test]
    fn an_empty_batch_clears_the_sync_peer() {
        let (cs, _genesis) = chainstate();
        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());
        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        let mut peers = MockPeers::default();
        let mut ban = BanManager::new();

        mgr.received_headers(&peer(1), Vec::new(), &mut peers, &mut ban, &[peer(1)], LocalTime::from_secs(1));

        assert_eq!(mgr.sync_peer(), None);
        assert!(matches!(upstream.events.borrow().last(), Some(Event::Synced { height: 0 })));
    }

    #[test]
    fn a_duplicate_of_a_known_invalid_header_is_scored_once() {
        let (mut cs, genesis_hash) = chainstate();
        // Poison a header hash as invalid by feeding it a bad version first.
        let mut bad = child(genesis_hash, 1);
        bad.version = 0;
        let _ = cs.accept_block_header(&bad, false);

        let upstream = MockUpstream::default();
        let mut mgr = SyncManager::new(cs, upstream.clone());
        mgr.peer_negotiated(peer(1), true, LocalTime::from_secs(0));

        let mut peers = MockPeers { invalid_header_first_time: true, ..Default::default() };
        let mut ban = BanManager::new();

        mgr.received_headers(&peer(1), vec![bad], &mut peers, &mut ban, &[peer(1)], LocalTime::from_secs(1));

        // The sync peer is retained: a duplicate (even of a known-invalid header) doesn't
        // clear it the way a freshly-invalid header would.
        assert_eq!(mgr.sync_peer(), Some(peer(1)));
    }
}
