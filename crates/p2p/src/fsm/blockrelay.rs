//! Block-relay coordinator (§4.10): announces newly-active tips to peers via `inv`, turns an
//! incoming `inv` into a `getheaders` trigger, and provides an immediate-relay bypass for a
//! freshly mined/accepted block.
use std::collections::HashMap;

use hdr_types::{BlockHash, InventoryItem};

use crate::chainstate::Chainstate;
use crate::fsm::handler::PeerId;
use crate::fsm::output::{SetTimer, Wire};
use crate::fsm::syncmgr::SyncManager;
use crate::net::{LocalDuration, LocalTime};

/// How long a hash stays remembered as "already sent to this peer", bounding the dedup table
/// and letting a hash be re-announced if a peer somehow missed it long ago (§4.10.1).
pub const INV_TTL: LocalDuration = LocalDuration::from_secs(600);
/// Cadence at which queued announcements are flushed to peers (§4.10.2), matching Bitcoin
/// Core's `SendMessages` announcement batching.
pub const ANNOUNCEMENT_INTERVAL: LocalDuration = LocalDuration::from_secs(30);

/// An event emitted by the block-relay coordinator.
#[derive(Debug, Clone)]
pub enum Event {
    /// A tip hash was queued for announcement to a peer.
    Queued { to: PeerId, hash: BlockHash },
    /// Queued announcements were flushed as `inv` messages.
    Flushed { to: PeerId, count: usize },
    /// A block was relayed immediately, bypassing the announcement queue.
    Relayed { hash: BlockHash, peers: usize },
    /// An incoming `inv` announcement triggered a `getheaders` request.
    GetHeadersTriggered { from: PeerId, hash: BlockHash },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Queued { to, hash } => write!(f, "{}: queued {} for announcement", to, hash),
            Event::Flushed { to, count } => write!(f, "{}: flushed {} announcement(s)", to, count),
            Event::Relayed { hash, peers } => write!(f, "{}: relayed immediately to {} peer(s)", hash, peers),
            Event::GetHeadersTriggered { from, hash } => write!(f, "{}: inv({}) triggered getheaders", from, hash),
        }
    }
}

#[derive(Default)]
struct PeerRelayState {
    /// Hashes already sent to this peer, with the time the dedup entry expires.
    sent: HashMap<BlockHash, LocalTime>,
    /// Hashes queued but not yet flushed.
    pending: Vec<BlockHash>,
}

impl PeerRelayState {
    fn was_recently_sent(&self, hash: &BlockHash, now: LocalTime) -> bool {
        self.sent.get(hash).is_some_and(|expires_at| *expires_at > now)
    }

    fn mark_sent(&mut self, hash: BlockHash, now: LocalTime) {
        self.sent.insert(hash, now + INV_TTL);
    }

    fn sweep_expired(&mut self, now: LocalTime) {
        self.sent.retain(|_, expires_at| *expires_at > now);
    }
}

/// Tracks per-peer block announcements: what's been sent, what's queued, and the dedup window.
pub struct BlockRelay<U> {
    peers: HashMap<PeerId, PeerRelayState>,
    last_flush: Option<LocalTime>,
    upstream: U,
}

impl<U: Wire<Event> + SetTimer> BlockRelay<U> {
    pub fn new(upstream: U) -> Self {
        Self {
            peers: HashMap::new(),
            last_flush: None,
            upstream,
        }
    }

    /// Register a newly-negotiated peer and, per §4.12's per-peer announce rule, immediately
    /// queue it the current tip (if any) so it doesn't have to wait for the next periodic tick.
    pub fn peer_negotiated<C: Chainstate, U2: Wire<crate::fsm::syncmgr::Event> + SetTimer>(
        &mut self,
        addr: PeerId,
        sync: &SyncManager<C, U2>,
        now: LocalTime,
    ) {
        self.peers.entry(addr).or_default();
        if let Some(tip) = sync.tip_hash() {
            self.queue_to_peer(addr, tip, now);
        }
    }

    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.peers.remove(addr);
    }

    /// Queue a newly-active tip for announcement to every connected peer, skipping any peer
    /// the hash was already sent to within [`INV_TTL`] (§4.10.1).
    pub fn queue_announcement(&mut self, hash: BlockHash, now: LocalTime) {
        let addrs: Vec<PeerId> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.queue_to_peer(addr, hash, now);
        }
    }

    /// Queue `hash` for announcement to a single peer, skipping it if already sent or pending.
    fn queue_to_peer(&mut self, addr: PeerId, hash: BlockHash, now: LocalTime) {
        let Some(state) = self.peers.get_mut(&addr) else {
            return;
        };
        if state.was_recently_sent(&hash, now) || state.pending.contains(&hash) {
            return;
        }
        state.pending.push(hash);
        self.upstream.event(Event::Queued { to: addr, hash });
    }

    /// Relay a block to every connected peer immediately, bypassing the announcement queue and
    /// the 30-second flush cadence (§4.10's immediate-relay bypass, e.g. for a block this node
    /// itself just accepted as the new tip).
    pub fn relay_block(&mut self, hash: BlockHash, now: LocalTime) {
        let mut sent = 0usize;
        for (addr, state) in self.peers.iter_mut() {
            if state.was_recently_sent(&hash, now) {
                continue;
            }
            self.upstream.inv(*addr, vec![InventoryItem::block(hash)]);
            state.mark_sent(hash, now);
            state.pending.retain(|h| h != &hash);
            sent += 1;
        }
        self.upstream.event(Event::Relayed { hash, peers: sent });
    }

    /// Flush every peer's queued announcements as a single `inv` message (§4.10.2).
    pub fn flush_block_announcements(&mut self, now: LocalTime) {
        for (addr, state) in self.peers.iter_mut() {
            state.sweep_expired(now);
            if state.pending.is_empty() {
                continue;
            }
            let items: Vec<InventoryItem> = state.pending.drain(..).map(InventoryItem::block).collect();
            let count = items.len();
            for item in &items {
                state.mark_sent(item.hash, now);
            }
            self.upstream.inv(*addr, items);
            self.upstream.event(Event::Flushed { to: *addr, count });
        }
    }

    /// Periodic tick: on the [`ANNOUNCEMENT_INTERVAL`] cadence, queue the current tip to every
    /// peer (§4.12's periodic tip announcement) and flush whatever's queued.
    pub fn received_wake<C: Chainstate, U2: Wire<crate::fsm::syncmgr::Event> + SetTimer>(
        &mut self,
        sync: &SyncManager<C, U2>,
        now: LocalTime,
    ) {
        let due = match self.last_flush {
            Some(last) => now.duration_since(last) >= ANNOUNCEMENT_INTERVAL,
            None => true,
        };
        if due {
            if let Some(tip) = sync.tip_hash() {
                self.queue_announcement(tip, now);
            }
            self.flush_block_announcements(now);
            self.last_flush = Some(now);
        }
        self.upstream.set_timer(ANNOUNCEMENT_INTERVAL);
    }

    /// Handle an incoming `inv` announcement: dedup against what we already know of, then hand
    /// the first unseen hash to the header-sync coordinator as a `getheaders` trigger
    /// (§4.10.3).
    pub fn received_inv<C: Chainstate, U2: Wire<crate::fsm::syncmgr::Event> + SetTimer>(
        &mut self,
        from: PeerId,
        items: Vec<InventoryItem>,
        sync: &mut SyncManager<C, U2>,
        now: LocalTime,
    ) {
        let Some(first_unknown) = items
            .iter()
            .filter(|item| item.is_block())
            .find(|item| sync.lookup_unknown(&item.hash))
        else {
            return;
        };
        self.upstream.event(Event::GetHeadersTriggered { from, hash: first_unknown.hash });
        sync.handle_inv_announcement(from, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::chainstate::{ChainParams, MemoryChainstate};
    use hdr_types::{BlockHeader, Network};

    #[derive(Default, Clone)]
    struct MockUpstream {
        invs: Rc<RefCell<Vec<(PeerId, Vec<InventoryItem>)>>>,
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
        fn get_headers(&mut self, _addr: PeerId, _payload: hdr_types::GetHeadersPayload) {}
        fn headers(&mut self, _addr: PeerId, _headers: Vec<hdr_types::BlockHeader>) {}
        fn inv(&mut self, addr: PeerId, items: Vec<InventoryItem>) {
            self.invs.borrow_mut().push((addr, items));
        }
    }

    fn peer(port: u16) -> PeerId {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn hash(byte: u8) -> BlockHash {
        BlockHash([byte; 32])
    }

    #[derive(Default, Clone)]
    struct MockSyncUpstream {
        get_headers_sent: Rc<RefCell<Vec<PeerId>>>,
    }

    impl SetTimer for MockSyncUpstream {
        fn set_timer(&self, _duration: LocalDuration) -> &Self {
            self
        }
    }

    impl Wire<crate::fsm::syncmgr::Event> for MockSyncUpstream {
        fn event(&self, _event: crate::fsm::syncmgr::Event) {}
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
        fn get_headers(&mut self, addr: PeerId, _payload: hdr_types::GetHeadersPayload) {
            self.get_headers_sent.borrow_mut().push(addr);
        }
        fn headers(&mut self, _addr: PeerId, _headers: Vec<hdr_types::BlockHeader>) {}
        fn inv(&mut self, _addr: PeerId, _items: Vec<InventoryItem>) {}
    }

    /// A chainstate whose tip is the genesis block, wrapped in a `SyncManager` for the
    /// `peer_negotiated`/`received_wake` tip lookups.
    fn test_sync_manager() -> SyncManager<MemoryChainstate, MockSyncUpstream> {
        test_sync_manager_with_upstream().0
    }

    fn test_sync_manager_with_upstream() -> (SyncManager<MemoryChainstate, MockSyncUpstream>, MockSyncUpstream) {
        let genesis = BlockHeader {
            version: 1,
            prev_block: BlockHash::ZERO,
            miner_address: [0u8; 20],
            time: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 0,
            randomx_hash: [0u8; 32],
        };
        let genesis_hash = genesis.block_hash();
        let params = ChainParams::new(Network::Regtest, genesis_hash, 0x1d00ffff, Vec::new());
        let mut cs = MemoryChainstate::new(params, genesis);
        cs.set_ibd(false);
        let sync_upstream = MockSyncUpstream::default();
        (SyncManager::new(cs, sync_upstream.clone()), sync_upstream)
    }

    #[test]
    fn relay_block_sends_immediately_and_dedups_a_second_call() {
        let upstream = MockUpstream::default();
        let mut relay = BlockRelay::new(upstream.clone());
        relay.peer_negotiated(peer(1), &test_sync_manager(), LocalTime::from_secs(0));
        // The negotiation itself queues the tip; drain it so the assertions below are only
        // about `relay_block`'s own behavior.
        relay.flush_block_announcements(LocalTime::from_secs(0));
        upstream.invs.borrow_mut().clear();

        relay.relay_block(hash(1), LocalTime::from_secs(0));
        assert_eq!(upstream.invs.borrow().len(), 1);

        relay.relay_block(hash(1), LocalTime::from_secs(1));
        assert_eq!(upstream.invs.borrow().len(), 1, "already-sent hash shouldn't be relayed twice");
    }

    #[test]
    fn queued_announcements_are_flushed_together_on_the_cadence() {
        let upstream = MockUpstream::default();
        let mut relay = BlockRelay::new(upstream.clone());
        relay.peer_negotiated(peer(1), &test_sync_manager(), LocalTime::from_secs(0));
        relay.flush_block_announcements(LocalTime::from_secs(0));
        upstream.invs.borrow_mut().clear();

        relay.queue_announcement(hash(1), LocalTime::from_secs(0));
        relay.queue_announcement(hash(2), LocalTime::from_secs(0));
        assert!(upstream.invs.borrow().is_empty());

        relay.flush_block_announcements(LocalTime::from_secs(0));
        assert_eq!(upstream.invs.borrow().len(), 1);
        assert_eq!(upstream.invs.borrow()[0].1.len(), 2);
    }

    #[test]
    fn flush_cadence_does_not_refire_before_the_interval_elapses() {
        let upstream = MockUpstream::default();
        let mut relay = BlockRelay::new(upstream.clone());
        let sync = test_sync_manager();
        relay.peer_negotiated(peer(1), &sync, LocalTime::from_secs(0));
        relay.received_wake(&sync, LocalTime::from_secs(0));
        upstream.invs.borrow_mut().clear();

        relay.queue_announcement(hash(1), LocalTime::from_secs(1));
        relay.received_wake(&sync, LocalTime::from_secs(1));
        assert!(upstream.invs.borrow().is_empty(), "flush shouldn't fire again before the interval elapses");
    }

    #[test]
    fn negotiating_a_peer_queues_the_current_tip_for_announcement() {
        let upstream = MockUpstream::default();
        let mut relay = BlockRelay::new(upstream.clone());
        let sync = test_sync_manager();

        relay.peer_negotiated(peer(1), &sync, LocalTime::from_secs(0));

        assert!(matches!(
            upstream.events.borrow().last(),
            Some(Event::Queued { to, .. }) if *to == peer(1)
        ));
    }

    #[test]
    fn periodic_wake_announces_the_tip_to_every_peer() {
        let upstream = MockUpstream::default();
        let mut relay = BlockRelay::new(upstream.clone());
        let sync = test_sync_manager();
        // Register the peer without going through `peer_negotiated`'s own tip queuing, so the
        // periodic announcement is exercised on its own.
        relay.peers.entry(peer(1)).or_default();

        relay.received_wake(&sync, LocalTime::from_secs(0));

        assert_eq!(upstream.invs.borrow().len(), 1);
        assert_eq!(upstream.invs.borrow()[0].0, peer(1));
    }

    #[test]
    fn an_announcement_of_an_unknown_block_triggers_a_getheaders_request() {
        let (mut sync, sync_upstream) = test_sync_manager_with_upstream();

        let relay_upstream = MockUpstream::default();
        let mut relay = BlockRelay::new(relay_upstream);

        relay.received_inv(
            peer(1),
            vec![InventoryItem::block(hash(1))],
            &mut sync,
            LocalTime::from_secs(0),
        );

        assert_eq!(sync_upstream.get_headers_sent.borrow().len(), 1);
        assert_eq!(sync_upstream.get_headers_sent.borrow()[0], peer(1));
    }

    #[test]
    fn disconnecting_a_peer_drops_its_relay_state() {
        let upstream = MockUpstream::default();
        let mut relay = BlockRelay::new(upstream.clone());
        relay.peer_negotiated(peer(1), &test_sync_manager(), LocalTime::from_secs(0));
        relay.peer_disconnected(&peer(1));

        relay.queue_announcement(hash(1), LocalTime::from_secs(0));
        assert!(upstream.events.borrow().is_empty());
    }
}
