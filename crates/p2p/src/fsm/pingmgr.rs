//! Ping loop and inactivity watchdog (§4.6).
use std::net::SocketAddr;

use crate::common::collections::AddressBook;
use crate::fsm::handler::PeerId;
use crate::fsm::output::{SetTimer, Wire};
use crate::net::{LocalDuration, LocalTime};

/// Send a `ping` every 2 minutes of idle time.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_secs(2 * 60);
/// Disconnect if an outstanding `ping` hasn't been answered within this long.
pub const PING_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Disconnect a peer that hasn't sent or received anything for this long.
pub const INACTIVITY_TIMEOUT: LocalDuration = LocalDuration::from_secs(20 * 60);

/// An event emitted by the ping manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A `ping` was sent to a peer.
    PingSent { peer: PeerId, nonce: u64 },
    /// A `pong` was received matching the outstanding nonce.
    PongReceived { peer: PeerId, nonce: u64, rtt: LocalDuration },
    /// A peer timed out waiting for a `pong`, or went idle.
    TimedOut { peer: PeerId },
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::PingSent { peer, nonce } => write!(f, "{}: sent ping({})", peer, nonce),
            Event::PongReceived { peer, nonce, rtt } => {
                write!(f, "{}: received pong({}), rtt {}", peer, nonce, rtt)
            }
            Event::TimedOut { peer } => write!(f, "{}: ping timeout", peer),
        }
    }
}

#[derive(Debug)]
struct PingState {
    /// Nonce of the outstanding ping, if any, and the time it was sent.
    outstanding: Option<(u64, LocalTime)>,
    last_active: LocalTime,
    last_rtt: Option<LocalDuration>,
}

impl PingState {
    fn new(now: LocalTime) -> Self {
        Self {
            outstanding: None,
            last_active: now,
            last_rtt: None,
        }
    }
}

/// Tracks ping/pong state and liveness per connected peer.
#[derive(Debug)]
pub struct PingManager<U> {
    peers: AddressBook<PeerId, PingState>,
    upstream: U,
}

impl<U: Wire<Event> + SetTimer> PingManager<U> {
    pub fn new(upstream: U) -> Self {
        Self {
            peers: AddressBook::new(),
            upstream,
        }
    }

    /// Called once a peer's handshake completes and it enters `Ready`.
    pub fn peer_negotiated(&mut self, addr: PeerId, now: LocalTime) {
        self.peers.insert(addr, PingState::new(now));
        self.upstream.set_timer(PING_INTERVAL);
    }

    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.peers.remove(addr);
    }

    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Record that traffic (of any kind) was seen from this peer.
    pub fn received_from(&mut self, addr: &PeerId, now: LocalTime) {
        if let Some(state) = self.peers.get_mut(addr) {
            state.last_active = now;
        }
    }

    /// Handle an incoming `pong`.
    pub fn received_pong(&mut self, addr: PeerId, nonce: u64, now: LocalTime) {
        if let Some(state) = self.peers.get_mut(&addr) {
            state.last_active = now;
            if let Some((outstanding_nonce, sent_at)) = state.outstanding {
                if outstanding_nonce == nonce {
                    let rtt = now.duration_since(sent_at);
                    state.last_rtt = Some(rtt);
                    state.outstanding = None;
                    self.upstream.event(Event::PongReceived { peer: addr, nonce, rtt });
                }
            }
        }
    }

    /// Last known round-trip-time for a peer, if any ping has been acknowledged.
    pub fn rtt(&self, addr: &SocketAddr) -> Option<LocalDuration> {
        self.peers.get(addr).and_then(|s| s.last_rtt)
    }

    /// Periodic tick: send overdue pings, time out unanswered ones and idle peers.
    pub fn received_wake(&mut self, now: LocalTime) {
        let mut to_disconnect = Vec::new();

        for (addr, state) in self.peers.iter_mut() {
            if now.duration_since(state.last_active) >= INACTIVITY_TIMEOUT {
                to_disconnect.push(*addr);
                continue;
            }
            match state.outstanding {
                Some((_, sent_at)) if now.duration_since(sent_at) >= PING_TIMEOUT => {
                    to_disconnect.push(*addr);
                }
                Some(_) => {}
                None => {
                    let nonce = fastrand::u64(..);
                    state.outstanding = Some((nonce, now));
                    self.upstream.ping(*addr, nonce);
                    self.upstream.event(Event::PingSent { peer: *addr, nonce });
                }
            }
        }

        for addr in to_disconnect {
            self.peers.remove(&addr);
            self.upstream.event(Event::TimedOut { peer: addr });
        }

        self.upstream.set_timer(PING_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct MockUpstream {
        pings: Rc<RefCell<Vec<(PeerId, u64)>>>,
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
        fn ping(&mut self, addr: PeerId, nonce: u64) -> &Self {
            self.pings.borrow_mut().push((addr, nonce));
            self
        }
        fn pong(&mut self, _addr: PeerId, _nonce: u64) -> &Self {
            self
        }
        fn get_addr(&mut self, _addr: PeerId) {}
        fn addr(&mut self, _addr: PeerId, _addrs: Vec<hdr_types::TimestampedAddress>) {}
        fn get_headers(&mut self, _addr: PeerId, _payload: hdr_types::GetHeadersPayload) {}
        fn headers(&mut self, _addr: PeerId, _headers: Vec<hdr_types::BlockHeader>) {}
        fn inv(&mut self, _addr: PeerId, _items: Vec<hdr_types::InventoryItem>) {}
    }

    fn peer() -> PeerId {
        "127.0.0.1:9999".parse().unwrap()
    }

    #[test]
    fn wake_sends_ping_once_then_waits_for_pong() {
        let upstream = MockUpstream::default();
        let mut mgr = PingManager::new(upstream.clone());
        let t0 = LocalTime::from_secs(0);

        mgr.peer_negotiated(peer(), t0);
        mgr.received_wake(t0);
        assert_eq!(upstream.pings.borrow().len(), 1);

        // A second wake before the pong arrives shouldn't send a new ping.
        mgr.received_wake(t0);
        assert_eq!(upstream.pings.borrow().len(), 1);
    }

    #[test]
    fn unanswered_ping_times_out() {
        let upstream = MockUpstream::default();
        let mut mgr = PingManager::new(upstream.clone());
        let t0 = LocalTime::from_secs(0);

        mgr.peer_negotiated(peer(), t0);
        mgr.received_wake(t0);

        let t1 = LocalTime::from_secs(PING_TIMEOUT.as_secs() + 1);
        mgr.received_wake(t1);

        assert!(matches!(
            upstream.events.borrow().last(),
            Some(Event::TimedOut { .. })
        ));
        assert!(!mgr.is_connected(&peer()));
    }

    #[test]
    fn pong_with_matching_nonce_clears_outstanding() {
        let upstream = MockUpstream::default();
        let mut mgr = PingManager::new(upstream.clone());
        let t0 = LocalTime::from_secs(0);

        mgr.peer_negotiated(peer(), t0);
        mgr.received_wake(t0);
        let nonce = upstream.pings.borrow()[0].1;

        mgr.received_pong(peer(), nonce, LocalTime::from_secs(1));
        assert!(mgr.rtt(&peer()).is_some());
    }
}
