//! Peer manager (§4.7): connection lifecycle, handshake, and misbehavior scoring.
//!
//! Grounded on the teacher's `fsm::peermgr::PeerManager`, generalized to the header-only
//! protocol: no `wtxidrelay`/`ytxidrelay`/`ytxidack` steps, and a misbehavior-score / ban
//! integration that the teacher didn't have.
use std::collections::{HashMap, HashSet};
use std::{net, net::SocketAddr, sync::Arc};

use tracing::{debug, warn};

use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

use hdr_types::{BlockHash, NetworkAddress, PermissionFlags, ServiceFlags, VersionPayload};

use crate::{
    fsm::addrmgr::{is_local, AddressManager},
    fsm::banmgr::BanManager,
    fsm::handler::{DisconnectReason, PeerId, Socket},
    net::{Disconnect as NetDisconnect, Link, LocalDuration, LocalTime},
};

use super::output::{Connect, Disconnect, SetTimer, Wire};

/// Time to wait for response during peer handshake before disconnecting the peer.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(12);
/// Time to wait for a new connection.
pub const CONNECTION_TIMEOUT: LocalDuration = LocalDuration::from_secs(6);
/// Time to wait until idle.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);
/// Target number of concurrent outbound peer connections.
pub const TARGET_OUTBOUND_PEERS: usize = 8;
/// Maximum number of inbound peer connections.
pub const MAX_INBOUND_PEERS: usize = 16;
/// Maximum number of inbound connections tolerated from the same IP.
pub const MAX_INBOUND_PER_IP: usize = 4;
/// An inbound peer connected more recently than this is never an eviction candidate (§4.7.1).
pub const INBOUND_EVICTION_PROTECTION_WINDOW: LocalDuration = LocalDuration::from_secs(10);

/// Misbehavior penalty table (§4.7.2). Grounded on `original_source/src/network/net_processing.cpp`'s
/// `Misbehaving()` call sites.
pub const PENALTY_INVALID_POW: u32 = 100;
pub const PENALTY_INVALID_HEADER: u32 = 100;
pub const PENALTY_NON_CONTINUOUS_HEADERS: u32 = 100;
pub const PENALTY_OVERSIZED_MESSAGE: u32 = 100;
pub const PENALTY_LOW_WORK_HEADERS: u32 = 1;
pub const PENALTY_TOO_MANY_UNCONNECTING_HEADERS: u32 = 20;
pub const PENALTY_TOO_MANY_ORPHANS: u32 = 20;
/// A peer whose cumulative score reaches this threshold is discouraged.
pub const DISCOURAGEMENT_THRESHOLD: u32 = 100;
/// Upper bound on the per-peer set of already-penalized invalid header hashes.
pub const MAX_INVALID_HEADER_HASHES: usize = 256;
/// Number of too-many-unconnecting-headers warnings tolerated before the one-shot penalty fires.
pub const MAX_UNCONNECTING_HEADERS_ANNOUNCEMENTS: u32 = 10;

/// A time offset, in seconds.
type TimeOffset = i64;

/// An event originating in the peer manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// The `version` message was received from a peer.
    VersionReceived { addr: PeerId, msg: VersionPayload },
    /// A peer has successfully negotiated (handshaked).
    Negotiated {
        addr: PeerId,
        link: Link,
        services: ServiceFlags,
        user_agent: String,
        version: u32,
    },
    /// Connecting to a peer found from the address manager.
    Connecting(PeerId),
    /// Connection attempt failed.
    ConnectionFailed(PeerId, Arc<std::io::Error>),
    /// A new peer has connected and is ready to accept messages (pre-handshake).
    Connected(PeerId, Link),
    /// A peer has been disconnected.
    Disconnected(PeerId, NetDisconnect<DisconnectReason>),
    /// A peer's misbehavior score crossed the discouragement threshold.
    Discouraged { addr: PeerId, score: u32 },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionReceived { addr, msg } => write!(
                fmt,
                "{}: version = {}, agent = {}, services = {}",
                addr, msg.version, msg.user_agent, msg.services
            ),
            Self::Negotiated { addr, services, .. } => {
                write!(fmt, "{}: peer negotiated with services {:?}", addr, services)
            }
            Self::Connecting(addr) => write!(fmt, "connecting to {}", addr),
            Self::Connected(addr, link) => write!(fmt, "{}: peer connected ({:?})", addr, link),
            Self::ConnectionFailed(addr, err) => {
                write!(fmt, "{}: peer connection attempt failed: {}", addr, err)
            }
            Self::Disconnected(addr, reason) => write!(fmt, "disconnected from {} ({})", addr, reason),
            Self::Discouraged { addr, score } => {
                write!(fmt, "{}: discouraged, misbehavior score {}", addr, score)
            }
        }
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub protocol_version: u32,
    pub permissions: HashMap<net::IpAddr, PermissionFlags>,
    pub services: ServiceFlags,
    pub persistent: Vec<net::SocketAddr>,
    pub required_services: ServiceFlags,
    pub target_outbound_peers: usize,
    pub max_inbound_peers: usize,
    pub retry_max_wait: LocalDuration,
    pub retry_min_wait: LocalDuration,
    pub user_agent: &'static str,
    pub dns_seeds: Vec<&'static str>,
    pub seed_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol_version: 0,
            permissions: HashMap::new(),
            services: ServiceFlags::NONE,
            persistent: Vec::new(),
            required_services: ServiceFlags::NONE,
            target_outbound_peers: TARGET_OUTBOUND_PEERS,
            max_inbound_peers: MAX_INBOUND_PEERS,
            retry_max_wait: LocalDuration::from_mins(60),
            retry_min_wait: LocalDuration::from_secs(1),
            user_agent: "",
            dns_seeds: Vec::new(),
            seed_port: 0,
        }
    }
}

/// Peer negotiation (handshake) state. The header-only protocol has a single intermediate
/// step between `version` and `verack`, unlike protocols that also gate on tx-relay opt-ins.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Ord, Eq)]
enum HandshakeState {
    /// Received `version`, waiting for `verack`.
    Version { since: LocalTime },
    /// Received `verack`. Handshake is complete.
    Verack { since: LocalTime },
}

/// A peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub socket: Socket,
    pub local_addr: net::SocketAddr,
    pub link: Link,
    pub since: LocalTime,
}

/// Peer state (§3's `PeerState` legal transitions, minus the tx-relay states).
#[derive(Debug, Clone)]
pub enum Peer {
    Connecting { time: LocalTime },
    Connected {
        conn: Connection,
        peer: Option<PeerInfo>,
    },
}

/// Misbehavior bookkeeping for a single peer (§3 `PeerMisbehaviorData`).
#[derive(Debug, Clone, Default)]
pub struct PeerMisbehaviorData {
    pub score: u32,
    /// Latches once `score` crosses [`DISCOURAGEMENT_THRESHOLD`] from below, so a peer already
    /// discouraged doesn't re-fire the discouragement event/ban-list write on every subsequent
    /// penalty it accrues before the caller gets around to disconnecting it (§3, §8 property 2).
    pub should_discourage: bool,
    pub unconnecting_headers_count: u32,
    pub unconnecting_latch_fired: bool,
    pub invalid_header_hashes: HashSet<BlockHash>,
}

impl PeerMisbehaviorData {
    fn remember_invalid_header(&mut self, hash: BlockHash) -> bool {
        if self.invalid_header_hashes.contains(&hash) {
            return false;
        }
        if self.invalid_header_hashes.len() >= MAX_INVALID_HEADER_HASHES {
            // Drop an arbitrary entry to bound memory; the dedup property degrades
            // gracefully rather than growing unbounded.
            if let Some(evict) = self.invalid_header_hashes.iter().next().copied() {
                self.invalid_header_hashes.remove(&evict);
            }
        }
        self.invalid_header_hashes.insert(hash);
        true
    }
}

/// A peer with protocol information.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub services: ServiceFlags,
    pub user_agent: String,
    /// An offset in seconds, between this peer's clock and ours.
    pub time_offset: TimeOffset,
    pub version: u32,
    pub persistent: bool,
    /// Peer nonce. Used to detect self-connections.
    nonce: u64,
    state: HandshakeState,
    pub misbehavior: PeerMisbehaviorData,
    pub permissions: PermissionFlags,
}

impl PeerInfo {
    pub fn is_negotiated(&self) -> bool {
        matches!(self.state, HandshakeState::Verack { .. })
    }

    pub fn has_noban(&self) -> bool {
        self.permissions.contains(PermissionFlags::NOBAN)
    }
}

/// Manages peer connections, handshake, and misbehavior scoring.
#[derive(Debug)]
pub struct PeerManager<U> {
    pub config: Config,
    last_idle: Option<LocalTime>,
    peers_storage: HashMap<SocketAddr, Peer>,
    disconnected: HashMap<net::SocketAddr, (Option<LocalTime>, usize)>,
    upstream: U,
    rng: fastrand::Rng,
}

impl<U: Wire<Event> + SetTimer + Connect + Disconnect> PeerManager<U> {
    pub fn new(config: Config, rng: fastrand::Rng, upstream: U) -> Self {
        Self {
            config,
            last_idle: None,
            peers_storage: HashMap::new(),
            disconnected: HashMap::new(),
            upstream,
            rng,
        }
    }

    pub async fn initialize(&mut self, addrs: &mut AddressManager) {
        let peers = self.config.persistent.clone();
        for addr in peers {
            if !self.connect(&addr) {
                debug!(target: "p2p", "{}: unable to connect to persistent peer", addr);
            }
        }
        self.upstream.set_timer(IDLE_TIMEOUT);
        self.maintain_connections(addrs).await;
    }

    fn permissions_for(&self, ip: &net::IpAddr) -> PermissionFlags {
        self.config.permissions.get(ip).copied().unwrap_or(PermissionFlags::NONE)
    }

    fn persistent_disconnected(&mut self, addr: &net::SocketAddr, local_time: LocalTime) {
        let (retry_at, attempts) = self.disconnected.entry(*addr).or_default();
        let delay = LocalDuration::from_secs(2u64.saturating_pow(*attempts as u32))
            .clamp(self.config.retry_min_wait, self.config.retry_max_wait);

        *retry_at = Some(local_time + delay);
        *attempts += 1;
        self.upstream.set_timer(delay);
    }

    fn maintain_persistent(&mut self, now: LocalTime) {
        let mut reconnect = Vec::new();
        for (addr, (retry_at, _)) in &mut self.disconnected {
            if let Some(t) = retry_at {
                if *t <= now {
                    *retry_at = None;
                    reconnect.push(*addr);
                }
            }
        }
        for addr in reconnect {
            self.connect(&addr);
        }
    }

    /// Called when a peer connected. `rtt_of` resolves a connected peer's last-known ping RTT
    /// (owned by the ping manager, a sibling component), used to score inbound eviction
    /// candidates (§4.7.1) when accepting this connection would exceed the inbound cap.
    pub fn peer_connected(
        &mut self,
        addr: SocketAddr,
        local_addr: SocketAddr,
        link: Link,
        now: LocalTime,
        rtt_of: impl Fn(&PeerId) -> Option<LocalDuration>,
    ) -> bool {
        debug_assert!(!self.is_connected(&addr), "{} is already connected", addr);

        self.peers_storage.insert(
            addr,
            Peer::Connected {
                conn: Connection {
                    socket: Socket::new(addr),
                    local_addr,
                    link,
                    since: now,
                },
                peer: None,
            },
        );
        self.disconnected.remove(&addr);

        match link {
            Link::Inbound => {
                let inbound_from_ip = self
                    .connected()
                    .filter(|c| c.link.is_inbound() && c.socket.addr.ip() == addr.ip())
                    .count();
                if inbound_from_ip > MAX_INBOUND_PER_IP {
                    self._disconnect(addr, DisconnectReason::ConnectionLimit);
                    return false;
                }
                if self.connected().filter(|c| c.link.is_inbound()).count() > self.config.max_inbound_peers
                    && !self.evict_inbound(now, &rtt_of)
                {
                    self._disconnect(addr, DisconnectReason::ConnectionLimit);
                    return false;
                }
            }
            Link::Outbound => {
                let nonce = self.rng.u64(..);
                self.upstream.version(addr, self.version_payload(addr, local_addr, nonce, now));
            }
        }
        self.upstream.set_timer(HANDSHAKE_TIMEOUT);
        self.upstream.event(Event::Connected(addr, link));
        false
    }

    /// Try to make room for a new inbound connection by disconnecting the worst existing one
    /// (§4.7.1). A peer connected within [`INBOUND_EVICTION_PROTECTION_WINDOW`] is never a
    /// candidate, so a node with every inbound slot freshly filled simply can't evict. Among the
    /// rest, the peer with the worst (or unknown) ping RTT is preferred; ties break toward the
    /// older connection. Returns `false` (nothing evicted) if no candidate survives protection.
    fn evict_inbound(&mut self, now: LocalTime, rtt_of: &dyn Fn(&PeerId) -> Option<LocalDuration>) -> bool {
        let victim = self
            .connected()
            .filter(|c| c.link.is_inbound() && now.duration_since(c.since) >= INBOUND_EVICTION_PROTECTION_WINDOW)
            .map(|c| {
                let rtt_key = rtt_of(&c.socket.addr).unwrap_or(LocalDuration::MAX);
                (c.socket.addr, rtt_key, std::cmp::Reverse(c.since))
            })
            .max_by_key(|(_, rtt_key, reverse_since)| (*rtt_key, *reverse_since));

        let Some((addr, ..)) = victim else {
            return false;
        };
        self._disconnect(addr, DisconnectReason::InboundEvicted);
        true
    }

    pub async fn peer_disconnected(
        &mut self,
        addr: &SocketAddr,
        addrs: &mut AddressManager,
        reason: NetDisconnect<DisconnectReason>,
    ) {
        let now = LocalTime::now();

        if self.is_connected(addr) {
            self.upstream.event(Event::Disconnected(*addr, reason.clone()));
        } else if self.is_connecting(addr) {
            if let NetDisconnect::ConnectionError(err) = &reason {
                self.upstream.event(Event::ConnectionFailed(*addr, err.clone()));
                addrs.failed(addr, now);
            }
        }
        self.peers_storage.remove(addr);

        if self.config.persistent.contains(addr) {
            self.persistent_disconnected(addr, now);
        } else {
            self.maintain_connections(addrs).await;
        }
    }

    pub fn received_version(&mut self, addr: &PeerId, msg: VersionPayload, addrs: &mut AddressManager, now: LocalTime) {
        if let Err(reason) = self.handle_version(addr, msg, addrs, now) {
            self._disconnect(*addr, reason);
        }
    }

    fn handle_version(
        &mut self,
        addr: &PeerId,
        msg: VersionPayload,
        addrs: &mut AddressManager,
        now: LocalTime,
    ) -> Result<(), DisconnectReason> {
        let Some(Peer::Connected { conn, .. }) = self.peers_storage.get(addr) else {
            return Ok(());
        };
        let conn = conn.clone();

        self.upstream.event(Event::VersionReceived { addr: *addr, msg: msg.clone() });

        let VersionPayload {
            version,
            services,
            timestamp,
            nonce,
            user_agent,
            addr_from,
            ..
        } = msg;

        let permissions = self.permissions_for(&addr.ip());
        let trusted = permissions.contains(PermissionFlags::NOBAN) || is_local(&addr.ip());

        if conn.link.is_outbound() && !services.has(self.config.required_services) && !trusted {
            return Err(DisconnectReason::PeerServices(services));
        }

        for (peer, c) in self.peers() {
            if c.link.is_outbound() && peer.nonce == nonce {
                return Err(DisconnectReason::SelfConnection);
            }
        }

        if conn.link.is_outbound() && self.negotiated(Link::Outbound).count() >= self.config.target_outbound_peers {
            return Err(DisconnectReason::ConnectionLimit);
        }

        addrs.good(&addr_from.socket_addr(), now);

        match conn.link {
            Link::Inbound => {
                let nonce = self.rng.u64(..);
                self.upstream
                    .version(conn.socket.addr, self.version_payload(conn.socket.addr, conn.local_addr, nonce, now));
                self.upstream.verack(conn.socket.addr);
            }
            Link::Outbound => {
                self.upstream.verack(conn.socket.addr);
            }
        }
        self.upstream.set_timer(HANDSHAKE_TIMEOUT);

        let persistent = self.config.persistent.contains(&conn.socket.addr);
        self.peers_storage.insert(
            conn.socket.addr,
            Peer::Connected {
                conn,
                peer: Some(PeerInfo {
                    nonce,
                    time_offset: now.as_secs() as i64 - timestamp,
                    services,
                    persistent,
                    user_agent,
                    state: HandshakeState::Version { since: now },
                    version: u32::min(self.config.protocol_version, version.max(0) as u32),
                    misbehavior: PeerMisbehaviorData::default(),
                    permissions,
                }),
            },
        );
        Ok(())
    }

    /// Called when a `verack` message was received.
    pub fn received_verack(&mut self, addr: &PeerId, now: LocalTime) -> Option<(PeerInfo, Connection)> {
        if let Some(Peer::Connected { peer: Some(peer), conn }) = self.peers_storage.get_mut(addr) {
            if let HandshakeState::Version { .. } = peer.state {
                self.upstream.event(Event::Negotiated {
                    addr: *addr,
                    link: conn.link,
                    services: peer.services,
                    user_agent: peer.user_agent.clone(),
                    version: peer.version,
                });
                peer.state = HandshakeState::Verack { since: now };
                return Some((peer.clone(), conn.clone()));
            } else {
                self._disconnect(*addr, DisconnectReason::PeerMisbehaving("unexpected `verack` message received"));
            }
        }
        None
    }

    /// Apply a misbehavior penalty (§4.7.2). Returns `true` if the peer was discouraged as a
    /// result and should be disconnected by the caller.
    pub fn misbehaving(&mut self, addr: &PeerId, penalty: u32, ban: &mut BanManager, now: LocalTime) -> bool {
        let Some(Peer::Connected { peer: Some(peer), .. }) = self.peers_storage.get_mut(addr) else {
            return false;
        };
        if peer.has_noban() {
            return false;
        }
        peer.misbehavior.score = peer.misbehavior.score.saturating_add(penalty);
        let crossed = !peer.misbehavior.should_discourage && peer.misbehavior.score >= DISCOURAGEMENT_THRESHOLD;
        if crossed {
            peer.misbehavior.should_discourage = true;
            ban.discourage(addr.ip(), now);
            self.upstream.event(Event::Discouraged {
                addr: *addr,
                score: peer.misbehavior.score,
            });
        }
        peer.misbehavior.should_discourage
    }

    /// Called for every HEADERS message that doesn't connect to known headers. Applies the
    /// one-shot latch penalty once the tolerance is exceeded (§4.7.2).
    pub fn note_unconnecting_headers(&mut self, addr: &PeerId) -> Option<u32> {
        let Some(Peer::Connected { peer: Some(peer), .. }) = self.peers_storage.get_mut(addr) else {
            return None;
        };
        peer.misbehavior.unconnecting_headers_count += 1;
        if peer.misbehavior.unconnecting_headers_count > MAX_UNCONNECTING_HEADERS_ANNOUNCEMENTS
            && !peer.misbehavior.unconnecting_latch_fired
        {
            peer.misbehavior.unconnecting_latch_fired = true;
            return Some(PENALTY_TOO_MANY_UNCONNECTING_HEADERS);
        }
        None
    }

    /// Record an invalid header hash for dedup; returns `true` if this is the first time this
    /// peer has been penalized for this specific hash (§4.7.2).
    pub fn note_invalid_header(&mut self, addr: &PeerId, hash: BlockHash) -> bool {
        let Some(Peer::Connected { peer: Some(peer), .. }) = self.peers_storage.get_mut(addr) else {
            return true;
        };
        peer.misbehavior.remember_invalid_header(hash)
    }

    pub async fn received_wake(&mut self, addrs: &mut AddressManager) {
        let mut timed_out = Vec::new();
        let local_time = LocalTime::now();

        for addr in self.idle_peers(local_time).collect::<Vec<_>>() {
            timed_out.push((addr, "connection"));
        }
        for (peer, conn) in self.peers() {
            if let HandshakeState::Version { since } = peer.state {
                if local_time - since >= HANDSHAKE_TIMEOUT {
                    timed_out.push((conn.socket.addr, "handshake"));
                }
            }
        }
        for connected in self.peers_storage.values().filter_map(|c| match c {
            Peer::Connected { conn, peer: None } => Some(conn),
            _ => None,
        }) {
            if local_time - connected.since >= HANDSHAKE_TIMEOUT {
                timed_out.push((connected.socket.addr, "handshake"));
            }
        }
        for (addr, reason) in timed_out {
            self._disconnect(addr, DisconnectReason::PeerTimeout(reason));
        }

        let dropped = self
            .negotiated(Link::Outbound)
            .filter(|(_, c)| c.socket.refs() == 1)
            .map(|(_, c)| c.socket.addr)
            .collect::<Vec<_>>();
        for addr in dropped {
            self._disconnect(addr, DisconnectReason::PeerDropped);
        }

        if local_time - self.last_idle.unwrap_or_default() >= IDLE_TIMEOUT {
            self.maintain_connections(addrs).await;
            self.upstream.set_timer(IDLE_TIMEOUT);
            self.last_idle = Some(local_time);
        }

        self.maintain_persistent(local_time);
    }

    pub fn version_payload(&self, addr: net::SocketAddr, local_addr: net::SocketAddr, nonce: u64, now: LocalTime) -> VersionPayload {
        VersionPayload {
            version: self.config.protocol_version as i32,
            services: self.config.services,
            timestamp: now.as_secs() as i64,
            addr_recv: NetworkAddress::new(addr, ServiceFlags::NONE),
            addr_from: NetworkAddress::new(local_addr, self.config.services),
            nonce,
            user_agent: self.config.user_agent.to_owned(),
            start_height: 0,
            relay: true,
        }
    }
}

impl<U: Connect + Disconnect + SetTimer + Wire<Event>> PeerManager<U> {
    pub fn peer_attempted(&mut self, addr: &net::SocketAddr) {
        debug_assert!(self.is_connecting(addr) || self.is_inbound(addr));
    }

    pub fn is_inbound(&mut self, addr: &PeerId) -> bool {
        self.peers_storage
            .get(addr)
            .is_some_and(|c| matches!(c, Peer::Connected { conn, .. } if conn.link.is_inbound()))
    }

    pub fn is_connecting(&self, addr: &PeerId) -> bool {
        self.peers_storage.get(addr).is_some_and(|c| matches!(c, Peer::Connecting { .. }))
    }

    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.peers_storage.get(addr).is_some_and(|c| matches!(c, Peer::Connected { .. }))
    }

    pub fn is_disconnected(&self, addr: &PeerId) -> bool {
        !self.is_connected(addr) && !self.is_connecting(addr)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&PeerInfo, &Connection)> + Clone {
        self.peers_storage.values().filter_map(move |c| match c {
            Peer::Connected { conn, peer: Some(peer) } => Some((peer, conn)),
            _ => None,
        })
    }

    pub fn connecting(&self) -> impl Iterator<Item = &PeerId> {
        self.peers_storage
            .iter()
            .filter(|(_, p)| matches!(p, Peer::Connecting { .. }))
            .map(|(addr, _)| addr)
    }

    pub fn connected(&self) -> impl Iterator<Item = &Connection> + Clone {
        self.peers_storage.values().filter_map(|c| match c {
            Peer::Connected { conn, .. } => Some(conn),
            _ => None,
        })
    }

    pub fn negotiated(&self, link: Link) -> impl Iterator<Item = (&PeerInfo, &Connection)> + Clone {
        self.peers().filter(move |(p, c)| p.is_negotiated() && c.link == link)
    }

    /// Select an outbound, non-persistent, negotiated peer suitable for being the sync peer
    /// (§4.9.1): outbound link only, never a feeler.
    pub fn negotiated_outbound_addrs(&self) -> Vec<PeerId> {
        self.negotiated(Link::Outbound).map(|(_, c)| c.socket.addr).collect()
    }

    pub fn connect(&mut self, addr: &PeerId) -> bool {
        let time = LocalTime::now();
        if self.is_connected(addr) || self.is_connecting(addr) {
            return true;
        }
        if !self.is_disconnected(addr) {
            return false;
        }
        self.peers_storage.insert(*addr, Peer::Connecting { time });
        self.upstream.connect(*addr, CONNECTION_TIMEOUT);
        true
    }

    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        if self.is_connected(&addr) {
            self._disconnect(addr, reason);
        }
    }

    fn _disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.upstream.disconnect(addr, reason);
    }

    fn delta(&self) -> usize {
        let negotiated = self.negotiated(Link::Outbound).count();
        let connected = self.connected().count() - negotiated;
        let connecting = self.connecting().count();

        let target = self.config.target_outbound_peers;
        let unknown = connecting + connected;
        let total = negotiated + unknown;
        let max = target + target / 2;

        if total > max || negotiated + unknown > target {
            return 0;
        }
        usize::min(max - total, target - (negotiated + unknown))
    }

    async fn maintain_connections(&mut self, addrs: &mut AddressManager) {
        if !self.config.persistent.is_empty() {
            return;
        }

        let delta = self.delta();
        let negotiated = self.negotiated(Link::Outbound).count();
        let target = self.config.target_outbound_peers;
        let mut connecting = HashSet::new();

        while connecting.len() < delta {
            let candidate = if negotiated < target { addrs.select() } else { None };

            if let Some(sockaddr) = candidate {
                addrs.attempt(&sockaddr, LocalTime::now());
                if !self.is_connected(&sockaddr) && self.connect(&sockaddr) {
                    connecting.insert(sockaddr);
                    self.upstream.event(Event::Connecting(sockaddr));
                }
            } else {
                if self.config.dns_seeds.is_empty() {
                    debug!(target: "p2p", "no DNS seeds configured, can't discover more addresses");
                    break;
                }
                let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
                let seed_ind = self.rng.usize(0..self.config.dns_seeds.len());
                let dns_seed = self.config.dns_seeds[seed_ind];

                match resolver.lookup_ip(dns_seed).await {
                    Ok(response) => {
                        let now = LocalTime::now();
                        let ips: Vec<(NetworkAddress, u64)> = response
                            .iter()
                            .map(|ip| {
                                (
                                    NetworkAddress::new(SocketAddr::new(ip, self.config.seed_port), ServiceFlags::NONE),
                                    now.as_secs(),
                                )
                            })
                            .collect();
                        addrs.add_multiple(ips, now);
                    }
                    Err(err) => warn!(target: "p2p", %err, "failed to resolve DNS seed {}", dns_seed),
                }
                break;
            }
        }
    }

    fn idle_peers(&self, now: LocalTime) -> impl Iterator<Item = PeerId> + '_ {
        self.peers_storage.iter().filter_map(move |(addr, c)| {
            if let Peer::Connecting { time } = c {
                if now - *time >= CONNECTION_TIMEOUT {
                    return Some(*addr);
                }
            }
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct MockUpstream {
        events: Rc<RefCell<Vec<Event>>>,
        disconnects: Rc<RefCell<Vec<(PeerId, DisconnectReason)>>>,
    }

    impl SetTimer for MockUpstream {
        fn set_timer(&self, _duration: LocalDuration) -> &Self {
            self
        }
    }

    impl Connect for MockUpstream {
        fn connect(&self, _addr: net::SocketAddr, _timeout: LocalDuration) {}
    }

    impl Disconnect for MockUpstream {
        fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
            self.disconnects.borrow_mut().push((addr, reason));
        }
    }

    impl Wire<Event> for MockUpstream {
        fn event(&self, event: Event) {
            self.events.borrow_mut().push(event);
        }
        fn version(&mut self, _addr: PeerId, _msg: VersionPayload) {}
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
        fn inv(&mut self, _addr: PeerId, _items: Vec<hdr_types::InventoryItem>) {}
    }

    fn peer(port: u16) -> PeerId {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn inbound_config(max_inbound_peers: usize) -> Config {
        Config {
            max_inbound_peers,
            ..Config::default()
        }
    }

    fn no_rtt(_: &PeerId) -> Option<LocalDuration> {
        None
    }

    #[test]
    fn inbound_connection_below_capacity_is_admitted_without_eviction() {
        let upstream = MockUpstream::default();
        let mut mgr = PeerManager::new(inbound_config(2), fastrand::Rng::new(), upstream.clone());

        mgr.peer_connected(peer(1), peer(100), Link::Inbound, LocalTime::from_secs(0), no_rtt);
        mgr.peer_connected(peer(2), peer(100), Link::Inbound, LocalTime::from_secs(0), no_rtt);

        assert!(upstream.disconnects.borrow().is_empty());
        assert_eq!(mgr.connected().filter(|c| c.link.is_inbound()).count(), 2);
    }

    #[test]
    fn an_eligible_peer_is_evicted_to_admit_a_new_inbound_connection_over_capacity() {
        let upstream = MockUpstream::default();
        let mut mgr = PeerManager::new(inbound_config(2), fastrand::Rng::new(), upstream.clone());

        mgr.peer_connected(peer(1), peer(100), Link::Inbound, LocalTime::from_secs(0), no_rtt);
        mgr.peer_connected(peer(2), peer(100), Link::Inbound, LocalTime::from_secs(0), no_rtt);

        // Both existing peers are well past the protection window by the time the third arrives.
        let now = LocalTime::from_secs(0) + INBOUND_EVICTION_PROTECTION_WINDOW + LocalDuration::from_secs(1);
        mgr.peer_connected(peer(3), peer(100), Link::Inbound, now, no_rtt);

        assert_eq!(upstream.disconnects.borrow().len(), 1);
        assert_eq!(upstream.disconnects.borrow()[0].1, DisconnectReason::InboundEvicted);
    }

    #[test]
    fn eviction_prefers_the_peer_with_the_worst_ping_rtt() {
        let upstream = MockUpstream::default();
        let mut mgr = PeerManager::new(inbound_config(2), fastrand::Rng::new(), upstream.clone());

        mgr.peer_connected(peer(1), peer(100), Link::Inbound, LocalTime::from_secs(0), no_rtt);
        mgr.peer_connected(peer(2), peer(100), Link::Inbound, LocalTime::from_secs(0), no_rtt);

        let now = LocalTime::from_secs(0) + INBOUND_EVICTION_PROTECTION_WINDOW + LocalDuration::from_secs(1);
        let rtt_of = |addr: &PeerId| -> Option<LocalDuration> {
            if *addr == peer(1) {
                Some(LocalDuration::from_millis(500))
            } else {
                Some(LocalDuration::from_millis(20))
            }
        };
        mgr.peer_connected(peer(3), peer(100), Link::Inbound, now, rtt_of);

        assert_eq!(upstream.disconnects.borrow()[0].0, peer(1));
    }

    #[test]
    fn all_inbound_peers_younger_than_the_protection_window_causes_eviction_to_fail() {
        let upstream = MockUpstream::default();
        let mut mgr = PeerManager::new(inbound_config(2), fastrand::Rng::new(), upstream.clone());

        let now = LocalTime::from_secs(100);
        mgr.peer_connected(peer(1), peer(200), Link::Inbound, now, no_rtt);
        mgr.peer_connected(peer(2), peer(200), Link::Inbound, now, no_rtt);

        // Both existing peers are still within the protection window.
        mgr.peer_connected(peer(3), peer(200), Link::Inbound, now + LocalDuration::from_secs(1), no_rtt);

        // Eviction found no candidate, so the new connection is rejected instead.
        assert_eq!(upstream.disconnects.borrow().len(), 1);
        assert_eq!(upstream.disconnects.borrow()[0], (peer(3), DisconnectReason::ConnectionLimit));
    }
}
