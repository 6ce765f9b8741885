//! Header-sync protocol state machine (§3-§4.12): composes the per-concern managers into the
//! single [`StateMachine`] the reactor drives.
use std::path::PathBuf;
use std::{borrow::Cow, net, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use flume as chan;
use tracing::{debug, trace};

use hdr_types::{
    BlockHash, Magic, Network, NetworkAddress, NetworkMessage, PermissionFlags,
    RawNetworkMessage, ServiceFlags,
};

use crate::{
    chainstate::Chainstate,
    common::time::AdjustedTime,
    fsm::addrmgr::AddressManager,
    fsm::anchormgr,
    fsm::banmgr::BanManager,
    fsm::blockrelay::BlockRelay,
    fsm::event::Event,
    fsm::output::{Outbox, Wire},
    fsm::peermgr,
    fsm::peermgr::PeerManager,
    fsm::pingmgr::PingManager,
    fsm::syncmgr::SyncManager,
    net::{Disconnect, Link, LocalDuration, LocalTime},
};

pub type PeerId = net::SocketAddr;

/// Peer-to-peer protocol version.
pub const PROTOCOL_VERSION: u32 = hdr_types::PROTOCOL_VERSION as u32;
/// User agent included in `version` messages.
pub const USER_AGENT: &str = hdr_types::USER_AGENT;

/// Configured connection limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Target outbound peer connections.
    pub max_outbound_peers: usize,
    /// Maximum inbound peer connections.
    pub max_inbound_peers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_outbound_peers: peermgr::TARGET_OUTBOUND_PEERS,
            max_inbound_peers: peermgr::MAX_INBOUND_PEERS,
        }
    }
}

/// Where (if anywhere) this instance persists its address book, ban list, and anchors (§4.3,
/// §4.4, §4.11). `None` runs fully in-memory, e.g. for tests.
#[derive(Debug, Clone, Default)]
pub struct PersistPaths {
    pub addrman: Option<PathBuf>,
    pub banlist: Option<PathBuf>,
    pub anchors: Option<PathBuf>,
}

/// Reference counting virtual socket. When there are no more references held, this peer can be
/// dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socket {
    /// Socket address.
    pub addr: net::SocketAddr,
    /// Reference counter.
    refs: Arc<()>,
}

impl Socket {
    /// Create a new virtual socket.
    pub fn new(addr: impl Into<net::SocketAddr>) -> Self {
        Self {
            addr: addr.into(),
            refs: Arc::new(()),
        }
    }

    /// Get the number of references to this virtual socket.
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.refs)
    }
}

impl From<net::SocketAddr> for Socket {
    fn from(addr: net::SocketAddr) -> Self {
        Self::new(addr)
    }
}

/// Disconnect reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer is misbehaving.
    PeerMisbehaving(&'static str),
    /// Peer protocol version is too old or too recent.
    PeerProtocolVersion(u32),
    /// Peer doesn't have the required services.
    PeerServices(ServiceFlags),
    /// Peer magic is invalid.
    PeerMagic(Magic),
    /// Peer timed out.
    PeerTimeout(&'static str),
    /// Peer was dropped by all sub-protocols.
    PeerDropped,
    /// Connection to self was detected.
    SelfConnection,
    /// Inbound connection limit reached.
    ConnectionLimit,
    /// Evicted to make room for a new inbound connection (§4.7.1).
    InboundEvicted,
    /// Error trying to decode incoming message.
    DecodeError,
    /// Peer was forced to disconnect by external command.
    Command,
    /// Peer already had a connection and was banned due to the violation of protocol rules.
    PeerBanned,
    /// Peer was disconnected for another reason.
    Other(&'static str),
}

impl DisconnectReason {
    /// Check whether the disconnect reason is transient, ie. may no longer be applicable
    /// after some time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLimit | Self::InboundEvicted | Self::PeerTimeout(_))
    }
}

impl From<DisconnectReason> for crate::net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::PeerProtocolVersion(_) => write!(f, "peer protocol version mismatch"),
            Self::PeerServices(_) => write!(f, "peer doesn't have the required services"),
            Self::PeerMagic(magic) => write!(f, "received message with invalid magic: {}", magic),
            Self::PeerTimeout(s) => write!(f, "peer timed out: {:?}", s),
            Self::PeerDropped => write!(f, "peer dropped"),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "inbound connection limit reached"),
            Self::InboundEvicted => write!(f, "evicted to make room for a new inbound peer"),
            Self::DecodeError => write!(f, "message decode error"),
            Self::Command => write!(f, "received external command"),
            Self::PeerBanned => write!(f, "peer was banned due to violation of protocol rules"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// A remote peer, as exposed to commands like [`Command::GetPeers`].
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: net::SocketAddr,
    /// Local peer address.
    pub local_addr: net::SocketAddr,
    /// Whether this is an inbound or outbound peer connection.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
    /// The peer's services.
    pub services: ServiceFlags,
    /// Peer user agent string.
    pub user_agent: String,
}

impl Peer {
    /// Check if this is an outbound peer.
    pub fn is_outbound(&self) -> bool {
        self.link.is_outbound()
    }
}

impl From<(&peermgr::PeerInfo, &peermgr::Connection)> for Peer {
    fn from((peer, conn): (&peermgr::PeerInfo, &peermgr::Connection)) -> Self {
        Self {
            addr: conn.socket.addr,
            local_addr: conn.local_addr,
            link: conn.link,
            since: conn.since,
            services: peer.services,
            user_agent: peer.user_agent.clone(),
        }
    }
}

/// A command that can be sent to the protocol from outside (§6.1's command surface; the
/// RPC/CLI layer that enqueues these is out of scope here).
pub enum Command {
    /// Get the currently connected, negotiated peers.
    GetPeers(chan::Sender<Vec<Peer>>),
    /// Connect to a peer.
    Connect(SocketAddr),
    /// Disconnect from a peer.
    Disconnect(SocketAddr),
    /// Import addresses into the address manager, e.g. from a `-addnode`-style config.
    ImportAddresses(Vec<NetworkAddress>),
    /// Announce a newly-accepted tip to every connected peer, bypassing the announcement queue.
    AnnounceBlock(BlockHash),
    /// Forbid a peer from connecting to us.
    BanPeer(SocketAddr),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetPeers(_) => write!(f, "GetPeers"),
            Self::Connect(addr) => write!(f, "Connect({})", addr),
            Self::Disconnect(addr) => write!(f, "Disconnect({})", addr),
            Self::ImportAddresses(addrs) => write!(f, "ImportAddresses({} addr(s))", addrs.len()),
            Self::AnnounceBlock(hash) => write!(f, "AnnounceBlock({})", hash),
            Self::BanPeer(addr) => write!(f, "BanPeer({})", addr),
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network we are connected to.
    pub network: Network,
    /// Peers to connect to and retry indefinitely (§4.7).
    pub connect: Vec<net::SocketAddr>,
    /// Services we offer.
    pub services: ServiceFlags,
    /// Required peer services.
    pub required_services: ServiceFlags,
    /// Per-IP permission overrides (§4.4, §4.7).
    pub permissions: std::collections::HashMap<net::IpAddr, PermissionFlags>,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Ping timeout, after which remotes are disconnected.
    pub ping_timeout: LocalDuration,
    /// Configured connection limits.
    pub limits: Limits,
    /// DNS seeds consulted when the address manager is empty (§4.3).
    pub dns_seeds: Vec<&'static str>,
    /// Port assumed for addresses resolved from DNS seeds.
    pub seed_port: u16,
    /// On-disk persistence paths.
    pub persist: PersistPaths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            connect: Vec::new(),
            services: ServiceFlags::NONE,
            required_services: ServiceFlags::NETWORK,
            permissions: std::collections::HashMap::new(),
            ping_timeout: crate::fsm::pingmgr::PING_TIMEOUT,
            user_agent: USER_AGENT,
            limits: Limits::default(),
            dns_seeds: Vec::new(),
            seed_port: 0,
            persist: PersistPaths::default(),
        }
    }
}

/// An instance of the header-only P2P protocol (§3), parametrized over the chainstate
/// implementation it drives header synchronization against.
pub struct StateMachine<C> {
    /// Network we're connecting to.
    pub network: Network,
    /// Peer address manager.
    addrmgr: AddressManager,
    /// Ban / discourage manager.
    banmgr: BanManager,
    /// Ping manager.
    pingmgr: PingManager<Outbox>,
    /// Peer manager.
    pub peermgr: PeerManager<Outbox>,
    /// Header-sync coordinator.
    syncmgr: SyncManager<C, Outbox>,
    /// Block-relay coordinator.
    blockrelay: BlockRelay<Outbox>,
    /// Network-adjusted time, fed by each peer's `version` timestamp (§4.2).
    clock: AdjustedTime<PeerId>,
    /// Last time a "tick" was triggered.
    last_tick: LocalTime,
    /// Random number generator.
    pub rng: fastrand::Rng,
    /// Outbound I/O. Used to communicate protocol events with a reactor.
    pub outbox: Outbox,
    persist: PersistPaths,
}

impl<C> Iterator for StateMachine<C> {
    type Item = crate::fsm::output::Io;

    fn next(&mut self) -> Option<crate::fsm::output::Io> {
        self.outbox.next()
    }
}

impl<C: Chainstate> StateMachine<C> {
    /// Construct a new protocol instance.
    pub fn new(chainstate: C, rng: fastrand::Rng, config: Config) -> Self {
        let Config {
            network,
            connect,
            services,
            required_services,
            permissions,
            ping_timeout: _,
            user_agent,
            limits,
            dns_seeds,
            seed_port,
            persist,
        } = config;

        let outbox = Outbox::new(network.magic());
        let pingmgr = PingManager::new(outbox.clone());
        let peermgr = PeerManager::new(
            peermgr::Config {
                protocol_version: PROTOCOL_VERSION,
                permissions,
                services,
                persistent: connect,
                target_outbound_peers: limits.max_outbound_peers,
                max_inbound_peers: limits.max_inbound_peers,
                retry_max_wait: LocalDuration::from_mins(60),
                retry_min_wait: LocalDuration::from_secs(1),
                required_services,
                user_agent,
                dns_seeds,
                seed_port,
            },
            rng.clone(),
            outbox.clone(),
        );
        let mut addrmgr = match &persist.addrman {
            Some(path) => AddressManager::load(path),
            None => AddressManager::new(),
        };
        let now = LocalTime::now();
        if let Some(path) = &persist.anchors {
            for addr in anchormgr::load(path) {
                addrmgr.add(NetworkAddress::new(addr, ServiceFlags::NONE), now.as_secs(), now);
            }
        }
        let banmgr = match &persist.banlist {
            Some(path) => BanManager::load(path.clone()),
            None => BanManager::new(),
        };
        let syncmgr = SyncManager::new(chainstate, outbox.clone());
        let blockrelay = BlockRelay::new(outbox.clone());

        Self {
            network,
            addrmgr,
            banmgr,
            pingmgr,
            peermgr,
            syncmgr,
            blockrelay,
            clock: AdjustedTime::new(now),
            last_tick: LocalTime::default(),
            rng,
            outbox,
            persist,
        }
    }

    /// Process a user command.
    pub async fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::GetPeers(reply) => {
                let peers = self.peermgr.peers().map(Peer::from).collect::<Vec<_>>();
                reply.send_async(peers).await.ok();
            }
            Command::Connect(addr) => {
                self.peermgr.connect(&addr);
            }
            Command::Disconnect(addr) => {
                self.disconnect(addr, DisconnectReason::Command);
            }
            Command::ImportAddresses(addrs) => {
                let now = LocalTime::now();
                self.addrmgr.add_multiple(addrs.into_iter().map(|a| (a, now.as_secs())), now);
            }
            Command::AnnounceBlock(hash) => {
                self.blockrelay.relay_block(hash, LocalTime::now());
            }
            Command::BanPeer(addr) => {
                self.banmgr.ban(addr.ip(), 0, LocalTime::now());
                self.peermgr.disconnect(addr, DisconnectReason::PeerBanned);
            }
        }
    }

    /// Disconnect a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.peermgr.disconnect(addr, reason);
    }

    fn persist_addrmgr(&self) {
        if let Some(path) = &self.persist.addrman {
            if let Err(err) = self.addrmgr.save(path) {
                tracing::warn!(target: "p2p", %err, "failed to persist address book");
            }
        }
    }

    fn persist_anchors(&self) {
        if let Some(path) = &self.persist.anchors {
            let anchors: Vec<SocketAddr> = self.peermgr.negotiated_outbound_addrs();
            if let Err(err) = anchormgr::save(&anchors, path) {
                tracing::warn!(target: "p2p", %err, "failed to persist anchors");
            }
        }
    }
}

#[async_trait]
impl<C: Chainstate + Send> crate::net::StateMachine for StateMachine<C> {
    type Message = RawNetworkMessage;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.clock.set_local_time(time);
        self.outbox.event(Event::Initializing);

        if let Some(path) = self.persist.anchors.clone() {
            for addr in anchormgr::load(&path) {
                // Anchors get NoBan + whitelist so a restart can't be eclipsed by an attacker
                // who has since poisoned the address book (§4.11).
                self.peermgr
                    .config
                    .permissions
                    .entry(addr.ip())
                    .and_modify(|p| *p |= PermissionFlags::NOBAN)
                    .or_insert(PermissionFlags::NOBAN);
                self.banmgr.add_to_whitelist(addr.ip());
                self.peermgr.connect(&addr);
            }
        }

        self.outbox.event(Event::Ready { time });
    }

    async fn message_received(&mut self, addr: &SocketAddr, msg: Cow<'_, RawNetworkMessage>) {
        let now = LocalTime::now();
        let addr = *addr;
        let msg = msg.into_owned();

        if msg.magic != self.network.magic() {
            self.disconnect(addr, DisconnectReason::PeerMagic(msg.magic));
            return;
        }

        if !self.peermgr.is_connected(&addr) {
            debug!(target: "p2p", "Received {:?} from unknown peer {}", msg, addr);
            return;
        }

        trace!(target: "p2p", "Received {:?} from {}", msg, addr);

        self.pingmgr.received_from(&addr, now);

        match msg.payload {
            NetworkMessage::Version(payload) => {
                self.peermgr.received_version(&addr, payload, &mut self.addrmgr, now);
            }
            NetworkMessage::Verack => {
                if let Some((peer, conn)) = self.peermgr.received_verack(&addr, now) {
                    self.clock.record_offset(conn.socket.addr, peer.time_offset);
                    self.pingmgr.peer_negotiated(conn.socket.addr, now);
                    self.syncmgr.peer_negotiated(conn.socket.addr, conn.link.is_outbound(), now);
                    self.blockrelay.peer_negotiated(conn.socket.addr, &self.syncmgr, now);
                }
            }
            NetworkMessage::Ping(nonce) => {
                self.outbox.pong(addr, nonce);
            }
            NetworkMessage::Pong(nonce) => {
                self.pingmgr.received_pong(addr, nonce, now);
            }
            NetworkMessage::GetAddr => {
                let addrs = self.addrmgr.get_addresses(1000);
                let timestamped = addrs
                    .into_iter()
                    .map(|a| hdr_types::TimestampedAddress { timestamp: now.as_secs() as u32, addr: a })
                    .collect();
                self.outbox.addr(addr, timestamped);
            }
            NetworkMessage::Addr(addrs) => {
                self.addrmgr.add_multiple(addrs.into_iter().map(|a| (a.addr, a.timestamp as u64)), now);
            }
            NetworkMessage::GetHeaders(payload) => {
                self.syncmgr.received_get_headers(addr, payload);
            }
            NetworkMessage::Headers(headers) => {
                let candidates = self.peermgr.negotiated_outbound_addrs();
                self.syncmgr.received_headers(&addr, headers, &mut self.peermgr, &mut self.banmgr, &candidates, now);
            }
            NetworkMessage::Inv(items) => {
                self.blockrelay.received_inv(addr, items, &mut self.syncmgr, now);
            }
            NetworkMessage::Unknown => {
                debug!(target: "p2p", "{}: received unrecognized message", addr);
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.peermgr.peer_attempted(addr);
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) -> bool {
        let now = LocalTime::now();

        if !self.banmgr.is_admissible(&addr.ip(), now) {
            debug!(target: "p2p", "prevented {} ({}) from connecting: banned or discouraged", addr, addr.ip());
            return false;
        }

        let pingmgr = &self.pingmgr;
        self.peermgr.peer_connected(addr, *local_addr, link, now, |a| pingmgr.rtt(a))
    }

    async fn disconnected(&mut self, addr: &SocketAddr, reason: Disconnect<DisconnectReason>) {
        if reason.is_banned() {
            self.banmgr.ban(addr.ip(), 0, LocalTime::now());
        }

        self.pingmgr.peer_disconnected(addr);
        let candidates = self.peermgr.negotiated_outbound_addrs();
        self.syncmgr.peer_disconnected(addr, &candidates, LocalTime::now());
        self.blockrelay.peer_disconnected(addr);
        self.peermgr.peer_disconnected(addr, &mut self.addrmgr, reason).await;

        self.persist_anchors();
    }

    fn is_disconnected(&mut self, addr: SocketAddr) -> bool {
        self.peermgr.is_disconnected(&addr)
    }

    fn tick(&mut self, local_time: LocalTime) {
        trace!(target: "p2p", "tick");
        self.clock.set_local_time(local_time);
    }

    async fn timer_expired(&mut self) {
        trace!(target: "p2p", "wake");

        let now = LocalTime::now();

        self.pingmgr.received_wake(now);
        self.addrmgr.cleanup_stale();
        self.banmgr.sweep_banned(now);
        self.banmgr.sweep_discouraged(now);
        self.peermgr.received_wake(&mut self.addrmgr).await;
        self.blockrelay.received_wake(&self.syncmgr, now);

        let candidates = self.peermgr.negotiated_outbound_addrs();
        self.syncmgr.received_wake(&candidates, now);

        if now.duration_since(self.last_tick) >= LocalDuration::from_secs(10) {
            let inbound = self.peermgr.negotiated(Link::Inbound).count();
            let outbound = self.peermgr.negotiated(Link::Outbound).count();
            debug!(
                target: "p2p",
                "inbound = {}, outbound = {}, addresses = {}",
                inbound,
                outbound,
                self.addrmgr.len(),
            );
            self.persist_addrmgr();
            self.persist_anchors();
            self.last_tick = now;
        }
    }

    fn is_connected(&mut self, addr: SocketAddr) -> bool {
        self.peermgr.is_connected(&addr)
    }

    fn connecting_amount(&self) -> usize {
        self.peermgr.connecting().count()
    }
}
