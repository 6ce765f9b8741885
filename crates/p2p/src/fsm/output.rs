//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each sub-protocol, eg. the header-sync or handshake protocols, is given a copy of this
//! outbox with specific capabilities, eg. peer disconnection, message sending etc. to
//! communicate with the network.
use std::sync::{Arc, Mutex};
use std::{cell::RefCell, collections::VecDeque, net, rc::Rc};

use tracing::debug;

use hdr_types::{
    BlockHeader, GetHeadersPayload, InventoryItem, Magic, NetworkMessage, RawNetworkMessage,
    TimestampedAddress, VersionPayload,
};

use crate::{
    fsm::event::Event,
    fsm::handler::{DisconnectReason, PeerId},
    net::LocalDuration,
};

/// Output of a state transition of the `Protocol` state machine.
pub type Io = crate::net::Io<RawNetworkMessage, Event, DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to peer.
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from peer.
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// The wire protocol (§6.1): every message this core ever sends.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    // Handshake messages //////////////////////////////////////////////////////

    /// Send a `version` message.
    fn version(&mut self, addr: PeerId, msg: VersionPayload);

    /// Send a `verack` message.
    fn verack(&mut self, addr: PeerId) -> &mut Self;

    // Ping/pong ///////////////////////////////////////////////////////////////

    /// Send a `ping` message.
    fn ping(&mut self, addr: PeerId, nonce: u64) -> &Self;

    /// Send a `pong` message.
    fn pong(&mut self, addr: PeerId, nonce: u64) -> &Self;

    // Addresses //////////////////////////////////////////////////////////////

    /// Send a `getaddr` message.
    fn get_addr(&mut self, addr: PeerId);

    /// Send an `addr` message.
    fn addr(&mut self, addr: PeerId, addrs: Vec<TimestampedAddress>);

    // Header sync ////////////////////////////////////////////////////////////

    /// Send a `getheaders` message.
    fn get_headers(&mut self, addr: PeerId, payload: GetHeadersPayload);

    /// Send a `headers` message.
    fn headers(&mut self, addr: PeerId, headers: Vec<BlockHeader>);

    // Inventory ///////////////////////////////////////////////////////////////

    /// Send an `inv` message to a peer.
    fn inv(&mut self, addr: PeerId, items: Vec<InventoryItem>);
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone)]
pub struct Outbox {
    /// Network magic used to frame outgoing messages.
    magic: Magic,
    /// Output queue.
    pub outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(Magic(0))
    }
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.lock().unwrap().pop_front()
    }
}

impl Outbox {
    /// Create a new channel.
    pub fn new(magic: Magic) -> Self {
        Self {
            magic,
            outbound: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound.lock().unwrap().push_back(output);
    }

    /// Push a message to the channel.
    pub fn message(&mut self, addr: PeerId, payload: NetworkMessage) -> &Self {
        debug!(target: "net", peer = %addr, command = payload.command(), "sending message");

        self.push(Io::Write(
            addr,
            RawNetworkMessage {
                magic: self.magic,
                payload,
            },
        ));

        self
    }

    /// Push an event to the channel.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }
}

/// Draining iterator over outbound channel queue.
pub struct Drain {
    items: Rc<RefCell<VecDeque<Io>>>,
}

impl Iterator for Drain {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.borrow_mut().pop_front()
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
        debug!(target: "net", peer = %addr, %reason, "disconnecting");

        self.push(Io::Disconnect(addr, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration) {
        self.push(Io::Connect(addr));
        self.push(Io::SetTimer(timeout));
    }
}

impl<E: Into<Event> + std::fmt::Debug> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "net", ?event, "event");
        self.event(event.into());
    }

    fn version(&mut self, addr: PeerId, msg: VersionPayload) {
        self.message(addr, NetworkMessage::Version(msg));
    }

    fn verack(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, NetworkMessage::Verack);
        self
    }

    fn ping(&mut self, addr: PeerId, nonce: u64) -> &Self {
        self.message(addr, NetworkMessage::Ping(nonce));
        self
    }

    fn pong(&mut self, addr: PeerId, nonce: u64) -> &Self {
        self.message(addr, NetworkMessage::Pong(nonce));
        self
    }

    fn get_addr(&mut self, addr: PeerId) {
        self.message(addr, NetworkMessage::GetAddr);
    }

    fn addr(&mut self, addr: PeerId, addrs: Vec<TimestampedAddress>) {
        self.message(addr, NetworkMessage::Addr(addrs));
    }

    fn get_headers(&mut self, addr: PeerId, payload: GetHeadersPayload) {
        self.message(addr, NetworkMessage::GetHeaders(payload));
    }

    fn headers(&mut self, addr: PeerId, headers: Vec<BlockHeader>) {
        self.message(addr, NetworkMessage::Headers(headers));
    }

    fn inv(&mut self, addr: PeerId, items: Vec<InventoryItem>) {
        self.message(addr, NetworkMessage::Inv(items));
    }
}
