use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::net;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::{
    chainstate::Chainstate,
    client::stream::Decoder,
    fsm,
    fsm::handler::{Command, DisconnectReason, StateMachine as Handler},
    net::{Disconnect, Io, Link, LocalTime, StateMachine},
};

/// Client service. Wraps the protocol [`StateMachine`](Handler) and handles decoding and
/// encoding of network messages, so the state machine itself only ever sees framed
/// [`hdr_types::RawNetworkMessage`]s, never raw bytes.
pub struct Service<C> {
    inboxes: HashMap<net::SocketAddr, Decoder>,
    machine: Handler<C>,
}

impl<C: Chainstate> Service<C> {
    /// Create a new client service.
    pub fn new(chainstate: C, rng: fastrand::Rng, config: fsm::handler::Config) -> Self {
        Self {
            inboxes: HashMap::new(),
            machine: Handler::new(chainstate, rng, config),
        }
    }
}

#[async_trait]
impl<C: Chainstate + Send> crate::net::Service for Service<C> {
    type Command = Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd).await
    }
}

#[async_trait]
impl<C: Chainstate + Send> StateMachine for Service<C> {
    type Message = [u8];
    type Event = crate::fsm::event::Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.machine.initialize(time).await;
    }

    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(addr) else {
            debug!(target: "p2p", "Received message from unknown peer {}", addr);
            return;
        };

        if inbox.input(bytes.borrow()).is_err() {
            error!(target: "p2p", "{}: receive buffer flood limit exceeded", addr);
            self.machine.disconnect(*addr, DisconnectReason::Other("receive buffer flood"));
            return;
        }

        loop {
            match inbox.decode_next() {
                Ok(Some(msg)) => self.machine.message_received(addr, Cow::Owned(msg)).await,
                Ok(None) => break,
                Err(err) => {
                    error!(target: "p2p", "Invalid message received from {}. Error: {}", addr, err);
                    self.machine.disconnect(*addr, DisconnectReason::DecodeError);
                    return;
                }
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.machine.attempted(addr)
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) -> bool {
        if !self.machine.connected(addr, local_addr, link) {
            return false;
        }
        self.inboxes.insert(addr, Decoder::new(1024));
        true
    }

    async fn disconnected(&mut self, addr: &net::SocketAddr, reason: Disconnect<Self::DisconnectReason>) {
        self.inboxes.remove(addr);
        self.machine.disconnected(addr, reason).await
    }

    fn is_disconnected(&mut self, addr: net::SocketAddr) -> bool {
        self.inboxes.get(&addr).is_none() || self.machine.is_disconnected(addr)
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.machine.tick(local_time);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired().await;
    }

    fn is_connected(&mut self, addr: net::SocketAddr) -> bool {
        self.inboxes.get(&addr).is_some() || self.machine.is_connected(addr)
    }

    fn connecting_amount(&self) -> usize {
        self.machine.peermgr.connecting().count()
    }
}

impl<C> Iterator for Service<C> {
    type Item = Io<Vec<u8>, crate::fsm::event::Event, DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.machine.next() {
            Some(Io::Write(addr, msg)) => Some(Io::Write(addr, msg.encode())),
            Some(Io::Event(e)) => Some(Io::Event(e)),
            Some(Io::Connect(a)) => Some(Io::Connect(a)),
            Some(Io::Disconnect(a, r)) => Some(Io::Disconnect(a, r)),
            Some(Io::SetTimer(d)) => Some(Io::SetTimer(d)),
            None => None,
        }
    }
}
