//! State machine events, forwarded by the reactor to the user thread.
use std::sync::Arc;

use hdr_types::NetworkMessage;

use crate::fsm::{
    addrmgr::Event as AddressEvent, anchormgr::Event as AnchorEvent,
    blockrelay::Event as BlockRelayEvent, peermgr::Event as PeerEvent,
    pingmgr::Event as PingEvent, syncmgr::Event as SyncEvent,
};
use crate::net::LocalTime;

/// A peer-to-peer event.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node is initializing its state machine and about to start network activity.
    Initializing,
    /// The node is initialized and ready to receive commands.
    Ready {
        /// Local time at startup.
        time: LocalTime,
    },
    /// Received a message from a peer.
    Received(NetworkMessage),
    /// An address manager event.
    Address(AddressEvent),
    /// A peer manager event.
    Peer(PeerEvent),
    /// A header-sync coordinator event.
    Sync(SyncEvent),
    /// A block-relay coordinator event.
    BlockRelay(BlockRelayEvent),
    /// A ping manager event.
    Ping(PingEvent),
    /// An anchor manager event.
    Anchor(AnchorEvent),
    /// An internal error, surfaced for logging/observability only.
    Error(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<PeerEvent> for Event {
    fn from(e: PeerEvent) -> Self {
        Self::Peer(e)
    }
}

impl From<AddressEvent> for Event {
    fn from(e: AddressEvent) -> Self {
        Self::Address(e)
    }
}

impl From<SyncEvent> for Event {
    fn from(e: SyncEvent) -> Self {
        Self::Sync(e)
    }
}

impl From<BlockRelayEvent> for Event {
    fn from(e: BlockRelayEvent) -> Self {
        Self::BlockRelay(e)
    }
}

impl From<PingEvent> for Event {
    fn from(e: PingEvent) -> Self {
        Self::Ping(e)
    }
}

impl From<AnchorEvent> for Event {
    fn from(e: AnchorEvent) -> Self {
        Self::Anchor(e)
    }
}
