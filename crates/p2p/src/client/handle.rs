//! Node handles are created from nodes by users of the library, to communicate with the
//! underlying protocol instance.
use std::net::SocketAddr;

use async_trait::async_trait;
use flume as chan;
use thiserror::Error;

use hdr_types::{BlockHash, NetworkAddress};

use crate::fsm::handler::{Command, Peer};

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// The command returned an error.
    #[error("command failed")]
    Command,
    /// The operation timed out.
    #[error("the operation timed out")]
    Timeout,
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with a running node (§6.1).
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Send a command to the client.
    async fn command(&self, cmd: Command) -> Result<(), Error>;

    /// Get the currently connected, negotiated peers.
    async fn get_peers(&self) -> Result<Vec<Peer>, Error>;
    /// Connect to a peer.
    async fn connect(&self, addr: SocketAddr) -> Result<(), Error>;
    /// Disconnect from a peer.
    async fn disconnect(&self, addr: SocketAddr) -> Result<(), Error>;
    /// Import addresses into the address manager, e.g. from a `-addnode`-style config.
    async fn import_addresses(&self, addrs: Vec<NetworkAddress>) -> Result<(), Error>;
    /// Announce a newly-accepted tip to every connected peer.
    async fn announce_block(&self, hash: BlockHash) -> Result<(), Error>;
    /// Forbid a peer from connecting to us.
    async fn ban_peer(&self, addr: SocketAddr) -> Result<(), Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn command(&self, cmd: Command) -> Result<(), Error>;
        async fn get_peers(&self) -> Result<Vec<Peer>, Error>;
        async fn connect(&self, addr: SocketAddr) -> Result<(), Error>;
        async fn disconnect(&self, addr: SocketAddr) -> Result<(), Error>;
        async fn import_addresses(&self, addrs: Vec<NetworkAddress>) -> Result<(), Error>;
        async fn announce_block(&self, hash: BlockHash) -> Result<(), Error>;
        async fn ban_peer(&self, addr: SocketAddr) -> Result<(), Error>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mock() {
        let mut _mock = MockHandle::new();
    }
}
