use std::net::SocketAddr;
use std::{net, time};

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

use hdr_types::{BlockHash, NetworkAddress};

use crate::{
    chainstate::Chainstate,
    client::boot_nodes::fixed_seed_addresses,
    client::error::Error,
    client::handle,
    client::service::Service,
    fsm::handler::{Command, Peer},
    net::{NetReactor, NetWaker},
};

pub use crate::fsm::handler::Config;

/// Runs a pre-loaded client (§4.12): owns the reactor and the [`Service`] it drives, and hands
/// out [`Handle`]s that the rest of the node uses to send it commands.
pub struct P2PClient<R: NetReactor, C: Chainstate> {
    handle: Handle<R::Waker>,
    service: Service<C>,
    listen: SocketAddr,
    commands: chan::Receiver<Command>,
    reactor: R,
}

impl<R: NetReactor, C: Chainstate> P2PClient<R, C> {
    /// Create a new client. `listen` is the local address to accept inbound connections on;
    /// pass `0.0.0.0:0` (or the IPv6 equivalent) to disable listening entirely.
    pub fn new(listen: SocketAddr, config: Config, chainstate: C) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();

        let (listening_send, listening) = chan::bounded(1);
        let reactor = <R as NetReactor>::new(listening_send)?;

        let seed_addrs = if config.persist.addrman.as_deref().map(|p| !p.exists()).unwrap_or(true) {
            fixed_seed_addresses(chainstate.params())
        } else {
            Vec::new()
        };

        let rng = fastrand::Rng::new();
        let service = Service::new(chainstate, rng, config);

        if !seed_addrs.is_empty() {
            commands_tx.send(Command::ImportAddresses(seed_addrs)).ok();
        }

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            timeout: time::Duration::from_secs(60),
            listening,
        };

        Ok(P2PClient {
            handle,
            listen,
            commands: commands_rx,
            reactor,
            service,
        })
    }

    /// Run the loaded client until `cancellation` fires.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self.reactor.run(&self.listen, self.service, self.commands, cancellation).await;

        if let Err(e) = result {
            tracing::error!(target: "p2p", "p2p is down, run error: {}", e);
        }
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> Handle<R::Waker> {
        self.handle.clone()
    }
}

#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub commands: chan::Sender<Command>,
    pub waker: W,
    pub timeout: time::Duration,
    pub listening: chan::Receiver<net::SocketAddr>,
}

impl<W: NetWaker> Handle<W> {
    /// Send a command to the command channel, and wake up the event loop.
    async fn _command(&self, cmd: Command) -> Result<(), handle::Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(handle::Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }
}

#[async_trait]
impl<W: NetWaker> handle::Handle for Handle<W> {
    async fn command(&self, cmd: Command) -> Result<(), handle::Error> {
        self._command(cmd).await
    }

    async fn get_peers(&self) -> Result<Vec<Peer>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetPeers(transmit)).await?;

        receive.recv_async().await.map_err(|_| handle::Error::Timeout)
    }

    async fn connect(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self.command(Command::Connect(addr)).await
    }

    async fn disconnect(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self.command(Command::Disconnect(addr)).await
    }

    async fn import_addresses(&self, addrs: Vec<NetworkAddress>) -> Result<(), handle::Error> {
        self.command(Command::ImportAddresses(addrs)).await
    }

    async fn announce_block(&self, hash: BlockHash) -> Result<(), handle::Error> {
        self.command(Command::AnnounceBlock(hash)).await
    }

    async fn ban_peer(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self.command(Command::BanPeer(addr)).await
    }
}
