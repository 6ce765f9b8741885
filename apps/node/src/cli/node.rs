use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use hdr_p2p::{
    client::{Handle, P2PClient},
    net::{ReactorTcp, Waker},
    ChainParams, MemoryChainstate,
};
use hdr_types::{BlockHash, BlockHeader, Network};

use crate::config::NodeConfig;

/// The limit of time to wait for the node to shut down.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Node encapsulates the node service's startup and lifecycle.
pub struct Node {
    config: NodeConfig,
    cancelation: CancellationToken,
    pub(crate) task_tracker: TaskTracker,
}

impl Node {
    pub async fn new(config: NodeConfig) -> eyre::Result<Self> {
        Ok(Self {
            config,
            cancelation: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Wait for the signal from any node service about the cancellation.
    pub async fn cancelled(&self) {
        self.cancelation.cancelled().await
    }

    pub async fn run(&self) -> eyre::Result<()> {
        let p2p_handle = self.spawn_p2p()?;
        drop(p2p_handle);

        self.task_tracker.close();

        Ok(())
    }

    fn spawn_p2p(&self) -> eyre::Result<Handle<Waker>> {
        let listen = self.config.p2p.listen_addr()?;
        let client_config = self.config.p2p.to_client_config(self.config.network)?;
        let chainstate = genesis_chainstate(self.config.network);

        let p2p_client = P2PClient::<ReactorTcp, MemoryChainstate>::new(listen, client_config, chainstate)?;
        let handle = p2p_client.handle();

        self.task_tracker.spawn(p2p_client.run(self.cancelation.clone()));

        Ok(handle)
    }

    pub async fn shutdown(&self) {
        info!("Shutting down node, finishing received requests...");

        self.cancelation.cancel();

        let timeout = self
            .config
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        select! {
            _ = self.task_tracker.wait() => {},
            _ = sleep(Duration::from_secs(timeout)) => {
                info!("Shutdown timeout reached, exiting...");
            },
        }
    }
}

/// Builds an in-memory chainstate seeded with a network genesis header, standing in for the
/// persistent chainstate manager this node does not yet implement (see DESIGN.md).
fn genesis_chainstate(network: Network) -> MemoryChainstate {
    let genesis = BlockHeader {
        version: 1,
        prev_block: BlockHash::ZERO,
        miner_address: [0u8; 20],
        time: 1_700_000_000,
        bits: 0x1d00ffff,
        nonce: 0,
        randomx_hash: [0u8; 32],
    };
    let params = ChainParams::new(network, genesis.block_hash(), genesis.bits, Vec::new());

    MemoryChainstate::new(params, genesis)
}
