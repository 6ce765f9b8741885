use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use eyre::{Context, OptionExt};
use serde::Deserialize;

use hdr_p2p::client;
use hdr_p2p::fsm::handler::Limits;
use hdr_types::Network;

/// Default number of inbound connections this node accepts.
pub const DEFAULT_MAX_INBOUND_CONNECTIONS: usize = 125;

/// Default number of outbound connections this node maintains.
pub const DEFAULT_MAX_OUTBOUND_CONNECTIONS: usize = 8;

#[derive(Deserialize, Clone)]
pub struct P2pConfig {
    /// Address to listen for incoming connections on.
    pub address: String,
    /// Maximum number of inbound connections.
    #[serde(default = "default_max_inbound_connections")]
    pub max_inbound_connections: usize,
    /// Target number of outbound connections.
    #[serde(default = "default_max_outbound_connections")]
    pub max_outbound_connections: usize,
    /// Peers to connect to and keep reconnecting to indefinitely.
    #[serde(default)]
    pub connect: Vec<String>,
    /// DNS seeds consulted when the address manager is empty.
    #[serde(default)]
    pub dns_seeds: Vec<String>,
    /// Directory the address book, ban list and anchors are persisted under. Runs fully
    /// in-memory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_max_inbound_connections() -> usize {
    DEFAULT_MAX_INBOUND_CONNECTIONS
}

fn default_max_outbound_connections() -> usize {
    DEFAULT_MAX_OUTBOUND_CONNECTIONS
}

impl P2pConfig {
    pub fn listen_addr(&self) -> eyre::Result<SocketAddr> {
        self.address
            .to_socket_addrs()
            .wrap_err("Failed to resolve listen address")?
            .next()
            .ok_or_eyre("No address found in listen address")
    }

    pub fn to_client_config(&self, network: Network) -> eyre::Result<client::Config> {
        let connect: Vec<SocketAddr> = self
            .connect
            .iter()
            .map(|x| x.to_socket_addrs().wrap_err("Failed to resolve connect address"))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();

        // `dns_seeds` wants `&'static str`; these are read once at startup and held for the
        // life of the process, so leaking them is the pragmatic way to satisfy that bound
        // with operator-supplied strings instead of hardcoded literals.
        let dns_seeds: Vec<&'static str> = self
            .dns_seeds
            .iter()
            .map(|s| -> &'static str { Box::leak(s.clone().into_boxed_str()) })
            .collect();

        let persist = self
            .data_dir
            .as_ref()
            .map(|dir| client::PersistPaths {
                addrman: Some(dir.join("peers.json")),
                banlist: Some(dir.join("banlist.json")),
                anchors: Some(dir.join("anchors.json")),
            })
            .unwrap_or_default();

        Ok(client::Config {
            network,
            connect,
            limits: Limits {
                max_outbound_peers: self.max_outbound_connections,
                max_inbound_peers: self.max_inbound_connections,
            },
            dns_seeds,
            seed_port: network.default_port(),
            persist,
            ..Default::default()
        })
    }
}
