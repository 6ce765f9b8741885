use std::path::PathBuf;

use config::Config;
use serde::Deserialize;

use hdr_types::Network;

mod logger;
pub use logger::LoggerConfig;

mod p2p;
pub use p2p::P2pConfig;

#[derive(Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_network", deserialize_with = "deserialize_network")]
    pub network: Network,

    pub p2p: P2pConfig,

    /// How long to wait for in-flight tasks to finish before giving up on a graceful
    /// shutdown, in seconds.
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,

    #[serde(default)]
    pub logger: LoggerConfig,
}

fn default_network() -> Network {
    Network::Mainnet
}

fn deserialize_network<'de, D>(deserializer: D) -> Result<Network, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_network(&s).map_err(serde::de::Error::custom)
}

fn parse_network(s: &str) -> Result<Network, String> {
    match s {
        "mainnet" => Ok(Network::Mainnet),
        "testnet" => Ok(Network::Testnet),
        "regtest" => Ok(Network::Regtest),
        other => Err(format!("unknown network {other:?}")),
    }
}

impl NodeConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
