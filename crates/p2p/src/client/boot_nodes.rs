//! Turns a chain's hardcoded bootstrap peers (§4.12) into importable [`NetworkAddress`]es.
use hdr_types::{NetworkAddress, ServiceFlags};

use crate::chainstate::ChainParams;

/// Convert a chain's fixed seeds into addresses suitable for [`crate::fsm::handler::Command::ImportAddresses`].
///
/// Consulted once at startup when the address manager has nothing persisted yet, so a fresh
/// node has somewhere to dial instead of sitting idle until a DNS seed answers.
pub fn fixed_seed_addresses(params: &ChainParams) -> Vec<NetworkAddress> {
    params
        .fixed_seeds()
        .iter()
        .map(|addr| NetworkAddress::new(*addr, ServiceFlags::NONE))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdr_types::{BlockHash, Network};

    #[test]
    fn converts_every_fixed_seed() {
        let seeds = vec!["1.2.3.4:9999".parse().unwrap(), "5.6.7.8:9999".parse().unwrap()];
        let params = ChainParams::new(Network::Mainnet, BlockHash::ZERO, 0x1d00ffff, seeds.clone());

        let addrs = fixed_seed_addresses(&params);
        assert_eq!(addrs.len(), seeds.len());
    }
}
