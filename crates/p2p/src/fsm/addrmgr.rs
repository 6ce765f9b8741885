//! Address manager (§4.3): a two-table (`tried`/`new`) store of peer addresses, restructured
//! from the teacher's single range-bucketed `HashMap<u8, HashSet<SocketAddr>>` design (kept
//! here only for the `is_local`/`addr_key` idioms) into the spec's explicit `AddrInfo` lifecycle.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use hdr_types::{NetworkAddress, ServiceFlags};

use crate::common::persist::{atomic_write_json, load_json, PersistError};
use crate::net::LocalTime;

/// An address is demoted from `tried`, or dropped from `new`, once it has failed this many
/// consecutive connection attempts.
pub const MAX_FAILURES: u32 = 10;
/// Entries with at least this many attempts bypass the retry cooldown during selection.
pub const SELECT_COOLDOWN_OVERRIDE_ATTEMPTS: u32 = 30;
/// An address in `new` that hasn't been seen or successfully connected to in this long is
/// "terrible" and gets dropped.
pub const MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;
/// Minimum time between retries of the same address during selection.
pub const SELECT_COOLDOWN_SECS: u64 = 600;
/// Bounded number of random probes per table during selection.
pub const SELECT_MAX_PROBES: usize = 64;
/// Probability (in percent) that `select()` draws from `tried` rather than `new`.
pub const TRIED_SELECTION_PERCENT: u32 = 80;

const ADDRMAN_VERSION: u32 = 1;

/// An event emitted by the address manager.
#[derive(Debug, Clone)]
pub enum Event {
    Added { addr: SocketAddr },
    Promoted { addr: SocketAddr },
    Demoted { addr: SocketAddr },
    Dropped { addr: SocketAddr },
}

/// An entry in either table (§3).
#[derive(Debug, Clone, Copy)]
pub struct AddrInfo {
    pub addr: NetworkAddress,
    pub last_seen: u64,
    pub last_try: Option<u64>,
    pub last_success: Option<u64>,
    pub attempts: u32,
}

impl AddrInfo {
    fn new(addr: NetworkAddress, last_seen: u64) -> Self {
        Self {
            addr,
            last_seen,
            last_try: None,
            last_success: None,
            attempts: 0,
        }
    }

    /// "Terrible": too many failures, or too old without ever succeeding (§3).
    fn is_terrible(&self, now: u64) -> bool {
        if self.last_success.is_some() {
            return false;
        }
        self.attempts >= MAX_FAILURES || now.saturating_sub(self.last_seen) > MAX_AGE_SECS
    }

    fn eligible_for_selection(&self, now: u64) -> bool {
        match self.last_try {
            None => true,
            Some(t) => {
                now.saturating_sub(t) >= SELECT_COOLDOWN_SECS
                    || self.attempts >= SELECT_COOLDOWN_OVERRIDE_ATTEMPTS
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedAddr {
    ip: [u8; 16],
    port: u16,
    services: u64,
    timestamp: u64,
    last_try: u64,
    last_success: u64,
    attempts: u32,
}

impl From<&AddrInfo> for PersistedAddr {
    fn from(info: &AddrInfo) -> Self {
        Self {
            ip: info.addr.ip,
            port: info.addr.port,
            services: info.addr.services.0,
            timestamp: info.last_seen,
            last_try: info.last_try.unwrap_or(0),
            last_success: info.last_success.unwrap_or(0),
            attempts: info.attempts,
        }
    }
}

impl From<&PersistedAddr> for (SocketAddr, AddrInfo) {
    fn from(p: &PersistedAddr) -> Self {
        let addr = NetworkAddress {
            services: ServiceFlags(p.services),
            ip: p.ip,
            port: p.port,
        };
        let info = AddrInfo {
            addr,
            last_seen: p.timestamp,
            last_try: (p.last_try != 0).then_some(p.last_try),
            last_success: (p.last_success != 0).then_some(p.last_success),
            attempts: p.attempts,
        };
        (addr.socket_addr(), info)
    }
}

#[derive(Serialize, Deserialize)]
struct AddrManFile {
    version: u32,
    tried_count: usize,
    new_count: usize,
    tried: Vec<PersistedAddr>,
    new: Vec<PersistedAddr>,
}

/// Two-table address store (§3, §4.3).
#[derive(Debug, Default)]
pub struct AddressManager {
    tried: HashMap<SocketAddr, AddrInfo>,
    new: HashMap<SocketAddr, AddrInfo>,
    rng: Option<fastrand::Rng>,
}

impl AddressManager {
    pub fn new() -> Self {
        Self {
            tried: HashMap::new(),
            new: HashMap::new(),
            rng: None,
        }
    }

    fn rng(&mut self) -> &mut fastrand::Rng {
        // Per-call entropy seeded from the global generator, never a static seed (anti-eclipse).
        self.rng.get_or_insert_with(|| fastrand::Rng::with_seed(fastrand::u64(..)))
    }

    pub fn len(&self) -> usize {
        self.tried.len() + self.new.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `add(addr, ts)` (§4.3): reject invalid or local addresses; insert into `new` unless
    /// terrible; update in place (never move tables) if already known.
    pub fn add(&mut self, addr: NetworkAddress, ts: u64, now: LocalTime) -> bool {
        if !addr.is_valid() {
            return false;
        }
        let socket_addr = addr.socket_addr();
        if is_local(&socket_addr.ip()) {
            return false;
        }
        let now_secs = now.as_secs();
        let clamped_ts = ts.min(now_secs);

        if let Some(existing) = self.tried.get_mut(&socket_addr) {
            if clamped_ts > existing.last_seen {
                existing.last_seen = clamped_ts;
            }
            return false;
        }
        if let Some(existing) = self.new.get_mut(&socket_addr) {
            if clamped_ts > existing.last_seen {
                existing.last_seen = clamped_ts;
            }
            return false;
        }

        let info = AddrInfo::new(addr, clamped_ts);
        if info.is_terrible(now_secs) {
            return false;
        }
        self.new.insert(socket_addr, info);
        true
    }

    pub fn add_multiple(&mut self, addrs: impl IntoIterator<Item = (NetworkAddress, u64)>, now: LocalTime) {
        for (addr, ts) in addrs {
            self.add(addr, ts, now);
        }
    }

    /// `attempt(addr)` (§4.3): records the attempt time on whichever table holds the address.
    pub fn attempt(&mut self, addr: &SocketAddr, now: LocalTime) {
        let now = now.as_secs();
        if let Some(info) = self.new.get_mut(addr) {
            info.last_try = Some(now);
        } else if let Some(info) = self.tried.get_mut(addr) {
            info.last_try = Some(now);
        }
    }

    /// `good(addr)` (§4.3): on a completed handshake, promote from `new` to `tried`, or
    /// refresh `tried`.
    pub fn good(&mut self, addr: &SocketAddr, now: LocalTime) {
        let now = now.as_secs();
        if let Some(mut info) = self.new.remove(addr) {
            info.last_success = Some(now);
            info.attempts = 0;
            self.tried.insert(*addr, info);
        } else if let Some(info) = self.tried.get_mut(addr) {
            info.last_success = Some(now);
            info.attempts = 0;
        }
    }

    /// `failed(addr)` (§4.3): demote from `tried` to `new` past `MAX_FAILURES`, or drop from
    /// `new` once terrible.
    pub fn failed(&mut self, addr: &SocketAddr, now: LocalTime) {
        let now_secs = now.as_secs();
        if let Some(info) = self.new.get_mut(addr) {
            info.attempts += 1;
            if info.is_terrible(now_secs) {
                self.new.remove(addr);
            }
            return;
        }
        if let Some(info) = self.tried.get_mut(addr) {
            info.attempts += 1;
            if info.attempts >= MAX_FAILURES {
                let mut demoted = self.tried.remove(addr).unwrap();
                demoted.attempts = 0;
                self.new.insert(*addr, demoted);
            }
        }
    }

    /// `select()` (§4.3): 80/20 biased table choice, bounded cooldown-aware probing, falling
    /// back to any entry if neither table yields an eligible one.
    pub fn select(&mut self) -> Option<SocketAddr> {
        let now = LocalTime::now().as_secs();
        let prefer_tried = self.rng().u32(0..100) < TRIED_SELECTION_PERCENT;

        let mut rng = self.rng.clone().unwrap_or_else(|| fastrand::Rng::with_seed(fastrand::u64(..)));

        let first_is_tried = prefer_tried;
        let first = if first_is_tried { &self.tried } else { &self.new };
        let second = if first_is_tried { &self.new } else { &self.tried };

        let found = Self::probe(first, now, &mut rng).or_else(|| Self::probe(second, now, &mut rng));
        self.rng = Some(rng);

        found.or_else(|| self.tried.keys().chain(self.new.keys()).next().copied())
    }

    fn probe(table: &HashMap<SocketAddr, AddrInfo>, now: u64, rng: &mut fastrand::Rng) -> Option<SocketAddr> {
        if table.is_empty() {
            return None;
        }
        let keys: Vec<&SocketAddr> = table.keys().collect();
        for _ in 0..SELECT_MAX_PROBES.min(keys.len()) {
            let idx = rng.usize(0..keys.len());
            let addr = keys[idx];
            if table[addr].eligible_for_selection(now) {
                return Some(*addr);
            }
        }
        None
    }

    /// `select_new_for_feeler()` (§4.3): random entry from `new`, for feeler connections.
    pub fn select_new_for_feeler(&mut self) -> Option<SocketAddr> {
        if self.new.is_empty() {
            return None;
        }
        let keys: Vec<&SocketAddr> = self.new.keys().collect();
        let idx = self.rng().usize(0..keys.len());
        Some(*keys[idx])
    }

    /// `get_addresses(max)` (§4.3): shuffled, terrible-filtered subset for `addr` replies.
    pub fn get_addresses(&mut self, max: usize) -> Vec<NetworkAddress> {
        let now = LocalTime::now().as_secs();
        let mut all: Vec<NetworkAddress> = self
            .tried
            .values()
            .chain(self.new.values())
            .filter(|info| !info.is_terrible(now))
            .map(|info| info.addr)
            .collect();

        let rng = self.rng();
        for i in (1..all.len()).rev() {
            let j = rng.usize(0..=i);
            all.swap(i, j);
        }
        all.truncate(max);
        all
    }

    /// `cleanup_stale()` (§4.3): drop stale/terrible entries from `new`; `tried` is retained
    /// indefinitely.
    pub fn cleanup_stale(&mut self) {
        let now = LocalTime::now().as_secs();
        self.new.retain(|_, info| !info.is_terrible(now));
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.tried.contains_key(addr) || self.new.contains_key(addr)
    }

    pub fn is_in_tried(&self, addr: &SocketAddr) -> bool {
        self.tried.contains_key(addr)
    }

    pub fn tried_len(&self) -> usize {
        self.tried.len()
    }

    pub fn new_len(&self) -> usize {
        self.new.len()
    }

    /// Save both tables atomically (§4.3 Persistence, §6.3).
    pub fn save(&self, path: &PathBuf) -> Result<(), PersistError> {
        let file = AddrManFile {
            version: ADDRMAN_VERSION,
            tried_count: self.tried.len(),
            new_count: self.new.len(),
            tried: self.tried.values().map(PersistedAddr::from).collect(),
            new: self.new.values().map(PersistedAddr::from).collect(),
        };
        atomic_write_json(path, &file)
    }

    /// Load both tables. A version mismatch or parse error clears state and continues, per §7.
    pub fn load(path: &PathBuf) -> Self {
        match load_json::<AddrManFile>(path) {
            Ok(Some(file)) if file.version == ADDRMAN_VERSION => {
                let tried = file.tried.iter().map(<(SocketAddr, AddrInfo)>::from).collect();
                let new = file.new.iter().map(<(SocketAddr, AddrInfo)>::from).collect();
                Self {
                    tried,
                    new,
                    rng: None,
                }
            }
            Ok(Some(_)) => {
                tracing::warn!(target: "addrman", "peers.json version mismatch, discarding");
                Self::new()
            }
            Ok(None) => Self::new(),
            Err(err) => {
                tracing::warn!(target: "addrman", %err, "failed to load peers.json, starting empty");
                Self::new()
            }
        }
    }
}

/// Check whether an IP address is locally routable, same filter as the teacher's.
pub fn is_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(addr) => {
            addr.is_private() || addr.is_loopback() || addr.is_link_local() || addr.is_unspecified()
        }
        IpAddr::V6(addr) => addr.is_loopback() || addr.is_unspecified(),
    }
}

/// Get the 8-bit key of an IP address's /16 (or IPv6 /32) range, as used by the teacher's
/// bucketing scheme. Kept for callers that still want range diversity when filtering
/// [`AddressManager::get_addresses`] output.
pub fn addr_key(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(ip) => {
            let octets: [u8; 4] = ip.octets();
            let bits: u16 = (octets[0] as u16) << 8 | octets[1] as u16;
            (bits % u8::MAX as u16) as u8
        }
        IpAddr::V6(ip) => {
            let segments: [u16; 8] = ip.segments();
            let bits: u32 = (segments[0] as u32) << 16 | segments[1] as u32;
            (bits % u8::MAX as u32) as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_addr(s: &str) -> NetworkAddress {
        NetworkAddress::new(s.parse().unwrap(), ServiceFlags::NETWORK)
    }

    #[test]
    fn add_puts_new_address_in_new_table() {
        let mut mgr = AddressManager::new();
        assert!(mgr.add(net_addr("203.0.113.1:9999"), 0, LocalTime::from_secs(1_000)));
        assert_eq!(mgr.len(), 1);
        assert!(!mgr.is_in_tried(&"203.0.113.1:9999".parse().unwrap()));
    }

    #[test]
    fn good_promotes_new_to_tried() {
        let mut mgr = AddressManager::new();
        let addr: SocketAddr = "203.0.113.2:9999".parse().unwrap();
        mgr.add(net_addr("203.0.113.2:9999"), 0, LocalTime::from_secs(1_000));
        mgr.good(&addr, LocalTime::from_secs(1_000));
        assert!(mgr.is_in_tried(&addr));
        assert_eq!(mgr.new_len(), 0);
    }

    #[test]
    fn no_address_is_in_both_tables() {
        let mut mgr = AddressManager::new();
        let addr: SocketAddr = "203.0.113.3:9999".parse().unwrap();
        mgr.add(net_addr("203.0.113.3:9999"), 0, LocalTime::from_secs(1_000));
        mgr.good(&addr, LocalTime::from_secs(1_000));
        assert_eq!(mgr.tried_len() + mgr.new_len(), 1);
    }

    #[test]
    fn failed_demotes_tried_after_max_failures() {
        let mut mgr = AddressManager::new();
        let addr: SocketAddr = "203.0.113.4:9999".parse().unwrap();
        mgr.add(net_addr("203.0.113.4:9999"), 0, LocalTime::from_secs(1_000));
        mgr.good(&addr, LocalTime::from_secs(1_000));

        for _ in 0..MAX_FAILURES {
            mgr.failed(&addr, LocalTime::from_secs(1_000));
        }
        assert_eq!(mgr.new_len(), 1);
        assert_eq!(mgr.tried_len(), 0);
    }

    #[test]
    fn local_addresses_are_rejected() {
        let mut mgr = AddressManager::new();
        assert!(!mgr.add(net_addr("127.0.0.1:9999"), 0, LocalTime::from_secs(1_000)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut mgr = AddressManager::new();
        let addr: SocketAddr = "203.0.113.5:9999".parse().unwrap();
        mgr.add(net_addr("203.0.113.5:9999"), 0, LocalTime::from_secs(1_000));
        mgr.good(&addr, LocalTime::from_secs(1_000));
        mgr.add(net_addr("203.0.113.6:9999"), 0, LocalTime::from_secs(1_000));

        let dir = std::env::temp_dir().join("hdr-p2p-addrman-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("peers.json");
        mgr.save(&path).unwrap();

        let loaded = AddressManager::load(&path);
        assert_eq!(loaded.tried_len(), 1);
        assert_eq!(loaded.new_len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cleanup_stale_drops_terrible_new_entries() {
        let mut mgr = AddressManager::new();
        let addr: SocketAddr = "203.0.113.9:9999".parse().unwrap();
        mgr.add(net_addr("203.0.113.9:9999"), 0, LocalTime::from_secs(1_000));
        for _ in 0..MAX_FAILURES {
            mgr.failed(&addr, LocalTime::from_secs(1_000));
        }
        mgr.cleanup_stale();
        assert!(!mgr.contains(&addr));
    }
}
