//! Ban / discourage manager (§4.4). Grounded on `original_source/src/network/ban_manager.cpp`
//! and `banman.cpp`: persistent bans keyed by IP string, volatile discouragement, and a
//! whitelist consulted only at connection admission.
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::common::persist::{atomic_write_json, load_json};
use crate::net::LocalTime;

/// Default discouragement duration (§4.4): ~24 hours.
pub const DEFAULT_DISCOURAGEMENT_SECS: u64 = 24 * 60 * 60;
/// Upper bound on the discouraged set; oldest-expiry entries are evicted past this.
pub const MAX_DISCOURAGED: usize = 10_000;

const BANLIST_VERSION: u32 = 1;

/// A persisted ban record. `ban_until == 0` means permanent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BanEntry {
    pub create_time: u64,
    pub ban_until: u64,
}

impl BanEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.ban_until != 0 && now >= self.ban_until
    }
}

#[derive(Serialize, Deserialize)]
struct BanlistFile {
    version: u32,
    banned: HashMap<String, BanEntry>,
}

/// Tracks banned (persistent) and discouraged (volatile) IPs, plus an admission whitelist.
#[derive(Debug, Default)]
pub struct BanManager {
    banned: HashMap<String, BanEntry>,
    discouraged: HashMap<String, u64>,
    whitelist: std::collections::HashSet<IpAddr>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl BanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted ban list. A parse error clears state rather than propagating, per §7.
    pub fn load(path: PathBuf) -> Self {
        let banned = match load_json::<BanlistFile>(&path) {
            Ok(Some(file)) if file.version == BANLIST_VERSION => file.banned,
            Ok(Some(_)) => {
                tracing::warn!(target: "ban", "banlist version mismatch, discarding");
                HashMap::new()
            }
            Ok(None) => HashMap::new(),
            Err(err) => {
                tracing::warn!(target: "ban", %err, "failed to load banlist, starting empty");
                HashMap::new()
            }
        };
        Self {
            banned,
            discouraged: HashMap::new(),
            whitelist: std::collections::HashSet::new(),
            path: Some(path),
            dirty: false,
        }
    }

    pub fn add_to_whitelist(&mut self, ip: IpAddr) {
        self.whitelist.insert(ip);
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    /// Ban `ip`. `offset_secs == 0` means permanent.
    pub fn ban(&mut self, ip: IpAddr, offset_secs: u64, now: LocalTime) {
        let now = now.as_secs();
        let ban_until = if offset_secs == 0 { 0 } else { now + offset_secs };
        self.banned.insert(
            ip.to_string(),
            BanEntry {
                create_time: now,
                ban_until,
            },
        );
        self.dirty = true;
        self.save_if_dirty();
    }

    pub fn unban(&mut self, ip: &IpAddr) {
        if self.banned.remove(&ip.to_string()).is_some() {
            self.dirty = true;
            self.save_if_dirty();
        }
    }

    pub fn is_banned(&self, ip: &IpAddr, now: LocalTime) -> bool {
        match self.banned.get(&ip.to_string()) {
            Some(entry) => !entry.is_expired(now.as_secs()),
            None => false,
        }
    }

    /// Discourage `ip` for [`DEFAULT_DISCOURAGEMENT_SECS`].
    pub fn discourage(&mut self, ip: IpAddr, now: LocalTime) {
        let expiry = now.as_secs() + DEFAULT_DISCOURAGEMENT_SECS;
        if self.discouraged.len() >= MAX_DISCOURAGED && !self.discouraged.contains_key(&ip.to_string()) {
            self.sweep_discouraged(now);
            if self.discouraged.len() >= MAX_DISCOURAGED {
                if let Some(oldest_ip) = self
                    .discouraged
                    .iter()
                    .min_by_key(|(_, expiry)| **expiry)
                    .map(|(ip, _)| ip.clone())
                {
                    self.discouraged.remove(&oldest_ip);
                }
            }
        }
        self.discouraged.insert(ip.to_string(), expiry);
    }

    pub fn is_discouraged(&self, ip: &IpAddr, now: LocalTime) -> bool {
        match self.discouraged.get(&ip.to_string()) {
            Some(expiry) => now.as_secs() < *expiry,
            None => false,
        }
    }

    /// Whitelisted peers bypass ban/discourage checks at admission (§4.7).
    pub fn is_admissible(&self, ip: &IpAddr, now: LocalTime) -> bool {
        self.is_whitelisted(ip) || (!self.is_banned(ip, now) && !self.is_discouraged(ip, now))
    }

    pub fn sweep_banned(&mut self, now: LocalTime) {
        let now = now.as_secs();
        let before = self.banned.len();
        self.banned.retain(|_, entry| !entry.is_expired(now));
        if self.banned.len() != before {
            self.dirty = true;
            self.save_if_dirty();
        }
    }

    pub fn sweep_discouraged(&mut self, now: LocalTime) {
        let now = now.as_secs();
        self.discouraged.retain(|_, expiry| now < *expiry);
    }

    fn save_if_dirty(&mut self) {
        let Some(path) = &self.path else {
            self.dirty = false;
            return;
        };
        if !self.dirty {
            return;
        }
        let file = BanlistFile {
            version: BANLIST_VERSION,
            banned: self.banned.clone(),
        };
        match atomic_write_json(path, &file) {
            Ok(()) => self.dirty = false,
            Err(err) => tracing::warn!(target: "ban", %err, "failed to persist banlist"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    #[test]
    fn permanent_ban_never_expires() {
        let mut mgr = BanManager::new();
        mgr.ban(ip(), 0, LocalTime::from_secs(0));
        assert!(mgr.is_banned(&ip(), LocalTime::from_secs(u64::MAX / 2)));
    }

    #[test]
    fn timed_ban_expires_at_deadline() {
        let mut mgr = BanManager::new();
        mgr.ban(ip(), 100, LocalTime::from_secs(0));
        assert!(mgr.is_banned(&ip(), LocalTime::from_secs(50)));
        assert!(!mgr.is_banned(&ip(), LocalTime::from_secs(100)));
    }

    #[test]
    fn whitelist_bypasses_admission_check() {
        let mut mgr = BanManager::new();
        mgr.ban(ip(), 0, LocalTime::from_secs(0));
        assert!(!mgr.is_admissible(&ip(), LocalTime::from_secs(1)));

        mgr.add_to_whitelist(ip());
        assert!(mgr.is_admissible(&ip(), LocalTime::from_secs(1)));
    }

    #[test]
    fn discourage_expires_after_default_window() {
        let mut mgr = BanManager::new();
        mgr.discourage(ip(), LocalTime::from_secs(0));
        assert!(mgr.is_discouraged(&ip(), LocalTime::from_secs(1)));
        assert!(!mgr.is_discouraged(&ip(), LocalTime::from_secs(DEFAULT_DISCOURAGEMENT_SECS + 1)));
    }
}
