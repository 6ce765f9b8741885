//! Anchor manager (§4.11): persists the last outbound, non-feeler peers across restarts so a
//! restarting node reconnects to the same part of the network rather than a fresh, possibly
//! eclipsed, view.
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::common::persist::{atomic_write_json, load_json};

/// Keep between 2 and 3 anchors.
pub const MIN_ANCHORS: usize = 2;
pub const MAX_ANCHORS: usize = 3;

#[derive(Debug, Clone)]
pub enum Event {
    Loaded { count: usize },
    Saved { count: usize },
}

#[derive(Serialize, Deserialize)]
struct AnchorEntry {
    ip: std::net::IpAddr,
    port: u16,
}

impl From<SocketAddr> for AnchorEntry {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<&AnchorEntry> for SocketAddr {
    fn from(entry: &AnchorEntry) -> Self {
        SocketAddr::new(entry.ip, entry.port)
    }
}

/// Save the given outbound endpoints (already filtered to non-feeler peers) to `path`, keeping
/// at most [`MAX_ANCHORS`].
pub fn save(peers: &[SocketAddr], path: &PathBuf) -> Result<usize, crate::common::persist::PersistError> {
    let entries: Vec<AnchorEntry> = peers
        .iter()
        .take(MAX_ANCHORS)
        .copied()
        .map(AnchorEntry::from)
        .collect();
    let count = entries.len();
    atomic_write_json(path, &entries)?;
    Ok(count)
}

/// Load previously-saved anchors. Returns an empty vector if the file is missing or unreadable.
pub fn load(path: &PathBuf) -> Vec<SocketAddr> {
    match load_json::<Vec<AnchorEntry>>(path) {
        Ok(Some(entries)) => entries.iter().map(SocketAddr::from).collect(),
        Ok(None) => Vec::new(),
        Err(err) => {
            tracing::warn!(target: "net", %err, "failed to load anchors, starting empty");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join("hdr-p2p-anchor-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("anchors.json");

        let peers = vec![
            "1.2.3.4:8333".parse().unwrap(),
            "5.6.7.8:8333".parse().unwrap(),
        ];
        save(&peers, &path).unwrap();

        let loaded = load(&path);
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&peers[0]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn save_caps_at_max_anchors() {
        let dir = std::env::temp_dir().join("hdr-p2p-anchor-test-cap");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("anchors.json");

        let peers: Vec<SocketAddr> = (0..10)
            .map(|i| format!("10.0.0.{}:8333", i).parse().unwrap())
            .collect();
        let count = save(&peers, &path).unwrap();
        assert_eq!(count, MAX_ANCHORS);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let path = std::env::temp_dir().join("hdr-p2p-anchor-test-missing.json");
        std::fs::remove_file(&path).ok();
        assert!(load(&path).is_empty());
    }
}
