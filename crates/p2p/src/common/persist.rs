//! Atomic temp-file/fsync/rename persistence, shared by the address manager, ban manager and
//! anchor manager (§6.3).
use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("(de)serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize `value` to JSON and write it to `path` via `<path>.tmp` + `fsync` + rename, so a
/// crash never leaves a half-written file in place.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load and parse a JSON file written by [`atomic_write_json`]. Returns `Ok(None)` if the file
/// doesn't exist. A parse failure is reported rather than silently defaulted, so the caller can
/// decide to clear state and continue per §7's persistence-error policy.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("hdr-p2p-persist-test-{:?}", std::thread::current().id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.json");

        atomic_write_json(&path, &Sample { n: 7 }).unwrap();
        let loaded: Sample = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, Sample { n: 7 });

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_returns_none() {
        let path = std::env::temp_dir().join("hdr-p2p-persist-test-missing.json");
        fs::remove_file(&path).ok();
        let loaded: Option<Sample> = load_json(&path).unwrap();
        assert!(loaded.is_none());
    }
}
