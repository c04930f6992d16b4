//! File-backed checkpoint persistence.
//!
//! The checkpoint survives restarts as a tiny JSON file,
//! `{ "historyId": <int> }`, read once at startup and rewritten after every
//! successful reconciliation and after a watch renewal. A missing or
//! unreadable file just means the engine starts uninitialized.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct StoredCheckpoint {
    #[serde(rename = "historyId")]
    history_id: u64,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The saved checkpoint, or `None` if the file is missing or corrupt.
    pub fn load(&self) -> Option<u64> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<StoredCheckpoint>(&contents) {
            Ok(stored) => {
                tracing::info!(
                    checkpoint = stored.history_id,
                    path = %self.path.display(),
                    "loaded saved checkpoint"
                );
                Some(stored.history_id)
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "ignoring unreadable checkpoint file"
                );
                None
            }
        }
    }

    pub fn save(&self, checkpoint: u64) -> Result<()> {
        let contents = serde_json::to_string(&StoredCheckpoint {
            history_id: checkpoint,
        })?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write checkpoint to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> CheckpointStore {
        let path = std::env::temp_dir().join(format!(
            "checkpoint-test-{}-{tag}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        CheckpointStore::new(path)
    }

    #[test]
    fn load_missing_file_is_none() {
        assert_eq!(temp_store("missing").load(), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = temp_store("roundtrip");
        store.save(1500).unwrap();
        assert_eq!(store.load(), Some(1500));
        let _ = std::fs::remove_file(store.path());
    }

    #[test]
    fn save_uses_history_id_field() {
        let store = temp_store("field");
        store.save(42).unwrap();
        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents, r#"{"historyId":42}"#);
        let _ = std::fs::remove_file(store.path());
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let store = temp_store("corrupt");
        std::fs::write(store.path(), "not json").unwrap();
        assert_eq!(store.load(), None);
        let _ = std::fs::remove_file(store.path());
    }
}
