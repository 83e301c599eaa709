//! JSON-document state store.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use vmlab_id::NodeId;

use crate::node::NodeRecord;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The durable record: everything the daemon must not forget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// All node records by id.
    pub nodes: HashMap<NodeId, NodeRecord>,

    /// Display ports not held by any running node.
    pub free_ports: Vec<u16>,
}

/// Whole-document JSON store.
///
/// Saves write a sibling temp file and rename it into place, so a crash
/// mid-write leaves the previous document intact.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted document, or `None` if none exists yet.
    ///
    /// A present-but-corrupt document is an error: silently starting from
    /// scratch would leak every port and disk the previous run held.
    pub fn load(&self) -> Result<Option<PersistedState>, StoreError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state = serde_json::from_str(&data)?;
        debug!(path = %self.path.display(), "loaded persisted state");
        Ok(Some(state))
    }

    /// Atomically replace the persisted document.
    pub fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(state)?;

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::node::RuntimeState;

    use super::*;

    fn test_state() -> PersistedState {
        let mut nodes = HashMap::new();
        let id = NodeId::new();
        let mut record = NodeRecord::new(id, PathBuf::from("/overlays/a.qcow2"));
        record.runtime = Some(RuntimeState {
            pid: 77,
            display_port: 5901,
            connection_id: "17".to_string(),
        });
        nodes.insert(id, record);
        PersistedState {
            nodes,
            free_ports: vec![5902, 5903],
        }
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        let state = test_state();
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.free_ports, vec![5902, 5903]);
        assert_eq!(loaded.nodes.len(), 1);
        let (id, record) = loaded.nodes.iter().next().unwrap();
        assert_eq!(record.id, *id);
        let runtime = record.runtime.as_ref().unwrap();
        assert_eq!(runtime.pid, 77);
        assert_eq!(runtime.display_port, 5901);
    }

    #[test]
    fn save_replaces_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        store.save(&test_state()).unwrap();
        store.save(&PersistedState::default()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.nodes.is_empty());
        assert!(loaded.free_ports.is_empty());

        // No temp file is left behind.
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[test]
    fn corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = StateStore::new(path);
        assert!(matches!(store.load(), Err(StoreError::Json(_))));
    }
}
