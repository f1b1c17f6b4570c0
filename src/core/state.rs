//! State store — one YAML record per node, written atomically.
//!
//! Single-node granularity is what makes partial-failure re-entry work: the
//! executor marks a record `Applying` before the provider call and advances
//! it (or removes it) only on confirmation, so a crash leaves a marker the
//! next plan refreshes via `read`. No cross-node lock is ever held.

use super::error::StateError;
use super::types::NodeState;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_path(&self, node_id: &str) -> PathBuf {
        self.root.join("nodes").join(format!("{}.yaml", node_id))
    }

    /// Load one record. Returns None if the node was never applied.
    pub fn load(&self, node_id: &str) -> Result<Option<NodeState>, StateError> {
        let path = self.node_path(node_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let state: NodeState =
            serde_yaml_ng::from_str(&content).map_err(|e| StateError::Corrupt {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
        Ok(Some(state))
    }

    /// Save one record atomically (write to temp, then rename).
    pub fn save(&self, state: &NodeState) -> Result<(), StateError> {
        let path = self.node_path(&state.node_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let yaml = serde_yaml_ng::to_string(state).map_err(|e| StateError::Corrupt {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;

        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml).map_err(|e| StateError::Io {
            path: tmp_path.display().to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        Ok(())
    }

    /// Remove a record after the provider confirmed its delete.
    pub fn remove(&self, node_id: &str) -> Result<(), StateError> {
        let path = self.node_path(node_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| StateError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Snapshot every record, sorted by node id for deterministic planning.
    pub fn load_all(&self) -> Result<IndexMap<String, NodeState>, StateError> {
        let dir = self.root.join("nodes");
        let mut out = IndexMap::new();
        if !dir.exists() {
            return Ok(out);
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| StateError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".yaml") {
                ids.push(id.to_string());
            }
        }
        ids.sort();

        for id in ids {
            if let Some(state) = self.load(&id)? {
                out.insert(id, state);
            }
        }
        Ok(out)
    }
}
