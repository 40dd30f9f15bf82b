//! Snapshot registry
//!
//! The registry is the authoritative index of existing snapshots: a map of
//! snapshot id to `{ snapshotId, createdAt, type }` persisted as
//! `registry.json`. Every mutation rewrites the file atomically; callers hold
//! the registry lock (see [`crate::lock`]) across read-modify-write cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::SnapResult;
use crate::secure_file_ops::{read_json, write_json_atomic};
use crate::snapshot::SnapshotKind;

pub const REGISTRY_FILE: &str = "registry.json";
const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: SnapshotKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    snapshots: BTreeMap<String, RegistryEntry>,
}

/// In-memory view of `registry.json`.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    /// Load the registry under `root`; a missing file is an empty registry.
    pub fn load(root: &Path) -> SnapResult<Self> {
        let path = root.join(REGISTRY_FILE);
        let entries = if path.exists() {
            let file: RegistryFile = read_json(&path)?;
            file.snapshots
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    pub fn save(&self) -> SnapResult<()> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            snapshots: self.entries.clone(),
        };
        write_json_atomic(&self.path, &file)
    }

    pub fn get(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.entries.insert(entry.snapshot_id.clone(), entry)
    }

    pub fn remove(&mut self, id: &str) -> Option<RegistryEntry> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered newest first (ties broken by id, descending).
    pub fn newest_first(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.snapshot_id.cmp(&a.snapshot_id))
        });
        entries
    }

    /// Drop entries for which `exists` is false. Returns the pruned ids.
    pub fn retain_existing<F>(&mut self, mut exists: F) -> Vec<String>
    where
        F: FnMut(&RegistryEntry) -> bool,
    {
        let dangling: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !exists(entry))
            .map(|entry| entry.snapshot_id.clone())
            .collect();
        for id in &dangling {
            self.entries.remove(id);
        }
        dangling
    }
}
