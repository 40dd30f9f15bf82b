//! Snapshot data model
//!
//! A [`Snapshot`] is the parsed form of `<id>/metadata.json`. Snapshots are
//! created once by the store and afterwards only their verification flag
//! changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{SnapError, SnapResult};

pub const ARCHIVE_FILE: &str = "project.zip";
pub const METADATA_FILE: &str = "metadata.json";
pub const CONFIG_DIR: &str = "config";
pub const VCS_DIR: &str = "vcs";
pub const STAGED_DIFF_FILE: &str = "staged.diff";
pub const UNSTAGED_DIFF_FILE: &str = "unstaged.diff";

/// Prefix of safety snapshots taken before a rollback.
pub const PRE_ROLLBACK_PREFIX: &str = "pre-rollback-";

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub hostname: String,
    pub vcs_state: VcsState,
    #[serde(default)]
    pub system_state: BTreeMap<String, String>,
    pub options: SnapshotOptions,
    pub size: SnapshotSize,
    pub integrity: Integrity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcsState {
    pub branch: String,
    pub commit_id: String,
    pub uncommitted_change_count: u32,
}

impl VcsState {
    pub fn unknown() -> Self {
        Self {
            branch: "unknown".to_string(),
            commit_id: "unknown".to_string(),
            uncommitted_change_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOptions {
    pub include_dependencies: bool,
    pub exclude_large_files: bool,
    pub compression_level: u8,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            include_dependencies: false,
            exclude_large_files: true,
            compression_level: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSize {
    pub compressed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrity {
    /// Hex SHA-256 of the archive; absent for some imported snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

/// Why a snapshot exists; recorded in the registry, not the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotKind {
    Manual,
    PreRollback,
    Imported,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SnapshotKind::Manual => "manual",
            SnapshotKind::PreRollback => "pre-rollback",
            SnapshotKind::Imported => "imported",
        };
        f.write_str(label)
    }
}

/// Snapshot as returned by listings: metadata plus its registry kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedSnapshot {
    pub kind: SnapshotKind,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

/// Reject ids that cannot safely be used as a directory name.
pub fn validate_id(id: &str) -> SnapResult<()> {
    if id.is_empty() {
        return Err(SnapError::invalid_id(id, "id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(SnapError::invalid_id(
            id,
            format!("id longer than {MAX_ID_LEN} characters"),
        ));
    }
    if id.starts_with('.') {
        return Err(SnapError::invalid_id(id, "id must not start with '.'"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(SnapError::invalid_id(
            id,
            format!("character '{bad}' is not allowed"),
        ));
    }
    Ok(())
}

/// Id derived from a creation timestamp when the caller supplies none.
pub fn timestamp_id(now: DateTime<Utc>) -> String {
    format!("snapshot_{}", now.format("%Y%m%d_%H%M%S"))
}

/// Deterministic safety-snapshot id for a rollback started at `now`.
pub fn pre_rollback_id(now: DateTime<Utc>) -> String {
    format!("{PRE_ROLLBACK_PREFIX}{}", now.format("%Y%m%dT%H%M%S%3fZ"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_reasonable_ids() {
        for id in ["baseline", "v1.2.3", "pre-rollback-20261014T101500123Z", "a_b"] {
            assert!(validate_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_path_like_ids() {
        for id in ["", "../etc", "a/b", ".hidden", "a b", "registry\\x"] {
            assert!(validate_id(id).is_err(), "{id:?} should be rejected");
        }
    }

    #[test]
    fn generated_ids_are_valid() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 10, 15, 0).unwrap();
        assert_eq!(timestamp_id(now), "snapshot_20261014_101500");
        let safety = pre_rollback_id(now);
        assert!(safety.starts_with(PRE_ROLLBACK_PREFIX));
        assert!(validate_id(&safety).is_ok());
    }

    #[test]
    fn metadata_uses_camel_case_fields() {
        let snapshot = Snapshot {
            id: "baseline".into(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            created_by: "ops".into(),
            hostname: "build-01".into(),
            vcs_state: VcsState::unknown(),
            system_state: BTreeMap::new(),
            options: SnapshotOptions::default(),
            size: SnapshotSize { compressed_bytes: 42 },
            integrity: Integrity {
                checksum: Some("ab".into()),
                verified: false,
            },
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["vcsState"]["uncommittedChangeCount"], 0);
        assert_eq!(json["size"]["compressedBytes"], 42);
        assert_eq!(json["integrity"]["verified"], false);
    }
}
