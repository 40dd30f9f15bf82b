//! Integrity verification for snapshot directories
//!
//! Checks run in a fixed order and stop at the first failure: directory,
//! metadata, archive presence, checksum (or size when no checksum was
//! recorded) and finally the archive's central directory. The outcome is
//! persisted into `metadata.json` under the registry lock.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive;
use crate::errors::SnapResult;
use crate::lock::{exclusive_with_timeout, REGISTRY_LOCK_FILE};
use crate::secure_file_ops::{calculate_file_hash, read_json, write_json_atomic};
use crate::snapshot::{validate_id, Snapshot, ARCHIVE_FILE, METADATA_FILE};

/// First check that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum VerifyFailure {
    #[error("snapshot directory does not exist")]
    MissingDirectory,

    #[error("metadata file is missing")]
    MissingMetadata,

    #[error("metadata file cannot be parsed: {reason}")]
    UnreadableMetadata { reason: String },

    #[error("archive file is missing")]
    MissingArchive,

    #[error("checksum mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("archive size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("archive is not readable: {reason}")]
    UnreadableArchive { reason: String },
}

impl VerifyFailure {
    /// Content drift that `rollback --force` may bypass.
    pub fn is_content_mismatch(&self) -> bool {
        matches!(
            self,
            VerifyFailure::ChecksumMismatch { .. } | VerifyFailure::SizeMismatch { .. }
        )
    }

    /// Failures that clear a previously persisted `verified` flag.
    fn invalidates_flag(&self) -> bool {
        self.is_content_mismatch()
            || matches!(
                self,
                VerifyFailure::MissingArchive | VerifyFailure::UnreadableArchive { .. }
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub snapshot_id: String,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<VerifyFailure>,
    pub warnings: Vec<String>,
}

impl VerificationReport {
    fn passed(snapshot_id: &str, warnings: Vec<String>) -> Self {
        Self {
            snapshot_id: snapshot_id.to_string(),
            verified: true,
            failure: None,
            warnings,
        }
    }

    fn failed(snapshot_id: &str, failure: VerifyFailure, warnings: Vec<String>) -> Self {
        Self {
            snapshot_id: snapshot_id.to_string(),
            verified: false,
            failure: Some(failure),
            warnings,
        }
    }
}

/// Run the verification checks against `dir` without touching any file.
///
/// Returns the report plus the parsed metadata when it could be read.
pub fn check_dir(dir: &Path, snapshot_id: &str) -> (VerificationReport, Option<Snapshot>) {
    let mut warnings = Vec::new();

    if !dir.is_dir() {
        return (
            VerificationReport::failed(snapshot_id, VerifyFailure::MissingDirectory, warnings),
            None,
        );
    }

    let metadata_path = dir.join(METADATA_FILE);
    if !metadata_path.is_file() {
        return (
            VerificationReport::failed(snapshot_id, VerifyFailure::MissingMetadata, warnings),
            None,
        );
    }
    let snapshot: Snapshot = match read_json(&metadata_path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let failure = VerifyFailure::UnreadableMetadata {
                reason: e.to_string(),
            };
            return (VerificationReport::failed(snapshot_id, failure, warnings), None);
        }
    };

    let archive_path = dir.join(ARCHIVE_FILE);
    if !archive_path.is_file() {
        return (
            VerificationReport::failed(snapshot_id, VerifyFailure::MissingArchive, warnings),
            Some(snapshot),
        );
    }

    match snapshot.integrity.checksum.as_deref() {
        Some(expected) => match calculate_file_hash(&archive_path) {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
            Ok(actual) => {
                let failure = VerifyFailure::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                };
                return (VerificationReport::failed(snapshot_id, failure, warnings), Some(snapshot));
            }
            Err(e) => {
                let failure = VerifyFailure::UnreadableArchive {
                    reason: e.to_string(),
                };
                return (VerificationReport::failed(snapshot_id, failure, warnings), Some(snapshot));
            }
        },
        None => {
            warnings.push("no checksum recorded; checksum verification skipped".to_string());
            let expected = snapshot.size.compressed_bytes;
            if expected > 0 {
                let actual = std::fs::metadata(&archive_path).map(|m| m.len()).unwrap_or(0);
                if actual != expected {
                    let failure = VerifyFailure::SizeMismatch { expected, actual };
                    let report = VerificationReport::failed(snapshot_id, failure, warnings);
                    return (report, Some(snapshot));
                }
            }
        }
    }

    if let Err(e) = archive::list_entries(&archive_path) {
        let failure = VerifyFailure::UnreadableArchive {
            reason: e.to_string(),
        };
        return (VerificationReport::failed(snapshot_id, failure, warnings), Some(snapshot));
    }

    (VerificationReport::passed(snapshot_id, warnings), Some(snapshot))
}

/// Verifies published snapshots and persists the result.
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    root: PathBuf,
    lock_timeout: Duration,
}

impl IntegrityVerifier {
    pub fn new(snapshots_root: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            root: snapshots_root.into(),
            lock_timeout,
        }
    }

    pub fn verify(&self, snapshot_id: &str) -> SnapResult<VerificationReport> {
        validate_id(snapshot_id)?;
        let dir = self.root.join(snapshot_id);
        let (report, snapshot) = check_dir(&dir, snapshot_id);

        for warning in &report.warnings {
            warn!("{snapshot_id}: {warning}");
        }

        match (&report.failure, snapshot) {
            (None, Some(snapshot)) if !snapshot.integrity.verified => {
                self.persist_flag(&dir, true)?;
                info!("snapshot {snapshot_id} verified");
            }
            (None, _) => debug!("snapshot {snapshot_id} verified (flag already set)"),
            (Some(failure), Some(snapshot)) if failure.invalidates_flag() => {
                warn!("snapshot {snapshot_id} failed verification: {failure}");
                if snapshot.integrity.verified {
                    self.persist_flag(&dir, false)?;
                }
            }
            (Some(failure), _) => warn!("snapshot {snapshot_id} failed verification: {failure}"),
        }

        Ok(report)
    }

    fn persist_flag(&self, dir: &Path, verified: bool) -> SnapResult<()> {
        let lock_path = self.root.join(REGISTRY_LOCK_FILE);
        let _guard = exclusive_with_timeout(&lock_path, self.lock_timeout)?;
        let metadata_path = dir.join(METADATA_FILE);
        // Re-read under the lock; a concurrent delete may have removed it.
        if !metadata_path.is_file() {
            return Ok(());
        }
        let mut snapshot: Snapshot = read_json(&metadata_path)?;
        if snapshot.integrity.verified != verified {
            snapshot.integrity.verified = verified;
            write_json_atomic(&metadata_path, &snapshot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{write_archive, ExclusionRules};
    use crate::cancel::CancelToken;
    use crate::snapshot::{Integrity, SnapshotOptions, SnapshotSize, VcsState};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    fn publish_fixture(root: &Path, id: &str, with_checksum: bool) -> PathBuf {
        let project = tempdir().unwrap();
        fs::write(project.path().join("app.js"), b"console.log(1)").unwrap();

        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        let archive = dir.join(ARCHIVE_FILE);
        let rules = ExclusionRules::new();
        let stats =
            write_archive(project.path(), &archive, &rules, 6, &CancelToken::new()).unwrap();

        let snapshot = Snapshot {
            id: id.to_string(),
            created_at: Utc::now(),
            created_by: "tester".into(),
            hostname: "localhost".into(),
            vcs_state: VcsState::unknown(),
            system_state: BTreeMap::new(),
            options: SnapshotOptions::default(),
            size: SnapshotSize {
                compressed_bytes: stats.compressed_bytes,
            },
            integrity: Integrity {
                checksum: with_checksum.then(|| calculate_file_hash(&archive).unwrap()),
                verified: false,
            },
        };
        write_json_atomic(&dir.join(METADATA_FILE), &snapshot).unwrap();
        dir
    }

    fn stored_flag(dir: &Path) -> bool {
        let snapshot: Snapshot = read_json(&dir.join(METADATA_FILE)).unwrap();
        snapshot.integrity.verified
    }

    #[test]
    fn verification_is_idempotent_and_persisted() {
        let root = tempdir().unwrap();
        let dir = publish_fixture(root.path(), "baseline", true);
        let verifier = IntegrityVerifier::new(root.path(), Duration::from_secs(1));

        let first = verifier.verify("baseline").unwrap();
        let bytes_after_first = fs::read(dir.join(METADATA_FILE)).unwrap();
        let second = verifier.verify("baseline").unwrap();

        assert!(first.verified && second.verified);
        assert_eq!(first, second);
        assert_eq!(fs::read(dir.join(METADATA_FILE)).unwrap(), bytes_after_first);
        assert!(stored_flag(&dir));
    }

    #[test]
    fn tampered_archive_fails_and_clears_flag() {
        let root = tempdir().unwrap();
        let dir = publish_fixture(root.path(), "baseline", true);
        let verifier = IntegrityVerifier::new(root.path(), Duration::from_secs(1));
        assert!(verifier.verify("baseline").unwrap().verified);

        let mut bytes = fs::read(dir.join(ARCHIVE_FILE)).unwrap();
        bytes.extend_from_slice(b"tamper");
        fs::write(dir.join(ARCHIVE_FILE), bytes).unwrap();

        let report = verifier.verify("baseline").unwrap();
        assert!(!report.verified);
        assert!(report.failure.as_ref().unwrap().is_content_mismatch());
        assert!(!stored_flag(&dir));
    }

    #[test]
    fn deleted_archive_fails_and_clears_flag() {
        let root = tempdir().unwrap();
        let dir = publish_fixture(root.path(), "baseline", true);
        let verifier = IntegrityVerifier::new(root.path(), Duration::from_secs(1));
        assert!(verifier.verify("baseline").unwrap().verified);
        assert!(stored_flag(&dir));

        fs::remove_file(dir.join(ARCHIVE_FILE)).unwrap();

        let report = verifier.verify("baseline").unwrap();
        assert!(!report.verified);
        assert_eq!(report.failure, Some(VerifyFailure::MissingArchive));
        assert!(!stored_flag(&dir));
    }

    #[test]
    fn missing_checksum_is_a_soft_warning() {
        let root = tempdir().unwrap();
        publish_fixture(root.path(), "imported", false);
        let verifier = IntegrityVerifier::new(root.path(), Duration::from_secs(1));

        let report = verifier.verify("imported").unwrap();
        assert!(report.verified);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn size_fallback_catches_truncation_without_checksum() {
        let root = tempdir().unwrap();
        let dir = publish_fixture(root.path(), "imported", false);
        let bytes = fs::read(dir.join(ARCHIVE_FILE)).unwrap();
        fs::write(dir.join(ARCHIVE_FILE), &bytes[..bytes.len() / 2]).unwrap();

        let report = IntegrityVerifier::new(root.path(), Duration::from_secs(1))
            .verify("imported")
            .unwrap();
        assert!(matches!(report.failure, Some(VerifyFailure::SizeMismatch { .. })));
    }

    #[test]
    fn checks_short_circuit_in_order() {
        let root = tempdir().unwrap();
        let (report, _) = check_dir(&root.path().join("nope"), "nope");
        assert_eq!(report.failure, Some(VerifyFailure::MissingDirectory));

        let dir = root.path().join("empty");
        fs::create_dir_all(&dir).unwrap();
        let (report, _) = check_dir(&dir, "empty");
        assert_eq!(report.failure, Some(VerifyFailure::MissingMetadata));

        let dir = publish_fixture(root.path(), "noarchive", true);
        fs::remove_file(dir.join(ARCHIVE_FILE)).unwrap();
        let (report, snapshot) = check_dir(&dir, "noarchive");
        assert_eq!(report.failure, Some(VerifyFailure::MissingArchive));
        assert!(snapshot.is_some());
    }

    #[test]
    fn corrupt_archive_with_matching_size_is_structurally_rejected() {
        let root = tempdir().unwrap();
        let dir = publish_fixture(root.path(), "junk", false);
        let len = fs::metadata(dir.join(ARCHIVE_FILE)).unwrap().len() as usize;
        fs::write(dir.join(ARCHIVE_FILE), vec![0u8; len]).unwrap();

        let (report, _) = check_dir(&dir, "junk");
        assert!(matches!(report.failure, Some(VerifyFailure::UnreadableArchive { .. })));
    }
}
