//! Rollback engine
//!
//! Restores the live project tree from a snapshot in a fixed sequence:
//! locate, verify, confirm, safety snapshot, clear, extract, reapply VCS
//! deltas, restore dependencies and services, audit. Everything up to and
//! including extraction must succeed; later steps only add warnings to the
//! returned [`RollbackReport`].

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::archive::{extract_archive, is_readable, ExclusionRules};
use crate::audit::{AuditLog, RollbackOutcome, RollbackRecord};
use crate::cancel::CancelToken;
use crate::collaborators::{notify_best_effort, Collaborators};
use crate::errors::{SnapError, SnapResult};
use crate::lock::{try_exclusive_for, ROLLBACK_LOCK_FILE};
use crate::retention::{self, RetentionPolicy};
use crate::snapshot::{
    pre_rollback_id, Snapshot, SnapshotKind, STAGED_DIFF_FILE, UNSTAGED_DIFF_FILE, VCS_DIR,
};
use crate::store::{CreateRequest, SnapshotStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOptions {
    /// Skip confirmation and tolerate checksum/size drift on a readable archive.
    pub force: bool,
    /// The caller already obtained confirmation.
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStage {
    Locate,
    Verify,
    Confirm,
    SafetySnapshot,
    Clear,
    Extract,
    ReapplyVcs,
    RestoreServices,
    Audit,
}

impl fmt::Display for RollbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RollbackStage::Locate => "locate",
            RollbackStage::Verify => "verify",
            RollbackStage::Confirm => "confirm",
            RollbackStage::SafetySnapshot => "safety-snapshot",
            RollbackStage::Clear => "clear",
            RollbackStage::Extract => "extract",
            RollbackStage::ReapplyVcs => "reapply-vcs",
            RollbackStage::RestoreServices => "restore-services",
            RollbackStage::Audit => "audit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub target_snapshot_id: String,
    pub safety_snapshot_id: String,
    pub files_restored: usize,
    /// Verification was bypassed with `force`.
    pub forced: bool,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct RollbackEngine {
    store: SnapshotStore,
    collaborators: Collaborators,
    audit: AuditLog,
}

fn enter(stage: RollbackStage, target: &str) {
    debug!(target: "snapguard::rollback", "{target}: {stage}");
}

impl RollbackEngine {
    pub fn new(store: SnapshotStore, collaborators: Collaborators) -> Self {
        let audit = AuditLog::new(store.root());
        Self {
            store,
            collaborators,
            audit,
        }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn rollback(
        &self,
        target_id: &str,
        options: RollbackOptions,
        cancel: &CancelToken,
    ) -> SnapResult<RollbackReport> {
        let mut warnings = Vec::new();

        enter(RollbackStage::Locate, target_id);
        let target = self.store.get(target_id)?;

        enter(RollbackStage::Verify, target_id);
        let forced = self.verify_target(&target, options.force, &mut warnings)?;

        enter(RollbackStage::Confirm, target_id);
        if !options.force && !options.confirmed {
            let prompt = format!(
                "Roll back {} to snapshot {target_id}? The current tree is saved first.",
                self.store.project_root().display()
            );
            if !self.collaborators.confirm.confirm(&prompt) {
                return Err(SnapError::declined(format!("rollback to {target_id}")));
            }
        }
        let lock_path = self.store.root().join(ROLLBACK_LOCK_FILE);
        let _lock = try_exclusive_for(&lock_path, Some(target_id))?;
        // Retention elsewhere protects the target from here on; make sure it
        // did not go away before the lock was taken.
        if !self.store.archive_path(target_id).is_file() {
            return Err(SnapError::not_found(target_id));
        }
        info!("rolling back to snapshot {target_id}");

        enter(RollbackStage::SafetySnapshot, target_id);
        let safety = self.safety_snapshot(&target, cancel, &mut warnings)?;

        let files_restored = match self.restore_tree(&target, cancel) {
            Ok(count) => count,
            Err((stage, e)) => {
                let reason = format!("{stage}: {e}");
                let record = RollbackRecord::new(target_id, RollbackOutcome::Failed)
                    .with_safety_snapshot(&safety.id)
                    .with_detail(&reason);
                if let Err(audit_err) = self.audit.append(&record) {
                    warn!("could not record failed rollback: {audit_err}");
                }
                notify_best_effort(
                    self.collaborators.notifier.as_ref(),
                    &format!(
                        "Rollback to {target_id} FAILED during {stage}; \
                         recover from safety snapshot {}",
                        safety.id
                    ),
                );
                return Err(SnapError::extraction_failed(target_id, &safety.id, reason));
            }
        };

        enter(RollbackStage::ReapplyVcs, target_id);
        self.reapply_vcs(&target, &mut warnings);

        enter(RollbackStage::RestoreServices, target_id);
        self.restore_services(&target, &mut warnings);

        enter(RollbackStage::Audit, target_id);
        let detail = if warnings.is_empty() {
            format!("{files_restored} files restored")
        } else {
            format!("{files_restored} files restored, {} warning(s)", warnings.len())
        };
        let record = RollbackRecord::new(target_id, RollbackOutcome::Success)
            .with_safety_snapshot(&safety.id)
            .with_detail(detail);
        if let Err(e) = self.audit.append(&record) {
            warnings.push(format!("rollback log not updated: {e}"));
        }
        notify_best_effort(
            self.collaborators.notifier.as_ref(),
            &format!(
                "Rolled back to snapshot {target_id} (safety snapshot {})",
                safety.id
            ),
        );

        for warning in &warnings {
            warn!("rollback warning: {warning}");
        }
        info!("rollback to {target_id} complete ({files_restored} files)");

        Ok(RollbackReport {
            target_snapshot_id: target_id.to_string(),
            safety_snapshot_id: safety.id,
            files_restored,
            forced,
            warnings,
        })
    }

    /// Returns whether verification was bypassed.
    fn verify_target(
        &self,
        target: &Snapshot,
        force: bool,
        warnings: &mut Vec<String>,
    ) -> SnapResult<bool> {
        let report = self.store.verifier().verify(&target.id)?;
        let Some(failure) = report.failure else {
            return Ok(false);
        };
        if force
            && failure.is_content_mismatch()
            && is_readable(&self.store.archive_path(&target.id))
        {
            let message = format!("forcing rollback despite failed verification: {failure}");
            warn!("{}: {message}", target.id);
            warnings.push(message);
            return Ok(true);
        }
        Err(SnapError::unverified(&target.id, failure.to_string()))
    }

    fn safety_snapshot(
        &self,
        target: &Snapshot,
        cancel: &CancelToken,
        warnings: &mut Vec<String>,
    ) -> SnapResult<Snapshot> {
        let request = CreateRequest {
            name: Some(pre_rollback_id(Utc::now())),
            options: self.store.full_capture_options(),
            kind: SnapshotKind::PreRollback,
            force: false,
        };
        let safety = self.store.create(request, cancel)?;
        info!("safety snapshot {} captured", safety.id);

        let protected: HashSet<String> =
            [target.id.clone(), safety.id.clone()].into_iter().collect();
        let policy = RetentionPolicy::from(self.store.config().retention);
        if let Err(e) = retention::prune(&self.store, &policy, &protected) {
            warnings.push(format!("retention after safety snapshot failed: {e}"));
        }
        Ok(safety)
    }

    fn restore_tree(
        &self,
        target: &Snapshot,
        cancel: &CancelToken,
    ) -> Result<usize, (RollbackStage, SnapError)> {
        enter(RollbackStage::Clear, &target.id);
        let preserved = self.store.uncaptured_rules();
        clear_tree(self.store.project_root(), &preserved, cancel)
            .map_err(|e| (RollbackStage::Clear, e))?;

        enter(RollbackStage::Extract, &target.id);
        extract_archive(&self.store.archive_path(&target.id), self.store.project_root(), cancel)
            .map_err(|e| (RollbackStage::Extract, e))
    }

    fn reapply_vcs(&self, target: &Snapshot, warnings: &mut Vec<String>) {
        let vcs_dir = self.store.snapshot_dir(&target.id).join(VCS_DIR);
        for (staged, file) in [(true, STAGED_DIFF_FILE), (false, UNSTAGED_DIFF_FILE)] {
            let diff = match fs::read_to_string(vcs_dir.join(file)) {
                Ok(diff) if !diff.trim().is_empty() => diff,
                _ => continue,
            };
            match self.collaborators.vcs.apply_diff(&diff, staged) {
                Ok(()) => debug!("reapplied {file}"),
                Err(e) => warnings.push(format!("could not reapply {file}: {e:#}")),
            }
        }
    }

    fn restore_services(&self, target: &Snapshot, warnings: &mut Vec<String>) {
        let config = self.store.config();
        if !target.options.include_dependencies {
            let timeout = Duration::from_secs(config.toolchain.install_timeout_secs);
            if let Err(e) = self.collaborators.toolchain.install_dependencies(timeout) {
                warnings.push(format!("dependency reinstall failed: {e:#}"));
            }
        }
        for service in &config.services.names {
            if let Err(e) = self.collaborators.services.restart(service) {
                warnings.push(format!("restart of {service} failed: {e:#}"));
            }
        }
    }
}

/// Remove everything under `dir` that `preserved` does not skip. A
/// directory is removed only once nothing preserved is left inside it.
/// Returns whether anything was kept.
fn clear_tree(dir: &Path, preserved: &ExclusionRules, cancel: &CancelToken) -> SnapResult<bool> {
    let entries =
        fs::read_dir(dir).map_err(|e| SnapError::io(format!("reading {}", dir.display()), e))?;
    let mut kept = false;
    for entry in entries {
        cancel.check("clearing project tree")?;
        let entry = entry.map_err(|e| SnapError::io("reading directory entry", e))?;
        let path = entry.path();
        if preserved.skips_entry(&path) {
            kept = true;
            continue;
        }
        let file_type = entry
            .file_type()
            .map_err(|e| SnapError::io(format!("inspecting {}", path.display()), e))?;
        let removal = if file_type.is_dir() {
            if clear_tree(&path, preserved, cancel)? {
                kept = true;
                continue;
            }
            fs::remove_dir(&path)
        } else {
            // Symlinks land here too and are removed without being followed.
            fs::remove_file(&path)
        };
        removal.map_err(|e| SnapError::io(format!("removing {}", path.display()), e))?;
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn clear_tree_keeps_preserved_paths_and_their_parents() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join("var/snapshots/baseline")).unwrap();
        fs::create_dir_all(root.join("var/cache")).unwrap();
        fs::create_dir_all(root.join("packages/web/.cache/chunks")).unwrap();
        fs::create_dir_all(root.join("src/ui/build")).unwrap();
        fs::write(root.join("src/ui/build/widget.js"), b"x").unwrap();
        fs::write(root.join("src/app.js"), b"x").unwrap();
        fs::write(root.join("packages/web/index.js"), b"x").unwrap();
        fs::write(root.join("README.md"), b"x").unwrap();

        let preserved = ExclusionRules::new()
            .exclude_names([".git", ".cache"])
            .exclude_path(root.join("var/snapshots"));
        let kept = clear_tree(root, &preserved, &CancelToken::new()).unwrap();

        assert!(kept);
        assert!(root.join(".git/objects").is_dir());
        assert!(root.join("var/snapshots/baseline").is_dir());
        assert!(root.join("packages/web/.cache/chunks").is_dir());
        assert!(!root.join("packages/web/index.js").exists());
        assert!(!root.join("var/cache").exists());
        assert!(!root.join("src").exists());
        assert!(!root.join("README.md").exists());
    }

    #[cfg(unix)]
    #[test]
    fn clear_tree_removes_links_without_following_them() {
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("shared.txt"), b"keep me").unwrap();
        let dir = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("shared")).unwrap();

        let kept = clear_tree(dir.path(), &ExclusionRules::new(), &CancelToken::new()).unwrap();

        assert!(!kept);
        assert!(fs::symlink_metadata(dir.path().join("shared")).is_err());
        assert!(outside.path().join("shared.txt").is_file());
    }

    #[test]
    fn stage_names_are_kebab_case() {
        assert_eq!(RollbackStage::SafetySnapshot.to_string(), "safety-snapshot");
        assert_eq!(RollbackStage::Extract.to_string(), "extract");
    }
}
