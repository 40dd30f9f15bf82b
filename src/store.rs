//! Snapshot store
//!
//! Owns everything under the snapshots root: one directory per snapshot
//! (`project.zip`, `metadata.json`, `config/`, `vcs/`), the registry, and the
//! transient `.staging-*` / `.trash-*` directories used to make create and
//! delete all-or-nothing.
//!
//! A snapshot is assembled and verified in a staging directory, then
//! published with a single rename while the registry lock is held. Deletion
//! renames the directory out of the way first so a failed registry write can
//! be undone.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::archive::{write_archive, ExclusionRules};
use crate::cancel::CancelToken;
use crate::collaborators::Vcs;
use crate::config::ControllerConfig;
use crate::errors::{SnapError, SnapResult};
use crate::integrity::{check_dir, IntegrityVerifier};
use crate::lock::{exclusive_with_timeout, LockGuard, REGISTRY_LOCK_FILE};
use crate::process::probe_version;
use crate::registry::{Registry, RegistryEntry};
use crate::secure_file_ops::{
    calculate_file_hash, contained_join, copy_with_parents, read_json, write_json_atomic,
};
use crate::snapshot::{
    timestamp_id, validate_id, Integrity, ListedSnapshot, Snapshot, SnapshotKind, SnapshotOptions,
    SnapshotSize, VcsState, ARCHIVE_FILE, CONFIG_DIR, METADATA_FILE, STAGED_DIFF_FILE,
    UNSTAGED_DIFF_FILE, VCS_DIR,
};

pub(crate) const STAGING_PREFIX: &str = ".staging-";
pub(crate) const TRASH_PREFIX: &str = ".trash-";
const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters of a `create` call.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub options: SnapshotOptions,
    pub kind: SnapshotKind,
    pub force: bool,
}

impl CreateRequest {
    pub fn manual(name: Option<String>, options: SnapshotOptions) -> Self {
        Self {
            name,
            options,
            kind: SnapshotKind::Manual,
            force: false,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// What a reconcile pass cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub dangling_entries: Vec<String>,
    pub swept_dirs: Vec<String>,
}

#[derive(Clone)]
pub struct SnapshotStore {
    config: Arc<ControllerConfig>,
    project_root: PathBuf,
    root: PathBuf,
    vcs: Arc<dyn Vcs>,
    verifier: IntegrityVerifier,
}

impl SnapshotStore {
    /// Open (creating if needed) the snapshots root described by `config`.
    pub fn open(config: Arc<ControllerConfig>, vcs: Arc<dyn Vcs>) -> SnapResult<Self> {
        let project_root = fs::canonicalize(&config.project_root).map_err(|e| {
            SnapError::io(
                format!("resolving project root {}", config.project_root.display()),
                e,
            )
        })?;
        let requested = config.snapshots_root();
        fs::create_dir_all(&requested).map_err(|e| SnapError::io("creating snapshots root", e))?;
        let root = fs::canonicalize(&requested)
            .map_err(|e| SnapError::io("resolving snapshots root", e))?;
        let lock_timeout = Duration::from_millis(config.registry_lock_timeout_ms);
        let verifier = IntegrityVerifier::new(root.clone(), lock_timeout);

        Ok(Self {
            config,
            project_root,
            root,
            vcs,
            verifier,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn verifier(&self) -> &IntegrityVerifier {
        &self.verifier
    }

    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn archive_path(&self, id: &str) -> PathBuf {
        self.snapshot_dir(id).join(ARCHIVE_FILE)
    }

    pub fn registry(&self) -> SnapResult<Registry> {
        Registry::load(&self.root)
    }

    fn registry_lock(&self) -> SnapResult<LockGuard> {
        exclusive_with_timeout(
            &self.root.join(REGISTRY_LOCK_FILE),
            Duration::from_millis(self.config.registry_lock_timeout_ms),
        )
    }

    /// Options a request falls back to when the caller has no preference.
    pub fn default_options(&self) -> SnapshotOptions {
        SnapshotOptions {
            include_dependencies: self.config.snapshot.include_dependencies,
            exclude_large_files: self.config.snapshot.exclude_large_files,
            compression_level: self.config.snapshot.compression_level,
        }
    }

    /// Options that capture every path a rollback clears: dependency
    /// directories and large files included.
    pub fn full_capture_options(&self) -> SnapshotOptions {
        SnapshotOptions {
            include_dependencies: true,
            exclude_large_files: false,
            compression_level: self.config.snapshot.compression_level,
        }
    }

    /// Paths no snapshot ever captures. A rollback leaves them in place.
    pub fn uncaptured_rules(&self) -> ExclusionRules {
        let settings = &self.config.exclusions;
        ExclusionRules::new()
            .exclude_names(settings.always.iter().cloned())
            .exclude_names(settings.vcs_dirs.iter().cloned())
            .exclude_path(self.root.clone())
    }

    fn exists(&self, registry: &Registry, id: &str) -> bool {
        registry.contains(id) || self.snapshot_dir(id).exists()
    }

    /// Capture the project tree as a new, verified snapshot.
    pub fn create(&self, request: CreateRequest, cancel: &CancelToken) -> SnapResult<Snapshot> {
        let now = Utc::now();
        let id = request.name.clone().unwrap_or_else(|| timestamp_id(now));
        validate_id(&id)?;
        if request.options.compression_level > 9 {
            return Err(SnapError::config(format!(
                "compression level must be within 0..=9, got {}",
                request.options.compression_level
            )));
        }

        if !request.force && self.exists(&self.registry()?, &id) {
            return Err(SnapError::already_exists(&id));
        }

        let staging = self.staging_dir(&id);
        fs::create_dir_all(&staging).map_err(|e| SnapError::io("creating staging directory", e))?;
        info!("creating snapshot {id} ({} kind)", request.kind);

        let staged = self
            .populate(&staging, &id, now, &request.options, cancel)
            .and_then(|snapshot| self.publish(&staging, snapshot, request.kind, request.force));

        match staged {
            Ok(snapshot) => {
                info!(
                    "snapshot {} created ({} bytes)",
                    snapshot.id, snapshot.size.compressed_bytes
                );
                Ok(snapshot)
            }
            Err(e) => {
                remove_dir_best_effort(&staging);
                warn!("snapshot {id} not created: {e}");
                Err(e)
            }
        }
    }

    fn staging_dir(&self, id: &str) -> PathBuf {
        self.root
            .join(format!("{STAGING_PREFIX}{id}-{}", Uuid::new_v4().simple()))
    }

    fn exclusion_rules(&self, options: &SnapshotOptions) -> ExclusionRules {
        let settings = &self.config.exclusions;
        let mut rules = self.uncaptured_rules();
        if !options.include_dependencies {
            rules = rules.exclude_names(settings.dependencies.iter().cloned());
        }
        if options.exclude_large_files {
            rules = rules.max_file_size(Some(self.config.snapshot.large_file_threshold_bytes));
        }
        rules
    }

    fn populate(
        &self,
        staging: &Path,
        id: &str,
        now: DateTime<Utc>,
        options: &SnapshotOptions,
        cancel: &CancelToken,
    ) -> SnapResult<Snapshot> {
        let archive = staging.join(ARCHIVE_FILE);
        let stats = write_archive(
            &self.project_root,
            &archive,
            &self.exclusion_rules(options),
            options.compression_level,
            cancel,
        )?;
        debug!(
            "archived {} files, {} directories, {} links ({} large files skipped)",
            stats.files, stats.directories, stats.symlinks, stats.skipped_large
        );

        cancel.check("snapshot creation")?;
        self.copy_config_files(staging)?;
        let vcs_state = self.capture_vcs(staging);
        let system_state = self.capture_system_state();

        let mut snapshot = Snapshot {
            id: id.to_string(),
            created_at: now,
            created_by: current_user(),
            hostname: current_hostname(),
            vcs_state,
            system_state,
            options: *options,
            size: SnapshotSize {
                compressed_bytes: stats.compressed_bytes,
            },
            integrity: Integrity {
                checksum: Some(calculate_file_hash(&archive)?),
                verified: false,
            },
        };
        let metadata_path = staging.join(METADATA_FILE);
        write_json_atomic(&metadata_path, &snapshot)?;

        cancel.check("snapshot creation")?;
        let (report, _) = check_dir(staging, id);
        if let Some(failure) = report.failure {
            return Err(SnapError::io_other(
                "snapshot verification",
                format!("{id}: {failure}"),
            ));
        }
        snapshot.integrity.verified = true;
        write_json_atomic(&metadata_path, &snapshot)?;
        Ok(snapshot)
    }

    fn copy_config_files(&self, staging: &Path) -> SnapResult<()> {
        let config_dir = staging.join(CONFIG_DIR);
        for relative in &self.config.snapshot.critical_config_files {
            let source = contained_join(&self.project_root, Path::new(relative))?;
            if !source.is_file() {
                continue;
            }
            copy_with_parents(&source, &contained_join(&config_dir, Path::new(relative))?)?;
            debug!("backed up {relative}");
        }
        Ok(())
    }

    fn capture_vcs(&self, staging: &Path) -> VcsState {
        let fallback = VcsState::unknown();
        let state = VcsState {
            branch: self.vcs.current_branch().unwrap_or(fallback.branch),
            commit_id: self.vcs.current_commit().unwrap_or(fallback.commit_id),
            uncommitted_change_count: self.vcs.uncommitted_count().unwrap_or(0),
        };

        let vcs_dir = staging.join(VCS_DIR);
        for (staged, file) in [(true, STAGED_DIFF_FILE), (false, UNSTAGED_DIFF_FILE)] {
            match self.vcs.diff(staged) {
                Ok(diff) => {
                    let written = fs::create_dir_all(&vcs_dir)
                        .and_then(|_| fs::write(vcs_dir.join(file), diff.as_bytes()));
                    if let Err(e) = written {
                        warn!("could not store {file}: {e}");
                    }
                }
                Err(e) => debug!("no {file} captured: {e:#}"),
            }
        }
        state
    }

    fn capture_system_state(&self) -> BTreeMap<String, String> {
        let mut state = BTreeMap::new();
        state.insert("os".to_string(), std::env::consts::OS.to_string());
        state.insert("arch".to_string(), std::env::consts::ARCH.to_string());
        for (label, command) in &self.config.snapshot.system_probes {
            if let Some(version) = probe_version(command, &self.project_root, PROBE_TIMEOUT) {
                state.insert(label.clone(), version);
            }
        }
        state
    }

    /// Move a verified staging directory into place and commit its registry entry.
    fn publish(
        &self,
        staging: &Path,
        snapshot: Snapshot,
        kind: SnapshotKind,
        force: bool,
    ) -> SnapResult<Snapshot> {
        let _guard = self.registry_lock()?;
        let mut registry = self.registry()?;
        let target = self.snapshot_dir(&snapshot.id);

        let mut replaced = None;
        if self.exists(&registry, &snapshot.id) {
            if !force {
                return Err(SnapError::already_exists(&snapshot.id));
            }
            if target.exists() {
                let trash = self.trash_dir(&snapshot.id);
                fs::rename(&target, &trash)
                    .map_err(|e| SnapError::io("moving replaced snapshot aside", e))?;
                replaced = Some(trash);
            }
        }

        if let Err(e) = fs::rename(staging, &target) {
            if let Some(trash) = &replaced {
                let _ = fs::rename(trash, &target);
            }
            return Err(SnapError::io("publishing snapshot", e));
        }

        registry.insert(RegistryEntry {
            snapshot_id: snapshot.id.clone(),
            created_at: snapshot.created_at,
            kind,
        });
        if let Err(e) = registry.save() {
            // Put the tree back the way it was; the caller removes `staging`.
            let _ = fs::rename(&target, staging);
            if let Some(trash) = &replaced {
                let _ = fs::rename(trash, &target);
            }
            return Err(e);
        }

        if let Some(trash) = replaced {
            remove_dir_best_effort(&trash);
        }
        Ok(snapshot)
    }

    fn trash_dir(&self, id: &str) -> PathBuf {
        self.root
            .join(format!("{TRASH_PREFIX}{id}-{}", Uuid::new_v4().simple()))
    }

    /// Snapshots newest first. Entries without readable metadata are skipped.
    pub fn list(&self) -> SnapResult<Vec<ListedSnapshot>> {
        let registry = self.registry()?;
        let mut listed = Vec::with_capacity(registry.len());
        for entry in registry.newest_first() {
            let metadata = self.snapshot_dir(&entry.snapshot_id).join(METADATA_FILE);
            match read_json::<Snapshot>(&metadata) {
                Ok(snapshot) => listed.push(ListedSnapshot {
                    kind: entry.kind,
                    snapshot,
                }),
                Err(e) => warn!("skipping snapshot {}: {e}", entry.snapshot_id),
            }
        }
        Ok(listed)
    }

    pub fn get(&self, id: &str) -> SnapResult<Snapshot> {
        Ok(self.get_listed(id)?.snapshot)
    }

    /// Metadata together with the registry kind.
    pub fn get_listed(&self, id: &str) -> SnapResult<ListedSnapshot> {
        validate_id(id)?;
        let registry = self.registry()?;
        let entry = registry.get(id).ok_or_else(|| SnapError::not_found(id))?;
        let metadata = self.snapshot_dir(id).join(METADATA_FILE);
        if !metadata.is_file() {
            return Err(SnapError::not_found(id));
        }
        Ok(ListedSnapshot {
            kind: entry.kind,
            snapshot: read_json(&metadata)?,
        })
    }

    /// Remove a snapshot directory and its registry entry.
    pub fn delete(&self, id: &str) -> SnapResult<()> {
        validate_id(id)?;
        let _guard = self.registry_lock()?;
        let mut registry = self.registry()?;
        let dir = self.snapshot_dir(id);

        if !registry.contains(id) && !dir.exists() {
            return Err(SnapError::not_found(id));
        }

        let trash = if dir.exists() {
            let trash = self.trash_dir(id);
            fs::rename(&dir, &trash)
                .map_err(|e| SnapError::io(format!("moving {id} to trash"), e))?;
            Some(trash)
        } else {
            None
        };

        registry.remove(id);
        if let Err(e) = registry.save() {
            if let Some(trash) = &trash {
                let _ = fs::rename(trash, &dir);
            }
            return Err(e);
        }

        if let Some(trash) = trash {
            remove_dir_best_effort(&trash);
        }
        info!("deleted snapshot {id}");
        Ok(())
    }

    /// Bring an externally produced snapshot directory into the store.
    pub fn import(&self, source: &Path, force: bool) -> SnapResult<Snapshot> {
        let metadata_path = source.join(METADATA_FILE);
        if !metadata_path.is_file() || !source.join(ARCHIVE_FILE).is_file() {
            return Err(SnapError::not_found(source.display().to_string()));
        }
        let mut snapshot: Snapshot = read_json(&metadata_path)?;
        validate_id(&snapshot.id)?;
        let id = snapshot.id.clone();

        if !force && self.exists(&self.registry()?, &id) {
            return Err(SnapError::already_exists(&id));
        }

        let staging = self.staging_dir(&id);
        let imported = copy_tree(source, &staging).and_then(|_| {
            // Flags from elsewhere are not trusted; re-derive them here.
            snapshot.integrity.verified = false;
            let staged_metadata = staging.join(METADATA_FILE);
            write_json_atomic(&staged_metadata, &snapshot)?;
            let (report, _) = check_dir(&staging, &id);
            for warning in &report.warnings {
                warn!("{id}: {warning}");
            }
            if let Some(failure) = report.failure {
                return Err(SnapError::unverified(&id, failure.to_string()));
            }
            snapshot.integrity.verified = true;
            write_json_atomic(&staged_metadata, &snapshot)?;
            self.publish(&staging, snapshot, SnapshotKind::Imported, force)
        });

        if imported.is_err() {
            remove_dir_best_effort(&staging);
        } else {
            info!("imported snapshot {id} from {}", source.display());
        }
        imported
    }

    /// Drop dangling registry entries and sweep abandoned staging/trash directories.
    pub fn reconcile(&self) -> SnapResult<ReconcileReport> {
        let _guard = self.registry_lock()?;
        let mut registry = self.registry()?;
        let root = self.root.clone();
        let dangling = registry
            .retain_existing(|entry| root.join(&entry.snapshot_id).join(METADATA_FILE).is_file());
        if !dangling.is_empty() {
            registry.save()?;
            for id in &dangling {
                warn!("pruned dangling registry entry {id}");
            }
        }

        let mut swept = Vec::new();
        let entries =
            fs::read_dir(&self.root).map_err(|e| SnapError::io("reading snapshots root", e))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let stale = if name.starts_with(TRASH_PREFIX) {
                true
            } else if name.starts_with(STAGING_PREFIX) {
                entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .map(|age| age >= STALE_STAGING_AGE)
                    .unwrap_or(false)
            } else {
                false
            };
            if stale && entry.path().is_dir() {
                remove_dir_best_effort(&entry.path());
                swept.push(name);
            }
        }

        Ok(ReconcileReport {
            dangling_entries: dangling,
            swept_dirs: swept,
        })
    }
}

fn copy_tree(source: &Path, dest: &Path) -> SnapResult<()> {
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| SnapError::io_other("walking import source", e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| SnapError::io_other("import", "entry outside source"))?;
        let target = contained_join(dest, relative)?;
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| SnapError::io("creating directory", e))?;
        } else if entry.file_type().is_file() {
            copy_with_parents(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_dir_best_effort(dir: &Path) {
    if dir.exists() {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("could not remove {}: {e}", dir.display());
        }
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn current_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoVcs;
    use tempfile::{tempdir, TempDir};

    fn store() -> (TempDir, SnapshotStore) {
        let project = tempdir().unwrap();
        fs::write(project.path().join("package.json"), b"{\"name\":\"app\"}").unwrap();
        fs::create_dir_all(project.path().join("src")).unwrap();
        fs::write(project.path().join("src/index.js"), b"module.exports = 1;").unwrap();

        let mut config = ControllerConfig::for_project(project.path());
        config.snapshot.system_probes.clear();
        let store = SnapshotStore::open(Arc::new(config), Arc::new(NoVcs)).unwrap();
        (project, store)
    }

    fn create_named(store: &SnapshotStore, name: &str) -> Snapshot {
        let request = CreateRequest::manual(Some(name.into()), store.default_options());
        store.create(request, &CancelToken::new()).unwrap()
    }

    fn names_in(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn create_publishes_verified_snapshot() {
        let (_project, store) = store();
        let snapshot = create_named(&store, "baseline");

        assert!(snapshot.integrity.verified);
        assert!(snapshot.integrity.checksum.is_some());
        assert_eq!(snapshot.vcs_state, VcsState::unknown());
        assert!(store.snapshot_dir("baseline").join("config/package.json").is_file());
        assert_eq!(store.get("baseline").unwrap(), snapshot);
        assert!(!names_in(store.root()).iter().any(|n| n.starts_with(STAGING_PREFIX)));
    }

    #[test]
    fn duplicate_name_requires_force() {
        let (_project, store) = store();
        let request = CreateRequest::manual(Some("baseline".into()), store.default_options());
        store.create(request.clone(), &CancelToken::new()).unwrap();

        let again = store.create(request.clone(), &CancelToken::new());
        assert!(matches!(again, Err(SnapError::AlreadyExists { .. })));

        let replaced = store.create(request.with_force(true), &CancelToken::new()).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.get("baseline").unwrap().created_at, replaced.created_at);
    }

    #[test]
    fn cancelled_create_leaves_nothing_behind() {
        let (_project, store) = store();
        let token = CancelToken::new();
        token.cancel();

        let request = CreateRequest::manual(Some("doomed".into()), store.default_options());
        let result = store.create(request, &token);
        assert!(matches!(result, Err(SnapError::Cancelled { .. })));
        assert!(!store.snapshot_dir("doomed").exists());
        assert!(store.registry().unwrap().is_empty());
        assert!(!names_in(store.root()).iter().any(|n| n.starts_with(STAGING_PREFIX)));
    }

    #[test]
    fn snapshots_dir_is_not_archived_into_itself() {
        let (_project, store) = store();
        create_named(&store, "one");
        create_named(&store, "two");

        let entries = crate::archive::list_entries(&store.archive_path("two")).unwrap();
        assert!(entries.iter().all(|e| !e.starts_with(".snapshots")));
        assert!(entries.contains(&"src/index.js".to_string()));
    }

    #[test]
    fn full_capture_keeps_what_default_options_skip() {
        let project = tempdir().unwrap();
        let mut config = ControllerConfig::for_project(project.path());
        config.snapshot.system_probes.clear();
        config.snapshot.large_file_threshold_bytes = 16;
        let store = SnapshotStore::open(Arc::new(config), Arc::new(NoVcs)).unwrap();
        fs::create_dir_all(project.path().join("node_modules/pkg")).unwrap();
        fs::write(project.path().join("node_modules/pkg/index.js"), b"1").unwrap();
        fs::write(project.path().join("blob.bin"), [7u8; 64]).unwrap();

        let request = CreateRequest::manual(Some("full".into()), store.full_capture_options());
        store.create(request, &CancelToken::new()).unwrap();
        let full = crate::archive::list_entries(&store.archive_path("full")).unwrap();
        assert!(full.contains(&"node_modules/pkg/index.js".to_string()));
        assert!(full.contains(&"blob.bin".to_string()));

        let trimmed = create_named(&store, "trimmed");
        assert!(trimmed.options.exclude_large_files);
        let entries = crate::archive::list_entries(&store.archive_path("trimmed")).unwrap();
        assert!(!entries.iter().any(|e| e.starts_with("node_modules") || e == "blob.bin"));

        let rules = store.uncaptured_rules();
        assert!(rules.skips_entry(&project.path().join("pkg/.git")));
        assert!(rules.skips_entry(&store.root().join("full")));
        assert!(!rules.skips_entry(&project.path().join("node_modules")));
    }

    #[test]
    fn delete_removes_directory_and_entry() {
        let (_project, store) = store();
        create_named(&store, "gone");
        store.delete("gone").unwrap();

        assert!(!store.snapshot_dir("gone").exists());
        assert!(matches!(store.get("gone"), Err(SnapError::NotFound { .. })));
        assert!(matches!(store.delete("gone"), Err(SnapError::NotFound { .. })));
        assert!(!names_in(store.root()).iter().any(|n| n.starts_with(TRASH_PREFIX)));
    }

    #[test]
    fn list_skips_entries_without_metadata() {
        let (_project, store) = store();
        create_named(&store, "kept");
        create_named(&store, "broken");
        fs::remove_file(store.snapshot_dir("broken").join(METADATA_FILE)).unwrap();

        let listed: Vec<String> =
            store.list().unwrap().into_iter().map(|l| l.snapshot.id).collect();
        assert_eq!(listed, vec!["kept".to_string()]);

        let report = store.reconcile().unwrap();
        assert_eq!(report.dangling_entries, vec!["broken".to_string()]);
        assert!(!store.registry().unwrap().contains("broken"));
    }

    #[test]
    fn reconcile_sweeps_trash_but_keeps_fresh_staging() {
        let (_project, store) = store();
        fs::create_dir_all(store.root().join(".trash-old-abc")).unwrap();
        fs::create_dir_all(store.root().join(".staging-live-abc")).unwrap();

        let report = store.reconcile().unwrap();
        assert_eq!(report.swept_dirs, vec![".trash-old-abc".to_string()]);
        assert!(store.root().join(".staging-live-abc").exists());
    }

    #[test]
    fn import_registers_external_snapshot() {
        let (_project, source_store) = store();
        create_named(&source_store, "external");

        let (_other, target_store) = store();
        let imported = target_store
            .import(&source_store.snapshot_dir("external"), false)
            .unwrap();
        assert!(imported.integrity.verified);
        assert_eq!(target_store.get_listed("external").unwrap().kind, SnapshotKind::Imported);

        let again = target_store.import(&source_store.snapshot_dir("external"), false);
        assert!(matches!(again, Err(SnapError::AlreadyExists { .. })));
    }

    #[test]
    fn invalid_names_are_rejected_before_any_work() {
        let (_project, store) = store();
        let result = store.create(
            CreateRequest::manual(Some("../escape".into()), store.default_options()),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(SnapError::InvalidId { .. })));
        assert_eq!(names_in(store.root()).len(), 0);
    }
}
