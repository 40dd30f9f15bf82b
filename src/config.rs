// SnapGuard config.rs
// Purpose: Explicit controller configuration passed to every component

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{SnapError, SnapResult};

/// Top-level configuration for the snapshot & rollback controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Project tree protected by snapshots.
    pub project_root: PathBuf,
    /// Snapshot storage area; relative paths resolve against `project_root`.
    pub snapshots_dir: PathBuf,
    /// Upper bound on waiting for the registry lock.
    pub registry_lock_timeout_ms: u64,
    pub snapshot: SnapshotSettings,
    pub exclusions: ExclusionSettings,
    pub retention: RetentionSettings,
    pub health: HealthSettings,
    pub toolchain: ToolchainSettings,
    pub services: ServiceSettings,
    pub notify: NotifySettings,
    pub rollback: RollbackSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSettings {
    pub include_dependencies: bool,
    pub exclude_large_files: bool,
    pub compression_level: u8,
    pub large_file_threshold_bytes: u64,
    /// Configuration files copied next to the archive when present.
    pub critical_config_files: Vec<String>,
    /// Diagnostic probes: label -> command whose first output line is recorded.
    pub system_probes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionSettings {
    /// Directory names never archived (VCS metadata, build caches).
    pub always: Vec<String>,
    /// Dependency/output directories archived only with `include_dependencies`.
    pub dependencies: Vec<String>,
    /// VCS metadata directories preserved when the live tree is cleared.
    pub vcs_dirs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub max_age_days: u32,
    pub max_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub timeout_secs: u64,
    pub critical_paths: Vec<String>,
    pub weights: HealthWeights,
    /// Credit for a security scan that completed but reported findings.
    pub security_partial_credit: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub build: u8,
    pub test: u8,
    pub critical_files: u8,
    pub security: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainSettings {
    pub build: Option<String>,
    pub test: Option<String>,
    pub install: Option<String>,
    pub security_scan: Option<String>,
    pub findings_exit_codes: Vec<i32>,
    /// Timeout for dependency reinstall after rollback.
    pub install_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub names: Vec<String>,
    /// `{service}` is replaced with the service name.
    pub restart_command: String,
    pub restart_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackSettings {
    /// Re-score health after every rollback issued through the controller.
    pub post_check: bool,
    /// Use git for VCS state capture and diff reapplication.
    pub use_git: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            snapshots_dir: PathBuf::from(".snapshots"),
            registry_lock_timeout_ms: 10_000,
            snapshot: SnapshotSettings::default(),
            exclusions: ExclusionSettings::default(),
            retention: RetentionSettings::default(),
            health: HealthSettings::default(),
            toolchain: ToolchainSettings::default(),
            services: ServiceSettings::default(),
            notify: NotifySettings::default(),
            rollback: RollbackSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        let mut system_probes = BTreeMap::new();
        system_probes.insert("node".to_string(), "node --version".to_string());
        system_probes.insert("npm".to_string(), "npm --version".to_string());
        system_probes.insert("rustc".to_string(), "rustc --version".to_string());
        system_probes.insert("docker".to_string(), "docker --version".to_string());

        Self {
            include_dependencies: false,
            exclude_large_files: true,
            compression_level: 6,
            large_file_threshold_bytes: 100 * 1024 * 1024,
            critical_config_files: [
                "package.json",
                "package-lock.json",
                "Cargo.toml",
                "Cargo.lock",
                "docker-compose.yml",
                ".env",
                "src-tauri/tauri.conf.json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            system_probes,
        }
    }
}

impl Default for ExclusionSettings {
    fn default() -> Self {
        let to_vec =
            |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            always: to_vec(&[
                ".git",
                ".hg",
                ".svn",
                ".cache",
                ".turbo",
                ".parcel-cache",
                ".next",
                "__pycache__",
            ]),
            dependencies: to_vec(&["node_modules", "target", "dist", "build", ".venv"]),
            vcs_dirs: to_vec(&[".git", ".hg", ".svn"]),
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_age_days: 7,
            max_count: 10,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            critical_paths: vec!["package.json".to_string()],
            weights: HealthWeights::default(),
            security_partial_credit: 10,
        }
    }
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            build: 25,
            test: 25,
            critical_files: 25,
            security: 25,
        }
    }
}

impl HealthWeights {
    pub fn total(&self) -> u32 {
        u32::from(self.build)
            + u32::from(self.test)
            + u32::from(self.critical_files)
            + u32::from(self.security)
    }
}

impl Default for ToolchainSettings {
    fn default() -> Self {
        Self {
            build: Some("npm run build".to_string()),
            test: Some("npm test".to_string()),
            install: Some("npm ci".to_string()),
            security_scan: Some("npm audit --audit-level=high".to_string()),
            findings_exit_codes: vec![1],
            install_timeout_secs: 600,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            restart_command: "docker compose restart {service}".to_string(),
            restart_timeout_secs: 120,
        }
    }
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self {
            post_check: true,
            use_git: true,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Config rooted at `project_root` with every other setting at its default.
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Self::default()
        }
    }

    /// Absolute-or-relative snapshot root as seen from the working directory.
    pub fn snapshots_root(&self) -> PathBuf {
        resolve_against(&self.project_root, &self.snapshots_dir)
    }

    pub fn validate(&self) -> SnapResult<()> {
        let total = self.health.weights.total();
        if total != 100 {
            return Err(SnapError::config(format!(
                "health check weights must sum to 100, got {total}"
            )));
        }
        if self.health.security_partial_credit > self.health.weights.security {
            return Err(SnapError::config(format!(
                "security_partial_credit ({}) exceeds the security weight ({})",
                self.health.security_partial_credit, self.health.weights.security
            )));
        }
        if self.snapshot.compression_level > 9 {
            return Err(SnapError::config(format!(
                "compression_level must be within 0..=9, got {}",
                self.snapshot.compression_level
            )));
        }
        if self.health.timeout_secs == 0 {
            return Err(SnapError::config("health.timeout_secs must be positive"));
        }
        if self.snapshots_root() == self.project_root {
            return Err(SnapError::config(
                "snapshots_dir must not be the project root itself",
            ));
        }
        Ok(())
    }
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
