// SnapGuard controller.rs
// Purpose: Wires configuration and collaborators into the store, engine and scorer

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

use crate::audit::{AuditLog, RollbackRecord};
use crate::cancel::CancelToken;
use crate::collaborators::{
    Collaborators, Confirm, FixedConfirm, LogNotifier, NoVcs, Notifier, StdinConfirm, Vcs,
};
use crate::config::ControllerConfig;
use crate::emergency::select_target;
use crate::errors::{SnapError, SnapResult};
use crate::health::{HealthReport, HealthScorer};
use crate::integrity::VerificationReport;
use crate::notify::WebhookNotifier;
use crate::process::{CommandScanner, CommandServiceRuntime, CommandToolchain, GitCli};
use crate::recovery::{
    decide, AutoRecoveryController, CheckedRollback, RecoveryDecision, RecoveryOutcome,
};
use crate::retention::{self, PruneReport, RetentionPolicy};
use crate::rollback::{RollbackEngine, RollbackOptions};
use crate::snapshot::{ListedSnapshot, Snapshot};
use crate::store::{CreateRequest, ReconcileReport, SnapshotStore};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

impl Collaborators {
    /// Process-backed collaborators for `config`.
    pub fn from_config(config: &ControllerConfig, interactive: bool) -> Self {
        let root = config.project_root.clone();
        let vcs: Arc<dyn Vcs> = if config.rollback.use_git && root.join(".git").exists() {
            Arc::new(GitCli::new(root.clone(), GIT_TIMEOUT))
        } else {
            Arc::new(NoVcs)
        };
        let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };
        let confirm: Arc<dyn Confirm> = if interactive {
            Arc::new(StdinConfirm)
        } else {
            Arc::new(FixedConfirm(false))
        };

        Self {
            vcs,
            toolchain: Arc::new(CommandToolchain {
                root: root.clone(),
                build: config.toolchain.build.clone(),
                test: config.toolchain.test.clone(),
                install: config.toolchain.install.clone(),
            }),
            scanner: Arc::new(CommandScanner {
                root: root.clone(),
                command: config.toolchain.security_scan.clone(),
                findings_exit_codes: config.toolchain.findings_exit_codes.clone(),
            }),
            services: Arc::new(CommandServiceRuntime {
                root,
                template: config.services.restart_command.clone(),
                timeout: Duration::from_secs(config.services.restart_timeout_secs),
            }),
            notifier,
            confirm,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub snapshot: Snapshot,
    pub retention: PruneReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub reconcile: ReconcileReport,
    pub retention: PruneReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub health: HealthReport,
    pub decision: RecoveryDecision,
    pub snapshot_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rollback: Option<RollbackRecord>,
}

/// Entry point used by the CLI and integration tests.
#[derive(Clone)]
pub struct Controller {
    config: Arc<ControllerConfig>,
    store: SnapshotStore,
    collaborators: Collaborators,
    cancel: CancelToken,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        collaborators: Collaborators,
        cancel: CancelToken,
    ) -> SnapResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let store = SnapshotStore::open(Arc::clone(&config), Arc::clone(&collaborators.vcs))?;
        Ok(Self {
            config,
            store,
            collaborators,
            cancel,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn engine(&self) -> RollbackEngine {
        RollbackEngine::new(self.store.clone(), self.collaborators.clone())
    }

    pub fn scorer(&self) -> HealthScorer {
        HealthScorer::new(
            self.store.project_root(),
            self.config.health.clone(),
            Arc::clone(&self.collaborators.toolchain),
            Arc::clone(&self.collaborators.scanner),
        )
    }

    pub fn recovery(&self) -> AutoRecoveryController {
        AutoRecoveryController::new(
            self.scorer(),
            self.engine(),
            self.store.clone(),
            Arc::clone(&self.collaborators.notifier),
            self.config.rollback.post_check,
        )
    }

    fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from(self.config.retention)
    }

    fn confirm_or_decline(&self, force: bool, prompt: &str, operation: &str) -> SnapResult<()> {
        if force || self.collaborators.confirm.confirm(prompt) {
            Ok(())
        } else {
            Err(SnapError::declined(operation))
        }
    }

    /// Create a snapshot, then apply retention with the new snapshot protected.
    pub fn create(&self, request: CreateRequest) -> SnapResult<CreateOutcome> {
        let snapshot = self.store.create(request, &self.cancel)?;
        let protected: HashSet<String> = [snapshot.id.clone()].into_iter().collect();
        let retention = retention::prune(&self.store, &self.retention_policy(), &protected)?;
        Ok(CreateOutcome { snapshot, retention })
    }

    pub fn list(&self) -> SnapResult<Vec<ListedSnapshot>> {
        self.store.list()
    }

    pub fn info(&self, id: &str) -> SnapResult<ListedSnapshot> {
        self.store.get_listed(id)
    }

    pub fn verify(&self, id: &str) -> SnapResult<VerificationReport> {
        self.store.verifier().verify(id)
    }

    pub fn delete(&self, id: &str, force: bool) -> SnapResult<()> {
        // Surface NotFound before asking.
        self.store.get_listed(id)?;
        self.confirm_or_decline(
            force,
            &format!("Permanently delete snapshot {id}?"),
            &format!("delete {id}"),
        )?;
        self.store.delete(id)
    }

    pub fn import(&self, source: &std::path::Path, force: bool) -> SnapResult<Snapshot> {
        self.store.import(source, force)
    }

    pub fn cleanup(&self, policy: RetentionPolicy, force: bool) -> SnapResult<CleanupReport> {
        let protected = HashSet::new();
        let planned = retention::plan(
            &policy,
            &self.store.registry()?.newest_first(),
            &protected,
            chrono::Utc::now(),
        );
        if !planned.is_empty() {
            self.confirm_or_decline(
                force,
                &format!(
                    "Permanently delete {} snapshot(s): {}?",
                    planned.len(),
                    planned.join(", ")
                ),
                "cleanup",
            )?;
        }
        let reconcile = self.store.reconcile()?;
        let retention = retention::prune(&self.store, &policy, &protected)?;
        Ok(CleanupReport { reconcile, retention })
    }

    pub async fn rollback(
        &self,
        id: &str,
        options: RollbackOptions,
    ) -> SnapResult<CheckedRollback> {
        self.recovery().rollback_checked(id, options, &self.cancel).await
    }

    /// Roll back to the newest verified snapshot.
    pub async fn emergency_rollback(&self, force: bool) -> SnapResult<CheckedRollback> {
        let store = self.store.clone();
        let target = task::spawn_blocking(move || select_target(&store))
            .await
            .map_err(|e| SnapError::io_other("target selection", e.to_string()))??;
        let options = RollbackOptions {
            force,
            confirmed: false,
        };
        self.rollback(&target.id, options).await
    }

    pub async fn status(&self) -> SnapResult<StatusReport> {
        let health = self.scorer().score().await;
        let decision = decide(health.score, false);
        Ok(StatusReport {
            snapshot_count: self.store.registry()?.len(),
            last_rollback: AuditLog::new(self.store.root()).last_record()?,
            health,
            decision,
        })
    }

    pub async fn auto_recovery(&self, force_allowed: bool) -> SnapResult<RecoveryOutcome> {
        self.recovery().run(force_allowed, &self.cancel).await
    }
}
