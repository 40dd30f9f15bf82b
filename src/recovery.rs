// SnapGuard recovery.rs
// Purpose: Score-driven recovery decisions and the auto-recovery loop body

use serde::Serialize;
use std::fmt;
use tokio::task;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::collaborators::{notify_best_effort, Notifier};
use crate::emergency::select_target;
use crate::errors::{SnapError, SnapResult};
use crate::health::{HealthReport, HealthScorer};
use crate::rollback::{RollbackEngine, RollbackOptions, RollbackReport};
use crate::store::SnapshotStore;

pub const HEALTHY_THRESHOLD: u8 = 75;
pub const DEGRADED_THRESHOLD: u8 = 50;
pub const RECOMMEND_THRESHOLD: u8 = 25;

/// Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    Healthy,
    Degraded,
    RecommendRecovery,
    EmergencyRequired,
}

impl RecoveryAction {
    pub fn from_score(score: u8) -> Self {
        if score >= HEALTHY_THRESHOLD {
            RecoveryAction::Healthy
        } else if score >= DEGRADED_THRESHOLD {
            RecoveryAction::Degraded
        } else if score >= RECOMMEND_THRESHOLD {
            RecoveryAction::RecommendRecovery
        } else {
            RecoveryAction::EmergencyRequired
        }
    }

    pub fn wants_rollback(self) -> bool {
        matches!(
            self,
            RecoveryAction::RecommendRecovery | RecoveryAction::EmergencyRequired
        )
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecoveryAction::Healthy => "healthy",
            RecoveryAction::Degraded => "degraded",
            RecoveryAction::RecommendRecovery => "recommend-recovery",
            RecoveryAction::EmergencyRequired => "emergency-required",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryDecision {
    pub action: RecoveryAction,
    pub execute_rollback: bool,
}

/// Map a score to an action. Rollback is only executed when authorized.
pub fn decide(score: u8, force_allowed: bool) -> RecoveryDecision {
    let action = RecoveryAction::from_score(score);
    RecoveryDecision {
        action,
        execute_rollback: force_allowed && action.wants_rollback(),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOutcome {
    pub health: HealthReport,
    pub decision: RecoveryDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_check: Option<HealthReport>,
}

/// Result of a rollback followed by an optional health re-check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckedRollback {
    pub rollback: RollbackReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_check: Option<HealthReport>,
}

#[derive(Clone)]
pub struct AutoRecoveryController {
    scorer: HealthScorer,
    engine: RollbackEngine,
    store: SnapshotStore,
    notifier: std::sync::Arc<dyn Notifier>,
    post_check: bool,
}

impl AutoRecoveryController {
    pub fn new(
        scorer: HealthScorer,
        engine: RollbackEngine,
        store: SnapshotStore,
        notifier: std::sync::Arc<dyn Notifier>,
        post_check: bool,
    ) -> Self {
        Self {
            scorer,
            engine,
            store,
            notifier,
            post_check,
        }
    }

    async fn notify(&self, message: String) {
        let notifier = self.notifier.clone();
        let sent =
            task::spawn_blocking(move || notify_best_effort(notifier.as_ref(), &message)).await;
        if let Err(e) = sent {
            warn!("notification task failed: {e}");
        }
    }

    /// Roll back on the blocking pool, then re-score when post checks are enabled.
    pub async fn rollback_checked(
        &self,
        target_id: &str,
        options: RollbackOptions,
        cancel: &CancelToken,
    ) -> SnapResult<CheckedRollback> {
        let engine = self.engine.clone();
        let target = target_id.to_string();
        let cancel = cancel.clone();
        let rollback = task::spawn_blocking(move || engine.rollback(&target, options, &cancel))
            .await
            .map_err(|e| SnapError::io_other("rollback task", e.to_string()))??;

        if !self.post_check {
            return Ok(CheckedRollback {
                rollback,
                post_check: None,
            });
        }

        let report = self.scorer.score().await;
        if report.score < DEGRADED_THRESHOLD {
            error!(
                "post-rollback health score {} below {DEGRADED_THRESHOLD}; \
                 safety snapshot {} holds the previous tree",
                report.score, rollback.safety_snapshot_id
            );
            self.notify(format!(
                "Post-rollback health check failed after restoring {} (score {})",
                rollback.target_snapshot_id, report.score
            ))
            .await;
            return Err(SnapError::PostCheckFailed {
                score: report.score,
                safety_snapshot_id: rollback.safety_snapshot_id,
            });
        }
        info!("post-rollback health score {}", report.score);
        Ok(CheckedRollback {
            rollback,
            post_check: Some(report),
        })
    }

    /// Score, decide, and roll back to the newest verified snapshot when authorized.
    pub async fn run(
        &self,
        force_allowed: bool,
        cancel: &CancelToken,
    ) -> SnapResult<RecoveryOutcome> {
        let health = self.scorer.score().await;
        let decision = decide(health.score, force_allowed);

        match decision.action {
            RecoveryAction::Healthy => info!("system healthy (score {})", health.score),
            RecoveryAction::Degraded => {
                warn!("system degraded (score {}); manual intervention recommended", health.score)
            }
            RecoveryAction::RecommendRecovery => {
                warn!("recovery recommended (score {})", health.score)
            }
            RecoveryAction::EmergencyRequired => {
                error!("emergency recovery required (score {})", health.score)
            }
        }
        if decision.action != RecoveryAction::Healthy {
            let next = if decision.execute_rollback {
                "rolling back to the newest verified snapshot"
            } else if decision.action.wants_rollback() {
                "rollback not authorized; rerun with --force"
            } else {
                "no automatic action"
            };
            self.notify(format!(
                "Health score {} ({}): {next}",
                health.score, decision.action
            ))
            .await;
        }

        if !decision.execute_rollback {
            return Ok(RecoveryOutcome {
                health,
                decision,
                rollback: None,
                post_check: None,
            });
        }

        let options = RollbackOptions {
            force: false,
            confirmed: true,
        };
        // A target failing re-verification loses its flag, so the next
        // selection moves on to an older snapshot.
        let mut rejected: Vec<String> = Vec::new();
        let checked = loop {
            let target = {
                let store = self.store.clone();
                task::spawn_blocking(move || select_target(&store))
                    .await
                    .map_err(|e| SnapError::io_other("target selection", e.to_string()))??
            };
            match self.rollback_checked(&target.id, options, cancel).await {
                Err(e @ SnapError::Unverified { .. }) if !rejected.contains(&target.id) => {
                    warn!("emergency target {} rejected: {e}", target.id);
                    rejected.push(target.id);
                }
                other => break other?,
            }
        };

        Ok(RecoveryOutcome {
            health,
            decision,
            rollback: Some(checked.rollback),
            post_check: checked.post_check,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_inclusive_at_band_edges() {
        assert_eq!(decide(100, false).action, RecoveryAction::Healthy);
        assert_eq!(decide(75, false).action, RecoveryAction::Healthy);
        assert_eq!(decide(74, false).action, RecoveryAction::Degraded);
        assert_eq!(decide(50, false).action, RecoveryAction::Degraded);
        assert_eq!(decide(49, false).action, RecoveryAction::RecommendRecovery);
        assert_eq!(decide(25, false).action, RecoveryAction::RecommendRecovery);
        assert_eq!(decide(24, false).action, RecoveryAction::EmergencyRequired);
        assert_eq!(decide(0, false).action, RecoveryAction::EmergencyRequired);
    }

    #[test]
    fn lower_scores_are_never_less_severe() {
        for low in 0..=100u8 {
            for high in low..=100u8 {
                assert!(decide(low, false).action >= decide(high, false).action);
            }
        }
    }

    #[test]
    fn rollback_requires_authorization() {
        assert!(!decide(10, false).execute_rollback);
        assert!(decide(10, true).execute_rollback);
        assert!(decide(30, true).execute_rollback);
        assert!(!decide(60, true).execute_rollback);
        assert!(!decide(90, true).execute_rollback);
    }
}
