//! Weighted health scoring
//!
//! Four independent checks (build, test, critical files, security scan)
//! contribute their configured weight to a 0-100 score. Collaborator calls
//! run on the blocking pool and are cut off at the configured timeout; a
//! timed-out or failed probe earns nothing and is not retried.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info};

use crate::collaborators::{ScanOutcome, SecurityScanner, Toolchain};
use crate::config::HealthSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub name: String,
    pub passed: bool,
    pub weight: u8,
    pub awarded: u8,
    pub detail: String,
}

impl HealthCheckResult {
    fn full(name: &str, weight: u8, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            weight,
            awarded: weight,
            detail: detail.into(),
        }
    }

    fn zero(name: &str, weight: u8, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            weight,
            awarded: 0,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub score: u8,
    pub checks: Vec<HealthCheckResult>,
}

impl HealthReport {
    fn from_checks(checks: Vec<HealthCheckResult>) -> Self {
        let total: u32 = checks.iter().map(|c| u32::from(c.awarded)).sum();
        Self {
            score: total.min(100) as u8,
            checks,
        }
    }

    pub fn check(&self, name: &str) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

pub const BUILD_CHECK: &str = "build";
pub const TEST_CHECK: &str = "test";
pub const CRITICAL_FILES_CHECK: &str = "critical-files";
pub const SECURITY_CHECK: &str = "security";

#[derive(Clone)]
pub struct HealthScorer {
    project_root: PathBuf,
    settings: HealthSettings,
    toolchain: Arc<dyn Toolchain>,
    scanner: Arc<dyn SecurityScanner>,
}

/// Run a blocking probe with a deadline.
async fn bounded<T, F>(timeout: Duration, probe: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(Duration) -> anyhow::Result<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, task::spawn_blocking(move || probe(timeout))).await {
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs_f32())),
        Ok(Err(join_error)) => Err(format!("probe aborted: {join_error}")),
        Ok(Ok(Err(e))) => Err(format!("{e:#}")),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

fn exit_code_check(name: &str, weight: u8, outcome: Result<i32, String>) -> HealthCheckResult {
    match outcome {
        Ok(0) => HealthCheckResult::full(name, weight, "exit code 0"),
        Ok(code) => HealthCheckResult::zero(name, weight, format!("exit code {code}")),
        Err(reason) => HealthCheckResult::zero(name, weight, reason),
    }
}

impl HealthScorer {
    pub fn new(
        project_root: impl Into<PathBuf>,
        settings: HealthSettings,
        toolchain: Arc<dyn Toolchain>,
        scanner: Arc<dyn SecurityScanner>,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            settings,
            toolchain,
            scanner,
        }
    }

    pub async fn score(&self) -> HealthReport {
        self.score_with_timeout(Duration::from_secs(self.settings.timeout_secs))
            .await
    }

    pub async fn score_with_timeout(&self, timeout: Duration) -> HealthReport {
        let weights = self.settings.weights;

        let toolchain = Arc::clone(&self.toolchain);
        let build = bounded(timeout, move |t| toolchain.build(t));
        let toolchain = Arc::clone(&self.toolchain);
        let test = bounded(timeout, move |t| toolchain.test(t));
        let scanner = Arc::clone(&self.scanner);
        let scan = bounded(timeout, move |t| scanner.scan(t));

        let (build, test, scan) = tokio::join!(build, test, scan);

        let checks = vec![
            exit_code_check(BUILD_CHECK, weights.build, build),
            exit_code_check(TEST_CHECK, weights.test, test),
            self.critical_files_check(weights.critical_files),
            self.security_check(weights.security, scan),
        ];
        for check in &checks {
            debug!(
                "health check {}: {}/{} ({})",
                check.name, check.awarded, check.weight, check.detail
            );
        }

        let report = HealthReport::from_checks(checks);
        info!("health score {}", report.score);
        report
    }

    fn critical_files_check(&self, weight: u8) -> HealthCheckResult {
        let missing: Vec<&str> = self
            .settings
            .critical_paths
            .iter()
            .filter(|p| !self.project_root.join(p).exists())
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            HealthCheckResult::full(CRITICAL_FILES_CHECK, weight, "all critical paths present")
        } else {
            HealthCheckResult::zero(
                CRITICAL_FILES_CHECK,
                weight,
                format!("missing: {}", missing.join(", ")),
            )
        }
    }

    fn security_check(
        &self,
        weight: u8,
        outcome: Result<ScanOutcome, String>,
    ) -> HealthCheckResult {
        match outcome {
            Ok(ScanOutcome { ran: true, findings: 0 }) => {
                HealthCheckResult::full(SECURITY_CHECK, weight, "no findings")
            }
            Ok(ScanOutcome { ran: true, findings }) => HealthCheckResult {
                name: SECURITY_CHECK.to_string(),
                passed: false,
                weight,
                awarded: self.settings.security_partial_credit.min(weight),
                detail: format!("{findings} finding(s)"),
            },
            Ok(ScanOutcome { ran: false, .. }) => {
                HealthCheckResult::zero(SECURITY_CHECK, weight, "scan could not run")
            }
            Err(reason) => HealthCheckResult::zero(SECURITY_CHECK, weight, reason),
        }
    }
}
