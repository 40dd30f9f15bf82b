//! External collaborator seams
//!
//! The controller never talks to git, the build toolchain, the container
//! runtime or a notification transport directly. Everything goes through the
//! traits below; process-backed implementations live in [`crate::process`]
//! and [`crate::notify`].

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Version-control system of the project tree.
pub trait Vcs: Send + Sync {
    fn current_branch(&self) -> Result<String>;
    fn current_commit(&self) -> Result<String>;
    fn uncommitted_count(&self) -> Result<u32>;
    /// Diff of staged (`true`) or unstaged (`false`) changes.
    fn diff(&self, staged: bool) -> Result<String>;
    fn apply_diff(&self, diff: &str, staged: bool) -> Result<()>;
}

/// Build/test toolchain of the project. Exit code zero means pass.
pub trait Toolchain: Send + Sync {
    fn build(&self, timeout: Duration) -> Result<i32>;
    fn test(&self, timeout: Duration) -> Result<i32>;
    fn install_dependencies(&self, timeout: Duration) -> Result<()>;
}

/// Result of a security scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    pub ran: bool,
    pub findings: u32,
}

impl ScanOutcome {
    pub fn clean() -> Self {
        Self { ran: true, findings: 0 }
    }

    pub fn with_findings(findings: u32) -> Self {
        Self { ran: true, findings }
    }

    pub fn unavailable() -> Self {
        Self { ran: false, findings: 0 }
    }
}

pub trait SecurityScanner: Send + Sync {
    fn scan(&self, timeout: Duration) -> Result<ScanOutcome>;
}

/// Container/orchestration runtime hosting the project's services.
pub trait ServiceRuntime: Send + Sync {
    fn restart(&self, service: &str) -> Result<()>;
}

/// Fire-and-forget notification transport.
pub trait Notifier: Send + Sync {
    fn send(&self, message: &str) -> Result<()>;
}

/// Interactive confirmation gate for destructive operations.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Send a notification, logging instead of propagating failures.
pub fn notify_best_effort(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.send(message) {
        tracing::warn!("notification delivery failed: {e:#}");
    }
}

/// Stand-in for project trees that are not under version control.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVcs;

impl Vcs for NoVcs {
    fn current_branch(&self) -> Result<String> {
        Err(anyhow!("project is not under version control"))
    }

    fn current_commit(&self) -> Result<String> {
        Err(anyhow!("project is not under version control"))
    }

    fn uncommitted_count(&self) -> Result<u32> {
        Err(anyhow!("project is not under version control"))
    }

    fn diff(&self, _staged: bool) -> Result<String> {
        Ok(String::new())
    }

    fn apply_diff(&self, _diff: &str, _staged: bool) -> Result<()> {
        Err(anyhow!("project is not under version control"))
    }
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, message: &str) -> Result<()> {
        tracing::info!(target: "snapguard::notify", "{message}");
        Ok(())
    }
}

/// Confirmation with a fixed answer (`--yes`, non-interactive runs, tests).
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirm(pub bool);

impl Confirm for FixedConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        self.0
    }
}

/// `y/N` prompt on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{prompt} [y/N] ");
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

/// The full set of collaborators a controller needs.
#[derive(Clone)]
pub struct Collaborators {
    pub vcs: Arc<dyn Vcs>,
    pub toolchain: Arc<dyn Toolchain>,
    pub scanner: Arc<dyn SecurityScanner>,
    pub services: Arc<dyn ServiceRuntime>,
    pub notifier: Arc<dyn Notifier>,
    pub confirm: Arc<dyn Confirm>,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn send(&self, _message: &str) -> Result<()> {
            Err(anyhow!("webhook unreachable"))
        }
    }

    #[test]
    fn notification_failures_do_not_propagate() {
        notify_best_effort(&FailingNotifier, "rollback complete");
        notify_best_effort(&LogNotifier, "rollback complete");
    }

    #[test]
    fn no_vcs_reports_errors_for_state() {
        assert!(NoVcs.current_branch().is_err());
        assert_eq!(NoVcs.diff(true).unwrap(), "");
    }

    #[test]
    fn fixed_confirm_returns_its_answer() {
        assert!(FixedConfirm(true).confirm("proceed?"));
        assert!(!FixedConfirm(false).confirm("proceed?"));
    }
}
