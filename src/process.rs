// SnapGuard process.rs
// Purpose: Process-backed collaborators (git, build toolchain, security scan, service restart)

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tracing::{debug, info, warn};

use crate::collaborators::{ScanOutcome, SecurityScanner, ServiceRuntime, Toolchain, Vcs};

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

fn shell_command(command_line: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

/// Run `cmd` in `cwd`. The child is killed once `timeout` elapses.
pub async fn run(
    mut cmd: Command,
    cwd: &Path,
    timeout: Duration,
    stdin: Option<&str>,
) -> Result<CommandOutput> {
    cmd.current_dir(cwd)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| format!("spawning {cmd:?}"))?;
    let input = stdin.map(|s| s.as_bytes().to_vec());
    let pipe = child.stdin.take();

    let exchange = async move {
        let feed = async {
            if let (Some(mut pipe), Some(data)) = (pipe, input) {
                // Dropping the pipe afterwards closes the child's stdin.
                if let Err(e) = pipe.write_all(&data).await {
                    warn!("writing child stdin failed: {e}");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(anyhow!(e).context("waiting for child process")),
        // The dropped future owned the child, so kill_on_drop reaps it.
        Err(_) => bail!("timed out after {:?}", timeout),
    }
}

/// Run a shell command line.
pub async fn run_shell(command_line: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutput> {
    debug!("running `{command_line}` in {}", cwd.display());
    run(shell_command(command_line), cwd, timeout, None).await
}

fn private_runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building process runtime")
}

/// Drive a process future from the synchronous collaborator traits.
///
/// Multi-threaded runtimes are borrowed through `block_in_place`. A
/// current-thread runtime cannot be blocked from its own thread, so the
/// future runs on a private runtime in a scoped thread instead.
fn block_on<F>(future: F) -> Result<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| handle.block_on(future)))
        }
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(|| -> Result<F::Output> { Ok(private_runtime()?.block_on(future)) })
                .join()
                .map_err(|_| anyhow!("process runtime thread panicked"))?
        }),
        Err(_) => Ok(private_runtime()?.block_on(future)),
    }
}

fn shell_blocking(command_line: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutput> {
    block_on(run_shell(command_line, cwd, timeout))?
}

/// First line of a diagnostic command's output, if it ran successfully.
pub fn probe_version(command_line: &str, cwd: &Path, timeout: Duration) -> Option<String> {
    let output = shell_blocking(command_line, cwd, timeout).ok()?;
    if !output.success() {
        return None;
    }
    output
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Git working tree driven through the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(repo: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo: repo.into(),
            timeout,
        }
    }

    fn git(&self, args: &[&str], stdin: Option<&str>) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        block_on(run(cmd, &self.repo, self.timeout, stdin))?
    }

    fn git_ok(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let output = self.git(args, stdin)?;
        if !output.success() {
            bail!("git {} failed: {}", args.join(" "), output.stderr.trim());
        }
        Ok(output.stdout)
    }
}

impl Vcs for GitCli {
    fn current_branch(&self) -> Result<String> {
        Ok(self
            .git_ok(&["rev-parse", "--abbrev-ref", "HEAD"], None)?
            .trim()
            .to_string())
    }

    fn current_commit(&self) -> Result<String> {
        Ok(self.git_ok(&["rev-parse", "HEAD"], None)?.trim().to_string())
    }

    fn uncommitted_count(&self) -> Result<u32> {
        let status = self.git_ok(&["status", "--porcelain"], None)?;
        Ok(status.lines().filter(|l| !l.trim().is_empty()).count() as u32)
    }

    fn diff(&self, staged: bool) -> Result<String> {
        if staged {
            self.git_ok(&["diff", "--cached", "--binary"], None)
        } else {
            self.git_ok(&["diff", "--binary"], None)
        }
    }

    fn apply_diff(&self, diff: &str, staged: bool) -> Result<()> {
        if diff.trim().is_empty() {
            return Ok(());
        }
        if staged {
            self.git_ok(&["apply", "--cached", "-"], Some(diff))?;
            return Ok(());
        }
        // Restored files usually carry the unstaged changes already.
        if self
            .git(&["apply", "--reverse", "--check", "-"], Some(diff))?
            .success()
        {
            debug!("unstaged diff already present in restored tree");
            return Ok(());
        }
        self.git_ok(&["apply", "-"], Some(diff))?;
        Ok(())
    }
}

/// Build/test/install commands from configuration.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    pub root: PathBuf,
    pub build: Option<String>,
    pub test: Option<String>,
    pub install: Option<String>,
}

impl CommandToolchain {
    fn exit_code(&self, command: Option<&String>, what: &str, timeout: Duration) -> Result<i32> {
        let command = command.ok_or_else(|| anyhow!("no {what} command configured"))?;
        let output = shell_blocking(command, &self.root, timeout)?;
        if !output.success() {
            debug!("{what} command stderr: {}", output.stderr.trim());
        }
        Ok(output.code.unwrap_or(-1))
    }
}

impl Toolchain for CommandToolchain {
    fn build(&self, timeout: Duration) -> Result<i32> {
        self.exit_code(self.build.as_ref(), "build", timeout)
    }

    fn test(&self, timeout: Duration) -> Result<i32> {
        self.exit_code(self.test.as_ref(), "test", timeout)
    }

    fn install_dependencies(&self, timeout: Duration) -> Result<()> {
        let Some(command) = self.install.as_ref() else {
            info!("no install command configured, skipping dependency restore");
            return Ok(());
        };
        let output = shell_blocking(command, &self.root, timeout)?;
        if !output.success() {
            bail!(
                "`{command}` exited with {:?}: {}",
                output.code,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

/// Security scan command. Exit 0 is clean, a findings exit code reports issues.
#[derive(Debug, Clone)]
pub struct CommandScanner {
    pub root: PathBuf,
    pub command: Option<String>,
    pub findings_exit_codes: Vec<i32>,
}

impl SecurityScanner for CommandScanner {
    fn scan(&self, timeout: Duration) -> Result<ScanOutcome> {
        let Some(command) = self.command.as_ref() else {
            return Ok(ScanOutcome::unavailable());
        };
        let output = shell_blocking(command, &self.root, timeout)?;
        Ok(match output.code {
            Some(0) => ScanOutcome::clean(),
            Some(code) if self.findings_exit_codes.contains(&code) => {
                let findings = output.stdout.lines().filter(|l| !l.trim().is_empty()).count();
                ScanOutcome::with_findings(findings.max(1) as u32)
            }
            _ => ScanOutcome::unavailable(),
        })
    }
}

/// Restart services through a command template containing `{service}`.
#[derive(Debug, Clone)]
pub struct CommandServiceRuntime {
    pub root: PathBuf,
    pub template: String,
    pub timeout: Duration,
}

impl ServiceRuntime for CommandServiceRuntime {
    fn restart(&self, service: &str) -> Result<()> {
        let command = self.template.replace("{service}", service);
        let output = shell_blocking(&command, &self.root, self.timeout)?;
        if !output.success() {
            bail!("`{command}` exited with {:?}: {}", output.code, output.stderr.trim());
        }
        info!("restarted service {service}");
        Ok(())
    }
}
