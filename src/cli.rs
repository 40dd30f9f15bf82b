use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::collaborators::Collaborators;
use crate::config_loader::{load_config, render_toml};
use crate::controller::Controller;
use crate::errors::{SnapError, SnapResult};
use crate::integrity::VerifyFailure;
use crate::log_sink::{self, LogLevel};
use crate::retention::RetentionPolicy;
use crate::rollback::RollbackOptions;
use crate::snapshot::SnapshotOptions;
use crate::store::CreateRequest;

/// Top-level CLI interface for SnapGuard
#[derive(Parser, Debug)]
#[command(
    name = "snapguard",
    version,
    about = "Deployment snapshot & rollback controller"
)]
pub struct Cli {
    /// Explicit configuration file (overrides snapguard.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Project tree to protect (defaults to the configured project_root)
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture the project tree as a new snapshot
    Create {
        /// Snapshot id (defaults to snapshot_<timestamp>)
        name: Option<String>,
        /// Replace an existing snapshot with the same id
        #[arg(long)]
        force: bool,
        /// Archive dependency and build output directories too
        #[arg(long)]
        include_deps: bool,
        /// Skip files above the large-file threshold
        #[arg(long)]
        exclude_large: bool,
        /// Archive files above the large-file threshold too
        #[arg(long, conflicts_with = "exclude_large")]
        include_large: bool,
        /// Deflate level 0-9 (0 stores uncompressed)
        #[arg(long)]
        compression: Option<u8>,
    },

    /// List snapshots, newest first
    List,

    /// Show full metadata of a snapshot
    Info { id: String },

    /// Re-verify a snapshot's archive
    Verify { id: String },

    /// Delete a snapshot
    Delete {
        id: String,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },

    /// Import a snapshot directory produced elsewhere
    Import {
        dir: PathBuf,
        /// Replace an existing snapshot with the same id
        #[arg(long)]
        force: bool,
    },

    /// Restore the project tree from a snapshot
    Rollback {
        id: String,
        /// Skip confirmation and tolerate checksum drift on a readable archive
        #[arg(long)]
        force: bool,
        /// Answer yes to the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Roll back to the newest verified snapshot
    ///
    /// Every rollback first saves the current tree as a pre-rollback-*
    /// snapshot, and that snapshot counts as verified. Run right after a
    /// rollback, this command therefore restores the tree that rollback
    /// replaced. Use `rollback <id>` to pick a specific known-good snapshot.
    EmergencyRollback {
        /// Skip confirmation and tolerate checksum drift on a readable archive
        #[arg(long)]
        force: bool,
    },

    /// Apply retention and sweep leftovers
    Cleanup {
        #[arg(long)]
        max_age_days: Option<u32>,
        #[arg(long)]
        max_count: Option<usize>,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },

    /// Print health score and the last rollback record
    Status,

    /// Score health and roll back when authorized
    ///
    /// The rollback target is the newest verified snapshot, which may be a
    /// pre-rollback-* safety snapshot taken by an earlier rollback. After a
    /// rollback, prefer `rollback <id>` over a second forced run.
    AutoRecovery {
        /// Authorize an automatic rollback
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> SnapResult<()> {
    if json {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| SnapError::serialization("rendering output", e))?;
        println!("{text}");
    } else {
        human(value);
    }
    Ok(())
}

/// Fold `create` flags over the configured defaults. `exclude_large` is
/// `None` when neither `--exclude-large` nor `--include-large` was given.
fn create_options(
    defaults: SnapshotOptions,
    include_deps: bool,
    exclude_large: Option<bool>,
    compression: Option<u8>,
) -> SnapshotOptions {
    SnapshotOptions {
        include_dependencies: include_deps || defaults.include_dependencies,
        exclude_large_files: exclude_large.unwrap_or(defaults.exclude_large_files),
        compression_level: compression.unwrap_or(defaults.compression_level),
    }
}

pub async fn dispatch(cli: Cli, cancel: CancelToken) -> SnapResult<()> {
    let config = load_config(cli.config.as_deref(), cli.project.as_deref())?;

    let level = config.log.level.parse::<LogLevel>().unwrap_or_else(|e| {
        eprintln!("{e}; using info");
        LogLevel::Info
    });
    log_sink::init(level.raised(cli.verbose));

    if let Commands::Config = cli.command {
        print!("{}", render_toml(&config)?);
        return Ok(());
    }

    let interactive = std::io::stdin().is_terminal() && !cli.json;
    let collaborators = Collaborators::from_config(&config, interactive);
    let controller = Controller::new(config, collaborators, cancel)?;
    let json = cli.json;

    match cli.command {
        Commands::Create {
            name,
            force,
            include_deps,
            exclude_large,
            include_large,
            compression,
        } => {
            let large = match (exclude_large, include_large) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let options = create_options(
                controller.store().default_options(),
                include_deps,
                large,
                compression,
            );
            let request = CreateRequest::manual(name, options).with_force(force);
            let worker = controller.clone();
            let outcome = tokio::task::spawn_blocking(move || worker.create(request))
                .await
                .map_err(|e| SnapError::io_other("create task", e.to_string()))??;
            emit(json, &outcome, |o| {
                println!(
                    "Created snapshot {} ({} bytes, checksum {})",
                    o.snapshot.id,
                    o.snapshot.size.compressed_bytes,
                    o.snapshot.integrity.checksum.as_deref().unwrap_or("-")
                );
                for id in &o.retention.deleted {
                    println!("  retention removed {id}");
                }
            })
        }

        Commands::List => {
            let snapshots = controller.list()?;
            emit(json, &snapshots, |list| {
                if list.is_empty() {
                    println!("No snapshots.");
                }
                for item in list {
                    let s = &item.snapshot;
                    println!(
                        "{:<40} {:<13} {}  {:>10} bytes  {}  {}@{}",
                        s.id,
                        item.kind.to_string(),
                        s.created_at.format("%Y-%m-%d %H:%M:%S"),
                        s.size.compressed_bytes,
                        if s.integrity.verified { "verified" } else { "UNVERIFIED" },
                        s.vcs_state.branch,
                        short_commit(&s.vcs_state.commit_id),
                    );
                }
            })
        }

        Commands::Info { id } => {
            let listed = controller.info(&id)?;
            emit(json, &listed, |item| {
                let s = &item.snapshot;
                println!("Snapshot:    {}", s.id);
                println!("Type:        {}", item.kind);
                println!(
                    "Created:     {} by {}@{}",
                    s.created_at.to_rfc3339(),
                    s.created_by,
                    s.hostname
                );
                println!(
                    "VCS:         {} {} ({} uncommitted)",
                    s.vcs_state.branch, s.vcs_state.commit_id, s.vcs_state.uncommitted_change_count
                );
                println!(
                    "Options:     deps={} exclude_large={} compression={}",
                    s.options.include_dependencies,
                    s.options.exclude_large_files,
                    s.options.compression_level
                );
                println!("Size:        {} bytes", s.size.compressed_bytes);
                println!("Checksum:    {}", s.integrity.checksum.as_deref().unwrap_or("-"));
                println!("Verified:    {}", s.integrity.verified);
                for (key, value) in &s.system_state {
                    println!("  {key}: {value}");
                }
            })
        }

        Commands::Verify { id } => {
            let report = controller.verify(&id)?;
            emit(json, &report, |r| {
                for warning in &r.warnings {
                    println!("warning: {warning}");
                }
                match &r.failure {
                    None => println!("Snapshot {} verified", r.snapshot_id),
                    Some(failure) => {
                        println!("Snapshot {} FAILED verification: {failure}", r.snapshot_id)
                    }
                }
            })?;
            match report.failure {
                None => Ok(()),
                Some(VerifyFailure::MissingDirectory) => Err(SnapError::not_found(id)),
                Some(failure) => Err(SnapError::unverified(id, failure.to_string())),
            }
        }

        Commands::Delete { id, force } => {
            controller.delete(&id, force)?;
            emit(json, &serde_json::json!({ "deleted": id.clone() }), |_| {
                println!("Deleted snapshot {id}")
            })
        }

        Commands::Import { dir, force } => {
            let snapshot = controller.import(&dir, force)?;
            emit(json, &snapshot, |s| println!("Imported snapshot {}", s.id))
        }

        Commands::Rollback { id, force, yes } => {
            let options = RollbackOptions {
                force,
                confirmed: yes,
            };
            let checked = controller.rollback(&id, options).await?;
            emit(json, &checked, print_rollback)
        }

        Commands::EmergencyRollback { force } => {
            let checked = controller.emergency_rollback(force).await?;
            emit(json, &checked, print_rollback)
        }

        Commands::Cleanup {
            max_age_days,
            max_count,
            force,
        } => {
            let configured = RetentionPolicy::from(controller.config().retention);
            let policy = RetentionPolicy {
                max_age_days: max_age_days.unwrap_or(configured.max_age_days),
                max_count: max_count.unwrap_or(configured.max_count),
            };
            let report = controller.cleanup(policy, force)?;
            emit(json, &report, |r| {
                for id in &r.reconcile.dangling_entries {
                    println!("Pruned dangling registry entry {id}");
                }
                for dir in &r.reconcile.swept_dirs {
                    println!("Swept {dir}");
                }
                for id in &r.retention.deleted {
                    println!("Deleted snapshot {id}");
                }
                println!("{} snapshot(s) remain", r.retention.remaining);
            })
        }

        Commands::Status => {
            let status = controller.status().await?;
            emit(json, &status, |s| {
                println!("Health score: {}/100 ({})", s.health.score, s.decision.action);
                for check in &s.health.checks {
                    println!(
                        "  {:<15} {:>3}/{:<3} {}",
                        check.name, check.awarded, check.weight, check.detail
                    );
                }
                println!("Snapshots:    {}", s.snapshot_count);
                match &s.last_rollback {
                    Some(record) => println!(
                        "Last rollback: {} to {} at {}",
                        record.outcome,
                        record.target_snapshot_id,
                        record.timestamp.to_rfc3339()
                    ),
                    None => println!("Last rollback: none"),
                }
            })
        }

        Commands::AutoRecovery { force } => {
            let outcome = controller.auto_recovery(force).await?;
            emit(json, &outcome, |o| {
                println!("Health score: {}/100 ({})", o.health.score, o.decision.action);
                match &o.rollback {
                    Some(report) => println!(
                        "Rolled back to {} (safety snapshot {})",
                        report.target_snapshot_id, report.safety_snapshot_id
                    ),
                    None if o.decision.action.wants_rollback() => {
                        println!("Rollback recommended; rerun with --force to execute")
                    }
                    None => {}
                }
                if let Some(post) = &o.post_check {
                    println!("Post-rollback score: {}/100", post.score);
                }
            })
        }

        // Handled before the controller is built.
        Commands::Config => Ok(()),
    }
}

fn print_rollback(checked: &crate::recovery::CheckedRollback) {
    let report = &checked.rollback;
    println!(
        "Rolled back to {} ({} files restored)",
        report.target_snapshot_id, report.files_restored
    );
    println!("Safety snapshot: {}", report.safety_snapshot_id);
    for warning in &report.warnings {
        warn!("{warning}");
        println!("warning: {warning}");
    }
    if let Some(post) = &checked.post_check {
        println!("Post-rollback health score: {}/100", post.score);
    }
}

fn short_commit(commit: &str) -> &str {
    commit.get(..8).unwrap_or(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn parses_rollback_flags() {
        let args = ["snapguard", "--json", "rollback", "baseline", "--force", "-y"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Rollback { id, force, yes } => {
                assert_eq!(id, "baseline");
                assert!(force && yes);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_cleanup_overrides() {
        let args = ["snapguard", "cleanup", "--max-age-days", "3", "--max-count", "2"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cleanup {
                max_age_days: Some(3),
                max_count: Some(2),
                force: false
            }
        ));
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli =
            Cli::try_parse_from(["snapguard", "list", "-vv", "--project", "/srv/app"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.project, Some(PathBuf::from("/srv/app")));
    }

    #[test]
    fn include_large_overrides_the_configured_exclusion() {
        let defaults = SnapshotOptions {
            include_dependencies: false,
            exclude_large_files: true,
            compression_level: 6,
        };
        assert!(!create_options(defaults, false, Some(false), None).exclude_large_files);
        assert!(create_options(defaults, false, None, None).exclude_large_files);

        let lenient = SnapshotOptions {
            exclude_large_files: false,
            ..defaults
        };
        assert!(create_options(lenient, false, Some(true), None).exclude_large_files);
        assert!(!create_options(lenient, false, None, None).exclude_large_files);
    }

    #[test]
    fn large_file_flags_are_mutually_exclusive() {
        let cli = Cli::try_parse_from(["snapguard", "create", "v1", "--include-large"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Create {
                include_large: true,
                exclude_large: false,
                ..
            }
        ));
        let both =
            Cli::try_parse_from(["snapguard", "create", "--include-large", "--exclude-large"]);
        assert!(both.is_err());
    }

    #[test]
    fn recovery_help_mentions_safety_snapshots() {
        let mut command = Cli::command();
        for name in ["emergency-rollback", "auto-recovery"] {
            let help = command
                .find_subcommand_mut(name)
                .unwrap()
                .render_long_help()
                .to_string();
            assert!(help.contains("pre-rollback-*"), "{name}: {help}");
            assert!(help.contains("rollback <id>"), "{name}: {help}");
        }
    }

    #[test]
    fn short_commit_handles_unknown() {
        assert_eq!(short_commit("unknown"), "unknown");
        assert_eq!(short_commit("0123456789abcdef"), "01234567");
    }
}
