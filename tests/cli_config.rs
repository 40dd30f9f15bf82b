use clap::Parser;
use std::fs;
use tempfile::TempDir;

use snapguard::cli::{dispatch, Cli};
use snapguard::config_loader::{load_config, render_toml, PROJECT_CONFIG_FILE};
use snapguard::{CancelToken, ControllerConfig, SnapError};

fn project_with_config(toml: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("package.json"), "{}").unwrap();
    fs::write(dir.path().join(PROJECT_CONFIG_FILE), toml).unwrap();
    dir
}

fn cli(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("snapguard").chain(args.iter().copied())).unwrap()
}

#[test]
fn explicit_file_replaces_project_file() {
    let dir = project_with_config("[retention]\nmax_count = 4\n");
    let explicit = dir.path().join("ci.toml");
    let toml = "[retention]\nmax_count = 2\n[snapshot]\ncompression_level = 9\n";
    fs::write(&explicit, toml).unwrap();

    let config = load_config(Some(&explicit), Some(dir.path())).unwrap();

    assert_eq!(config.retention.max_count, 2);
    assert_eq!(config.snapshot.compression_level, 9);
}

#[test]
fn rendered_config_parses_back() {
    let dir = project_with_config("[health]\nsecurity_partial_credit = 5\n");
    let config = load_config(None, Some(dir.path())).unwrap();

    let rendered = render_toml(&config).unwrap();
    let reparsed: ControllerConfig = toml::from_str(&rendered).unwrap();

    assert_eq!(reparsed.health.security_partial_credit, 5);
    assert_eq!(reparsed.health.weights, config.health.weights);
    assert_eq!(reparsed.snapshots_dir, config.snapshots_dir);
}

#[test]
fn out_of_range_compression_is_a_config_error() {
    let dir = project_with_config("[snapshot]\ncompression_level = 12\n");
    let err = load_config(None, Some(dir.path())).unwrap_err();
    assert!(matches!(err, SnapError::Config { .. }));
    assert_eq!(err.exit_code(), 12);
}

#[tokio::test]
async fn dispatch_runs_create_verify_and_reports_missing_ids() {
    let dir = project_with_config("[retention]\nmax_count = 5\n");
    let project = dir.path().to_str().unwrap().to_string();

    let run = |args: &[&str]| {
        let mut full = vec!["--json", "--project", project.as_str()];
        full.extend_from_slice(args);
        dispatch(cli(&full), CancelToken::new())
    };

    run(&["create", "release-1"]).await.unwrap();
    run(&["verify", "release-1"]).await.unwrap();
    assert!(dir.path().join(".snapshots/release-1/project.zip").is_file());

    let missing = run(&["verify", "ghost"]).await.unwrap_err();
    assert!(matches!(missing, SnapError::NotFound { .. }));
    assert_eq!(missing.exit_code(), 2);

    // --json runs are non-interactive, so deletion needs --force.
    let declined = run(&["delete", "release-1"]).await.unwrap_err();
    assert_eq!(declined.exit_code(), 10);
    run(&["delete", "release-1", "--force"]).await.unwrap();
    assert!(!dir.path().join(".snapshots/release-1").exists());
}
