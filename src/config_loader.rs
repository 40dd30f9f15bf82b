use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::{Path, PathBuf};

use crate::config::ControllerConfig;
use crate::errors::SnapResult;

/// File name looked up in the project root when no explicit path is given.
pub const PROJECT_CONFIG_FILE: &str = "snapguard.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "SNAPGUARD_CONFIG";

/// Layered configuration: defaults, user config, project (or explicit) file, environment.
pub fn load_config(
    explicit_path: Option<&Path>,
    project_root: Option<&Path>,
) -> SnapResult<ControllerConfig> {
    let mut figment = Figment::from(Serialized::defaults(ControllerConfig::default()));

    if let Some(user_file) = user_config_file() {
        figment = figment.merge(Toml::file(user_file));
    }

    let file = explicit_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| project_root.unwrap_or(Path::new(".")).join(PROJECT_CONFIG_FILE));

    figment = figment
        .merge(Toml::file(file))
        .merge(Env::prefixed("SNAPGUARD_").split("__"));

    let mut config: ControllerConfig = figment.extract()?;

    // The command line wins over every file and environment layer.
    if let Some(root) = project_root {
        config.project_root = root.to_path_buf();
    }

    config.validate()?;
    Ok(config)
}

fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("snapguard").join("config.toml"))
}

/// Effective configuration rendered as TOML (for `snapguard config`).
pub fn render_toml(config: &ControllerConfig) -> SnapResult<String> {
    toml::to_string_pretty(config).map_err(|e| crate::errors::SnapError::config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            "[retention]\nmax_count = 3\n\n[health]\ncritical_paths = [\"Cargo.toml\"]\n",
        )
        .unwrap();

        let config = load_config(None, Some(dir.path())).unwrap();
        assert_eq!(config.retention.max_count, 3);
        assert_eq!(config.retention.max_age_days, 7);
        assert_eq!(config.health.critical_paths, vec!["Cargo.toml".to_string()]);
        assert_eq!(config.project_root, dir.path());
    }

    #[test]
    fn invalid_weights_are_rejected_at_load() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "[health.weights]\nbuild = 50\n").unwrap();

        assert!(load_config(Some(&file), Some(dir.path())).is_err());
    }

    #[test]
    fn renders_effective_config() {
        let rendered = render_toml(&ControllerConfig::default()).unwrap();
        assert!(rendered.contains("max_age_days = 7"));
    }
}
