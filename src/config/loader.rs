use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::types::Settings;

pub const DEFAULT_CONFIG_FILE: &str = "atlas.yaml";
pub const ENV_DATABASE: &str = "ATLAS_DB";
pub const ENV_ASSET_ROOT: &str = "ATLAS_ASSET_ROOT";

/// Load settings for a registry rooted at `working_dir`.
///
/// - If `config_path` is given it must exist.
/// - Otherwise `atlas.yaml` in `working_dir` is used when present, defaults if not.
/// - `ATLAS_DB` and `ATLAS_ASSET_ROOT` override the file.
/// - Relative paths are resolved against `working_dir`.
pub fn load_settings(config_path: Option<&Path>, working_dir: &Path) -> Result<Settings> {
    let settings = match config_path {
        Some(path) => {
            if !path.is_file() {
                bail!("Config not found: '{}'", path.display());
            }
            read_settings(path)?
        }
        None => {
            let default = working_dir.join(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                read_settings(&default)?
            } else {
                tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                Settings::default()
            }
        }
    };

    Ok(apply_env_overrides(settings, |key| std::env::var(key).ok()).rooted_at(working_dir))
}

/// Parse settings from YAML text. An empty document yields the defaults.
pub fn parse_settings(content: &str) -> Result<Settings> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings: Settings =
        serde_yaml::from_str(content).context("Failed to parse YAML settings")?;
    if settings.http_timeout_secs == 0 {
        bail!("http_timeout_secs must be greater than zero");
    }
    Ok(settings)
}

/// Applies `ATLAS_DB` / `ATLAS_ASSET_ROOT` from `lookup`.
pub fn apply_env_overrides<F>(mut settings: Settings, lookup: F) -> Settings
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(db) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
        settings.database_path = PathBuf::from(db);
    }
    if let Some(root) = lookup(ENV_ASSET_ROOT).filter(|v| !v.is_empty()) {
        settings.asset_root = PathBuf::from(root);
    }
    settings
}

fn read_settings(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_settings(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}
