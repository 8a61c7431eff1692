use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use atlas_registry::config::loader::{
    apply_env_overrides, parse_settings, ENV_ASSET_ROOT, ENV_DATABASE,
};
use atlas_registry::config::{load_settings, Settings};
use atlas_registry::connector::ExternalFetcher;
use atlas_registry::state::kinds::*;
use atlas_registry::state::models::*;
use atlas_registry::{Registry, RegistryError};
use tempfile::TempDir;

#[test]
fn test_parse_valid_settings() {
    let yaml = r#"
database_path: "/var/lib/atlas/registry.db"
asset_root: "assets"
conflict_retries: 5
approved_domains:
  ons: "https://api.ons.gov.uk/v1/"
  boe: "https://www.bankofengland.co.uk"
"#;
    let settings = parse_settings(yaml).unwrap();
    assert_eq!(settings.database_path, PathBuf::from("/var/lib/atlas/registry.db"));
    assert_eq!(settings.asset_root, PathBuf::from("assets"));
    assert_eq!(settings.conflict_retries, 5);
    // Unset keys keep their defaults
    assert_eq!(settings.busy_timeout_ms, 5_000);
    assert_eq!(settings.http_timeout_secs, 30);
    assert_eq!(settings.approved_domains.len(), 2);
    assert_eq!(settings.approved_domains["boe"], "https://www.bankofengland.co.uk");
}

#[test]
fn test_empty_settings_use_defaults() {
    let settings = parse_settings("").unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.database_path, PathBuf::from(".atlas/registry.db"));
    assert_eq!(settings.asset_root, PathBuf::from(".atlas/environments"));
}

#[test]
fn test_invalid_settings_are_rejected() {
    assert!(parse_settings("http_timeout_secs: 0").is_err());
    assert!(parse_settings("conflict_retries: lots").is_err());
    assert!(parse_settings("approved_domains: [a, b]").is_err());
}

#[test]
fn test_env_overrides_replace_paths() {
    let vars: BTreeMap<&str, &str> = [(ENV_DATABASE, "/tmp/other.db"), (ENV_ASSET_ROOT, "")]
        .into_iter()
        .collect();
    let settings = apply_env_overrides(Settings::default(), |key| {
        vars.get(key).map(|v| v.to_string())
    });
    assert_eq!(settings.database_path, PathBuf::from("/tmp/other.db"));
    // Empty values are ignored
    assert_eq!(settings.asset_root, PathBuf::from(".atlas/environments"));
}

#[test]
fn test_relative_paths_resolve_against_working_dir() {
    let settings = Settings {
        database_path: PathBuf::from("/abs/registry.db"),
        ..Settings::default()
    }
    .rooted_at(Path::new("/srv/atlas"));
    assert_eq!(settings.database_path, PathBuf::from("/abs/registry.db"));
    assert_eq!(settings.asset_root, PathBuf::from("/srv/atlas/.atlas/environments"));
}

#[test]
fn test_load_settings_from_working_dir() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("atlas.yaml"), "asset_root: files\n").unwrap();

    let settings = load_settings(None, dir.path()).unwrap();
    assert_eq!(settings.asset_root, dir.path().join("files"));

    let missing = dir.path().join("nope.yaml");
    let err = load_settings(Some(&missing), dir.path()).unwrap_err();
    assert!(err.to_string().contains("Config not found"));
}

async fn external_blueprint(domain: &str, specifier: &str) -> Blueprint {
    let dir = TempDir::new().unwrap();
    let registry = Registry::in_memory(dir.path().join("assets")).await.unwrap();
    let mut bp = NewBlueprint::new("cpi", "Consumer prices", Stage::DataInputs, ".json");
    bp.source_type = Some(SourceType::ExternalConnection);
    bp.source_name = Some(domain.into());
    bp.source_specifier = Some(specifier.into());
    registry
        .create_blueprint(&Actor::new("root", Role::Admin), &bp)
        .await
        .unwrap()
}

fn fetcher() -> ExternalFetcher {
    let domains = [
        ("ons".to_string(), "https://api.ons.gov.uk/v1/".to_string()),
        ("local".to_string(), "http://127.0.0.1:9".to_string()),
    ]
    .into_iter()
    .collect();
    ExternalFetcher::new(domains, Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_external_url_joins_base_and_specifier() {
    let bp = external_blueprint("ons", "/timeseries/d7g7/data").await;
    let url = fetcher().resolve_url(&bp).unwrap();
    assert_eq!(url, "https://api.ons.gov.uk/v1/timeseries/d7g7/data");
}

#[tokio::test]
async fn test_unapproved_domain_is_refused() {
    let bp = external_blueprint("pastebin", "raw/abc").await;
    let err = fetcher().resolve_url(&bp).unwrap_err();
    assert!(matches!(err, RegistryError::Permission(_)));

    let err = fetcher().fetch(&bp).await.unwrap_err();
    assert!(matches!(err, RegistryError::Permission(_)));
}

#[tokio::test]
async fn test_internal_blueprint_cannot_be_fetched() {
    let dir = TempDir::new().unwrap();
    let registry = Registry::in_memory(dir.path().join("assets")).await.unwrap();
    let bp = registry
        .create_blueprint(
            &Actor::new("root", Role::Admin),
            &NewBlueprint::new("manual", "Manual upload", Stage::DataInputs, ".csv"),
        )
        .await
        .unwrap();
    let err = fetcher().resolve_url(&bp).unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));
}

#[tokio::test]
async fn test_unreachable_source_is_an_http_error() {
    let bp = external_blueprint("local", "data.json").await;
    let err = fetcher().fetch(&bp).await.unwrap_err();
    assert!(matches!(err, RegistryError::Http(_)), "{err}");
    assert_eq!(err.code(), "HTTP_ERROR");
}

#[test]
fn test_external_connection_needs_domain_and_specifier() {
    tokio_test::block_on(async {
        let dir = TempDir::new().unwrap();
        let registry = Registry::in_memory(dir.path().join("assets")).await.unwrap();
        let mut bp = NewBlueprint::new("cpi", "Consumer prices", Stage::DataInputs, ".json");
        bp.source_type = Some(SourceType::ExternalConnection);
        bp.source_name = Some("ons".into());
        let err = registry
            .create_blueprint(&Actor::new("root", Role::Admin), &bp)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    });
}
