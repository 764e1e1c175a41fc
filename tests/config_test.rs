//! Configuration loading: TOML file, environment overrides, validation.

use std::collections::HashMap;

use stash::config::{Config, ServerConfig};
use stash::error::StashError;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> =
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn test_defaults_are_valid() {
    let cfg = Config::default();
    cfg.validate().expect("defaults validate");
    assert_eq!(cfg.storage.expire_secs, 86_400);
    assert_eq!(cfg.server.port, 5000);
    assert!(cfg.server.is_disabled("ls"));
    assert!(!cfg.server.is_disabled("delete"));
}

#[test]
fn test_toml_file_with_partial_sections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stash.toml");
    std::fs::write(
        &path,
        r#"
[storage]
upload_folder = "/srv/stash/files"
expire_secs = 600

[server]
port = 8080
disabled_features = []
"#,
    )
    .unwrap();

    let cfg = Config::from_file(&path).expect("load");
    assert_eq!(cfg.storage.upload_folder.to_str(), Some("/srv/stash/files"));
    assert_eq!(cfg.storage.expire_secs, 600);
    // Unset keys keep their defaults.
    assert_eq!(cfg.storage.staging_max_age_secs, 3_600);
    assert_eq!(cfg.server.port, 8080);
    assert!(cfg.server.disabled_features.is_empty());
    assert_eq!(cfg.server.display_for, ["chrome", "firefox"]);
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[storage\nexpire_secs = ").unwrap();
    assert!(matches!(Config::from_file(&path), Err(StashError::Config(_))));
}

#[test]
fn test_environment_overrides() {
    let mut cfg = Config::default();
    cfg.apply_env(env(&[
        ("UPLOAD_FOLDER", "/data/files"),
        ("TMP_FOLDER", "/data/tmp"),
        ("FILE_LIST", "/data/index.json"),
        ("EXPIRE", " 120 "),
        ("PORT", "9000"),
        ("DISABLED_FEATURE", "ls, delete"),
        ("DISPLAY_FOR", "chrome,,safari "),
    ]))
    .expect("apply");

    assert_eq!(cfg.storage.upload_folder.to_str(), Some("/data/files"));
    assert_eq!(cfg.storage.tmp_folder.to_str(), Some("/data/tmp"));
    assert_eq!(cfg.storage.file_list.to_str(), Some("/data/index.json"));
    assert_eq!(cfg.storage.expire_secs, 120);
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.disabled_features, ["ls", "delete"]);
    assert_eq!(cfg.server.display_for, ["chrome", "safari"]);
    cfg.validate().expect("valid");
}

#[test]
fn test_bad_environment_values() {
    let mut cfg = Config::default();
    assert!(cfg.apply_env(env(&[("EXPIRE", "tomorrow")])).is_err());
    assert!(cfg.apply_env(env(&[("PORT", "99999")])).is_err());
}

#[test]
fn test_validation_rules() {
    let mut cfg = Config::default();
    cfg.storage.expire_secs = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.storage.tmp_folder = cfg.storage.upload_folder.clone();
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.server.disabled_features = vec!["upload".into()];
    assert!(cfg.validate().is_err());
}

#[test]
fn test_prepare_directories_creates_blob_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config::default();
    cfg.storage = stash::config::StorageConfig::under(dir.path());
    cfg.prepare_directories().expect("prepare");
    assert!(dir.path().join("files").is_dir());
    assert!(dir.path().join("tmp").is_dir());

    let mut missing_parent = Config::default();
    missing_parent.storage = stash::config::StorageConfig::under(&dir.path().join("nope"));
    assert!(missing_parent.prepare_directories().is_err());
}

#[test]
fn test_display_for_matches_user_agent_fragments() {
    let server = ServerConfig::default();
    assert!(server.displays_inline_for("Mozilla/5.0 Chrome/120.0 Safari/537.36"));
    assert!(!server.displays_inline_for("curl/8.5.0"));
    assert!(!server.displays_inline_for(""));
}
