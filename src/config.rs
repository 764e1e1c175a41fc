use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Result, StashError};

/// Environment variable naming an optional TOML settings file.
pub const SETTINGS_ENV: &str = "STASH_SETTINGS";

/// Routes that an administrator may switch off.
pub const KNOWN_FEATURES: &[&str] = &["ls", "delete"];

/// Top-level configuration: defaults, then TOML file, then environment.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Everything the storage engine needs. Immutable once the engine is built.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Final blob directory (`UPLOAD_FOLDER`).
    #[serde(default = "default_upload_folder")]
    pub upload_folder: PathBuf,
    /// Staging directory for in-flight uploads (`TMP_FOLDER`).
    /// Must live on the same filesystem as `upload_folder`.
    #[serde(default = "default_tmp_folder")]
    pub tmp_folder: PathBuf,
    /// JSON metadata index (`FILE_LIST`).
    #[serde(default = "default_file_list")]
    pub file_list: PathBuf,
    /// TTL frozen into each new entry (`EXPIRE`).
    #[serde(default = "default_expire")]
    pub expire_secs: u64,
    /// Staged files older than this are abandoned uploads.
    #[serde(default = "default_staging_max_age")]
    pub staging_max_age_secs: u64,
    /// Blobs without an index entry are only reclaimed after this long,
    /// so an upload between blob commit and index insert is left alone.
    #[serde(default = "default_orphan_grace")]
    pub orphan_grace_secs: u64,
    /// Minimum spacing between two housekeeping passes in one process.
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_folder: default_upload_folder(),
            tmp_folder: default_tmp_folder(),
            file_list: default_file_list(),
            expire_secs: default_expire(),
            staging_max_age_secs: default_staging_max_age(),
            orphan_grace_secs: default_orphan_grace(),
            housekeeping_interval_secs: default_housekeeping_interval(),
        }
    }
}

impl StorageConfig {
    /// Lay out all storage paths under a single root. Handy for tests and
    /// throwaway instances.
    pub fn under(root: &Path) -> Self {
        Self {
            upload_folder: root.join("files"),
            tmp_folder: root.join("tmp"),
            file_list: root.join("uploaded_files_jsondb"),
            ..Self::default()
        }
    }
}

/// HTTP collaborator settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Routes switched off by the administrator (`ls`, `delete`).
    #[serde(default = "default_disabled_features")]
    pub disabled_features: Vec<String>,
    /// User-Agent fragments that get files inline instead of as attachment.
    #[serde(default = "default_display_for")]
    pub display_for: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            disabled_features: default_disabled_features(),
            display_for: default_display_for(),
        }
    }
}

impl ServerConfig {
    pub fn is_disabled(&self, feature: &str) -> bool {
        self.disabled_features.iter().any(|f| f == feature)
    }

    pub fn displays_inline_for(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        self.display_for
            .iter()
            .any(|frag| !frag.is_empty() && ua.contains(&frag.to_ascii_lowercase()))
    }
}

fn default_upload_folder() -> PathBuf { PathBuf::from("/opt/stash/files") }
fn default_tmp_folder() -> PathBuf { PathBuf::from("/opt/stash/tmp") }
fn default_file_list() -> PathBuf { PathBuf::from("/opt/stash/uploaded_files_jsondb") }
fn default_expire() -> u64 { 86_400 }
fn default_staging_max_age() -> u64 { 3_600 }
fn default_orphan_grace() -> u64 { 600 }
fn default_housekeeping_interval() -> u64 { 300 }
fn default_bind() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 5000 }
fn default_disabled_features() -> Vec<String> { vec!["ls".into()] }
fn default_display_for() -> Vec<String> { vec!["chrome".into(), "firefox".into()] }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StashError::Config(format!("Cannot read config file: {e}")))?;
        toml::from_str(&content).map_err(|e| StashError::Config(format!("Invalid TOML: {e}")))
    }

    /// Full startup load: defaults, then the optional settings file
    /// (explicit path or `STASH_SETTINGS`), then process environment
    /// overrides, then validation. An environment variable that is set
    /// always wins over the same key in the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(SETTINGS_ENV).map(PathBuf::from));

        let mut config = match settings {
            Some(p) => {
                info!(path = ?p, "Loading settings file");
                Self::from_file(&p)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `UPLOAD_FOLDER`-style overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("UPLOAD_FOLDER") {
            self.storage.upload_folder = PathBuf::from(v);
        }
        if let Some(v) = lookup("TMP_FOLDER") {
            self.storage.tmp_folder = PathBuf::from(v);
        }
        if let Some(v) = lookup("FILE_LIST") {
            self.storage.file_list = PathBuf::from(v);
        }
        if let Some(v) = lookup("EXPIRE") {
            self.storage.expire_secs = v
                .trim()
                .parse()
                .map_err(|e| StashError::Config(format!("EXPIRE must be an integer: {e}")))?;
        }
        if let Some(v) = lookup("BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = v
                .trim()
                .parse()
                .map_err(|e| StashError::Config(format!("PORT must be a port number: {e}")))?;
        }
        if let Some(v) = lookup("DISABLED_FEATURE") {
            self.server.disabled_features = split_list(&v);
        }
        if let Some(v) = lookup("DISPLAY_FOR") {
            self.server.display_for = split_list(&v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.storage;
        if s.expire_secs == 0 {
            return Err(StashError::Config("expire_secs must be > 0".into()));
        }
        for (name, path) in [
            ("upload_folder", &s.upload_folder),
            ("tmp_folder", &s.tmp_folder),
            ("file_list", &s.file_list),
        ] {
            if path.as_os_str().is_empty() {
                return Err(StashError::Config(format!("{name} must not be empty")));
            }
        }
        if s.upload_folder == s.tmp_folder {
            return Err(StashError::Config(
                "upload_folder and tmp_folder must be different directories".into(),
            ));
        }
        for feature in &self.server.disabled_features {
            if !KNOWN_FEATURES.contains(&feature.as_str()) {
                return Err(StashError::Config(format!(
                    "Unknown feature '{feature}' in disabled_features"
                )));
            }
        }
        Ok(())
    }

    /// Startup directory check: parents must exist, blob and staging
    /// directories are created on demand and must share a filesystem.
    pub fn prepare_directories(&self) -> Result<()> {
        let s = &self.storage;
        for path in [&s.upload_folder, &s.tmp_folder, &s.file_list] {
            let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(parent) = parent {
                if !parent.is_dir() {
                    return Err(StashError::Config(format!(
                        "'{}' doesn't exist or is not a directory",
                        parent.display()
                    )));
                }
            }
        }

        for dir in [&s.upload_folder, &s.tmp_folder] {
            if dir.is_dir() {
                continue;
            }
            warn!(path = ?dir, "Directory doesn't exist, creating");
            std::fs::create_dir_all(dir).map_err(|e| {
                StashError::Config(format!("Cannot create {}: {e}", dir.display()))
            })?;
        }

        same_filesystem(&s.upload_folder, &s.tmp_folder)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(unix)]
fn same_filesystem(a: &Path, b: &Path) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let dev = |p: &Path| {
        std::fs::metadata(p)
            .map(|m| m.dev())
            .map_err(|e| StashError::Config(format!("Cannot stat {}: {e}", p.display())))
    };
    if dev(a)? != dev(b)? {
        return Err(StashError::Config(format!(
            "{} and {} must be on the same filesystem",
            a.display(),
            b.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn same_filesystem(_a: &Path, _b: &Path) -> Result<()> {
    Ok(())
}
