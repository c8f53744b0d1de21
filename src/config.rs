//! # Configuration
//!
//! Handles loading, parsing, and validation of TOML configuration files.
//! Searches multiple standard locations with a well-defined priority order,
//! then validates all paths, exclusion patterns, and backend bindings
//! before returning.

use crate::error::{ConfigError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{env, fs};

/// Top-level configuration structure: global settings plus a named map of
/// backup sets.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    pub backups: BTreeMap<String, BackupSetConfig>,
}

/// Global settings not specific to any one backup set.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    /// Log verbosity passed to the tracing subscriber unless overridden by
    /// `--log-level`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Named backup set configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackupSetConfig {
    /// Path to the RSA-4096 private key PEM file. Required when
    /// `options.use_encryption` is true.
    pub private_key_filename: Option<PathBuf>,

    /// Regular expressions matched against the absolute path; a path is
    /// excluded if any pattern matches.
    #[serde(default)]
    pub exclusions: Vec<String>,

    /// Root directories walked by the Snapshotter.
    pub directories: Vec<PathBuf>,

    /// Storage backend binding.
    pub protocol: BackendConfig,

    /// Per-set tunables.
    #[serde(default)]
    pub options: BackupOptions,
}

impl BackupSetConfig {
    /// Compiles `exclusions` into regexes, surfacing the offending pattern
    /// on failure rather than a bare parser error.
    pub fn compiled_exclusions(&self, set_name: &str) -> Result<Vec<Regex>> {
        self.exclusions
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| {
                    ConfigError::InvalidExclusion {
                        name: set_name.to_string(),
                        pattern: pattern.clone(),
                        source,
                    }
                    .into()
                })
            })
            .collect()
    }
}

/// Storage backend binding for a backup set.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Plain filesystem directory, stage-then-rename publishes.
    Local { location: PathBuf },
    /// Any `object_store`-supported remote bucket.
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        region: Option<String>,
        endpoint: Option<String>,
    },
}

/// Per-set tunables.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackupOptions {
    /// Number of manifest versions retained per set; 0 means unlimited.
    #[serde(default = "default_max_manifest_versions")]
    pub max_manifest_versions: usize,

    /// Whether blobs are encrypted under the set's RSA public key.
    #[serde(default)]
    pub use_encryption: bool,

    /// Whether blobs are compressed before (optional) encryption.
    #[serde(default = "default_true")]
    pub use_compression: bool,

    /// Compression algorithm used when `use_compression` is set.
    #[serde(default = "default_compression")]
    pub compression: CompressionKind,

    /// Zstd compression level (1-22), ignored for other algorithms.
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,

    /// Size-heuristic margin a patch must beat to be kept over a fresh base
    /// blob.
    #[serde(default = "default_diff_margin")]
    pub diff_margin: f64,

    /// File-count checkpoint interval for manifest commits during a run.
    /// 0 disables file-count checkpointing.
    #[serde(default = "default_checkpoint_files")]
    pub checkpoint_every_files: usize,

    /// Elapsed-time checkpoint interval in seconds.
    #[serde(default = "default_checkpoint_secs")]
    pub checkpoint_every_secs: u64,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            max_manifest_versions: default_max_manifest_versions(),
            use_encryption: false,
            use_compression: default_true(),
            compression: default_compression(),
            zstd_level: default_zstd_level(),
            diff_margin: default_diff_margin(),
            checkpoint_every_files: default_checkpoint_files(),
            checkpoint_every_secs: default_checkpoint_secs(),
        }
    }
}

/// Supported compression backends.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Zstd,
    Gzip,
    None,
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionKind::Zstd => write!(f, "zstd"),
            CompressionKind::Gzip => write!(f, "gzip"),
            CompressionKind::None => write!(f, "none"),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}
fn default_true() -> bool {
    true
}
fn default_compression() -> CompressionKind {
    CompressionKind::Zstd
}
fn default_zstd_level() -> i32 {
    3
}
fn default_max_manifest_versions() -> usize {
    10
}
fn default_diff_margin() -> f64 {
    crate::diff::DEFAULT_DIFF_MARGIN
}
fn default_checkpoint_files() -> usize {
    500
}
fn default_checkpoint_secs() -> u64 {
    60
}

/// Standard configuration file search paths, in descending priority order.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/vaultkeep.toml")];
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!("{home}/.config/vaultkeep.toml")));
    }
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(format!("{xdg}/vaultkeep.toml")));
    }
    paths.push(PathBuf::from("vaultkeep.toml"));
    paths
}

/// Loads configuration from the first found config file in the search path.
pub fn load_config() -> Result<Config> {
    let search = config_search_paths();

    for path in &search {
        if path.exists() {
            return load_config_from(path);
        }
    }

    Err(ConfigError::NotFound { searched: search }.into())
}

/// Loads and validates configuration from a specific file path.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;

    let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse { source: e })?;

    validate_config(&config)?;
    Ok(config)
}

/// Validates configuration invariants after parsing.
fn validate_config(config: &Config) -> std::result::Result<(), ConfigError> {
    if config.backups.is_empty() {
        return Err(ConfigError::Validation {
            message: "at least one [backups.*] set must be defined".to_string(),
        });
    }

    for (name, set) in &config.backups {
        if set.directories.is_empty() {
            return Err(ConfigError::Validation {
                message: format!("backup set '{name}' has no directories configured"),
            });
        }

        for dir in &set.directories {
            if !dir.exists() {
                return Err(ConfigError::MissingSource {
                    name: name.clone(),
                    path: dir.clone(),
                });
            }
        }

        for pattern in &set.exclusions {
            if let Err(source) = Regex::new(pattern) {
                return Err(ConfigError::InvalidExclusion {
                    name: name.clone(),
                    pattern: pattern.clone(),
                    source,
                });
            }
        }

        if set.options.use_encryption && set.private_key_filename.is_none() {
            return Err(ConfigError::Validation {
                message: format!(
                    "backup set '{name}' has use_encryption=true but no private_key_filename"
                ),
            });
        }

        if set.options.zstd_level < 1 || set.options.zstd_level > 22 {
            return Err(ConfigError::Validation {
                message: format!(
                    "backup set '{name}': zstd_level must be between 1 and 22, got {}",
                    set.options.zstd_level
                ),
            });
        }
    }

    Ok(())
}

/// Generates a default configuration file at the given path.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(anyhow::anyhow!("config file already exists: {}", path.display()).into());
    }

    let config = Config {
        settings: Settings::default(),
        backups: BTreeMap::from([(
            "documents".to_string(),
            BackupSetConfig {
                private_key_filename: None,
                exclusions: vec![r".*\.tmp$".to_string(), r".*/\.git/.*".to_string()],
                directories: vec![PathBuf::from("/home/user/Documents")],
                protocol: BackendConfig::Local {
                    location: PathBuf::from("/backup/documents"),
                },
                options: BackupOptions::default(),
            },
        )]),
    };

    let toml_str = toml::to_string_pretty(&config)
        .map_err(|e| anyhow::anyhow!("failed to serialize config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml_str)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml(dir: &Path) -> String {
        format!(
            r#"
            [settings]
            log_level = "info"

            [backups.docs]
            directories = ["{}"]
            exclusions = [".*\\.tmp$"]

            [backups.docs.protocol]
            type = "local"
            location = "/tmp/vaultkeep-store"

            [backups.docs.options]
            use_encryption = false
            "#,
            dir.display()
        )
    }

    #[test]
    fn parses_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let toml_str = sample_toml(dir.path());
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.settings.log_level, "info");
        let set = &config.backups["docs"];
        assert_eq!(set.options.max_manifest_versions, 10);
        assert!(!set.options.use_encryption);
        matches!(set.protocol, BackendConfig::Local { .. });
    }

    #[test]
    fn validation_rejects_missing_directory() {
        let mut backups = BTreeMap::new();
        backups.insert(
            "bad".to_string(),
            BackupSetConfig {
                private_key_filename: None,
                exclusions: vec![],
                directories: vec![PathBuf::from("/does/not/exist/vaultkeep")],
                protocol: BackendConfig::Local {
                    location: PathBuf::from("/tmp/x"),
                },
                options: BackupOptions::default(),
            },
        );
        let config = Config {
            settings: Settings::default(),
            backups,
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn validation_rejects_bad_exclusion_regex() {
        let dir = tempfile::tempdir().unwrap();
        let mut backups = BTreeMap::new();
        backups.insert(
            "bad".to_string(),
            BackupSetConfig {
                private_key_filename: None,
                exclusions: vec!["(unterminated".to_string()],
                directories: vec![dir.path().to_path_buf()],
                protocol: BackendConfig::Local {
                    location: PathBuf::from("/tmp/x"),
                },
                options: BackupOptions::default(),
            },
        );
        let config = Config {
            settings: Settings::default(),
            backups,
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn validation_requires_key_when_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let mut backups = BTreeMap::new();
        let mut options = BackupOptions::default();
        options.use_encryption = true;
        backups.insert(
            "bad".to_string(),
            BackupSetConfig {
                private_key_filename: None,
                exclusions: vec![],
                directories: vec![dir.path().to_path_buf()],
                protocol: BackendConfig::Local {
                    location: PathBuf::from("/tmp/x"),
                },
                options,
            },
        );
        let config = Config {
            settings: Settings::default(),
            backups,
        };
        assert!(validate_config(&config).is_err());
    }
}
