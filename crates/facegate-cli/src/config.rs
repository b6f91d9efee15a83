use std::path::{Path, PathBuf};
use std::time::Duration;

use facegate_core::{FaceSelection, Tolerance};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Runtime configuration: an optional TOML file named by `FACEGATE_CONFIG`,
/// overridden by `FACEGATE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match (exclusive).
    pub tolerance: Tolerance,
    /// Timeout in seconds for one feature extraction.
    pub extract_timeout_secs: u64,
    /// Which face to use when an image holds several.
    pub face_selection: FaceSelection,
    /// Passphrase for at-rest encryption of feature vectors.
    pub store_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir(|k| std::env::var(k).ok()).join("faces.db"),
            tolerance: Tolerance::default(),
            extract_timeout_secs: 10,
            face_selection: FaceSelection::default(),
            store_key: None,
        }
    }
}

impl Config {
    /// Load from the file named by `FACEGATE_CONFIG` (if set), then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|k| std::env::var(k).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `FACEGATE_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("FACEGATE_TOLERANCE") {
            match raw.parse::<f32>().ok().and_then(|v| Tolerance::new(v).ok()) {
                Some(t) => self.tolerance = t,
                None => tracing::warn!(value = %raw, "ignoring invalid FACEGATE_TOLERANCE"),
            }
        }
        if let Some(raw) = lookup("FACEGATE_EXTRACT_TIMEOUT_SECS") {
            match raw.parse() {
                Ok(secs) => self.extract_timeout_secs = secs,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid FACEGATE_EXTRACT_TIMEOUT_SECS"),
            }
        }
        if let Some(raw) = lookup("FACEGATE_FACE_SELECTION") {
            match raw.parse() {
                Ok(policy) => self.face_selection = policy,
                Err(err) => tracing::warn!(error = %err, "ignoring invalid FACEGATE_FACE_SELECTION"),
            }
        }
        if let Some(key) = lookup("FACEGATE_STORE_KEY").filter(|k| !k.is_empty()) {
            self.store_key = Some(key);
        }
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

fn default_data_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}
