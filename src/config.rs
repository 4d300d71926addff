//! Environment-driven configuration.
//!
//! All recognized keys are read once at startup; the resulting `Config` is a
//! passive struct handed to every component. Validation failures map to the
//! process exit codes used by `main`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One of the two storage roots the engine coordinates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Lake,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Lake => "lake",
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Lake,
            Side::Lake => Side::Local,
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "local" => Some(Side::Local),
            "lake" => Some(Side::Lake),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-side settings: the root path and its deletion policy.
#[derive(Debug, Clone)]
pub struct SideConfig {
    pub root: PathBuf,
    /// Whether sync-path deletes (mirror, manual queue delete) are allowed.
    /// Dedupe-initiated deletes ignore this by contract.
    pub allow_delete_from_sync: bool,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub local: SideConfig,
    pub lake: SideConfig,
    pub queue_concurrency: u32,
    pub queue_retry_count: u32,
    pub hash_workers: u32,
    pub app_data_dir: PathBuf,
    pub host: String,
    pub port: u16,
}

/// Configuration errors (exit code 2).
#[derive(Debug)]
pub enum ConfigError {
    MissingKey(&'static str),
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingKey(key) => write!(f, "missing required config key {key}"),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value: v }),
        },
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: v }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Read configuration from the environment.
    ///
    /// Only validates shape here; root existence is checked separately at
    /// startup so it can map to a different exit code.
    pub fn from_env() -> Result<Config, ConfigError> {
        let local_root = std::env::var("LOCAL_MODELS_ROOT")
            .map_err(|_| ConfigError::MissingKey("LOCAL_MODELS_ROOT"))?;
        let lake_root = std::env::var("LAKE_MODELS_ROOT")
            .map_err(|_| ConfigError::MissingKey("LAKE_MODELS_ROOT"))?;

        if let Ok(algo) = std::env::var("HASH_ALGO")
            && !algo.is_empty()
            && algo.to_ascii_lowercase() != "blake3"
        {
            return Err(ConfigError::InvalidValue {
                key: "HASH_ALGO",
                value: algo,
            });
        }

        let app_data_dir = match std::env::var("APP_DATA_DIR") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => default_app_data_dir(),
        };

        let port = match std::env::var("PORT") {
            Ok(v) => v
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key: "PORT", value: v })?,
            Err(_) => 8420,
        };

        let mut queue_concurrency = env_u32("QUEUE_CONCURRENCY", 1)?;
        if queue_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUEUE_CONCURRENCY",
                value: "0".into(),
            });
        }
        if queue_concurrency > 1 {
            log::warn!("QUEUE_CONCURRENCY > 1 is not supported yet, clamping to 1");
            queue_concurrency = 1;
        }

        let hash_workers = env_u32("HASH_WORKERS", 2)?.clamp(1, 16);

        Ok(Config {
            local: SideConfig {
                root: PathBuf::from(local_root),
                allow_delete_from_sync: env_bool("LOCAL_ALLOW_DELETE", false)?,
            },
            lake: SideConfig {
                root: PathBuf::from(lake_root),
                allow_delete_from_sync: env_bool("LAKE_ALLOW_DELETE", false)?,
            },
            queue_concurrency,
            queue_retry_count: env_u32("QUEUE_RETRY_COUNT", 3)?,
            hash_workers,
            app_data_dir,
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port,
        })
    }

    pub fn side(&self, side: Side) -> &SideConfig {
        match side {
            Side::Local => &self.local,
            Side::Lake => &self.lake,
        }
    }

    pub fn root(&self, side: Side) -> &Path {
        &self.side(side).root
    }

    pub fn allow_delete_from_sync(&self, side: Side) -> bool {
        self.side(side).allow_delete_from_sync
    }

    /// Path of the queue database inside the app data directory.
    pub fn queue_db_path(&self) -> PathBuf {
        self.app_data_dir.join("queue.db")
    }

    /// Path of the hash cache database.
    pub fn hash_cache_db_path(&self) -> PathBuf {
        self.app_data_dir.join("hash-cache.db")
    }

    /// Path of the dedupe scan database.
    pub fn dedupe_db_path(&self) -> PathBuf {
        self.app_data_dir.join("dedupe.db")
    }

    /// Directory holding bundle definition files.
    pub fn bundles_dir(&self) -> PathBuf {
        self.app_data_dir.join("bundles")
    }

    /// The source-URL sidecar lives on the Lake root so that every
    /// installation pointed at the same Lake shares it.
    pub fn sources_sidecar_path(&self) -> PathBuf {
        self.lake.root.join(".model_sources.json")
    }
}

fn default_app_data_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".lakesync"),
        _ => PathBuf::from(".lakesync"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var reads are process-global, so construct configs directly where
    // possible and keep the env-based tests to the parsing helpers.

    #[test]
    fn side_parse_and_display() {
        assert_eq!(Side::parse("local"), Some(Side::Local));
        assert_eq!(Side::parse("lake"), Some(Side::Lake));
        assert_eq!(Side::parse("both"), None);
        assert_eq!(Side::Local.to_string(), "local");
        assert_eq!(Side::Lake.other(), Side::Local);
    }

    #[test]
    fn side_serde_round_trip() {
        let json = serde_json::to_string(&Side::Lake).unwrap();
        assert_eq!(json, "\"lake\"");
        let back: Side = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Side::Lake);
    }

    #[test]
    fn db_paths_derive_from_data_dir() {
        let config = Config {
            local: SideConfig {
                root: PathBuf::from("/ssd/models"),
                allow_delete_from_sync: false,
            },
            lake: SideConfig {
                root: PathBuf::from("/nas/models"),
                allow_delete_from_sync: true,
            },
            queue_concurrency: 1,
            queue_retry_count: 3,
            hash_workers: 2,
            app_data_dir: PathBuf::from("/data/lakesync"),
            host: "127.0.0.1".into(),
            port: 8420,
        };
        assert_eq!(config.queue_db_path(), PathBuf::from("/data/lakesync/queue.db"));
        assert_eq!(
            config.sources_sidecar_path(),
            PathBuf::from("/nas/models/.model_sources.json")
        );
        assert!(config.allow_delete_from_sync(Side::Lake));
        assert!(!config.allow_delete_from_sync(Side::Local));
    }
}
