use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub dbupgrade: String,
    /// Log to files in this directory instead of stderr
    pub directory: Option<PathBuf>,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DBUPGRADE_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            dbupgrade: Self::DBUPGRADE_LEVEL.to_string(),
            directory: None,
        }
    }

    /// flexi_logger spec for this crate
    pub fn log_spec(&self) -> String {
        format!("warn, dbupgrade={}", self.dbupgrade)
    }

    fn ensure_valid(&mut self) {
        let str_original = self.dbupgrade.clone();
        self.dbupgrade = self.dbupgrade.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.dbupgrade.as_str()) {
            eprintln!(
                "Config error: dbupgrade log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::DBUPGRADE_LEVEL
            );
            self.dbupgrade = Self::DBUPGRADE_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpgradeConfig {
    /// Upgrade definition file, relative to the working directory
    pub file: PathBuf,
    pub target: Option<String>,
    pub downgrade_allowed: bool,
    /// Write a history entry for every statement, not only for failures and versions
    pub log_statements: bool,
}

impl UpgradeConfig {
    fn default() -> Self {
        UpgradeConfig {
            file: PathBuf::from("upgrade.sql"),
            target: None,
            downgrade_allowed: false,
            log_statements: true,
        }
    }

    fn ensure_valid(&mut self) {
        if let Some(target) = &self.target {
            if target.trim().is_empty() {
                eprintln!("Config error: empty upgrade target - ignoring it");
                self.target = None;
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub name: String,
    pub path: PathBuf,
    pub user: Option<String>,
    #[serde(default = "ConnectionConfig::default_create")]
    pub create: bool,
    #[serde(default = "ConnectionConfig::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl ConnectionConfig {
    fn default_create() -> bool {
        true
    }

    fn default_busy_timeout_ms() -> u64 {
        5000
    }

    fn default() -> Self {
        ConnectionConfig {
            name: crate::database::DEFAULT_DATABASE.to_owned(),
            path: PathBuf::from("database.db"),
            user: None,
            create: Self::default_create(),
            busy_timeout_ms: Self::default_busy_timeout_ms(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub interval_ms: u64,
    /// Give up connecting after this long; no retries when absent
    pub max_duration_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            interval_ms: 1000,
            max_duration_secs: None,
        }
    }
}

impl RetryConfig {
    const MIN_INTERVAL_MS: u64 = 10;

    fn ensure_valid(&mut self) {
        if self.interval_ms < Self::MIN_INTERVAL_MS {
            eprintln!(
                "Config error: retry interval of {}ms is too small - using {}ms",
                self.interval_ms,
                Self::MIN_INTERVAL_MS
            );
            self.interval_ms = Self::MIN_INTERVAL_MS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub upgrade: UpgradeConfig,
    pub database: ConnectionConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Values visible to `IF SCRIPT` conditions
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            upgrade: UpgradeConfig::default(),
            database: ConnectionConfig::default(),
            connections: Vec::new(),
            retry: RetryConfig::default(),
            variables: BTreeMap::new(),
        }
    }
}

impl Config {
    const ENV_PREFIX: &str = "DBUPGRADE_";

    /// Loads the configuration from `config.toml` in the app's config directory.
    /// If the file is missing it is created with the defaults.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.config_dir().join("config.toml");
        let default_config = Config::default();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        Self::load_from(&config_path)
    }

    /// Defaults, merged with the TOML file (if it exists), merged with `DBUPGRADE_`
    /// environment variables (`__` separates nested keys).
    pub fn load_from(config_path: &Path) -> Self {
        let default_config = Config::default();

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        // Attempt to extract the configuration; on error, log a message and fall back to defaults.
        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.upgrade.ensure_valid();
        self.retry.ensure_valid();
    }
}
