//! Configuration management.

mod database;

pub use database::{
    ConfigFileDatabase, DEFAULT_WAIT_DOWN, DbConfig, MAX_OVERFLOW_SQL_SIZE, MIN_OVERFLOW_SQL_SIZE,
    TlsConnectMode, TlsSettings, clamp_overflow_size,
};

use serde::Deserialize;
use std::path::Path;

/// Main configuration for dbhigh.
#[derive(Debug, Clone, Default)]
pub struct DbHighConfig {
    /// Database connection settings.
    pub database: DbConfig,
    /// Observability settings.
    pub observability: ObservabilitySettings,
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Database section.
    pub database: Option<ConfigFileDatabase>,
    /// Logging section.
    pub logging: Option<LoggingSettings>,
    /// Metrics section.
    pub metrics: Option<MetricsSettings>,
}

/// Observability settings from the config file.
#[derive(Debug, Clone, Default)]
pub struct ObservabilitySettings {
    /// Logging settings.
    pub logging: Option<LoggingSettings>,
    /// Metrics settings.
    pub metrics: Option<MetricsSettings>,
}

/// Logging section in config file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSettings {
    /// Output format: `pretty` or `json`.
    pub format: Option<String>,
    /// Filter directive, e.g. `info` or `dbhigh=debug`.
    pub level: Option<String>,
    /// Log file path; logs go to stderr when unset.
    pub file: Option<String>,
}

/// Metrics section in config file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsSettings {
    /// Whether metrics are recorded.
    pub enabled: Option<bool>,
    /// Prometheus listener port.
    pub port: Option<u16>,
}

impl DbHighConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or names an
    /// unknown engine.
    pub fn load_from_file(path: &Path) -> crate::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| crate::Error::OperationFailed {
                operation: "read_config_file".to_string(),
                cause: format!("{}: {e}", path.display()),
            })?;

        Self::parse(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration.
    pub fn parse(contents: &str) -> crate::Result<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| crate::Error::OperationFailed {
                operation: "parse_config_file".to_string(),
                cause: e.to_string(),
            })?;

        Self::from_config_file(file)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir (`~/.config/dbhigh/config.toml` on Linux)
    /// 2. `/etc/dbhigh/config.toml`
    ///
    /// Returns default configuration if no config file is found.
    #[must_use]
    pub fn load_default() -> Self {
        let mut candidates = Vec::new();
        if let Some(base_dirs) = directories::BaseDirs::new() {
            candidates.push(base_dirs.config_dir().join("dbhigh").join("config.toml"));
        }
        candidates.push(Path::new("/etc/dbhigh/config.toml").to_path_buf());

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring config file");
                },
            }
        }

        Self::default()
    }

    fn from_config_file(file: ConfigFile) -> crate::Result<Self> {
        let database = match file.database {
            Some(database) => DbConfig::from_config_file(database)?,
            None => DbConfig::default(),
        };

        Ok(Self {
            database,
            observability: ObservabilitySettings {
                logging: file.logging,
                metrics: file.metrics,
            },
        })
    }

    /// Applies environment variable overrides to every section.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        self.database = self.database.with_env_overrides();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Dialect;
    use std::io::Write;

    #[test]
    fn test_parse_full_file() {
        let config = DbHighConfig::parse(
            r#"
            [database]
            engine = "sqlite"
            name = "/var/lib/dbhigh/zabbix.db"
            max_overflow_sql_size = 100

            [logging]
            format = "json"
            level = "debug"

            [metrics]
            enabled = true
            port = 9100
            "#,
        )
        .unwrap();

        assert_eq!(config.database.engine, Dialect::Sqlite);
        assert_eq!(config.database.name, "/var/lib/dbhigh/zabbix.db");
        assert_eq!(config.database.max_overflow_sql_size, MIN_OVERFLOW_SQL_SIZE);
        let logging = config.observability.logging.unwrap();
        assert_eq!(logging.format.as_deref(), Some("json"));
        assert_eq!(config.observability.metrics.unwrap().port, Some(9100));
    }

    #[test]
    fn test_parse_empty_file_uses_defaults() {
        let config = DbHighConfig::parse("").unwrap();
        assert_eq!(config.database.engine, Dialect::Sqlite);
        assert!(config.observability.logging.is_none());
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(DbHighConfig::parse("[database").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\nengine = \"postgresql\"\nname = \"zabbix\"").unwrap();
        let config = DbHighConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.database.engine, Dialect::PostgreSql);
        assert_eq!(config.database.name, "zabbix");
    }

    #[test]
    fn test_load_missing_file() {
        let err = DbHighConfig::load_from_file(Path::new("/nonexistent/dbhigh.toml")).unwrap_err();
        assert!(err.to_string().contains("read_config_file"));
    }
}
