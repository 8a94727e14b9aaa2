//! Database connection configuration.

use crate::db::Dialect;
use crate::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default pause between reconnect attempts while the database is down.
pub const DEFAULT_WAIT_DOWN: Duration = Duration::from_secs(10);

/// Upper bound (and default) for accumulated SQL text before it is flushed.
pub const MAX_OVERFLOW_SQL_SIZE: usize = 262_144;

/// Lower bound for the overflow flush threshold.
pub const MIN_OVERFLOW_SQL_SIZE: usize = 1024;

/// TLS connect mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsConnectMode {
    /// Encrypt, do not verify the server certificate.
    Required,
    /// Encrypt and verify the certificate chain against the CA file.
    VerifyCa,
    /// Encrypt, verify the chain and the server host name.
    VerifyFull,
}

impl TlsConnectMode {
    /// Parses a connect mode value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "required" => Some(Self::Required),
            "verify_ca" => Some(Self::VerifyCa),
            "verify_full" => Some(Self::VerifyFull),
            _ => None,
        }
    }

    /// Returns the configuration spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::VerifyCa => "verify_ca",
            Self::VerifyFull => "verify_full",
        }
    }

    /// Whether the server certificate must be verified.
    #[must_use]
    pub const fn verifies(self) -> bool {
        matches!(self, Self::VerifyCa | Self::VerifyFull)
    }
}

/// TLS material as configured.
///
/// Values are kept verbatim so that defined-but-empty parameters can be
/// rejected by [`DbConfig::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TlsSettings {
    /// Connect mode: `required`, `verify_ca` or `verify_full`.
    pub connect: Option<String>,
    /// CA certificate file.
    pub ca_file: Option<PathBuf>,
    /// Client certificate file.
    pub cert_file: Option<PathBuf>,
    /// Client key file.
    pub key_file: Option<PathBuf>,
    /// Cipher list for TLS 1.2 and below.
    pub cipher: Option<String>,
    /// Cipher suites for TLS 1.3.
    pub cipher13: Option<String>,
}

impl TlsSettings {
    /// Returns `true` if no TLS parameter is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.connect.is_none()
            && self.ca_file.is_none()
            && self.cert_file.is_none()
            && self.key_file.is_none()
            && self.cipher.is_none()
            && self.cipher13.is_none()
    }

    /// Returns the parsed connect mode, if set and valid.
    #[must_use]
    pub fn connect_mode(&self) -> Option<TlsConnectMode> {
        self.connect.as_deref().and_then(TlsConnectMode::parse)
    }
}

/// Database section of the configuration file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileDatabase {
    /// Engine name.
    pub engine: Option<String>,
    /// Server host.
    pub host: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// Database name, or file path for the embedded engine.
    pub name: Option<String>,
    /// Schema (namespace) name.
    pub schema: Option<String>,
    /// User name.
    pub user: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Unix socket path.
    pub socket: Option<String>,
    /// Seconds to wait between reconnect attempts.
    pub wait_down_secs: Option<u64>,
    /// Overflow flush threshold in bytes.
    pub max_overflow_sql_size: Option<usize>,
    /// Slow query threshold in milliseconds, 0 disables.
    pub log_slow_queries_ms: Option<u64>,
    /// TLS parameters.
    pub tls: Option<TlsSettings>,
}

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Storage engine.
    pub engine: Dialect,
    /// Server host.
    pub host: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// Database name, or file path for the embedded engine.
    pub name: String,
    /// Schema (namespace) name.
    pub schema: Option<String>,
    /// User name.
    pub user: Option<String>,
    /// Password.
    pub password: Option<SecretString>,
    /// Unix socket path.
    pub socket: Option<PathBuf>,
    /// TLS parameters.
    pub tls: TlsSettings,
    /// Pause between reconnect attempts.
    pub wait_down: Duration,
    /// Overflow flush threshold in bytes.
    pub max_overflow_sql_size: usize,
    /// Statements slower than this are logged at warn level.
    pub log_slow_queries: Option<Duration>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            engine: Dialect::Sqlite,
            host: None,
            port: None,
            name: "dbhigh.db".to_string(),
            schema: None,
            user: None,
            password: None,
            socket: None,
            tls: TlsSettings::default(),
            wait_down: DEFAULT_WAIT_DOWN,
            max_overflow_sql_size: MAX_OVERFLOW_SQL_SIZE,
            log_slow_queries: None,
        }
    }
}

impl DbConfig {
    /// Creates a configuration for an embedded database file.
    #[must_use]
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            engine: Dialect::Sqlite,
            name: path.into().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    /// Creates a configuration for a PostgreSQL server.
    #[must_use]
    pub fn postgres(host: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            engine: Dialect::PostgreSql,
            host: Some(host.into()),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builds configuration from the database section of a config file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown engine name.
    pub fn from_config_file(file: ConfigFileDatabase) -> Result<Self> {
        let mut config = Self::default();

        if let Some(engine) = file.engine {
            config.engine = Dialect::parse(&engine)?;
        }
        config.host = file.host;
        config.port = file.port;
        if let Some(name) = file.name {
            config.name = name;
        }
        config.schema = file.schema;
        config.user = file.user;
        config.password = file.password.map(SecretString::from);
        config.socket = file.socket.map(PathBuf::from);
        if let Some(tls) = file.tls {
            config.tls = tls;
        }
        if let Some(secs) = file.wait_down_secs {
            config.wait_down = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = file.max_overflow_sql_size {
            config.max_overflow_sql_size = clamp_overflow_size(size);
        }
        if let Some(ms) = file.log_slow_queries_ms {
            config.log_slow_queries = slow_query_threshold(ms);
        }

        Ok(config)
    }

    /// Applies environment variable overrides.
    ///
    /// Unparsable values are ignored with a warning.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_string("DBHIGH_DB_ENGINE") {
            match Dialect::parse(&v) {
                Ok(engine) => self.engine = engine,
                Err(e) => tracing::warn!(error = %e, "ignoring DBHIGH_DB_ENGINE"),
            }
        }
        if let Some(v) = env_string("DBHIGH_DB_HOST") {
            self.host = Some(v);
        }
        if let Some(v) = env_parse::<u16>("DBHIGH_DB_PORT") {
            self.port = Some(v);
        }
        if let Some(v) = env_string("DBHIGH_DB_NAME") {
            self.name = v;
        }
        if let Some(v) = env_string("DBHIGH_DB_SCHEMA") {
            self.schema = Some(v);
        }
        if let Some(v) = env_string("DBHIGH_DB_USER") {
            self.user = Some(v);
        }
        if let Ok(v) = std::env::var("DBHIGH_DB_PASSWORD") {
            self.password = Some(SecretString::from(v));
        }
        if let Some(v) = env_string("DBHIGH_DB_SOCKET") {
            self.socket = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("DBHIGH_DB_TLS_CONNECT") {
            self.tls.connect = Some(v);
        }
        if let Ok(v) = std::env::var("DBHIGH_DB_TLS_CA_FILE") {
            self.tls.ca_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("DBHIGH_DB_TLS_CERT_FILE") {
            self.tls.cert_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("DBHIGH_DB_TLS_KEY_FILE") {
            self.tls.key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse::<u64>("DBHIGH_DB_WAIT_DOWN_SECS") {
            self.wait_down = Duration::from_secs(v.max(1));
        }
        if let Some(v) = env_parse::<usize>("DBHIGH_DB_MAX_OVERFLOW_SQL_SIZE") {
            self.max_overflow_sql_size = clamp_overflow_size(v);
        }
        if let Some(v) = env_parse::<u64>("DBHIGH_DB_LOG_SLOW_QUERIES_MS") {
            self.log_slow_queries = slow_query_threshold(v);
        }
        self
    }

    /// Sets the reconnect pause.
    #[must_use]
    pub const fn with_wait_down(mut self, wait_down: Duration) -> Self {
        self.wait_down = wait_down;
        self
    }

    /// Sets the overflow flush threshold, clamped to the supported range.
    #[must_use]
    pub fn with_max_overflow_sql_size(mut self, size: usize) -> Self {
        self.max_overflow_sql_size = clamp_overflow_size(size);
        self
    }

    /// Sets the slow query threshold.
    #[must_use]
    pub const fn with_log_slow_queries(mut self, threshold: Option<Duration>) -> Self {
        self.log_slow_queries = threshold;
        self
    }

    /// Sets the schema name.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Sets the TLS parameters.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Returns the schema name, defaulting to `public` on PostgreSQL.
    #[must_use]
    pub fn schema_or_default(&self) -> &str {
        match (&self.schema, self.engine) {
            (Some(schema), _) => schema,
            (None, Dialect::PostgreSql) => "public",
            (None, _) => "",
        }
    }

    /// Validates the configuration.
    ///
    /// All failures are deploy-time defects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when:
    /// - a TLS parameter is defined but empty
    /// - the TLS connect mode is not `required`, `verify_ca` or `verify_full`
    /// - a verifying connect mode has no CA file
    /// - a certificate or key file is set without all of certificate, key and CA
    /// - TLS is configured for the embedded engine
    /// - cipher lists are configured for an engine other than `MySQL`
    pub fn validate(&self) -> Result<()> {
        let tls = &self.tls;

        check_not_empty("tls.connect", tls.connect.as_deref())?;
        check_not_empty("tls.cert_file", tls.cert_file.as_ref().and_then(|p| p.to_str()))?;
        check_not_empty("tls.key_file", tls.key_file.as_ref().and_then(|p| p.to_str()))?;
        check_not_empty("tls.ca_file", tls.ca_file.as_ref().and_then(|p| p.to_str()))?;
        check_not_empty("tls.cipher", tls.cipher.as_deref())?;
        check_not_empty("tls.cipher13", tls.cipher13.as_deref())?;

        if let Some(connect) = tls.connect.as_deref() {
            let Some(mode) = TlsConnectMode::parse(connect) else {
                return Err(config_error(format!(
                    "invalid \"tls.connect\" configuration parameter: '{connect}'"
                )));
            };
            if mode.verifies() && tls.ca_file.is_none() {
                return Err(config_error(format!(
                    "parameter \"tls.connect\" value \"{connect}\" requires \"tls.ca_file\", but it is not defined"
                )));
            }
        }

        if (tls.cert_file.is_some() || tls.key_file.is_some())
            && (tls.cert_file.is_none() || tls.key_file.is_none() || tls.ca_file.is_none())
        {
            return Err(config_error(
                "parameter \"tls.key_file\" or \"tls.cert_file\" is defined, but \"tls.key_file\", \
                 \"tls.cert_file\" or \"tls.ca_file\" is not defined"
                    .to_string(),
            ));
        }

        if self.engine == Dialect::Sqlite && !tls.is_empty() {
            return Err(config_error(
                "TLS parameters cannot be used with the sqlite engine".to_string(),
            ));
        }

        if self.engine != Dialect::MySql && (tls.cipher.is_some() || tls.cipher13.is_some()) {
            return Err(config_error(format!(
                "\"tls.cipher\" and \"tls.cipher13\" are supported only by mysql, not {}",
                self.engine
            )));
        }

        Ok(())
    }
}

fn config_error(message: String) -> Error {
    tracing::error!("{message}");
    Error::Config(message)
}

fn check_not_empty(parameter: &str, value: Option<&str>) -> Result<()> {
    if value.is_some_and(str::is_empty) {
        return Err(config_error(format!(
            "configuration parameter \"{parameter}\" is defined but empty"
        )));
    }
    Ok(())
}

/// Clamps an overflow threshold to `[MIN_OVERFLOW_SQL_SIZE, MAX_OVERFLOW_SQL_SIZE]`.
#[must_use]
pub fn clamp_overflow_size(size: usize) -> usize {
    size.clamp(MIN_OVERFLOW_SQL_SIZE, MAX_OVERFLOW_SQL_SIZE)
}

fn slow_query_threshold(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}
