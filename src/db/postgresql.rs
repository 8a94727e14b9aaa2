//! PostgreSQL driver.
//!
//! Wraps an async `tokio-postgres` client behind the blocking [`Driver`]
//! interface. Each driver owns a private current-thread runtime; the
//! connection task spawned on it makes progress whenever a call blocks on
//! the runtime. Must not be used from inside another Tokio runtime.
//!
//! Statements go through the simple query protocol so a buffer of several
//! `;`-separated statements executes in one round trip and every column
//! comes back as text (`bytea` in its `\x` hex form).

use super::{Dialect, Driver, DriverError, ErrorCode, ResultSet, Row};
use crate::config::DbConfig;
use secrecy::ExposeSecret;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, SimpleQueryMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver for a PostgreSQL server.
#[derive(Default)]
pub struct PostgresDriver {
    runtime: Option<Runtime>,
    client: Option<Client>,
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("connected", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl PostgresDriver {
    /// Creates an unconnected driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn runtime(&mut self) -> Result<&Runtime, DriverError> {
        if self.runtime.is_none() {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| DriverError::fail(ErrorCode::Connect, e.to_string()))?;
            self.runtime = Some(runtime);
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| DriverError::fail(ErrorCode::Connect, "runtime unavailable"))
    }

    fn simple_query(
        &mut self,
        sql: &str,
        code: ErrorCode,
    ) -> Result<Vec<SimpleQueryMessage>, DriverError> {
        let (Some(runtime), Some(client)) = (self.runtime.as_ref(), self.client.as_ref()) else {
            return Err(DriverError::down(code, "connection is closed"));
        };
        runtime
            .block_on(client.simple_query(sql))
            .map_err(|e| classify(&e, code))
    }

    fn batch(&mut self, sql: &str) -> Result<(), DriverError> {
        self.simple_query(sql, ErrorCode::Transaction).map(|_| ())
    }
}

/// Builds the client configuration.
pub fn pg_config(config: &DbConfig) -> tokio_postgres::Config {
    let mut pg = tokio_postgres::Config::new();
    pg.dbname(&config.name)
        .application_name("dbhigh")
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(host) = config.host.as_deref().filter(|h| !h.is_empty()) {
        pg.host(host);
    }
    #[cfg(unix)]
    if let Some(socket) = &config.socket {
        pg.host_path(socket);
    }
    if config.host.as_deref().is_none_or(str::is_empty) && config.socket.is_none() {
        pg.host("localhost");
    }
    if let Some(port) = config.port {
        pg.port(port);
    }
    if let Some(user) = &config.user {
        pg.user(user);
    }
    if let Some(password) = &config.password {
        pg.password(password.expose_secret());
    }
    if let Some(schema) = &config.schema {
        pg.options(format!("-c search_path={schema}"));
    }
    if config.tls.connect_mode().is_some() {
        pg.ssl_mode(tokio_postgres::config::SslMode::Require);
    }
    pg
}

/// Classifies a client error.
///
/// Connection-class failures, shutdowns and transport (I/O or closed
/// connection) errors are transient; a read-only transaction (hot standby)
/// is transient with the read-only code; everything else, including client
/// configuration and authentication setup errors, is permanent.
pub fn classify(err: &tokio_postgres::Error, code: ErrorCode) -> DriverError {
    let message = err
        .as_db_error()
        .map_or_else(|| err.to_string(), |db| db.message().to_string());
    let transport = err.is_closed()
        || std::error::Error::source(err).is_some_and(|source| source.is::<std::io::Error>());

    classify_state(err.code(), transport, code, message)
}

fn classify_state(state: Option<&SqlState>, transport: bool, code: ErrorCode, message: String) -> DriverError {
    match state {
        _ if transport => DriverError::down(code, message),
        None => DriverError::fail(code, message),
        Some(state) if *state == SqlState::READ_ONLY_SQL_TRANSACTION => {
            DriverError::down(ErrorCode::ReadOnly, message)
        },
        Some(state)
            if state.code().starts_with("08")
                || *state == SqlState::ADMIN_SHUTDOWN
                || *state == SqlState::CRASH_SHUTDOWN
                || *state == SqlState::CANNOT_CONNECT_NOW =>
        {
            DriverError::down(code, message)
        },
        Some(_) => DriverError::fail(code, message),
    }
}

impl Driver for PostgresDriver {
    fn dialect(&self) -> Dialect {
        Dialect::PostgreSql
    }

    fn connect(&mut self, config: &DbConfig) -> Result<(), DriverError> {
        let pg = pg_config(config);
        let tls_mode = config.tls.connect_mode();
        #[cfg(feature = "postgres-tls")]
        let tls = match tls_mode {
            Some(_) => Some(tls::connector(&config.tls)?),
            None => None,
        };
        let runtime = self.runtime()?;

        let client = runtime.block_on(async {
            #[cfg(feature = "postgres-tls")]
            if let Some(tls) = tls {
                let (client, connection) = pg
                    .connect(tls)
                    .await
                    .map_err(|e| classify(&e, ErrorCode::Connect))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::warn!(error = %e, "database connection closed");
                    }
                });
                return Ok(client);
            }
            #[cfg(not(feature = "postgres-tls"))]
            if tls_mode.is_some() {
                return Err(DriverError::fail(
                    ErrorCode::Connect,
                    "TLS requested but built without the postgres-tls feature",
                ));
            }

            let (client, connection) = pg
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| classify(&e, ErrorCode::Connect))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(error = %e, "database connection closed");
                }
            });
            Ok::<_, DriverError>(client)
        })?;

        tracing::debug!(tls = tls_mode.is_some(), "connected to PostgreSQL");
        self.client = Some(client);
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the client ends the connection task.
        self.client = None;
    }

    fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|c| !c.is_closed())
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        let messages = self.simple_query(sql, ErrorCode::Execute)?;
        Ok(messages
            .iter()
            .map(|m| match m {
                SimpleQueryMessage::CommandComplete(n) => *n,
                _ => 0,
            })
            .sum())
    }

    fn select(&mut self, sql: &str) -> Result<ResultSet, DriverError> {
        let messages = self.simple_query(sql, ErrorCode::Select)?;
        let mut columns = Vec::new();
        let mut rows = Vec::new();

        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if columns.is_empty() {
                    columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let values: Row = (0..row.len())
                    .map(|i| row.get(i).map(ToString::to_string))
                    .collect();
                rows.push(values);
            }
        }

        Ok(ResultSet::new(columns, rows))
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        self.batch("begin")
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.batch("commit")
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.batch("rollback")
    }
}

#[cfg(feature = "postgres-tls")]
mod tls {
    use crate::config::TlsSettings;
    use crate::db::{DriverError, ErrorCode};
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use rustls::{ClientConfig, RootCertStore};
    use std::path::Path;
    use tokio_postgres_rustls::MakeRustlsConnect;

    fn tls_error(path: &Path, e: impl std::fmt::Display) -> DriverError {
        DriverError::fail(ErrorCode::Connect, format!("{}: {e}", path.display()))
    }

    /// Builds the TLS connector.
    ///
    /// The server chain is checked against `ca_file` when given, otherwise
    /// against the bundled web PKI roots.
    pub fn connector(settings: &TlsSettings) -> Result<MakeRustlsConnect, DriverError> {
        let mut roots = RootCertStore::empty();
        match &settings.ca_file {
            Some(ca_file) => {
                for cert in CertificateDer::pem_file_iter(ca_file).map_err(|e| tls_error(ca_file, e))? {
                    let cert = cert.map_err(|e| tls_error(ca_file, e))?;
                    roots.add(cert).map_err(|e| tls_error(ca_file, e))?;
                }
            },
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match (&settings.cert_file, &settings.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let certs = CertificateDer::pem_file_iter(cert_file)
                    .map_err(|e| tls_error(cert_file, e))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| tls_error(cert_file, e))?;
                let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| tls_error(key_file, e))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| tls_error(key_file, e))?
            },
            _ => builder.with_no_client_auth(),
        };

        Ok(MakeRustlsConnect::new(config))
    }
}
