//! Binary entry point for dbhigh.
//!
//! Operational commands for a dbhigh database: configuration checks, schema
//! inspection, bootstrapping, connectivity checks and manual id reservation.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use dbhigh::config::DbHighConfig;
use dbhigh::db::{self, ConnectMode, Dialect};
use dbhigh::ids::IdAllocator;
use dbhigh::observability::{self, InitOptions};
use dbhigh::schema::SchemaRegistry;
use dbhigh::schema::catalog::default_registry;
use dbhigh::schema::ddl::{bootstrap, create_table_sql};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

/// dbhigh - persistence-resilience layer for monitoring backends.
#[derive(Parser)]
#[command(name = "dbhigh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "DBHIGH_CONFIG_PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the effective settings.
    CheckConfig,

    /// Show the compiled-in schema catalog.
    Schema {
        /// Only show this table.
        #[arg(short, long)]
        table: Option<String>,

        /// Print `CREATE TABLE` statements for the configured engine.
        #[arg(long, conflicts_with = "json")]
        ddl: bool,

        /// Print the catalog as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Create missing catalog tables in the configured database.
    Bootstrap,

    /// Reserve a range of record ids for a table.
    Reserve {
        /// Table name.
        table: String,

        /// Number of ids to reserve.
        #[arg(short = 'n', long, default_value = "1")]
        count: u64,
    },

    /// Connect once and run a trivial query.
    Ping,

    /// Serve Prometheus metrics while holding a connection open.
    Metrics {
        /// Seconds between connectivity checks.
        #[arg(long, default_value = "30")]
        interval: u64,
    },
}

/// Main entry point.
fn main() -> ExitCode {
    // A missing .env file is the normal case.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    let expose_metrics = matches!(cli.command, Commands::Metrics { .. });
    let _observability = match observability::init_from_config(
        &config.observability,
        InitOptions {
            verbose: cli.verbose,
            metrics_expose: expose_metrics,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(err) = e.downcast_ref::<dbhigh::Error>()
                && err.is_fatal()
            {
                tracing::error!(error = %err, "fatal error");
            }
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
fn run_command(cli: Cli, config: DbHighConfig) -> anyhow::Result<()> {
    let registry = Arc::new(default_registry());

    match cli.command {
        Commands::CheckConfig => cmd_check_config(&config),

        Commands::Schema { table, ddl, json } => {
            cmd_schema(&registry, config.database.engine, table.as_deref(), ddl, json)
        },

        Commands::Bootstrap => cmd_bootstrap(config, &registry),

        Commands::Reserve { table, count } => cmd_reserve(config, registry, &table, count),

        Commands::Ping => cmd_ping(config),

        Commands::Metrics { interval } => cmd_metrics(config, interval),
    }
}

/// Loads configuration from an explicit path or the default locations.
fn load_config(path: Option<&str>) -> anyhow::Result<DbHighConfig> {
    let config = match path.filter(|p| !p.trim().is_empty()) {
        Some(path) => DbHighConfig::load_from_file(Path::new(path))
            .with_context(|| format!("loading {path}"))?,
        None => DbHighConfig::load_default(),
    };
    Ok(config.with_env_overrides())
}

fn cmd_check_config(config: &DbHighConfig) -> anyhow::Result<()> {
    let db = &config.database;
    db.validate()?;

    println!("Database Configuration");
    println!("======================");
    println!();
    println!("Engine: {}", db.engine);
    println!("Name: {}", db.name);
    println!("Host: {}", db.host.as_deref().unwrap_or("(default)"));
    println!(
        "Port: {}",
        db.port.map_or_else(|| "(default)".to_string(), |p| p.to_string())
    );
    println!("Schema: {}", db.schema_or_default());
    println!("User: {}", db.user.as_deref().unwrap_or("(none)"));
    println!("Password: {}", if db.password.is_some() { "(set)" } else { "(none)" });
    if let Some(socket) = &db.socket {
        println!("Socket: {}", socket.display());
    }
    println!(
        "TLS: {}",
        db.tls.connect_mode().map_or("disabled", |mode| mode.as_str())
    );
    println!();
    println!("Reconnect Wait: {}s", db.wait_down.as_secs());
    println!("Overflow SQL Size: {} bytes", db.max_overflow_sql_size);
    println!(
        "Slow Query Log: {}",
        db.log_slow_queries
            .map_or_else(|| "disabled".to_string(), |t| format!("{} ms", t.as_millis()))
    );
    println!();
    println!("Configuration is valid");
    Ok(())
}

fn cmd_schema(
    registry: &SchemaRegistry,
    dialect: Dialect,
    table: Option<&str>,
    ddl: bool,
    json: bool,
) -> anyhow::Result<()> {
    let tables = match table {
        Some(name) => vec![registry.require_table(name)?],
        None => registry.tables().collect(),
    };

    if ddl {
        for table in tables {
            println!("{};", create_table_sql(table, dialect));
        }
        return Ok(());
    }

    if json {
        let value: Vec<serde_json::Value> = tables
            .iter()
            .map(|table| {
                serde_json::json!({
                    "name": table.name,
                    "recid": table.recid,
                    "primary_key": table.primary_key,
                    "fields": table.fields.iter().map(|f| serde_json::json!({
                        "name": f.name,
                        "type": f.field_type.as_str(),
                        "length": f.length,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for table in tables {
        println!("{} (recid: {})", table.name, table.recid.as_deref().unwrap_or("-"));
        for field in &table.fields {
            if field.length > 0 {
                println!("  {:<16} {}({})", field.name, field.field_type, field.length);
            } else {
                println!("  {:<16} {}", field.name, field.field_type);
            }
        }
    }
    Ok(())
}

fn cmd_bootstrap(config: DbHighConfig, registry: &SchemaRegistry) -> anyhow::Result<()> {
    let mut conn = db::open(config.database, ConnectMode::RetryOrExit)?;
    let created = bootstrap(&mut conn, registry)?;
    println!("Created {created} of {} tables", registry.len());
    conn.close();
    Ok(())
}

fn cmd_reserve(
    config: DbHighConfig,
    registry: Arc<SchemaRegistry>,
    table: &str,
    count: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(count > 0, "count must be positive");

    let ids = IdAllocator::new(registry);
    let mut conn = db::open(config.database, ConnectMode::RetryOrExit)?;
    let first = conn.transaction(|conn| ids.reserve(conn, table, count))?;
    conn.close();

    println!("{table}: {first}..={}", first + count - 1);
    Ok(())
}

fn cmd_ping(config: DbHighConfig) -> anyhow::Result<()> {
    let engine = config.database.engine;
    let mut conn = db::open(config.database, ConnectMode::Once)?;
    conn.select_once("select 1")?;
    conn.close();
    println!("{engine}: ok");
    Ok(())
}

fn cmd_metrics(config: DbHighConfig, interval: u64) -> anyhow::Result<()> {
    let interval = std::time::Duration::from_secs(interval.max(1));
    let mut conn = db::open(config.database, ConnectMode::Retry)?;
    loop {
        if let Err(e) = conn.select("select 1") {
            tracing::warn!(error = %e, "connectivity check failed");
        }
        std::thread::sleep(interval);
    }
}
