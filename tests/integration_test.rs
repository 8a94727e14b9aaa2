//! End-to-end tests against file-backed `SQLite` databases.
//!
//! Covers:
//! - Bulk insert round trips for every logical type
//! - Id ledger behaviour on an empty database
//! - Zero-length inputs
//! - Transaction failure handling
//! - Field size validation limits

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dbhigh::config::DbConfig;
use dbhigh::db::{ConnectMode, Connection, DbStatus, Dialect, SqliteDriver};
use dbhigh::ids::IdAllocator;
use dbhigh::schema::catalog::default_registry;
use dbhigh::schema::ddl::bootstrap;
use dbhigh::sql::{BulkInsert, DbValue, add_condition, add_str_condition, execute_multiple_query};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

/// Opens a bootstrapped database in `dir`.
fn open(dir: &TempDir) -> (Connection, IdAllocator) {
    let registry = Arc::new(default_registry());
    let config = DbConfig::sqlite(dir.path().join("dbhigh.db"));
    let mut conn = Connection::new(Box::new(SqliteDriver::new()), config);
    conn.connect(ConnectMode::Once).expect("connect");
    bootstrap(&mut conn, &registry).expect("bootstrap");
    (conn, IdAllocator::new(registry))
}

fn rows(conn: &mut Connection, sql: &str) -> Vec<Vec<Option<String>>> {
    conn.select(sql).expect("select").collect()
}

fn scalar(conn: &mut Connection, sql: &str) -> Option<String> {
    rows(conn, sql).into_iter().next().and_then(|row| row.into_iter().next().flatten())
}

// ============================================================================
// Bulk insert
// ============================================================================

#[test]
fn test_bulk_insert_round_trip_all_types() {
    let dir = TempDir::new().unwrap();
    let (mut conn, ids) = open(&dir);
    let registry = ids.registry();

    let mut hosts = BulkInsert::prepare(
        registry,
        "hosts",
        &["hostid", "proxyid", "host", "status", "flags", "name", "name_upper", "description"],
    )
    .unwrap();
    hosts
        .add_row(vec![
            DbValue::Id(0),
            DbValue::Id(0),
            "db-01".into(),
            DbValue::Int(-3),
            DbValue::Int(0),
            "Zürich ☃".into(),
            "zurich".into(),
            "it's \"quoted\"".into(),
        ])
        .unwrap();
    hosts.autoincrement("hostid").unwrap();
    hosts.execute(&mut conn, &ids).unwrap();
    assert_eq!(hosts.last_id(), 1);

    let mut history = BulkInsert::prepare(registry, "history", &["itemid", "clock", "value", "ns"]).unwrap();
    history
        .add_row(vec![DbValue::Id(1), DbValue::Int(1_700_000_000), DbValue::Float(0.1), DbValue::Int(5)])
        .unwrap();
    history.execute(&mut conn, &ids).unwrap();

    let mut history_uint =
        BulkInsert::prepare(registry, "history_uint", &["itemid", "clock", "value", "ns"]).unwrap();
    history_uint
        .add_row(vec![
            DbValue::Id(1),
            DbValue::Int(0),
            DbValue::Uint(9_007_199_254_740_993),
            DbValue::Int(0),
        ])
        .unwrap();
    history_uint.execute(&mut conn, &ids).unwrap();

    let payload = STANDARD.encode(b"\x00binary\xffpayload");
    let mut history_bin = BulkInsert::prepare(registry, "history_bin", &["itemid", "clock", "value", "ns"]).unwrap();
    history_bin
        .add_row(vec![DbValue::Id(1), DbValue::Int(0), payload.clone().into(), DbValue::Int(0)])
        .unwrap();
    history_bin.execute(&mut conn, &ids).unwrap();

    let mut audit = BulkInsert::prepare(registry, "auditlog", &["auditid", "userid", "clock", "action", "resourcetype", "details"]).unwrap();
    audit
        .add_row(vec![
            "ckv8mfa9e000001l2cqx3e4ab".into(),
            DbValue::Id(0),
            DbValue::Int(0),
            DbValue::Int(1),
            DbValue::Int(4),
            "line one\nline two".into(),
        ])
        .unwrap();
    audit.execute(&mut conn, &ids).unwrap();

    assert_eq!(
        rows(&mut conn, "select hostid,proxyid,host,status,name,name_upper,description from hosts"),
        vec![vec![
            Some("1".to_string()),
            None,
            Some("db-01".to_string()),
            Some("-3".to_string()),
            Some("Zürich ☃".to_string()),
            Some("ZURICH".to_string()),
            Some("it's \"quoted\"".to_string()),
        ]]
    );
    assert_eq!(scalar(&mut conn, "select value from history").as_deref(), Some("0.1"));
    assert_eq!(
        scalar(&mut conn, "select value from history_uint").as_deref(),
        Some("9007199254740993")
    );
    assert_eq!(scalar(&mut conn, "select value from history_bin"), Some(payload));
    assert_eq!(
        rows(&mut conn, "select auditid,userid,details from auditlog"),
        vec![vec![
            Some("ckv8mfa9e000001l2cqx3e4ab".to_string()),
            None,
            Some("line one\nline two".to_string()),
        ]]
    );
}

#[test]
fn test_bulk_insert_flushes_large_batches() {
    let dir = TempDir::new().unwrap();
    let (mut conn, ids) = open(&dir);

    let mut items = BulkInsert::prepare(ids.registry(), "event_tag", &["eventtagid", "eventid", "tag", "value"]).unwrap();
    for i in 0..5000 {
        items
            .add_row(vec![DbValue::Id(0), DbValue::Id(1), format!("tag-{i}").into(), "x".repeat(64).into()])
            .unwrap();
    }
    items.autoincrement("eventtagid").unwrap();

    conn.begin().unwrap();
    items.execute(&mut conn, &ids).unwrap();
    assert_eq!(conn.commit().unwrap(), DbStatus::Ok);

    assert_eq!(items.last_id(), 5000);
    assert_eq!(scalar(&mut conn, "select count(*) from event_tag").as_deref(), Some("5000"));
    assert_eq!(
        scalar(&mut conn, "select count(distinct eventtagid) from event_tag").as_deref(),
        Some("5000")
    );
}

// ============================================================================
// Id ledger
// ============================================================================

#[test]
fn test_events_ledger_on_empty_database() {
    let dir = TempDir::new().unwrap();
    let (mut conn, ids) = open(&dir);

    assert_eq!(ids.reserve(&mut conn, "events", 5).unwrap(), 1);
    assert_eq!(ids.reserve(&mut conn, "events", 3).unwrap(), 6);
    assert_eq!(
        scalar(&mut conn, "select nextid from ids where table_name='events' and field_name='eventid'")
            .as_deref(),
        Some("8")
    );
}

#[test]
fn test_ledger_seeds_past_existing_rows() {
    let dir = TempDir::new().unwrap();
    let (mut conn, ids) = open(&dir);
    conn.execute("insert into hosts (hostid,host,status,flags) values (41,'a',0,0)")
        .unwrap();

    assert_eq!(ids.reserve(&mut conn, "hosts", 2).unwrap(), 42);
    assert_eq!(ids.reserve(&mut conn, "hosts", 1).unwrap(), 44);
}

// ============================================================================
// Zero-length inputs
// ============================================================================

#[test]
fn test_zero_length_inputs_are_noops() {
    let dir = TempDir::new().unwrap();
    let (mut conn, ids) = open(&dir);
    // Any statement would reconnect the closed connection.
    conn.close();

    assert_eq!(ids.reserve(&mut conn, "hosts", 0).unwrap(), 0);

    let mut insert = BulkInsert::prepare(ids.registry(), "hosts", &["hostid", "host"]).unwrap();
    insert.execute(&mut conn, &ids).unwrap();

    execute_multiple_query(&mut conn, "delete from hosts where", "hostid", &[]).unwrap();

    let mut sql = String::from("select 1 where");
    add_condition(&mut sql, "hostid", &[], Dialect::Sqlite);
    add_str_condition(&mut sql, "host", &[], Dialect::Sqlite);
    assert_eq!(sql, "select 1 where");

    assert!(!conn.is_connected());
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn test_commit_after_failed_statement_rolls_back() {
    let dir = TempDir::new().unwrap();
    let (mut conn, _) = open(&dir);

    conn.begin().unwrap();
    conn.execute("insert into hosts (hostid,host,status,flags) values (1,'a',0,0)")
        .unwrap();
    assert!(conn.execute("insert into hosts (hostid,host,status,flags) values (1,'b',0,0)").is_err());
    assert!(conn.txn_failed());

    assert_eq!(conn.commit().unwrap(), DbStatus::Fail);
    assert!(!conn.in_transaction());
    assert_eq!(scalar(&mut conn, "select count(*) from hosts").as_deref(), Some("0"));
}

#[test]
fn test_transaction_helper_commits_ledger_and_rows() {
    let dir = TempDir::new().unwrap();
    let (mut conn, ids) = open(&dir);

    let first = conn
        .transaction(|conn| {
            let first = ids.reserve(conn, "items", 10)?;
            conn.execute(&format!(
                "insert into items (itemid,hostid,status,value_type) values ({first},1,0,0)"
            ))?;
            Ok(first)
        })
        .unwrap();

    assert_eq!(first, 1);
    assert_eq!(scalar(&mut conn, "select count(*) from items").as_deref(), Some("1"));
    assert_eq!(ids.reserve(&mut conn, "items", 1).unwrap(), 11);
}

// ============================================================================
// Field size validation
// ============================================================================

#[test]
fn test_field_size_limits() {
    let registry = default_registry();
    let at_limit = "a".repeat(65_535);
    let over_limit = "a".repeat(65_536);
    let wide = "é".repeat(32_768);

    for dialect in [Dialect::MySql, Dialect::PostgreSql] {
        assert!(registry.validate_field_size("hosts", "description", &at_limit, dialect).unwrap());
        assert!(!registry.validate_field_size("hosts", "description", &over_limit, dialect).unwrap());
    }
    // 65536 bytes but only 32768 characters.
    assert!(!registry.validate_field_size("hosts", "description", &wide, Dialect::MySql).unwrap());
    assert!(registry.validate_field_size("hosts", "description", &wide, Dialect::PostgreSql).unwrap());
}
