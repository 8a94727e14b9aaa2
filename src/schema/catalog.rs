//! Compiled-in default catalog.
//!
//! A subset of the monitoring schema: the id ledger, inventory tables, events
//! and their tags, alerts, history tables and the audit log.

use super::{Field, FieldFlags, FieldType, SchemaRegistry, Table};

/// Host status: monitored.
pub const HOST_STATUS_MONITORED: i32 = 0;
/// Host status: not monitored.
pub const HOST_STATUS_NOT_MONITORED: i32 = 1;
/// Host status: template.
pub const HOST_STATUS_TEMPLATE: i32 = 3;
/// Host flag: discovery prototype.
pub const FLAG_DISCOVERY_PROTOTYPE: i32 = 2;

fn id(name: &str) -> Field {
    Field::new(name, FieldType::Id).with_flags(FieldFlags::NOT_NULL)
}

fn fk(name: &str) -> Field {
    Field::new(name, FieldType::Id)
}

fn int(name: &str) -> Field {
    Field::new(name, FieldType::Int).with_flags(FieldFlags::NOT_NULL)
}

fn chars(name: &str, length: usize) -> Field {
    Field::new(name, FieldType::Char).with_length(length)
}

fn text(name: &str) -> Field {
    Field::new(name, FieldType::Text).with_length(65_535)
}

fn history(name: &str, value: Field) -> Table {
    Table::keyed(
        name,
        &["itemid", "clock", "ns"],
        vec![id("itemid"), int("clock"), value, int("ns")],
    )
}

/// Returns the default schema registry.
#[must_use]
pub fn default_registry() -> SchemaRegistry {
    SchemaRegistry::new(vec![
        Table::keyed(
            "ids",
            &["table_name", "field_name"],
            vec![
                chars("table_name", 64).with_flags(FieldFlags::NOT_NULL),
                chars("field_name", 64).with_flags(FieldFlags::NOT_NULL),
                id("nextid"),
            ],
        ),
        Table::new(
            "hosts",
            "hostid",
            vec![
                id("hostid"),
                fk("proxyid"),
                chars("host", 128),
                int("status"),
                int("flags"),
                chars("name", 128),
                chars("name_upper", 128).with_flags(FieldFlags::UPPER),
                text("description"),
            ],
        ),
        Table::new(
            "items",
            "itemid",
            vec![
                id("itemid"),
                id("hostid"),
                chars("name", 255),
                chars("key_", 2048),
                chars("delay", 1024),
                int("value_type"),
                int("status"),
                text("params"),
            ],
        ),
        Table::new(
            "events",
            "eventid",
            vec![
                id("eventid"),
                int("source"),
                int("object"),
                Field::new("objectid", FieldType::Uint),
                int("clock"),
                int("value"),
                int("acknowledged"),
                int("ns"),
                chars("name", 2048),
                int("severity"),
            ],
        ),
        Table::new(
            "event_tag",
            "eventtagid",
            vec![
                id("eventtagid"),
                id("eventid"),
                chars("tag", 255),
                chars("value", 255),
            ],
        ),
        Table::new(
            "problem_tag",
            "problemtagid",
            vec![
                id("problemtagid"),
                id("eventid"),
                chars("tag", 255),
                chars("value", 255),
            ],
        ),
        Table::new(
            "alerts",
            "alertid",
            vec![
                id("alertid"),
                fk("actionid"),
                id("eventid"),
                int("clock"),
                text("message"),
                int("status"),
                int("retries"),
                chars("error", 2048),
            ],
        ),
        Table::new(
            "dhosts",
            "dhostid",
            vec![id("dhostid"), id("druleid"), int("status")],
        ),
        Table::new(
            "dservices",
            "dserviceid",
            vec![
                id("dserviceid"),
                id("dhostid"),
                chars("value", 255),
                chars("port", 64),
                int("status"),
            ],
        ),
        history(
            "history",
            Field::new("value", FieldType::Float).with_flags(FieldFlags::NOT_NULL),
        ),
        history("history_uint", Field::new("value", FieldType::Uint)),
        history("history_str", chars("value", 255)),
        history("history_text", text("value")),
        history("history_bin", Field::new("value", FieldType::Blob)),
        Table::new(
            "auditlog",
            "auditid",
            vec![
                Field::new("auditid", FieldType::Cuid).with_flags(FieldFlags::NOT_NULL),
                fk("userid"),
                int("clock"),
                int("action"),
                int("resourcetype"),
                Field::new("details", FieldType::LongText),
            ],
        ),
        Table::new(
            "proxy_history",
            "id",
            vec![
                Field::new("id", FieldType::Serial).with_flags(FieldFlags::NOT_NULL),
                id("itemid"),
                int("clock"),
                Field::new("value", FieldType::LongText),
            ],
        ),
    ])
}
