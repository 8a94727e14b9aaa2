//! SQL text builders.
//!
//! - [`condition`]: `IN`-list conditions split to engine expression limits
//! - [`overflow`]: statement buffers flushed past a size threshold
//! - [`insert`]: schema-checked bulk inserts

pub mod condition;
pub mod insert;
pub mod overflow;

pub use condition::{add_condition, add_str_condition, sql_id_cmp, sql_id_ins};
pub use insert::{BulkInsert, DbValue};
pub use overflow::{
    MULTIPLE_QUERY_CHUNK, execute_multiple_query, execute_overflowed_sql, flush_overflowed_sql,
    prepare_multiple_query,
};
