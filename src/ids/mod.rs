//! Unique id allocation.
//!
//! Ids are handed out in contiguous ranges per `(table, record id field)`
//! from the `ids` ledger table:
//!
//! ```text
//! ids(table_name, field_name, nextid)   -- nextid = last id handed out
//! ```
//!
//! A reservation of `count` ids advances `nextid` by `count` and returns the
//! first id of the range. A missing ledger row is seeded from the largest
//! id already stored in the table; a row holding an out-of-range value is
//! deleted and seeded again.
//!
//! The algorithm runs over [`LedgerStore`], implemented for
//! [`Connection`] with plain SQL.

mod ledger;

pub use ledger::LedgerStore;

use crate::db::record_ids_reserved;
use crate::schema::SchemaRegistry;
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Largest id the ledger hands out (signed 64-bit ceiling).
pub const MAX_ID: u64 = u64::MAX >> 1;

/// Tables whose ids come from [`NextIdCallback`] when one is registered.
pub const DIVERTED_TABLES: &[&str] = &[
    "events",
    "event_tag",
    "problem_tag",
    "dservices",
    "dhosts",
    "alerts",
    "escalations",
    "autoreg_host",
    "event_suppress",
    "trigger_queue",
    "proxy_history",
    "proxy_dhistory",
    "proxy_autoreg_host",
    "host_proxy",
];

/// External id source for high-churn tables, typically an in-memory
/// counter in a cache shared between workers.
///
/// Called with the table name and count; returns the first id.
pub type NextIdCallback = Arc<dyn Fn(&str, u64) -> Result<u64> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Read,
    Seed,
    Repair { found: u64 },
    Advance { pre: u64 },
    Done(u64),
}

/// Reserves id ranges.
#[derive(Clone)]
pub struct IdAllocator {
    registry: Arc<SchemaRegistry>,
    diverted: HashSet<String>,
    callback: Option<NextIdCallback>,
}

impl std::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdAllocator")
            .field("tables", &self.registry.len())
            .field("diverted", &self.diverted.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl IdAllocator {
    /// Creates an allocator over `registry` with the default diverted set
    /// and no callback.
    #[must_use]
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            diverted: DIVERTED_TABLES.iter().map(ToString::to_string).collect(),
            callback: None,
        }
    }

    /// Registers the id source for diverted tables.
    #[must_use]
    pub fn with_callback(mut self, callback: NextIdCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Replaces the diverted table set.
    #[must_use]
    pub fn with_diverted_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.diverted = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the schema registry.
    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Returns `true` if `table` is served by the callback.
    #[must_use]
    pub fn is_diverted(&self, table: &str) -> bool {
        self.callback.is_some() && self.diverted.contains(table)
    }

    /// Reserves `count` consecutive ids for `table` and returns the first.
    ///
    /// Returns 0 for `count == 0` without touching storage, and 0 when the
    /// ambient transaction has already failed.
    ///
    /// # Errors
    ///
    /// - [`Error::Schema`] for an unknown table or one without a record id
    /// - [`Error::IdSpaceExhausted`] when the table holds ids at the ceiling
    /// - storage errors outside a transaction
    pub fn reserve<S>(&self, store: &mut S, table: &str, count: u64) -> Result<u64>
    where
        S: LedgerStore + ?Sized,
    {
        if count == 0 {
            return Ok(0);
        }

        let field = self.registry.require_table(table)?.require_recid()?;

        if let Some(callback) = self.callback.as_ref().filter(|_| self.diverted.contains(table)) {
            let first = callback(table, count)?;
            tracing::debug!(table, count, first, "reserved ids from callback");
            record_ids_reserved(table, count);
            return Ok(first);
        }

        let mut step = Step::Read;
        loop {
            // Avoid looping forever inside a failed transaction.
            if store.txn_failed() {
                tracing::debug!(table, "id reservation skipped: transaction failed");
                return Ok(0);
            }

            match advance(store, table, field, count, step) {
                Ok(Step::Done(first)) => {
                    tracing::debug!(table, field, count, first, "reserved ids");
                    record_ids_reserved(table, count);
                    return Ok(first);
                },
                Ok(next) => step = next,
                Err(e) if !e.is_fatal() && store.txn_failed() => {
                    tracing::debug!(table, error = %e, "id reservation aborted: transaction failed");
                    return Ok(0);
                },
                Err(e) => return Err(e),
            }
        }
    }
}

fn exhausted(table: &str, field: &str, id: u64) -> Error {
    tracing::error!(table, field, id, "maximum number of id's exceeded");
    Error::IdSpaceExhausted {
        table: table.to_string(),
        field: field.to_string(),
        id,
    }
}

fn advance<S>(store: &mut S, table: &str, field: &str, count: u64, step: Step) -> Result<Step>
where
    S: LedgerStore + ?Sized,
{
    Ok(match step {
        Step::Read => match store.read_next_id(table, field)? {
            None => Step::Seed,
            Some(found) if found >= MAX_ID => Step::Repair { found },
            Some(pre) => Step::Advance { pre },
        },
        Step::Seed => {
            let seed = store.max_record_id(table, field, 0, MAX_ID)?.unwrap_or(0);
            if seed >= MAX_ID {
                return Err(exhausted(table, field, seed));
            }
            if !store.insert_ledger(table, field, seed)? {
                // A parallel transaction created the row but it is not
                // visible to us yet.
                store.bump_ledger(table, field)?;
            }
            Step::Read
        },
        Step::Repair { found } => {
            tracing::warn!(table, field, found, "resetting out of range id ledger value");
            store.delete_ledger(table, field)?;
            Step::Read
        },
        Step::Advance { pre } => {
            let Some(expected) = pre.checked_add(count).filter(|&n| n < MAX_ID) else {
                return Err(exhausted(table, field, pre));
            };
            store.advance_ledger(table, field, count)?;
            match store.read_next_id(table, field)? {
                Some(post) if post == expected => Step::Done(post - count + 1),
                post => {
                    tracing::error!(
                        table,
                        field,
                        pre,
                        count,
                        ?post,
                        "id ledger changed during reservation, retrying"
                    );
                    Step::Read
                },
            }
        },
        Step::Done(first) => Step::Done(first),
    })
}
