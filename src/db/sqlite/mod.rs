//! Embedded engine binding.
//!
//! Each [`SqliteDriver`] owns its own `rusqlite` connection. Transactions
//! start with `begin immediate` so concurrent writers serialize on the
//! database lock (bounded by the busy timeout) instead of failing on a
//! read-to-write lock upgrade.

mod connection;
mod driver;

pub use connection::{DEFAULT_BUSY_TIMEOUT, classify, configure_connection};
pub use driver::SqliteDriver;
