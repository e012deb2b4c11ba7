//! chainingest-storage — relational backends for the ingestion core.
//!
//! Backends:
//! - [`postgres`] — PostgreSQL via `sqlx` (production)
//! - [`sqlite`] — SQLite via `sqlx` (embedded / tests)
//!
//! Both enforce the same referential contract: blocks are unique by hash
//! and by number, transactions cascade from their block, events cascade
//! from their transaction. Per the store boundary contract, every write
//! returns a boolean `persisted` and errors are logged here, never raised.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;
