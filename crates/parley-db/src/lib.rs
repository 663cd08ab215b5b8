//! Database layer for the Parley gateway.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. The message store and the SQLite presence
//! backend both live in the database created here.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: concurrent readers with a single writer. Every
//!   gateway process on a host can point at the same file, which is what
//!   makes the SQLite presence backend visible fleet-wide.
//! - **`r2d2` connection pool**: bounded connection reuse for the blocking
//!   thread pool that performs all database work.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so they ship with the server.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
