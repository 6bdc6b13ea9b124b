//! Storage backends.
//!
//! - [`MemoryStore`] - Always available, for tests and local runs
//! - [`PostgresStore`] - Production backend (requires the `postgres` feature)

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryStore, MemoryTables};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
