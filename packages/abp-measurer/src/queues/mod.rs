//! Job queue backends.
//!
//! - [`MemoryJobQueue`] - In-process queue for tests and single-process runs
//! - [`PostgresJobQueue`] - Shared queue for many workers (requires the `postgres` feature)

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{JobRecord, JobStatus, MemoryJobQueue};

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobQueue;
