//! Collaborator seams.
//!
//! The browser driver and the rule matcher are external capabilities; the
//! store and queue traits let the same pipeline run against Postgres in
//! production and in-memory backends in tests.

pub mod driver;
pub mod fetcher;
pub mod matcher;
pub mod queue;
pub mod store;
