//! Domain types shared across the pipeline.

pub mod ids;
pub mod job;
pub mod request;
pub mod rule;

pub use ids::*;
pub use job::CrawlJob;
pub use request::{RawLogEntry, RequestRecord};
pub use rule::{is_exception_rule, is_style_rule, prepare_rule_lines, text_hash, NewRule};
