use serde::{Deserialize, Serialize};
use std::fmt;

// Row identifiers are BIGSERIAL keys; wrapping them keeps a rule id from
// being passed where a list id is expected.
macro_rules! row_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<i64> for $name {
                fn from(id: i64) -> Self {
                    Self(id)
                }
            }
        )*
    };
}

row_id!(
    /// `batches.id`
    BatchId,
    /// `domains.id`
    DomainId,
    /// `lists.id`
    ListId,
    /// `rules.id`
    RuleId,
    /// `tags.id`
    TagId,
    /// `crawls.id`
    CrawlId,
);

/// Queue job identifier.
pub type JobId = uuid::Uuid;
