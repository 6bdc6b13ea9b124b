//! External rule-matcher capability.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::error::MatcherError;

/// Request-type bits in the matcher's vocabulary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeMask(pub u32);

impl TypeMask {
    pub const SCRIPT: TypeMask = TypeMask(1 << 0);
    pub const IMAGE: TypeMask = TypeMask(1 << 1);
    pub const STYLESHEET: TypeMask = TypeMask(1 << 2);
    pub const OBJECT: TypeMask = TypeMask(1 << 3);
    pub const XML_HTTP_REQUEST: TypeMask = TypeMask(1 << 4);
    pub const OBJECT_SUBREQUEST: TypeMask = TypeMask(1 << 5);
    pub const SUBDOCUMENT: TypeMask = TypeMask(1 << 6);
    pub const DOCUMENT: TypeMask = TypeMask(1 << 7);
    pub const OTHER: TypeMask = TypeMask(1 << 8);

    pub fn intersects(self, other: TypeMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        TypeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for TypeMask {
    fn bitor_assign(&mut self, rhs: TypeMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeMask({:#011b})", self.0)
    }
}

/// Outcome of matching one request.
///
/// `rule` is the original text of the blocking rule; `exception_rule` is set
/// when an exception rule overrode it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    pub matches: bool,
    pub rule: Option<String>,
    pub exception_rule: Option<String>,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self::default()
    }

    pub fn blocked(rule: impl Into<String>) -> Self {
        Self {
            matches: true,
            rule: Some(rule.into()),
            exception_rule: None,
        }
    }

    pub fn excepted(rule: impl Into<String>, exception_rule: impl Into<String>) -> Self {
        Self {
            matches: false,
            rule: Some(rule.into()),
            exception_rule: Some(exception_rule.into()),
        }
    }
}

/// A compiled rule set.
pub trait RuleMatcher: Send + Sync {
    fn matches(&self, url: &str, types: TypeMask, origin_hostname: Option<&str>) -> MatchResult;
}

/// Builds a matcher from prepared rule lines.
pub trait MatcherFactory: Send + Sync {
    fn build(&self, rule_lines: &[String]) -> Result<Arc<dyn RuleMatcher>, MatcherError>;
}
