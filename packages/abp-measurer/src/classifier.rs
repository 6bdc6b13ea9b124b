//! Verdict bucketing over an external rule matcher.

use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::error::MatcherError;
use crate::traits::matcher::{MatcherFactory, RuleMatcher, TypeMask};
use crate::types::{prepare_rule_lines, RequestRecord};

/// Map a DevTools resource type name to matcher type bits.
pub fn resource_type_mask(resource_type: &str) -> TypeMask {
    match resource_type {
        "Document" => TypeMask::SUBDOCUMENT | TypeMask::DOCUMENT,
        "Image" => TypeMask::IMAGE,
        "Font" => TypeMask::OTHER,
        "Script" => TypeMask::SCRIPT,
        "Stylesheet" => TypeMask::STYLESHEET,
        "XHR" => TypeMask::XML_HTTP_REQUEST,
        _ => TypeMask::OTHER | TypeMask::OBJECT | TypeMask::OBJECT_SUBREQUEST,
    }
}

/// Hostname of the issuing document, if its url parses.
pub fn origin_hostname(from_url: &str) -> Option<String> {
    Url::parse(from_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Classification of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked {
        rule: Option<String>,
    },
    /// A blocking rule matched but an exception rule overrode it
    Exception {
        rule: Option<String>,
        exception_rule: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockedRequest {
    pub record: RequestRecord,
    pub rule: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExceptedRequest {
    pub record: RequestRecord,
    pub rule: Option<String>,
    pub exception_rule: String,
}

/// Disjoint, order-preserving verdict buckets for one crawl.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Buckets {
    pub allowed: Vec<RequestRecord>,
    pub blocked: Vec<BlockedRequest>,
    pub exceptions: Vec<ExceptedRequest>,
}

impl Buckets {
    pub fn len(&self) -> usize {
        self.allowed.len() + self.blocked.len() + self.exceptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every rule text referenced by a verdict, blocking and exception.
    pub fn referenced_rules(&self) -> impl Iterator<Item = &str> {
        self.blocked
            .iter()
            .filter_map(|b| b.rule.as_deref())
            .chain(self.exceptions.iter().flat_map(|e| {
                e.rule
                    .as_deref()
                    .into_iter()
                    .chain(std::iter::once(e.exception_rule.as_str()))
            }))
    }
}

/// One matcher handle built from the union of a crawl's filter lists.
pub struct Classifier {
    matcher: Arc<dyn RuleMatcher>,
}

impl Classifier {
    /// Prepare the rule lines and build a matcher from them.
    pub fn build(factory: &dyn MatcherFactory, rule_text: &str) -> Result<Self, MatcherError> {
        let lines = prepare_rule_lines(rule_text);
        debug!(rules = lines.len(), "building rule matcher");
        Ok(Self {
            matcher: factory.build(&lines)?,
        })
    }

    pub fn verdict(&self, record: &RequestRecord) -> Verdict {
        let origin = origin_hostname(&record.from_url);
        let result = self.matcher.matches(
            &record.for_url,
            resource_type_mask(&record.resource_type),
            origin.as_deref(),
        );

        if result.matches {
            Verdict::Blocked { rule: result.rule }
        } else if let Some(exception_rule) = result.exception_rule {
            Verdict::Exception {
                rule: result.rule,
                exception_rule,
            }
        } else {
            Verdict::Allowed
        }
    }

    /// Bucket every record exactly once.
    pub fn classify(&self, records: Vec<RequestRecord>) -> Buckets {
        let mut buckets = Buckets::default();
        for record in records {
            match self.verdict(&record) {
                Verdict::Allowed => buckets.allowed.push(record),
                Verdict::Blocked { rule } => buckets.blocked.push(BlockedRequest { record, rule }),
                Verdict::Exception {
                    rule,
                    exception_rule,
                } => buckets.exceptions.push(ExceptedRequest {
                    record,
                    rule,
                    exception_rule,
                }),
            }
        }
        debug!(
            allowed = buckets.allowed.len(),
            blocked = buckets.blocked.len(),
            exceptions = buckets.exceptions.len(),
            "classified requests"
        );
        buckets
    }
}
