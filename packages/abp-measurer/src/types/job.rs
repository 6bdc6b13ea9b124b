//! Crawl job specs and their validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::ValidationError;
use crate::types::ids::CrawlId;

/// Longest dwell a job may request.
pub const MAX_DWELL_SECS: u64 = 3_600;

fn default_secs() -> u64 {
    5
}

fn default_depth() -> i32 {
    1
}

/// One unit of crawl work.
///
/// Root jobs have no `parent_crawl_id`; child jobs are copies of their
/// parent with `depth - 1`, the sampled child url and the parent's crawl id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlJob {
    #[serde(alias = "filtersUrls")]
    pub filter_list_urls: Vec<String>,
    pub batch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Dwell time in seconds
    #[serde(default = "default_secs")]
    pub secs: u64,
    #[serde(default, alias = "breath")]
    pub breadth: i32,
    #[serde(default = "default_depth")]
    pub depth: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_crawl_id: Option<CrawlId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
}

/// The resolved page a job visits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTarget {
    pub url: String,
    pub domain: String,
}

impl CrawlJob {
    /// Create a root job with the documented defaults.
    pub fn new(batch: impl Into<String>, filter_list_urls: Vec<String>) -> Self {
        Self {
            filter_list_urls,
            batch: batch.into(),
            domain: None,
            url: None,
            region: None,
            secs: default_secs(),
            breadth: 0,
            depth: default_depth(),
            parent_crawl_id: None,
            tags: Vec::new(),
            rank: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_depth(mut self, depth: i32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_breadth(mut self, breadth: i32) -> Self {
        self.breadth = breadth;
        self
    }

    pub fn with_secs(mut self, secs: u64) -> Self {
        self.secs = secs;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_rank(mut self, rank: i64, region: Option<String>) -> Self {
        self.rank = Some(rank);
        self.region = region;
        self
    }

    /// Parse and validate an untyped job message.
    ///
    /// Type errors are reported per field before deserializing, so a queue
    /// message with e.g. a string depth fails with a precise reason.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        check_raw(&value)?;
        let job: CrawlJob = serde_json::from_value(value)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        job.validate()?;
        Ok(job)
    }

    /// Validate the job and resolve the page it visits.
    pub fn validate(&self) -> Result<CrawlTarget, ValidationError> {
        if self.filter_list_urls.is_empty() {
            return Err(ValidationError::EmptyFilterList);
        }
        for list_url in &self.filter_list_urls {
            if Url::parse(list_url).is_err() {
                return Err(ValidationError::MalformedUrl {
                    field: "filterListUrls",
                    value: list_url.clone(),
                });
            }
        }

        if self.secs > MAX_DWELL_SECS {
            return Err(ValidationError::DwellOutOfRange {
                secs: self.secs,
                max: MAX_DWELL_SECS,
            });
        }

        if let Some(domain) = &self.domain {
            if !domain.contains('.') {
                return Err(ValidationError::InvalidDomain(domain.clone()));
            }
        }

        match (&self.url, &self.domain) {
            (Some(raw), domain) => {
                let parsed = Url::parse(raw).map_err(|_| ValidationError::MalformedUrl {
                    field: "url",
                    value: raw.clone(),
                })?;
                let domain = match domain {
                    Some(domain) => domain.clone(),
                    None => parsed
                        .host_str()
                        .map(str::to_string)
                        .ok_or_else(|| ValidationError::MalformedUrl {
                            field: "url",
                            value: raw.clone(),
                        })?,
                };
                Ok(CrawlTarget {
                    url: raw.clone(),
                    domain,
                })
            }
            (None, Some(domain)) => Ok(CrawlTarget {
                url: format!("http://{domain}"),
                domain: domain.clone(),
            }),
            (None, None) => Err(ValidationError::MissingTarget),
        }
    }

    /// Whether this job is the root of a lineage tree.
    pub fn is_root(&self) -> bool {
        self.parent_crawl_id.is_none()
    }

    /// Build the job for one sampled child page.
    pub fn child(&self, url: impl Into<String>, parent: CrawlId) -> Self {
        Self {
            url: Some(url.into()),
            depth: self.depth - 1,
            parent_crawl_id: Some(parent),
            ..self.clone()
        }
    }
}

fn check_raw(value: &Value) -> Result<(), ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

    for (field, key) in [
        ("parentCrawlId", "parentCrawlId"),
        ("depth", "depth"),
        ("breadth", "breadth"),
        ("breadth", "breath"),
        ("rank", "rank"),
        ("secs", "secs"),
    ] {
        match obj.get(key) {
            None | Some(Value::Null) => {}
            Some(v) if v.as_i64().is_some() || v.as_u64().is_some() => {}
            Some(v) => {
                return Err(ValidationError::NotAnInteger {
                    field,
                    value: v.to_string(),
                })
            }
        }
    }

    let lists = obj
        .get("filterListUrls")
        .or_else(|| obj.get("filtersUrls"))
        .and_then(Value::as_array)
        .ok_or(ValidationError::NotAnArray {
            field: "filterListUrls",
        })?;
    if lists.is_empty() {
        return Err(ValidationError::EmptyFilterList);
    }
    for entry in lists {
        let raw = entry.as_str().ok_or(ValidationError::NotAString {
            field: "filterListUrls",
        })?;
        if Url::parse(raw).is_err() {
            return Err(ValidationError::MalformedUrl {
                field: "filterListUrls",
                value: raw.to_string(),
            });
        }
    }

    if !obj.get("batch").map(Value::is_string).unwrap_or(false) {
        return Err(ValidationError::NotAString { field: "batch" });
    }

    for field in ["domain", "url", "region"] {
        match obj.get(field) {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => return Err(ValidationError::NotAString { field }),
        }
    }

    match obj.get("tags") {
        None | Some(Value::Null) => {}
        Some(Value::Array(tags)) => {
            if let Some(index) = tags.iter().position(|t| !t.is_string()) {
                return Err(ValidationError::TagNotAString { index });
            }
        }
        Some(_) => return Err(ValidationError::NotAnArray { field: "tags" }),
    }

    Ok(())
}
