use serde::{Deserialize, Serialize};

/// One browser performance-log entry as handed over by the driver.
///
/// `message` is itself a JSON document (the DevTools event) and is decoded
/// separately by [`crate::normalize_logs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLogEntry {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub message: String,
}

impl RawLogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            level: None,
            timestamp: None,
            message: message.into(),
        }
    }
}

/// A network request observed during a page visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub timestamp: Option<f64>,
    pub request_id: String,
    /// Document that issued the request
    pub from_url: String,
    /// Requested url
    pub for_url: String,
    /// DevTools resource type name (`Script`, `Image`, ...)
    pub resource_type: String,
    pub initiator_type: String,
    pub initiator_url: Option<String>,
    pub content_hash: Option<String>,
    pub size: Option<i64>,
}

impl RequestRecord {
    /// Minimal record, used by tests and drivers that synthesize requests.
    pub fn new(
        from_url: impl Into<String>,
        for_url: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: None,
            request_id: String::new(),
            from_url: from_url.into(),
            for_url: for_url.into(),
            resource_type: resource_type.into(),
            initiator_type: "other".to_string(),
            initiator_url: None,
            content_hash: None,
            size: None,
        }
    }
}
