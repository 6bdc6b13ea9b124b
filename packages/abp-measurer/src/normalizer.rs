//! Raw browser log decoding.
//!
//! Each [`RawLogEntry`] carries a separately encoded DevTools event. Entries
//! are decoded independently: one that fails to decode is logged and
//! skipped, never failing the batch.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{RawLogEntry, RequestRecord};

const REQUEST_WILL_BE_SENT: &str = "Network.requestWillBeSent";
const LOADING_FINISHED: &str = "Network.loadingFinished";

#[derive(Deserialize)]
struct Envelope {
    message: DevtoolsEvent,
}

#[derive(Deserialize)]
struct DevtoolsEvent {
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSent {
    #[serde(default)]
    request_id: String,
    #[serde(rename = "documentURL")]
    document_url: Option<String>,
    request: NetworkRequest,
    #[serde(rename = "type")]
    resource_type: Option<String>,
    initiator: Option<Initiator>,
    wall_time: Option<f64>,
    timestamp: Option<f64>,
}

#[derive(Deserialize)]
struct NetworkRequest {
    url: String,
}

#[derive(Deserialize)]
struct Initiator {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFinished {
    request_id: String,
    encoded_data_length: Option<f64>,
}

/// Decode raw log entries into request records, preserving input order.
///
/// Only `Network.requestWillBeSent` events with a document url become
/// records. Sizes reported by `Network.loadingFinished` are attached to the
/// record with the same request id.
pub fn normalize_logs(entries: &[RawLogEntry]) -> Vec<RequestRecord> {
    let events: Vec<DevtoolsEvent> = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_str::<Envelope>(&entry.message) {
            Ok(envelope) => Some(envelope.message),
            Err(e) => {
                warn!(index, error = %e, "skipping undecodable log entry");
                None
            }
        })
        .collect();

    let sizes: HashMap<String, i64> = events
        .iter()
        .filter(|event| event.method == LOADING_FINISHED)
        .filter_map(|event| LoadingFinished::deserialize(&event.params).ok())
        .filter_map(|done| {
            done.encoded_data_length
                .map(|len| (done.request_id, len as i64))
        })
        .collect();

    events
        .into_iter()
        .filter(|event| event.method == REQUEST_WILL_BE_SENT)
        .filter_map(|event| match RequestWillBeSent::deserialize(event.params) {
            Ok(params) => Some(params),
            Err(e) => {
                debug!(error = %e, "skipping request event with unexpected shape");
                None
            }
        })
        .filter_map(|params| {
            let from_url = params.document_url?;
            let (initiator_type, initiator_url) = match params.initiator {
                Some(initiator) => (initiator.kind, initiator.url),
                None => (None, None),
            };
            Some(RequestRecord {
                timestamp: params.wall_time.or(params.timestamp),
                size: sizes.get(&params.request_id).copied(),
                request_id: params.request_id,
                from_url,
                for_url: params.request.url,
                resource_type: params.resource_type.unwrap_or_else(|| "Other".to_string()),
                initiator_type: initiator_type.unwrap_or_else(|| "other".to_string()),
                initiator_url,
                content_hash: None,
            })
        })
        .collect()
}
