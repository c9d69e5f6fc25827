//! Inbound wire messages
//!
//! Clients (htmx with the `ws-wrap-payload` extension) send one JSON object
//! per frame:
//!
//! ```text
//! {"HEADERS": {"HX-Trigger": "search", ...}, "payload": {"input": "ca"}}
//! {"HEADERS": {"HX-Trigger": "more", ...},   "payload": {}}
//! ```
//!
//! Decoding happens in two steps. [`Envelope`] failing to parse is a protocol
//! error and ends the connection; turning a parsed envelope into an
//! [`Event`] can fail with `UnknownTrigger` / `BadPayload`, which are
//! reported back to the client while the connection stays open.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SearchError};

pub const TRIGGER_SEARCH: &str = "search";
pub const TRIGGER_MORE: &str = "more";

/// htmx request headers forwarded inside the frame.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HtmxHeaders {
    #[serde(rename = "HX-Trigger", default)]
    pub trigger: String,
    #[serde(rename = "HX-Trigger-Name", default)]
    pub trigger_name: Option<String>,
    #[serde(rename = "HX-Target", default)]
    pub target: Option<String>,
    #[serde(rename = "HX-Current-URL", default)]
    pub current_url: Option<String>,
    /// Sent as the string `"true"` by htmx.
    #[serde(rename = "HX-Request", default)]
    pub request: Option<String>,
}

/// Raw inbound message: headers plus an undecoded payload.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "HEADERS")]
    pub headers: HtmxHeaders,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn trigger(&self) -> &str {
        &self.headers.trigger
    }
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
    input: String,
}

/// Every event kind the server handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Start a new search for `input`, superseding the current one.
    Search { input: String },
    /// Deliver the next page of the current search.
    More,
}

impl TryFrom<Envelope> for Event {
    type Error = SearchError;

    fn try_from(envelope: Envelope) -> Result<Self> {
        match envelope.headers.trigger.as_str() {
            TRIGGER_SEARCH => {
                if envelope.payload.is_null() {
                    return Err(SearchError::BadPayload("missing payload".into()));
                }
                let payload: SearchPayload = serde_json::from_value(envelope.payload)
                    .map_err(|e| SearchError::BadPayload(e.to_string()))?;
                Ok(Event::Search { input: payload.input })
            }
            // more carries the form values (hx-include) but needs none of them
            TRIGGER_MORE => Ok(Event::More),
            other => Err(SearchError::UnknownTrigger(other.to_string())),
        }
    }
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Search { .. } => TRIGGER_SEARCH,
            Event::More => TRIGGER_MORE,
        }
    }
}
