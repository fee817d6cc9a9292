//! Wire shapes of the Prometheus HTTP API.

use std::collections::HashMap;

use serde::Deserialize;

use crate::FetchError;

/// `(unix seconds, raw value)` as the backend encodes a point.
pub type RawPoint = (f64, serde_json::Value);

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueryResponse {
    #[serde(default)]
    pub status: Option<String>,
    pub data: QueryData,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    #[serde(default)]
    pub result_type: Option<String>,
    pub result: Vec<SeriesEntry>,
}

/// One series: its label set plus either an instant `value` or range `values`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SeriesEntry {
    #[serde(default)]
    pub metric: HashMap<String, String>,
    #[serde(default)]
    pub value: Option<RawPoint>,
    #[serde(default)]
    pub values: Option<Vec<RawPoint>>,
}

impl SeriesEntry {
    pub fn points(&self) -> impl Iterator<Item = &RawPoint> {
        self.value.iter().chain(self.values.iter().flatten())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelValuesResponse {
    pub data: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse a successful (2xx) body, honouring an embedded `status: "error"`.
pub fn parse_query_response(status: u16, body: &str) -> Result<QueryResponse, FetchError> {
    if let Some(err) = backend_error(status, body) {
        return Err(err);
    }
    serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))
}

pub fn parse_label_values(status: u16, body: &str) -> Result<Vec<String>, FetchError> {
    if let Some(err) = backend_error(status, body) {
        return Err(err);
    }
    serde_json::from_str::<LabelValuesResponse>(body)
        .map(|response| response.data)
        .map_err(|e| FetchError::Malformed(e.to_string()))
}

/// Turn a non-2xx response into the most specific error its body allows.
pub fn error_from_status(status: u16, body: &str) -> FetchError {
    backend_error(status, body).unwrap_or_else(|| FetchError::Status {
        status,
        body: truncate(body, 512),
    })
}

fn backend_error(status: u16, body: &str) -> Option<FetchError> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    if envelope.status.as_deref() != Some("error") {
        return None;
    }
    Some(FetchError::Backend {
        status,
        error_type: envelope.error_type.unwrap_or_else(|| "unknown".to_string()),
        message: envelope.error.unwrap_or_default(),
    })
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
