use std::net::IpAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Input: read-only flow snapshots delivered by the proxy engine
// ---------------------------------------------------------------------------

/// One completed (or terminally failed) request/response exchange as observed
/// by the interception point. Timestamps are epoch seconds taken from the
/// engine's monotonic-derived clock; any of them may be missing when the flow
/// never reached that stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Engine-assigned flow identifier, used in error reports and logs.
    pub id: String,
    pub request: RequestSnapshot,
    #[serde(default)]
    pub response: Option<ResponseSnapshot>,
    #[serde(default)]
    pub server: Option<ServerSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    /// Full URL including scheme, host, path and query.
    pub url: String,
    pub host: String,
    pub path: String,
    /// Protocol version label, e.g. "HTTP/1.1".
    pub http_version: String,
    /// Ordered, duplicates preserved, original casing.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Bytes>,
    #[serde(default)]
    pub timestamp_start: Option<f64>,
    #[serde(default)]
    pub timestamp_end: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub http_version: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Bytes>,
    #[serde(default)]
    pub timestamp_start: Option<f64>,
    #[serde(default)]
    pub timestamp_end: Option<f64>,
}

/// Connection-level metadata for the upstream server, absent when the flow
/// failed before a connection was established.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSnapshot {
    #[serde(default)]
    pub peer_addr: Option<IpAddr>,
    #[serde(default)]
    pub timestamp_start: Option<f64>,
    #[serde(default)]
    pub timestamp_tcp_setup: Option<f64>,
    #[serde(default)]
    pub timestamp_tls_setup: Option<f64>,
    #[serde(default)]
    pub timestamp_end: Option<f64>,
}

// ---------------------------------------------------------------------------
// Output: one record per line in the capture log
// ---------------------------------------------------------------------------

/// A captured flow as persisted to the JSON Lines log. Field names are part
/// of the on-disk format; downstream consumers rely on the fixed shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
    pub request: RequestRecord,
    pub response: ResponseRecord,
    pub timings: Timings,
    #[serde(rename = "serverIPAddress")]
    pub server_ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    #[serde(rename = "httpVersion")]
    pub http_version: String,
    pub headers: Vec<NameValue>,
    #[serde(rename = "queryString")]
    pub query_string: Vec<NameValue>,
    #[serde(rename = "bodySize")]
    pub body_size: u64,
    pub body: Option<String>,
    #[serde(rename = "bodyEncoding")]
    pub body_encoding: Option<BodyEncoding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// 0 when no response was ever received.
    pub status: u16,
    #[serde(rename = "statusText")]
    pub status_text: String,
    #[serde(rename = "httpVersion")]
    pub http_version: String,
    pub headers: Vec<NameValue>,
    /// Convenience duplicate of the `content-type` header, "" when absent.
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(rename = "bodySize")]
    pub body_size: u64,
    pub body: Option<String>,
    #[serde(rename = "bodyEncoding")]
    pub body_encoding: Option<BodyEncoding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// How a body payload is carried in the record. Exactly one of
/// {absent, text, base64} applies per body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Text,
    Base64,
}

/// Phase durations in integer milliseconds. `blocked` and `dns` are always
/// present and zero-filled (the engine event model does not expose those
/// timestamps); the remaining phases carry -1 when the required timestamp
/// pair is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub blocked: i64,
    pub dns: i64,
    pub connect: i64,
    pub ssl: i64,
    pub send: i64,
    pub wait: i64,
    pub receive: i64,
}
