use base64::{engine::general_purpose, Engine as _};
use chrono::{SecondsFormat, Utc};
use url::Url;
use uuid::Uuid;

use crate::error::{CaptureError, CaptureResult};
use crate::model::{
    BodyEncoding, FlowRecord, FlowSnapshot, NameValue, RequestRecord, ResponseRecord,
};
use crate::timing::reconstruct_timings;

/// Map one flow snapshot to its capture record. Pure: no I/O, no shared
/// state, and odd-but-present data (binary bodies, duplicate headers, missing
/// response) is encoded best-effort rather than rejected. The one genuinely
/// malformed input, a request URL that cannot be parsed, makes query
/// extraction impossible and yields a structured error so the caller can
/// drop the record without corrupting the log's fixed shape.
pub fn encode_flow(snapshot: &FlowSnapshot) -> CaptureResult<FlowRecord> {
    let url = Url::parse(&snapshot.request.url).map_err(|e| CaptureError::Encoding {
        flow_id: snapshot.id.clone(),
        reason: format!("unparseable request url {:?}: {e}", snapshot.request.url),
    })?;

    let query_string = url
        .query_pairs()
        .map(|(name, value)| NameValue::new(name, value))
        .collect();

    let (body, body_encoding, body_size) = encode_body(snapshot.request.body.as_deref());
    let request = RequestRecord {
        method: snapshot.request.method.clone(),
        url: snapshot.request.url.clone(),
        host: snapshot.request.host.clone(),
        path: snapshot.request.path.clone(),
        http_version: snapshot.request.http_version.clone(),
        headers: name_values(&snapshot.request.headers),
        query_string,
        body_size,
        body,
        body_encoding,
    };

    // A flow with no response (aborted connection, upstream failure) still
    // produces the full response shape with zero/empty fields.
    let response = match &snapshot.response {
        Some(r) => {
            let (body, body_encoding, body_size) = encode_body(r.body.as_deref());
            ResponseRecord {
                status: r.status,
                status_text: r.reason.clone(),
                http_version: r.http_version.clone(),
                content_type: content_type(&r.headers),
                headers: name_values(&r.headers),
                body_size,
                body,
                body_encoding,
            }
        }
        None => ResponseRecord {
            status: 0,
            status_text: String::new(),
            http_version: String::new(),
            headers: Vec::new(),
            content_type: String::new(),
            body_size: 0,
            body: None,
            body_encoding: None,
        },
    };

    let now = Utc::now();
    Ok(FlowRecord {
        id: record_id(),
        timestamp: now.to_rfc3339_opts(SecondsFormat::Micros, true),
        timestamp_ms: now.timestamp_millis(),
        request,
        response,
        timings: reconstruct_timings(snapshot),
        server_ip_address: snapshot
            .server
            .as_ref()
            .and_then(|s| s.peer_addr)
            .map(|addr| addr.to_string())
            .unwrap_or_default(),
    })
}

/// Unique per record for the process lifetime: "entry-" + 12 hex chars of a
/// v4 UUID.
fn record_id() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(12);
    format!("entry-{hex}")
}

fn name_values(headers: &[(String, String)]) -> Vec<NameValue> {
    headers
        .iter()
        .map(|(name, value)| NameValue::new(name.clone(), value.clone()))
        .collect()
}

fn content_type(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.clone())
        .unwrap_or_default()
}

/// Body policy: strict UTF-8 decode, base64 on failure. The size always
/// counts raw bytes, not the encoded representation. An absent or empty body
/// carries neither payload nor encoding marker.
fn encode_body(raw: Option<&[u8]>) -> (Option<String>, Option<BodyEncoding>, u64) {
    match raw {
        Some(bytes) if !bytes.is_empty() => {
            let size = bytes.len() as u64;
            match std::str::from_utf8(bytes) {
                Ok(text) => (Some(text.to_owned()), Some(BodyEncoding::Text), size),
                Err(_) => (
                    Some(general_purpose::STANDARD.encode(bytes)),
                    Some(BodyEncoding::Base64),
                    size,
                ),
            }
        }
        _ => (None, None, 0),
    }
}
