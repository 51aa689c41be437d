//! Validation of inbound OTA requests and the resulting transfer plan.
//!
//! Accepted shapes, flat or nested under `ota`:
//!
//! ```json
//! {"reqId":"r1","url":"mock.bin","size":4096,"chunkBytes":512}
//! {"reqId":"r1","ota":{"image":"mock.bin","sizeBytes":"4096"}}
//! ```

use serde_json::{Map, Value};

use crate::codec::{decode_json, request_id, synth_request_id};

pub const DEFAULT_CHUNK_BYTES: u64 = 1024;
pub const MIN_CHUNK_BYTES: u64 = 64;
pub const MAX_CHUNK_BYTES: u64 = 8 * 1024;

/// Percentages reported as `progress` events; 100 is reported by `verified`
pub const PROGRESS_MARKS: [u8; 3] = [25, 50, 75];

const INVALID_PAYLOAD: &str = "invalid payload";

/// Why a request never left the validating stage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct OtaRejection {
    pub req_id: Option<String>,
    pub reason: String,
    pub detail: String,
    /// The payload was not JSON at all
    pub undecodable: bool,
}

impl OtaRejection {
    fn invalid(req_id: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            req_id,
            reason: INVALID_PAYLOAD.to_string(),
            detail: detail.into(),
            undecodable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaRequest {
    pub req_id: Option<String>,
    pub url: Option<String>,
    pub size: u64,
    /// Requested chunk size as sent; zero when absent
    pub chunk_bytes: i64,
}

impl OtaRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, OtaRejection> {
        let data = decode_json(payload).map_err(|e| OtaRejection {
            undecodable: true,
            ..OtaRejection::invalid(None, e.to_string())
        })?;
        let Value::Object(data) = data else {
            return Err(OtaRejection::invalid(None, "JSON object expected"));
        };
        Self::from_object(&data)
    }

    fn from_object(data: &Map<String, Value>) -> Result<Self, OtaRejection> {
        let body = match data.get("ota") {
            Some(Value::Object(nested)) => nested,
            _ => data,
        };

        let top_level_id = request_id(data.get("reqId"));
        let req_id = top_level_id
            .clone()
            .or_else(|| request_id(body.get("reqId")));
        let url = non_empty_str(body.get("url")).or_else(|| non_empty_str(body.get("image")));

        let raw_size = body
            .get("size")
            .filter(|v| is_truthy(v))
            .or_else(|| body.get("sizeBytes"));
        let size = raw_size
            .and_then(coerce_int)
            .filter(|size| *size > 0)
            .ok_or_else(|| OtaRejection::invalid(top_level_id.clone(), "missing or invalid size"))?;

        let chunk_bytes = match body.get("chunkBytes") {
            None | Some(Value::Null) => 0,
            Some(raw) => coerce_int(raw)
                .ok_or_else(|| OtaRejection::invalid(top_level_id.clone(), "invalid chunkBytes"))?,
        };

        Ok(Self {
            req_id,
            url,
            size: size as u64,
            chunk_bytes,
        })
    }
}

/// Everything fixed once a request is accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub req_id: String,
    pub url: Option<String>,
    pub size: u64,
    pub chunk_bytes: u64,
    /// Byte offsets at which each of [`PROGRESS_MARKS`] is reached
    pub thresholds: [u64; 3],
}

impl TransferPlan {
    pub fn from_request(request: OtaRequest) -> Self {
        let size = request.size;
        Self {
            req_id: request.req_id.unwrap_or_else(synth_request_id),
            url: request.url,
            size,
            chunk_bytes: clamp_chunk(request.chunk_bytes),
            thresholds: PROGRESS_MARKS.map(|mark| threshold(size, mark)),
        }
    }
}

/// Non-positive means "use the default"; everything lands in `[64, 8192]`.
pub fn clamp_chunk(requested: i64) -> u64 {
    let requested = if requested > 0 {
        requested as u64
    } else {
        DEFAULT_CHUNK_BYTES
    };
    requested.clamp(MIN_CHUNK_BYTES, MAX_CHUNK_BYTES)
}

/// `size * mark / 100`, floored, never below 1.
pub fn threshold(size: u64, mark: u8) -> u64 {
    let offset = (size as u128 * mark as u128 / 100) as u64;
    offset.max(1)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Integers, finite floats (truncated) and strings holding an integer.
fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| u.min(i64::MAX as u64) as i64))
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reject(payload: &str) -> OtaRejection {
        OtaRequest::parse(payload.as_bytes()).unwrap_err()
    }

    #[test]
    fn accepts_flat_and_nested_requests() {
        let flat = OtaRequest::parse(br#"{"reqId":"r1","url":"mock.bin","size":4096}"#).unwrap();
        assert_eq!(flat.req_id.as_deref(), Some("r1"));
        assert_eq!(flat.url.as_deref(), Some("mock.bin"));
        assert_eq!(flat.size, 4096);
        assert_eq!(flat.chunk_bytes, 0);

        let nested =
            OtaRequest::parse(br#"{"ota":{"reqId":"r2","image":"fw.bin","sizeBytes":"512","chunkBytes":"128"}}"#)
                .unwrap();
        assert_eq!(nested.req_id.as_deref(), Some("r2"));
        assert_eq!(nested.url.as_deref(), Some("fw.bin"));
        assert_eq!(nested.size, 512);
        assert_eq!(nested.chunk_bytes, 128);
    }

    #[test]
    fn numeric_request_ids_are_kept() {
        let flat = OtaRequest::parse(br#"{"reqId":7,"size":10}"#).unwrap();
        assert_eq!(flat.req_id.as_deref(), Some("7"));
        let nested = OtaRequest::parse(br#"{"ota":{"reqId":8,"size":10}}"#).unwrap();
        assert_eq!(nested.req_id.as_deref(), Some("8"));
        assert_eq!(reject(r#"{"reqId":9,"size":-1}"#).req_id.as_deref(), Some("9"));
    }

    #[test]
    fn zero_size_falls_back_to_size_bytes() {
        let request = OtaRequest::parse(br#"{"size":0,"sizeBytes":100}"#).unwrap();
        assert_eq!(request.size, 100);
        let float = OtaRequest::parse(br#"{"size":99.9}"#).unwrap();
        assert_eq!(float.size, 99);
    }

    #[test]
    fn missing_non_positive_or_non_numeric_size_is_rejected() {
        for payload in [
            r#"{"url":"x"}"#,
            r#"{"size":0}"#,
            r#"{"size":-5}"#,
            r#"{"size":"big"}"#,
            r#"{"size":true}"#,
            r#"{"size":[1]}"#,
        ] {
            let rejection = reject(payload);
            assert_eq!(rejection.reason, "invalid payload", "{payload}");
            assert_eq!(rejection.detail, "missing or invalid size", "{payload}");
        }
    }

    #[test]
    fn non_numeric_chunk_is_rejected() {
        let rejection = reject(r#"{"reqId":"r9","size":10,"chunkBytes":"lots"}"#);
        assert_eq!(rejection.detail, "invalid chunkBytes");
        assert_eq!(rejection.req_id.as_deref(), Some("r9"));
        assert!(OtaRequest::parse(br#"{"size":10,"chunkBytes":null}"#).is_ok());
    }

    #[test]
    fn undecodable_and_non_object_payloads_are_rejected() {
        let garbled = reject("{size:");
        assert!(garbled.undecodable);
        assert!(garbled.detail.starts_with("JSON parse error"));

        let list = reject("[4096]");
        assert!(!list.undecodable);
        assert_eq!(list.detail, "JSON object expected");
    }

    #[test]
    fn chunk_size_is_clamped_with_default() {
        assert_eq!(clamp_chunk(0), DEFAULT_CHUNK_BYTES);
        assert_eq!(clamp_chunk(-10), DEFAULT_CHUNK_BYTES);
        assert_eq!(clamp_chunk(1), MIN_CHUNK_BYTES);
        assert_eq!(clamp_chunk(500), 500);
        assert_eq!(clamp_chunk(1 << 20), MAX_CHUNK_BYTES);
    }

    #[test]
    fn thresholds_never_drop_below_one() {
        assert_eq!(threshold(4096, 25), 1024);
        assert_eq!(threshold(4096, 75), 3072);
        assert_eq!(threshold(1, 25), 1);
        assert_eq!(threshold(3, 50), 1);
        assert_eq!(threshold(3, 75), 2);
        assert_eq!(threshold(u64::MAX, 75), (u64::MAX as u128 * 75 / 100) as u64);
    }

    #[test]
    fn plan_synthesizes_missing_request_id() {
        let request = OtaRequest::parse(br#"{"size":10}"#).unwrap();
        let plan = TransferPlan::from_request(request);
        assert!(plan.req_id.starts_with("req-"));
        assert_eq!(plan.chunk_bytes, DEFAULT_CHUNK_BYTES);
        assert_eq!(plan.thresholds, [2, 5, 7]);
    }
}
