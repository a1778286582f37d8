//! The immutable unit of a cassette: one `(request, response, recorded_at)`
//! triple, validated on construction and serialized through a fixed JSON
//! shape.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::analyzer::{self, BodyKind};
use crate::error::VcrError;
use crate::object_store::{sha256_hex, StreamChunk};

pub const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Methods whose bodies participate in the request fingerprint.
const HASHED_BODY_METHODS: &[&str] = &["POST", "PUT", "PATCH"];

/// Microseconds since the Unix epoch. This is the cassette ordering key,
/// captured when a request is initiated rather than when it completes.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(1)
}

/// `"-"` for bodyless fingerprints, SHA-256 hex otherwise.
pub fn body_hash(method: &str, body: &[u8]) -> String {
    if body.is_empty() || !HASHED_BODY_METHODS.contains(&method) {
        "-".to_string()
    } else {
        sha256_hex(body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body_hash: String,
}

impl RecordedRequest {
    /// Build a request record from live-request parts. The URL is expected
    /// to be redacted already; header names are lowercased here.
    pub fn new(
        method: &str,
        url: impl Into<String>,
        headers: HashMap<String, String>,
        body: &[u8],
    ) -> Result<Self, VcrError> {
        let method = method.to_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(VcrError::EntryInvalid(format!(
                "unsupported method {method}"
            )));
        }

        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_lowercase(), value))
            .collect();

        let body_hash = body_hash(&method, body);
        Ok(Self {
            method,
            url: url.into(),
            headers,
            body_hash,
        })
    }

    /// Identity of this request for uniqueness checks within a cassette.
    pub fn fingerprint(&self) -> String {
        format!("{} {} {}", self.method, self.url, self.body_hash)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    Text,
    Binary,
    Stream,
    ExternalBinary,
    ExternalStream,
}

impl BodyEncoding {
    pub fn is_external(self) -> bool {
        matches!(self, BodyEncoding::ExternalBinary | BodyEncoding::ExternalStream)
    }
}

/// A body that must be persisted to the object store before the owning
/// entry is loadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalBody {
    Binary { hash: String, bytes: Vec<u8> },
    Stream { hash: String, chunks: Vec<StreamChunk> },
}

impl ExternalBody {
    pub fn hash(&self) -> &str {
        match self {
            ExternalBody::Binary { hash, .. } | ExternalBody::Stream { hash, .. } => hash,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    #[serde(rename = "body_b64", with = "base64_bytes")]
    pub body: Vec<u8>,
    pub body_encoding: BodyEncoding,
    pub body_external_ref: Option<String>,
    pub stream_metadata: Option<Map<String, Value>>,
    /// Unknown fields round-trip untouched for forward compatibility.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordedResponse {
    /// Build a response record from live-response parts, routing the body
    /// inline or to the object store by kind and size. Headers are expected
    /// to be redacted and stripped of volatile entries already; text bodies
    /// are expected to be redacted.
    ///
    /// Returns the record plus the external body (if any) the caller must
    /// put into the object store.
    pub fn new(
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        media_type: Option<&str>,
        max_inline_size: usize,
        recorded_at: u64,
    ) -> Result<(Self, Option<ExternalBody>), VcrError> {
        validate_status(status)?;

        let kind = analyzer::classify(media_type, &body);
        let size = body.len();
        let external = analyzer::should_store_externally(kind, size, max_inline_size);

        let (encoding, inline, external_body, stream_metadata) = match (kind, external) {
            (BodyKind::Text, _) => (BodyEncoding::Text, body, None, None),
            (BodyKind::Binary, false) => (BodyEncoding::Binary, body, None, None),
            (BodyKind::Binary, true) => {
                let hash = sha256_hex(&body);
                let meta = size_metadata(size, None);
                (
                    BodyEncoding::ExternalBinary,
                    Vec::new(),
                    Some(ExternalBody::Binary { hash, bytes: body }),
                    Some(meta),
                )
            }
            (BodyKind::Stream, false) => {
                let meta = size_metadata(size, Some("stream"));
                (BodyEncoding::Stream, body, None, Some(meta))
            }
            (BodyKind::Stream, true) => {
                let hash = sha256_hex(&body);
                let meta = size_metadata(size, Some("stream"));
                let chunks = vec![StreamChunk {
                    timestamp: recorded_at,
                    data: body,
                }];
                (
                    BodyEncoding::ExternalStream,
                    Vec::new(),
                    Some(ExternalBody::Stream { hash, chunks }),
                    Some(meta),
                )
            }
        };

        let body_external_ref = external_body.as_ref().map(|b| b.hash().to_string());

        Ok((
            Self {
                status,
                headers,
                body: inline,
                body_encoding: encoding,
                body_external_ref,
                stream_metadata,
                extra: Map::new(),
            },
            external_body,
        ))
    }
}

fn size_metadata(size: usize, kind: Option<&str>) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("size".to_string(), Value::from(size as u64));
    if let Some(kind) = kind {
        meta.insert("type".to_string(), Value::from(kind));
    }
    meta
}

fn validate_status(status: u16) -> Result<(), VcrError> {
    if !(100..600).contains(&status) {
        return Err(VcrError::EntryInvalid(format!("status {status} out of range")));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CassetteEntry {
    pub req: RecordedRequest,
    pub resp: RecordedResponse,
    pub recorded_at: u64,
}

impl CassetteEntry {
    pub fn new(
        req: RecordedRequest,
        resp: RecordedResponse,
        recorded_at: u64,
    ) -> Result<Self, VcrError> {
        let entry = Self {
            req,
            resp,
            recorded_at,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Deserialize one cassette line. Entries missing `recorded_at` fail
    /// here; there is no legacy fallback.
    pub fn from_value(value: Value) -> Result<Self, VcrError> {
        let entry: CassetteEntry = serde_json::from_value(value)
            .map_err(|e| VcrError::EntryInvalid(e.to_string()))?;
        entry.validate()?;
        Ok(entry)
    }

    pub fn to_value(&self) -> Result<Value, VcrError> {
        serde_json::to_value(self).map_err(|e| VcrError::EntryInvalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), VcrError> {
        if self.recorded_at == 0 {
            return Err(VcrError::EntryInvalid(
                "recorded_at must be positive".to_string(),
            ));
        }

        if !ALLOWED_METHODS.contains(&self.req.method.as_str()) {
            return Err(VcrError::EntryInvalid(format!(
                "unsupported method {}",
                self.req.method
            )));
        }

        let hash = &self.req.body_hash;
        let hash_ok = hash == "-"
            || (hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
        if !hash_ok {
            return Err(VcrError::EntryInvalid(format!("malformed body_hash {hash}")));
        }

        validate_status(self.resp.status)?;

        if self.resp.body_encoding.is_external() {
            if self.resp.body_external_ref.is_none() {
                return Err(VcrError::EntryInvalid(
                    "external encoding without body_external_ref".to_string(),
                ));
            }
            if !self.resp.body.is_empty() {
                return Err(VcrError::EntryInvalid(
                    "external encoding with inline body".to_string(),
                ));
            }
        }

        Ok(())
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        if encoded.is_empty() {
            return Ok(Vec::new());
        }
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_response(body: &str) -> RecordedResponse {
        RecordedResponse::new(
            200,
            HashMap::new(),
            body.as_bytes().to_vec(),
            Some("application/json"),
            1000,
            1,
        )
        .unwrap()
        .0
    }

    fn sample_entry() -> CassetteEntry {
        let req = RecordedRequest::new(
            "get",
            "https://api.example.com/x",
            HashMap::from([("Accept".to_string(), "application/json".to_string())]),
            b"",
        )
        .unwrap();
        CassetteEntry::new(req, text_response("{\"ok\":true}"), 42).unwrap()
    }

    #[test]
    fn constructor_uppercases_method_and_lowercases_headers() {
        let entry = sample_entry();
        assert_eq!(entry.req.method, "GET");
        assert!(entry.req.headers.contains_key("accept"));
        assert_eq!(entry.req.body_hash, "-");
    }

    #[test]
    fn body_hash_only_for_mutating_methods() {
        assert_eq!(body_hash("GET", b"payload"), "-");
        assert_eq!(body_hash("POST", b""), "-");
        let hashed = body_hash("POST", b"payload");
        assert_eq!(hashed.len(), 64);
        assert_eq!(hashed, body_hash("PUT", b"payload"));
    }

    #[test]
    fn round_trip_is_identity() {
        let entry = sample_entry();
        let restored = CassetteEntry::from_value(entry.to_value().unwrap()).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn unknown_response_fields_survive_round_trip() {
        let mut value = sample_entry().to_value().unwrap();
        value["resp"]["x_future_field"] = Value::from("kept");

        let entry = CassetteEntry::from_value(value).unwrap();
        assert_eq!(entry.resp.extra["x_future_field"], "kept");

        let reserialized = entry.to_value().unwrap();
        assert_eq!(reserialized["resp"]["x_future_field"], "kept");
    }

    #[test]
    fn missing_recorded_at_is_rejected() {
        let mut value = sample_entry().to_value().unwrap();
        value.as_object_mut().unwrap().remove("recorded_at");
        assert!(CassetteEntry::from_value(value).is_err());
    }

    #[test]
    fn zero_recorded_at_is_rejected() {
        let req = RecordedRequest::new("GET", "https://a/b", HashMap::new(), b"").unwrap();
        assert!(CassetteEntry::new(req, text_response("x"), 0).is_err());
    }

    #[test]
    fn external_encoding_requires_ref_and_empty_inline() {
        let mut entry = sample_entry();
        entry.resp.body_encoding = BodyEncoding::ExternalBinary;
        entry.resp.body_external_ref = None;
        assert!(entry.validate().is_err());

        entry.resp.body_external_ref = Some("ab".repeat(32));
        entry.resp.body = b"inline".to_vec();
        assert!(entry.validate().is_err());

        entry.resp.body = Vec::new();
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn large_binary_routes_external() {
        let body = vec![0u8; 5000];
        let (resp, external) = RecordedResponse::new(
            200,
            HashMap::new(),
            body.clone(),
            Some("application/octet-stream"),
            1000,
            7,
        )
        .unwrap();

        assert_eq!(resp.body_encoding, BodyEncoding::ExternalBinary);
        assert!(resp.body.is_empty());
        assert_eq!(resp.stream_metadata.as_ref().unwrap()["size"], 5000);
        match external.unwrap() {
            ExternalBody::Binary { hash, bytes } => {
                assert_eq!(hash, sha256_hex(&body));
                assert_eq!(bytes, body);
            }
            other => panic!("expected binary external body, got {other:?}"),
        }
    }

    #[test]
    fn small_stream_stays_inline_with_metadata() {
        let body = b"data: {\"event\": \"start\"}\n\n".to_vec();
        let (resp, external) = RecordedResponse::new(
            200,
            HashMap::new(),
            body.clone(),
            Some("text/event-stream"),
            1000,
            7,
        )
        .unwrap();

        assert!(external.is_none());
        assert_eq!(resp.body_encoding, BodyEncoding::Stream);
        assert_eq!(resp.body, body);
        let meta = resp.stream_metadata.unwrap();
        assert_eq!(meta["type"], "stream");
        assert_eq!(meta["size"], body.len() as u64);
    }
}
