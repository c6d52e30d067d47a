//! Newline-delimited JSON bundle codec (spec §6).
//!
//! Each line is an object with a `metadata` field and exactly one of
//! `data` (UTF-8 string) or `data_b64` (base64 string).

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum JsonBundleError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 in data_b64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("record is missing the `metadata` field")]
    MissingMetadata,
    #[error("record has neither `data` nor `data_b64`")]
    MissingData,
    #[error("record has both `data` and `data_b64`")]
    BothDataFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawRecord {
    metadata: Option<serde_json::Value>,
    data: Option<String>,
    data_b64: Option<String>,
}

/// One decoded record from a json-bundle stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleRecord {
    pub metadata: serde_json::Value,
    pub data: Vec<u8>,
}

/// Parse a single newline-delimited-JSON line into a `BundleRecord`.
pub fn parse_line(line: &str) -> Result<BundleRecord, JsonBundleError> {
    let raw: RawRecord = serde_json::from_str(line)?;
    let metadata = raw.metadata.ok_or(JsonBundleError::MissingMetadata)?;

    match (raw.data, raw.data_b64) {
        (Some(_), Some(_)) => Err(JsonBundleError::BothDataFields),
        (None, None) => Err(JsonBundleError::MissingData),
        (Some(data), None) => Ok(BundleRecord {
            metadata,
            data: data.into_bytes(),
        }),
        (None, Some(b64)) => {
            let data = B64.decode(b64)?;
            Ok(BundleRecord { metadata, data })
        }
    }
}

/// Marshal a record back to a single line. Prefers `data` when the bytes are
/// valid UTF-8, else falls back to `data_b64`.
pub fn marshal_record(metadata: &serde_json::Value, data: &[u8]) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("metadata".to_string(), metadata.clone());
    match std::str::from_utf8(data) {
        Ok(s) => {
            obj.insert("data".to_string(), serde_json::Value::String(s.to_string()));
        }
        Err(_) => {
            obj.insert(
                "data_b64".to_string(),
                serde_json::Value::String(B64.encode(data)),
            );
        }
    }
    serde_json::Value::Object(obj).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_utf8_data() {
        let line = r#"{"metadata":{"a":1},"data":"hello"}"#;
        let rec = parse_line(line).unwrap();
        assert_eq!(rec.data, b"hello");
        assert_eq!(rec.metadata, serde_json::json!({"a": 1}));
    }

    #[test]
    fn parses_base64_data() {
        let b64 = B64.encode(b"\xff\xfe binary");
        let line = format!(r#"{{"metadata":{{}},"data_b64":"{b64}"}}"#);
        let rec = parse_line(&line).unwrap();
        assert_eq!(rec.data, b"\xff\xfe binary");
    }

    #[test]
    fn rejects_missing_metadata() {
        let line = r#"{"data":"x"}"#;
        assert!(matches!(
            parse_line(line),
            Err(JsonBundleError::MissingMetadata)
        ));
    }

    #[test]
    fn rejects_missing_data() {
        let line = r#"{"metadata":{}}"#;
        assert!(matches!(parse_line(line), Err(JsonBundleError::MissingData)));
    }

    #[test]
    fn rejects_both_data_fields() {
        let line = r#"{"metadata":{},"data":"x","data_b64":"eA=="}"#;
        assert!(matches!(
            parse_line(line),
            Err(JsonBundleError::BothDataFields)
        ));
    }

    #[test]
    fn marshal_prefers_utf8() {
        let line = marshal_record(&serde_json::json!({}), b"hello");
        assert!(line.contains("\"data\":\"hello\""));
        let rec = parse_line(&line).unwrap();
        assert_eq!(rec.data, b"hello");
    }

    #[test]
    fn marshal_falls_back_to_base64_for_non_utf8() {
        let bytes = [0xff, 0xfe, 0x00, 0x01];
        let line = marshal_record(&serde_json::json!({}), &bytes);
        assert!(line.contains("data_b64"));
        let rec = parse_line(&line).unwrap();
        assert_eq!(rec.data, bytes);
    }
}
