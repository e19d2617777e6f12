//! Body content kinds and the object mapping behind them.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ContentError;

pub const UTF_8: &str = "UTF-8";
pub const ISO_8859_1: &str = "ISO-8859-1";

/// What a body holds, as announced by `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentKind {
    #[default]
    Plain,
    Binary,
    Json,
    Cbor,
}

impl ContentKind {
    pub fn mime(self) -> &'static str {
        match self {
            ContentKind::Plain => "text/plain",
            ContentKind::Binary => "application/binary",
            ContentKind::Json => "application/json",
            ContentKind::Cbor => "application/cbor",
        }
    }

    pub fn default_charset(self) -> &'static str {
        match self {
            ContentKind::Binary => ISO_8859_1,
            _ => UTF_8,
        }
    }

    /// Classifies a `Content-Type` value and extracts its charset, if any.
    ///
    /// Anything that is not cbor, json or binary is treated as plain text.
    pub fn parse(content_type: &str) -> (ContentKind, Option<String>) {
        let lower = content_type.to_ascii_lowercase();
        let kind = if lower.contains(ContentKind::Cbor.mime()) {
            ContentKind::Cbor
        } else if lower.contains(ContentKind::Json.mime()) {
            ContentKind::Json
        } else if lower.contains(ContentKind::Binary.mime()) {
            ContentKind::Binary
        } else {
            ContentKind::Plain
        };

        let charset = lower.find("charset=").map(|at| {
            content_type[at + "charset=".len()..]
                .chars()
                .filter(|c| !matches!(c, '=' | '/' | '"' | ';' | '\'' | ' '))
                .collect::<String>()
        });

        (kind, charset.filter(|c| !c.is_empty()))
    }

    /// `Content-Type` value, e.g. `application/json; charset=UTF-8`.
    pub fn header_value(self, charset: &str) -> String {
        format!("{}; charset={}", self.mime(), charset)
    }

    /// Serializes a value the way this kind is carried: CBOR for cbor, JSON otherwise.
    pub fn encode_value<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, ContentError> {
        match self {
            ContentKind::Cbor => {
                let mut out = Vec::new();
                ciborium::ser::into_writer(value, &mut out)
                    .map_err(|e| ContentError::Cbor(format!("{e:?}")))?;
                Ok(out)
            }
            _ => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode_value<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, ContentError> {
        match self {
            ContentKind::Cbor => {
                ciborium::de::from_reader(bytes).map_err(|e| ContentError::Cbor(format!("{e:?}")))
            }
            _ => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_content_type() {
        assert_eq!(
            ContentKind::parse("application/json; charset=utf-8"),
            (ContentKind::Json, Some("utf-8".to_string()))
        );
        assert_eq!(
            ContentKind::parse("application/cbor"),
            (ContentKind::Cbor, None)
        );
        assert_eq!(
            ContentKind::parse("Application/Binary; charset=\"ISO-8859-1\""),
            (ContentKind::Binary, Some("ISO-8859-1".to_string()))
        );
        assert_eq!(ContentKind::parse("text/html").0, ContentKind::Plain);
    }

    #[test]
    fn test_header_value() {
        assert_eq!(
            ContentKind::Json.header_value(UTF_8),
            "application/json; charset=UTF-8"
        );
        assert_eq!(ContentKind::Binary.default_charset(), ISO_8859_1);
    }

    /// Tests that cbor bodies go through CBOR and everything else through JSON.
    #[test]
    fn test_value_mapping() {
        let mut value = BTreeMap::new();
        value.insert("errCode".to_string(), 0);
        value.insert("count".to_string(), 3);

        let json = ContentKind::Json.encode_value(&value).unwrap();
        assert_eq!(json, br#"{"count":3,"errCode":0}"#);
        let back: BTreeMap<String, i32> = ContentKind::Plain.decode_value(&json).unwrap();
        assert_eq!(back, value);

        let cbor = ContentKind::Cbor.encode_value(&value).unwrap();
        assert_ne!(cbor, json);
        let back: BTreeMap<String, i32> = ContentKind::Cbor.decode_value(&cbor).unwrap();
        assert_eq!(back, value);

        let err = ContentKind::Json
            .decode_value::<BTreeMap<String, i32>>(b"not json")
            .unwrap_err();
        assert!(matches!(err, ContentError::Json(_)));
    }
}
