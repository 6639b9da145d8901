//! Envelope codec: the stored form of a call outcome.
//!
//! An [`Outcome`] is what a handler produced: either the protobuf-encoded
//! response message or a structured [`RpcError`]. The cache stores outcomes
//! as an [`Envelope`], a small JSON document:
//!
//! ```text
//! {"data":"<base64 protobuf bytes>"}
//! {"error":{"code":40400,"message":"not found"}}
//! ```
//!
//! A document with neither field is a void response and decodes to an empty
//! payload, which is also the protobuf encoding of an empty message.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::rpc_error::RpcError;

/// The result of executing a handler, in cache-ready form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Protobuf wire encoding of the response message.
    Payload(Bytes),
    /// Structured error returned by the handler (or produced on its behalf).
    Error(RpcError),
}

impl Outcome {
    /// Encode a response message into a payload outcome.
    pub fn from_message<M: Message>(message: &M) -> CacheResult<Self> {
        encode_message(message).map(Outcome::Payload)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }

    pub fn error(&self) -> Option<&RpcError> {
        match self {
            Outcome::Error(err) => Some(err),
            Outcome::Payload(_) => None,
        }
    }
}

/// Serialized container stored in the backing cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Envelope {
    pub fn from_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Payload(bytes) => Self {
                data: Some(bytes.clone()),
                error: None,
            },
            Outcome::Error(err) => Self {
                data: None,
                error: Some(err.clone()),
            },
        }
    }

    /// Convert back into an outcome. A stored error wins over stored data.
    pub fn into_outcome(self) -> Outcome {
        match (self.error, self.data) {
            (Some(err), _) => Outcome::Error(err),
            (None, Some(bytes)) => Outcome::Payload(bytes),
            (None, None) => Outcome::Payload(Bytes::new()),
        }
    }

    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CacheError::marshal(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> CacheResult<Self> {
        serde_json::from_slice(raw).map_err(|e| CacheError::unmarshal(e.to_string()))
    }
}

/// Encode an outcome into its stored byte form.
pub fn encode_outcome(outcome: &Outcome) -> CacheResult<Vec<u8>> {
    Envelope::from_outcome(outcome).encode()
}

/// Decode stored bytes back into an outcome.
pub fn decode_outcome(raw: &[u8]) -> CacheResult<Outcome> {
    Envelope::decode(raw).map(Envelope::into_outcome)
}

/// Protobuf-encode a message.
pub fn encode_message<M: Message>(message: &M) -> CacheResult<Bytes> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .map_err(|e| CacheError::marshal(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a protobuf payload into a freshly allocated message.
pub fn decode_message<M: Message + Default>(payload: &[u8]) -> CacheResult<M> {
    M::decode(payload).map_err(|e| CacheError::unmarshal(e.to_string()))
}

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|encoded| {
            STANDARD
                .decode(encoded)
                .map(Bytes::from)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_error::ErrorCode;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Article {
        #[prost(uint64, tag = "1")]
        id: u64,
        #[prost(string, tag = "2")]
        title: String,
        #[prost(string, repeated, tag = "3")]
        tags: Vec<String>,
    }

    #[test]
    fn test_payload_round_trip() -> CacheResult<()> {
        let article = Article {
            id: 7,
            title: "Rust in production".to_string(),
            tags: vec!["rust".to_string(), "grpc".to_string()],
        };
        let stored = encode_outcome(&Outcome::from_message(&article)?)?;
        match decode_outcome(&stored)? {
            Outcome::Payload(bytes) => {
                let decoded: Article = decode_message(&bytes)?;
                assert_eq!(decoded, article);
            }
            other => panic!("expected payload, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_error_round_trip() -> CacheResult<()> {
        let err = RpcError::with_message(ErrorCode::NotFound, "article 7 not found");
        let stored = encode_outcome(&Outcome::Error(err.clone()))?;
        assert_eq!(decode_outcome(&stored)?, Outcome::Error(err));
        Ok(())
    }

    #[test]
    fn test_void_envelope_decodes_to_empty_payload() -> CacheResult<()> {
        assert_eq!(decode_outcome(b"{}")?, Outcome::Payload(Bytes::new()));
        Ok(())
    }

    #[test]
    fn test_error_wins_over_data() {
        let envelope = Envelope {
            data: Some(Bytes::from_static(b"\x08\x01")),
            error: Some(RpcError::from_code(ErrorCode::NoData)),
        };
        assert!(envelope.into_outcome().is_error());
    }

    #[test]
    fn test_envelope_json_layout() -> CacheResult<()> {
        let stored = encode_outcome(&Outcome::Payload(Bytes::from_static(b"hi")))?;
        assert_eq!(stored, br#"{"data":"aGk="}"#.to_vec());
        Ok(())
    }

    #[test]
    fn test_garbage_is_unmarshal_error() {
        let err = decode_outcome(b"not json").unwrap_err();
        assert!(matches!(err, CacheError::Unmarshal { .. }));

        let err = decode_outcome(br#"{"data":"***"}"#).unwrap_err();
        assert!(matches!(err, CacheError::Unmarshal { .. }));
    }

    #[test]
    fn test_decode_message_rejects_bad_payload() {
        let err = decode_message::<Article>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, CacheError::Unmarshal { .. }));
    }
}
