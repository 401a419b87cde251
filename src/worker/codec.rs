//! Envelope codec for worker result channels.
//!
//! Values are serialized to JSON, compressed with zstd, then base64-encoded so
//! the bytes on the pipe are plain ASCII. The format is private to a single
//! build of this crate: the parent only ever decodes what its own children
//! encoded.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// zstd level used for channel payloads. Favors speed, payloads are short-lived.
const COMPRESSION_LEVEL: i32 = 3;

/// Failure to encode or decode a channel payload.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("channel closed without a payload")]
    Empty,

    #[error("payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("payload compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("payload (de)serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Encode a value into its channel form.
pub fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(value)?;
    let compressed =
        zstd::stream::encode_all(json.as_slice(), COMPRESSION_LEVEL).map_err(CodecError::Compress)?;
    Ok(STANDARD.encode(compressed).into_bytes())
}

/// Decode a value previously produced by [`encode`].
pub fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, CodecError> {
    let text = bytes.trim_ascii();
    if text.is_empty() {
        return Err(CodecError::Empty);
    }
    let compressed = STANDARD.decode(text)?;
    let json = zstd::stream::decode_all(compressed.as_slice()).map_err(CodecError::Compress)?;
    Ok(serde_json::from_slice(&json)?)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_roundtrip_strings(value in ".*") {
            let decoded: String = decode(&encode(&value).unwrap()).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_roundtrip_optional_vectors(value in proptest::option::of(prop::collection::vec(any::<i64>(), 0..256))) {
            let decoded: Option<Vec<i64>> = decode(&encode(&value).unwrap()).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_roundtrip_tuples(a in any::<u32>(), b in any::<bool>(), c in "[a-z]{0,16}") {
            let value = (a, b, c);
            let decoded: (u32, bool, String) = decode(&encode(&value).unwrap()).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
